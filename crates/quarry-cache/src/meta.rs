//! The persisted cache meta store.
//!
//! Partitioned by package path: each package owns one directory (named by
//! its escaped path) holding its latest input fingerprint, one output meta
//! per fingerprint hash, and a `latest` pointer. Concurrent writers for
//! different packages never touch the same files.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use quarry_paths::{
    AbsoluteSystemPath, AbsoluteSystemPathBuf, AnchoredSystemPath, RelativeUnixPathBuf,
};

use crate::{fingerprint::InputData, CacheError};

/// The latest computed fingerprint for a package, kept as the baseline for
/// cache-miss diffing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputMeta {
    pub data: InputData,
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputData {
    /// The fingerprint this output was produced under.
    pub input_hash: String,
    /// Content hash per produced file, relative to the package dir.
    pub file_hashes: BTreeMap<RelativeUnixPathBuf, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputMeta {
    pub data: OutputData,
    /// Digest over `data`; what dependents fold into their fingerprints.
    pub hash: String,
    /// Last restore/production time, milliseconds since epoch. Drives
    /// eviction.
    pub access: i64,
    pub create: i64,
}

impl OutputMeta {
    pub fn new(data: OutputData) -> Result<Self, CacheError> {
        let hash = crate::fingerprint::hash_serializable(&data)?;
        let now = Utc::now().timestamp_millis();
        Ok(Self {
            data,
            hash,
            access: now,
            create: now,
        })
    }
}

/// Escapes a package path into a single flat-directory-safe file name.
/// `@scope/pkg` paths stay unambiguous because both `@` and `/` are
/// percent-escaped.
pub fn escape_package_path(path: &AnchoredSystemPath) -> String {
    path.to_unix()
        .as_str()
        .replace('@', "%40")
        .replace('/', "%2F")
}

const INPUT_FILE: &str = "input.json";
const LATEST_FILE: &str = "latest.json";
const OUTPUT_PREFIX: &str = "out-";

pub struct CacheMetaStore {
    meta_dir: AbsoluteSystemPathBuf,
}

impl CacheMetaStore {
    pub fn new(meta_dir: AbsoluteSystemPathBuf) -> Result<Self, CacheError> {
        meta_dir.create_dir_all()?;
        Ok(Self { meta_dir })
    }

    fn package_dir(&self, package: &AnchoredSystemPath) -> AbsoluteSystemPathBuf {
        self.meta_dir.join_component(&escape_package_path(package))
    }

    fn read_json<T: serde::de::DeserializeOwned>(
        path: &AbsoluteSystemPath,
    ) -> Result<Option<T>, CacheError> {
        match path.read_existing_to_string()? {
            Some(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            None => Ok(None),
        }
    }

    fn write_json<T: Serialize>(path: &AbsoluteSystemPath, value: &T) -> Result<(), CacheError> {
        path.create_with_contents(serde_json::to_string_pretty(value)?)?;
        Ok(())
    }

    pub fn read_input(&self, package: &AnchoredSystemPath) -> Result<Option<InputMeta>, CacheError> {
        Self::read_json(&self.package_dir(package).join_component(INPUT_FILE))
    }

    pub fn write_input(
        &self,
        package: &AnchoredSystemPath,
        meta: &InputMeta,
    ) -> Result<(), CacheError> {
        Self::write_json(&self.package_dir(package).join_component(INPUT_FILE), meta)
    }

    pub fn read_output(
        &self,
        package: &AnchoredSystemPath,
        input_hash: &str,
    ) -> Result<Option<OutputMeta>, CacheError> {
        Self::read_json(&self.output_file(package, input_hash))
    }

    /// Writes the output meta for its fingerprint and moves the `latest`
    /// pointer to it.
    pub fn write_output(
        &self,
        package: &AnchoredSystemPath,
        meta: &OutputMeta,
    ) -> Result<(), CacheError> {
        Self::write_json(&self.output_file(package, &meta.data.input_hash), meta)?;
        Self::write_json(
            &self.package_dir(package).join_component(LATEST_FILE),
            meta,
        )
    }

    /// The output meta dependents read as this package's "recorded output".
    pub fn read_latest_output(
        &self,
        package: &AnchoredSystemPath,
    ) -> Result<Option<OutputMeta>, CacheError> {
        Self::read_json(&self.package_dir(package).join_component(LATEST_FILE))
    }

    /// Bumps the access time of an output meta and re-points `latest` at
    /// it. Returns the refreshed meta, or `None` if it does not exist.
    pub fn touch_output(
        &self,
        package: &AnchoredSystemPath,
        input_hash: &str,
    ) -> Result<Option<OutputMeta>, CacheError> {
        let Some(mut meta) = self.read_output(package, input_hash)? else {
            return Ok(None);
        };
        meta.access = Utc::now().timestamp_millis();
        self.write_output(package, &meta)?;
        Ok(Some(meta))
    }

    fn output_file(&self, package: &AnchoredSystemPath, input_hash: &str) -> AbsoluteSystemPathBuf {
        self.package_dir(package)
            .join_component(&format!("{OUTPUT_PREFIX}{input_hash}.json"))
    }

    /// Every package partition currently present in the store.
    pub fn list_package_dirs(&self) -> Result<Vec<AbsoluteSystemPathBuf>, CacheError> {
        let mut dirs = Vec::new();
        for entry in self.meta_dir.read_dir()? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                dirs.push(AbsoluteSystemPathBuf::try_from(entry.path().as_path())?);
            }
        }
        dirs.sort();
        Ok(dirs)
    }

    /// All output metas in one package partition, with the files they live
    /// in.
    pub fn list_outputs_in(
        dir: &AbsoluteSystemPath,
    ) -> Result<Vec<(AbsoluteSystemPathBuf, OutputMeta)>, CacheError> {
        let mut outputs = Vec::new();
        for entry in dir.read_dir()? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(OUTPUT_PREFIX) || !name.ends_with(".json") {
                continue;
            }
            let path = AbsoluteSystemPathBuf::try_from(entry.path().as_path())?;
            if let Some(meta) = Self::read_json::<OutputMeta>(&path)? {
                outputs.push((path, meta));
            }
        }
        outputs.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(outputs)
    }
}
