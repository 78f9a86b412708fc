use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};

use quarry_paths::AbsoluteSystemPath;

/// A parsed package manifest. Only the fields the pipeline consumes are
/// structured; everything else is kept in `other` for round-tripping.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageManifest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dependencies: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dev_dependencies: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optional_dependencies: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_dependencies: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scripts: BTreeMap<String, String>,
    // Unstructured fields kept for round trip capabilities
    #[serde(flatten)]
    pub other: BTreeMap<String, serde_json::Value>,
}

/// The manifest section a dependency was declared under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DepSection {
    Dep,
    Dev,
    Opt,
    Peer,
}

impl fmt::Display for DepSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepSection::Dep => f.write_str("dep"),
            DepSection::Dev => f.write_str("dev"),
            DepSection::Opt => f.write_str("opt"),
            DepSection::Peer => f.write_str("peer"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to read manifest: {0}")]
    Io(#[from] std::io::Error),
    #[error("unable to parse manifest: {0}")]
    Json(#[from] serde_json::Error),
}

impl PackageManifest {
    pub fn load(path: &AbsoluteSystemPath) -> Result<PackageManifest, Error> {
        tracing::trace!("loading manifest from {}", path);
        let contents = path.read_to_string()?;
        Ok(serde_json::from_str(&contents)?)
    }

    // Utility method for easy construction of manifests during testing
    pub fn from_value(value: serde_json::Value) -> Result<PackageManifest, Error> {
        Ok(serde_json::from_value(value)?)
    }

    /// Every declared dependency with the section it came from. Production
    /// dependencies come first so they win when the same name appears in
    /// more than one section.
    pub fn all_dependencies(&self) -> impl Iterator<Item = (&String, &String, DepSection)> + '_ {
        fn tagged(
            deps: &Option<BTreeMap<String, String>>,
            section: DepSection,
        ) -> Vec<(&String, &String, DepSection)> {
            deps.iter()
                .flatten()
                .map(move |(name, range)| (name, range, section))
                .collect::<Vec<_>>()
        }
        tagged(&self.dependencies, DepSection::Dep)
            .into_iter()
            .chain(tagged(&self.dev_dependencies, DepSection::Dev))
            .chain(tagged(&self.optional_dependencies, DepSection::Opt))
            .chain(tagged(&self.peer_dependencies, DepSection::Peer))
    }

    /// Returns the command for `script_name` if it is non-empty.
    pub fn command(&self, script_name: &str) -> Option<&str> {
        self.scripts
            .get(script_name)
            .filter(|command| !command.is_empty())
            .map(|command| command.as_str())
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use test_case::test_case;

    use super::*;

    #[test_case(json!({"name": "foo", "random-field": true}) ; "additional fields kept during round trip")]
    #[test_case(json!({"version": "1.2.0", "foo": "bar"}) ; "version")]
    #[test_case(json!({"dependencies": { "lodash": "^4" }, "foo": "bar"}) ; "dependencies")]
    #[test_case(json!({"devDependencies": { "jest": "*" }, "foo": "bar"}) ; "dev dependencies")]
    #[test_case(json!({"optionalDependencies": { "fsevents": "2" }, "foo": "bar"}) ; "optional dependencies")]
    #[test_case(json!({"peerDependencies": { "react": ">=17" }, "foo": "bar"}) ; "peer dependencies")]
    #[test_case(json!({"scripts": { "build": "tsc" }, "foo": "bar"}) ; "scripts")]
    fn test_roundtrip(json: serde_json::Value) {
        let manifest = PackageManifest::from_value(json.clone()).unwrap();
        let actual = serde_json::to_value(manifest).unwrap();
        assert_eq!(actual, json);
    }

    #[test]
    fn test_all_dependencies_sections() {
        let manifest = PackageManifest::from_value(json!({
            "name": "pkg",
            "dependencies": { "a": "^1" },
            "devDependencies": { "b": "*" },
            "peerDependencies": { "c": ">=2" },
        }))
        .unwrap();
        let deps: Vec<_> = manifest
            .all_dependencies()
            .map(|(name, range, section)| (name.as_str(), range.as_str(), section))
            .collect();
        assert_eq!(
            deps,
            vec![
                ("a", "^1", DepSection::Dep),
                ("b", "*", DepSection::Dev),
                ("c", ">=2", DepSection::Peer),
            ]
        );
    }

    #[test]
    fn test_empty_script_is_no_command() {
        let manifest = PackageManifest::from_value(json!({
            "scripts": { "build": "", "test": "jest" },
        }))
        .unwrap();
        assert_eq!(manifest.command("build"), None);
        assert_eq!(manifest.command("test"), Some("jest"));
    }
}
