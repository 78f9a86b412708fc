//! Remote cache artifacts over plain HTTP GET/PUT.
//!
//! An artifact is a zstd-compressed tar holding the output meta followed by
//! the pool files it references. The remote store is best-effort only; the
//! caller is responsible for falling back to local operation.

use std::io::Read;

use tar::Header;
use zstd::stream::write::Encoder;

use crate::{meta::OutputMeta, CacheError};

// mtime attached to every archived file, for byte-identical artifacts.
const MTIME: u64 = 946_684_800_000; // 2000-01-01T00:00:00Z, in milliseconds

// nobody is the usual uid / gid of the 'nobody' user.
const NOBODY: u64 = 65534;

const META_ENTRY: &str = "meta.json";
const POOL_PREFIX: &str = "pool/";

#[derive(Debug)]
pub struct RemoteArtifact {
    pub meta: OutputMeta,
    /// Pool entries: file name (content hash + extension) and bytes.
    pub files: Vec<(String, Vec<u8>)>,
}

pub struct HttpCache {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpCache {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn artifact_url(&self, hash: &str) -> String {
        format!("{}/v1/artifacts/{}", self.base_url, hash)
    }

    /// Fetches the artifact for a fingerprint hash. `Ok(None)` is an
    /// ordinary miss; transport and server errors bubble up so the caller
    /// can disable the remote store.
    pub async fn fetch(&self, hash: &str) -> Result<Option<RemoteArtifact>, CacheError> {
        let mut request = self.client.get(self.artifact_url(hash));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let bytes = response.error_for_status()?.bytes().await?;
        Ok(Some(read_artifact(&bytes)?))
    }

    pub async fn put(
        &self,
        hash: &str,
        meta: &OutputMeta,
        files: &[(String, Vec<u8>)],
    ) -> Result<(), CacheError> {
        let body = write_artifact(meta, files)?;
        let mut request = self.client.put(self.artifact_url(hash)).body(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        request.send().await?.error_for_status()?;
        Ok(())
    }
}

fn append_entry(
    builder: &mut tar::Builder<impl std::io::Write>,
    path: &str,
    bytes: &[u8],
) -> Result<(), CacheError> {
    let mut header = Header::new_gnu();
    header.set_mtime(MTIME);
    header.set_uid(NOBODY);
    header.set_gid(NOBODY);
    header.set_username("nobody")?;
    header.set_groupname("nobody")?;
    header.set_mode(0o644);
    header.set_size(bytes.len() as u64);
    builder.append_data(&mut header, path, bytes)?;
    Ok(())
}

pub(crate) fn write_artifact(
    meta: &OutputMeta,
    files: &[(String, Vec<u8>)],
) -> Result<Vec<u8>, CacheError> {
    let mut body = Vec::new();
    {
        let zw = Encoder::new(&mut body, 3)?.auto_finish();
        let mut tw = tar::Builder::new(zw);
        append_entry(&mut tw, META_ENTRY, &serde_json::to_vec(meta)?)?;
        for (name, bytes) in files {
            append_entry(&mut tw, &format!("{POOL_PREFIX}{name}"), bytes)?;
        }
        tw.finish()?;
    }
    Ok(body)
}

pub(crate) fn read_artifact(bytes: &[u8]) -> Result<RemoteArtifact, CacheError> {
    let decoder = zstd::stream::read::Decoder::new(bytes)?;
    let mut archive = tar::Archive::new(decoder);

    let mut meta = None;
    let mut files = Vec::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut contents)?;
        if path == META_ENTRY {
            meta = Some(serde_json::from_slice(&contents)?);
        } else if let Some(name) = path.strip_prefix(POOL_PREFIX) {
            files.push((name.to_string(), contents));
        } else {
            return Err(CacheError::InvalidArtifact(path));
        }
    }

    let meta = meta.ok_or_else(|| CacheError::InvalidArtifact(META_ENTRY.to_string()))?;
    Ok(RemoteArtifact { meta, files })
}

#[cfg(test)]
mod test {
    use quarry_paths::RelativeUnixPathBuf;

    use super::*;
    use crate::meta::OutputData;

    fn sample_meta() -> OutputMeta {
        OutputMeta::new(OutputData {
            input_hash: "abc".to_string(),
            file_hashes: [(
                RelativeUnixPathBuf::new("dist/index.js").unwrap(),
                "h1".to_string(),
            )]
            .into_iter()
            .collect(),
        })
        .unwrap()
    }

    #[test]
    fn test_artifact_round_trip() {
        let meta = sample_meta();
        let files = vec![("h1.js".to_string(), b"compiled".to_vec())];
        let body = write_artifact(&meta, &files).unwrap();
        let artifact = read_artifact(&body).unwrap();
        assert_eq!(artifact.meta, meta);
        assert_eq!(artifact.files, files);
    }

    #[test]
    fn test_unknown_entry_is_rejected() {
        let meta = sample_meta();
        let mut body = Vec::new();
        {
            let zw = Encoder::new(&mut body, 3).unwrap().auto_finish();
            let mut tw = tar::Builder::new(zw);
            append_entry(&mut tw, "meta.json", &serde_json::to_vec(&meta).unwrap()).unwrap();
            append_entry(&mut tw, "../escape.txt", b"nope").unwrap();
            tw.finish().unwrap();
        }
        assert!(matches!(
            read_artifact(&body),
            Err(CacheError::InvalidArtifact(_))
        ));
    }
}
