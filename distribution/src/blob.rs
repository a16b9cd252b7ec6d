//! Blob store collaborator holding release bundles.
//!
//! Clients upload bundles straight to the store through a short-lived signed
//! URL and download them from a plain URL. Both point at this service's own
//! `/blobs` route.
use async_trait::async_trait;
use bytes::Bytes;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::Sha256;
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

type HmacSha256 = Hmac<Sha256>;

#[derive(thiserror::Error, Debug)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("invalid blob key: {0}")]
    InvalidKey(String),

    #[error("invalid or expired upload signature")]
    InvalidSignature,

    #[error("invalid signing key")]
    InvalidSigningKey,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError>;

    async fn get(&self, key: &str) -> Result<Bytes, BlobError>;

    /// Size of the blob, `None` if it does not exist.
    async fn head(&self, key: &str) -> Result<Option<u64>, BlobError>;

    async fn copy(&self, from: &str, to: &str) -> Result<(), BlobError>;

    /// Deleting a missing blob is not an error.
    async fn delete(&self, key: &str) -> Result<(), BlobError>;

    fn signer(&self) -> &UrlSigner;

    fn presigned_upload_url(&self, key: &str) -> Result<Url, BlobError> {
        validate_key(key)?;
        Ok(self.signer().upload_url(key))
    }

    fn download_url(&self, key: &str) -> String {
        self.signer().blob_url(key).to_string()
    }
}

/// Keys are relative `/`-separated paths without empty or dot segments.
pub fn validate_key(key: &str) -> Result<(), BlobError> {
    let valid = !key.is_empty()
        && !key.contains('\\')
        && key
            .split('/')
            .all(|segment| !matches!(segment, "" | "." | ".."));

    match valid {
        true => Ok(()),
        false => Err(BlobError::InvalidKey(key.to_string())),
    }
}

/// Builds blob URLs under `public_url` and signs upload URLs with an expiry.
#[derive(Clone)]
pub struct UrlSigner {
    public_url: Url,
    mac: HmacSha256,
    ttl: Duration,
}

impl UrlSigner {
    pub fn new(public_url: Url, signing_key: &[u8], ttl: Duration) -> Result<Self, BlobError> {
        let mac =
            HmacSha256::new_from_slice(signing_key).map_err(|_| BlobError::InvalidSigningKey)?;
        Ok(UrlSigner {
            public_url,
            mac,
            ttl,
        })
    }

    pub fn blob_url(&self, key: &str) -> Url {
        let mut url = self.public_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("blobs").extend(key.split('/'));
        }
        url
    }

    pub fn upload_url(&self, key: &str) -> Url {
        let expires = unix_secs() + self.ttl.as_secs();
        let mut url = self.blob_url(key);
        url.query_pairs_mut()
            .append_pair("expires", &expires.to_string())
            .append_pair("signature", &self.sign(key, expires));
        url
    }

    fn mac_for(&self, key: &str, expires: u64) -> HmacSha256 {
        let mut mac = self.mac.clone();
        mac.update(format!("PUT\n{key}\n{expires}").as_bytes());
        mac
    }

    fn sign(&self, key: &str, expires: u64) -> String {
        hex::encode(self.mac_for(key, expires).finalize().into_bytes())
    }

    /// Checks an upload's `expires` and `signature` query parameters.
    pub fn verify_upload(&self, key: &str, expires: u64, signature: &str) -> Result<(), BlobError> {
        if expires < unix_secs() {
            return Err(BlobError::InvalidSignature);
        }
        let signature = hex::decode(signature).map_err(|_| BlobError::InvalidSignature)?;
        self.mac_for(key, expires)
            .verify_slice(&signature)
            .map_err(|_| BlobError::InvalidSignature)
    }
}

fn unix_secs() -> u64 {
    crate::types::now_millis() / 1000
}

/// Blobs stored as files under a base directory.
pub struct FilesystemBlobStore {
    base_dir: PathBuf,
    signer: UrlSigner,
}

impl FilesystemBlobStore {
    pub fn new(base_dir: impl AsRef<Path>, signer: UrlSigner) -> Self {
        FilesystemBlobStore {
            base_dir: base_dir.as_ref().to_path_buf(),
            signer,
        }
    }

    fn path(&self, key: &str) -> Result<PathBuf, BlobError> {
        validate_key(key)?;
        Ok(key.split('/').fold(self.base_dir.clone(), |path, segment| path.join(segment)))
    }

    async fn ensure_parent(path: &Path) -> Result<(), BlobError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}

fn not_found_as(key: &str) -> impl FnOnce(io::Error) -> BlobError + '_ {
    move |err| match err.kind() {
        io::ErrorKind::NotFound => BlobError::NotFound(key.to_string()),
        _ => BlobError::Io(err),
    }
}

#[async_trait]
impl BlobStore for FilesystemBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError> {
        let path = self.path(key)?;
        Self::ensure_parent(&path).await?;

        // Readers never see a partially written bundle.
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        let path = self.path(key)?;
        let data = tokio::fs::read(&path).await.map_err(not_found_as(key))?;
        Ok(Bytes::from(data))
    }

    async fn head(&self, key: &str) -> Result<Option<u64>, BlobError> {
        let path = self.path(key)?;
        match tokio::fs::metadata(&path).await {
            Ok(metadata) if metadata.is_file() => Ok(Some(metadata.len())),
            Ok(_) => Ok(None),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), BlobError> {
        let source = self.path(from)?;
        let target = self.path(to)?;
        Self::ensure_parent(&target).await?;
        tokio::fs::copy(&source, &target)
            .await
            .map_err(not_found_as(from))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        let path = self.path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn signer(&self) -> &UrlSigner {
        &self.signer
    }
}

/// Process-local blob store, used for development and tests.
pub struct MemoryBlobStore {
    blobs: Mutex<HashMap<String, Bytes>>,
    signer: UrlSigner,
}

impl MemoryBlobStore {
    pub fn new(signer: UrlSigner) -> Self {
        MemoryBlobStore {
            blobs: Mutex::new(HashMap::new()),
            signer,
        }
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.lock().is_empty()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<(), BlobError> {
        validate_key(key)?;
        self.blobs.lock().insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes, BlobError> {
        self.blobs
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(key.to_string()))
    }

    async fn head(&self, key: &str) -> Result<Option<u64>, BlobError> {
        Ok(self.blobs.lock().get(key).map(|data| data.len() as u64))
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), BlobError> {
        validate_key(to)?;
        let mut blobs = self.blobs.lock();
        let data = blobs
            .get(from)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(from.to_string()))?;
        blobs.insert(to.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), BlobError> {
        self.blobs.lock().remove(key);
        Ok(())
    }

    fn signer(&self) -> &UrlSigner {
        &self.signer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> UrlSigner {
        UrlSigner::new(
            Url::parse("https://ota.example.com/").unwrap(),
            b"secret",
            Duration::from_secs(60),
        )
        .unwrap()
    }

    fn query(url: &Url, name: &str) -> String {
        url.query_pairs()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.into_owned())
            .unwrap()
    }

    #[test]
    fn key_validation() {
        assert!(validate_key("app/ios/Production/v1/abc").is_ok());
        for key in ["", "/abs", "a//b", "a/../b", "./a", "a\\b", "a/"] {
            assert!(validate_key(key).is_err(), "{key}");
        }
    }

    #[test]
    fn urls_live_under_public_url() {
        let signer = UrlSigner::new(
            Url::parse("https://cdn.example.com/ota").unwrap(),
            b"secret",
            Duration::from_secs(60),
        )
        .unwrap();
        assert_eq!(
            signer.blob_url("my app/ios/v1").as_str(),
            "https://cdn.example.com/ota/blobs/my%20app/ios/v1"
        );
    }

    #[test]
    fn signed_upload_urls_verify() {
        let signer = signer();
        let url = signer.upload_url("a/b");
        let expires: u64 = query(&url, "expires").parse().unwrap();
        let signature = query(&url, "signature");

        assert!(signer.verify_upload("a/b", expires, &signature).is_ok());
        assert!(matches!(
            signer.verify_upload("a/c", expires, &signature),
            Err(BlobError::InvalidSignature)
        ));
        assert!(matches!(
            signer.verify_upload("a/b", expires + 1, &signature),
            Err(BlobError::InvalidSignature)
        ));
        assert!(matches!(
            signer.verify_upload("a/b", 1, &signer.sign("a/b", 1)),
            Err(BlobError::InvalidSignature)
        ));
        assert!(signer.verify_upload("a/b", expires, "zz").is_err());
    }

    #[tokio::test]
    async fn filesystem_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemBlobStore::new(dir.path(), signer());

        assert_eq!(store.head("app/v1").await.unwrap(), None);
        store.put("app/v1", Bytes::from_static(b"bundle")).await.unwrap();
        assert_eq!(store.head("app/v1").await.unwrap(), Some(6));

        store.copy("app/v1", "other/v2").await.unwrap();
        assert_eq!(store.get("other/v2").await.unwrap(), Bytes::from_static(b"bundle"));

        store.delete("app/v1").await.unwrap();
        store.delete("app/v1").await.unwrap();
        assert!(matches!(
            store.get("app/v1").await,
            Err(BlobError::NotFound(_))
        ));
        assert!(matches!(
            store.copy("app/v1", "x").await,
            Err(BlobError::NotFound(_))
        ));
        assert!(matches!(
            store.put("../escape", Bytes::new()).await,
            Err(BlobError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn memory_store() {
        let store = MemoryBlobStore::new(signer());
        store.put("a", Bytes::from_static(b"xyz")).await.unwrap();
        store.copy("a", "b").await.unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.head("b").await.unwrap(), Some(3));
        store.delete("a").await.unwrap();
        assert_eq!(store.head("a").await.unwrap(), None);
        assert!(store.download_url("b").ends_with("/blobs/b"));
    }
}
