//! Filesystem-backed artifact storage with signed, expiring access URLs.

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use tokio::{fs, io::AsyncWriteExt};
use tracing::debug;
use uuid::Uuid;

use crate::application::ports::{ArtifactStore, StorageError};

const SOURCE: &str = "infra::artifacts";

#[derive(Debug)]
pub struct FsArtifactStore {
    root: PathBuf,
    base_url: String,
    signing_secret: Vec<u8>,
}

impl FsArtifactStore {
    /// Initialise storage rooted at the provided directory, creating it if necessary.
    pub fn new(
        root: PathBuf,
        base_url: impl Into<String>,
        signing_secret: impl Into<Vec<u8>>,
    ) -> Result<Self, std::io::Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            signing_secret: signing_secret.into(),
        })
    }

    /// Obtain the absolute filesystem path for a stored artifact.
    pub fn absolute_path(&self, key: &str) -> Result<PathBuf, StorageError> {
        self.resolve(key)
    }

    /// Check a presigned reference: the signature must match and `expires` must not have passed.
    pub fn verify(&self, key: &str, expires: i64, signature: &str, now: OffsetDateTime) -> bool {
        if now.unix_timestamp() > expires {
            return false;
        }
        let Ok(provided) = hex::decode(signature) else {
            return false;
        };
        let expected = self.sign(key, expires);
        expected.ct_eq(&provided).unwrap_u8() == 1
    }

    fn sign(&self, key: &str, expires: i64) -> Vec<u8> {
        let mut hasher = Sha256::new();
        hasher.update(&self.signing_secret);
        hasher.update(b"|");
        hasher.update(key.as_bytes());
        hasher.update(b"|");
        hasher.update(expires.to_string().as_bytes());
        hasher.finalize().to_vec()
    }

    fn presign_at(&self, key: &str, ttl: Duration, now: OffsetDateTime) -> String {
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let expires = now.unix_timestamp().saturating_add(ttl_secs);
        let signature = hex::encode(self.sign(key, expires));
        format!(
            "{}/{key}?expires={expires}&signature={signature}",
            self.base_url
        )
    }

    /// Resolve the absolute filesystem path for `key`, rejecting anything that escapes the root.
    fn resolve(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative.is_absolute()
            || relative.components().any(|component| {
                matches!(
                    component,
                    Component::ParentDir | Component::Prefix(_) | Component::RootDir
                )
            })
        {
            return Err(StorageError::InvalidKey(key.to_string()));
        }

        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &str, bytes: Bytes, content_type: &str) -> Result<(), StorageError> {
        let absolute = self.resolve(key)?;
        if let Some(parent) = absolute.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write beside the target and rename, so readers never observe a partial file.
        let staging = absolute.with_extension(format!("{}.partial", Uuid::new_v4()));
        let mut file = fs::File::create(&staging).await?;
        if let Err(err) = file.write_all(&bytes).await {
            drop(file);
            let _ = fs::remove_file(&staging).await;
            return Err(err.into());
        }
        file.flush().await?;
        drop(file);
        fs::rename(&staging, &absolute).await?;

        debug!(
            target = SOURCE,
            key,
            content_type,
            size_bytes = bytes.len(),
            "artifact stored"
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, StorageError> {
        let absolute = self.resolve(key)?;
        match fs::read(absolute).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn presign(&self, key: &str, ttl: Duration) -> Result<String, StorageError> {
        self.resolve(key)?;
        Ok(self.presign_at(key, ttl, OffsetDateTime::now_utc()))
    }

    /// Missing files are treated as success.
    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let absolute = self.resolve(key)?;
        match fs::remove_file(&absolute).await {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;
    use time::macros::datetime;

    use super::*;

    fn store(root: &Path) -> FsArtifactStore {
        FsArtifactStore::new(root.to_path_buf(), "https://cdn.example/", "s3cret").unwrap()
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let key = "fractals/abc.png";

        store
            .put(key, Bytes::from_static(b"\x89PNG"), "image/png")
            .await
            .unwrap();
        assert_eq!(
            store.get(key).await.unwrap(),
            Some(Bytes::from_static(b"\x89PNG"))
        );

        store.delete(key).await.unwrap();
        assert_eq!(store.get(key).await.unwrap(), None);
        store.delete(key).await.unwrap();
    }

    #[tokio::test]
    async fn keys_cannot_escape_the_root() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());

        for key in ["../outside.png", "/etc/passwd", ""] {
            let err = store
                .put(key, Bytes::from_static(b"x"), "image/png")
                .await
                .unwrap_err();
            assert!(matches!(err, StorageError::InvalidKey(_)), "{key}");
        }
    }

    #[test]
    fn presigned_url_verifies_until_expiry() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let now = datetime!(2026-03-01 12:00:00 UTC);
        let url = store.presign_at("fractals/abc.png", Duration::from_secs(3600), now);

        let expires = now.unix_timestamp() + 3600;
        let prefix = format!("https://cdn.example/fractals/abc.png?expires={expires}&signature=");
        assert!(url.starts_with(&prefix), "{url}");
        let signature = &url[prefix.len()..];

        assert!(store.verify("fractals/abc.png", expires, signature, now));
        assert!(!store.verify("fractals/other.png", expires, signature, now));
        assert!(!store.verify(
            "fractals/abc.png",
            expires,
            signature,
            now + time::Duration::seconds(3601)
        ));
        assert!(!store.verify("fractals/abc.png", expires, "zz", now));
    }
}
