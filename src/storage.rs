use std::fmt::Display;
use std::path::{Path, PathBuf};

use axum::body::Bytes;
use futures_util::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::{fs::File, io::AsyncWriteExt};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::error::{Error, Result};
use crate::signing::Signer;
use crate::utils::{now_utc, random_code};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Video,
    Thumbnail,
    Document,
}

impl AssetKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            AssetKind::Video => "videos",
            AssetKind::Thumbnail => "thumbnails",
            AssetKind::Document => "documents",
        }
    }

    fn extensions(&self) -> &'static [&'static str] {
        match self {
            AssetKind::Video => &["mp4", "webm", "mov", "m4v"],
            AssetKind::Thumbnail => &["png", "jpg", "jpeg", "webp"],
            AssetKind::Document => &["pdf", "zip", "md", "txt"],
        }
    }

    fn accepts(&self, content_type: &mime::Mime) -> bool {
        match self {
            AssetKind::Video => content_type.type_() == mime::VIDEO,
            AssetKind::Thumbnail => content_type.type_() == mime::IMAGE,
            AssetKind::Document => {
                content_type.type_() == mime::APPLICATION || content_type.type_() == mime::TEXT
            }
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        [AssetKind::Video, AssetKind::Thumbnail, AssetKind::Document]
            .into_iter()
            .find(|kind| kind.prefix() == prefix)
    }
}

/// Object store for course media, kept on local disk and delivered through
/// expiring signed links.
pub struct Storage {
    root: PathBuf,
    signer: Signer,
    max_bytes: usize,
}

impl Storage {
    pub async fn new(root: impl AsRef<Path>, secret: &str, max_bytes: usize) -> anyhow::Result<Self> {
        let root = root.as_ref().to_path_buf();
        for kind in [AssetKind::Video, AssetKind::Thumbnail, AssetKind::Document] {
            tokio::fs::create_dir_all(root.join(kind.prefix())).await?;
        }
        tokio::fs::create_dir_all(root.join(".tmp")).await?;
        Ok(Self {
            root,
            signer: Signer::media(secret),
            max_bytes,
        })
    }

    /// Check an upload's name and declared type, returning the file extension to keep.
    pub fn check_upload(kind: AssetKind, filename: &str, content_type: Option<&str>) -> Result<String> {
        let ext = Path::new(filename)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .ok_or_else(|| Error::BadRequest(format!("File {filename} has no extension")))?;
        if !kind.extensions().contains(&ext.as_str()) {
            return Err(Error::BadRequest(format!(
                "Unsupported {:?} file type .{ext}",
                kind
            )));
        }
        if let Some(content_type) = content_type {
            let parsed: mime::Mime = content_type
                .parse()
                .map_err(|_| Error::BadRequest(format!("Invalid content type {content_type}")))?;
            if !kind.accepts(&parsed) {
                return Err(Error::BadRequest(format!(
                    "Content type {content_type} is not allowed for {:?}",
                    kind
                )));
            }
        }
        Ok(ext)
    }

    /// Store an upload streamed in chunks and return its key.
    pub async fn put_stream<S, E>(
        &self,
        kind: AssetKind,
        filename: &str,
        content_type: Option<&str>,
        stream: S,
    ) -> Result<String>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        let ext = Self::check_upload(kind, filename, content_type)?;
        let name = format!("{}.{ext}", random_code(20).to_lowercase());
        let temp = self.root.join(".tmp").join(&name);
        match self.write_temp(&temp, stream).await {
            Ok(size) if size > 0 => {
                let key = format!("{}/{name}", kind.prefix());
                tokio::fs::rename(&temp, self.root.join(&key)).await?;
                info!("stored {} ({} bytes)", key, size);
                Ok(key)
            }
            Ok(_) => {
                let _ = tokio::fs::remove_file(&temp).await;
                Err(Error::BadRequest(format!("File {filename} is empty")))
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp).await;
                Err(e)
            }
        }
    }

    async fn write_temp<S, E>(&self, path: &Path, stream: S) -> Result<usize>
    where
        S: Stream<Item = std::result::Result<Bytes, E>>,
        E: Display,
    {
        let mut stream = std::pin::pin!(stream);
        let mut file = File::create(path).await?;
        let mut size = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Error::BadRequest(format!("Failed to read chunk: {e}")))?;
            size += chunk.len();
            if size > self.max_bytes {
                return Err(Error::BadRequest(format!(
                    "Upload exceeds {} bytes",
                    self.max_bytes
                )));
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(size)
    }

    pub async fn put(&self, kind: AssetKind, filename: &str, content_type: Option<&str>, bytes: Bytes) -> Result<String> {
        let stream = futures_util::stream::iter([Ok::<_, std::convert::Infallible>(bytes)]);
        self.put_stream(kind, filename, content_type, stream).await
    }

    /// Resolve a key to its file, rejecting anything that is not `<prefix>/<name>`.
    pub fn path(&self, key: &str) -> Result<PathBuf> {
        let invalid = || Error::BadRequest(format!("Invalid media key {key}"));
        let (prefix, name) = key.split_once('/').ok_or_else(invalid)?;
        AssetKind::from_prefix(prefix).ok_or_else(invalid)?;
        let valid_name = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_');
        if !valid_name {
            return Err(invalid());
        }
        Ok(self.root.join(prefix).join(name))
    }

    pub async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Best effort removal of objects that are no longer referenced.
    pub async fn delete_all(&self, keys: &[String]) {
        for key in keys {
            if let Err(e) = self.delete(key).await {
                warn!("failed to delete {}: {}", key, e);
            }
        }
    }

    fn payload(key: &str, expires: i64) -> String {
        format!("{key}:{expires}")
    }

    pub fn signed_url(&self, key: &str, ttl_secs: i64) -> String {
        let expires = now_utc().unix_timestamp() + ttl_secs;
        let signature = self.signer.sign(Self::payload(key, expires).as_bytes());
        format!("/media/{key}?expires={expires}&signature={signature}")
    }

    pub fn verify(&self, key: &str, expires: i64, signature: &str) -> Result<()> {
        if !self
            .signer
            .verify(Self::payload(key, expires).as_bytes(), signature)
        {
            return Err(Error::Forbidden("Invalid media signature".to_string()));
        }
        if expires < now_utc().unix_timestamp() {
            return Err(Error::Forbidden("Media link has expired".to_string()));
        }
        Ok(())
    }
}
