pub mod download;
pub mod manifest;
pub mod staging;
pub mod upload;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::error::PlatformError;
use crate::package::download::DownloadSession;
use crate::package::upload::{ExpectedMetadata, UploadSession};

/// Chunked, resumable upload/download sessions plus the published package
/// tree on disk (`base/<game_name>/<version>/`). Session tables are guarded
/// by a `std::sync::RwLock` that is only ever held to clone/insert/remove an
/// `Arc`, never across an `.await` — the per-session work happens under the
/// session's own `tokio::sync::Mutex` instead.
pub struct PackageStore {
    base_dir: PathBuf,
    tmp_dir: PathBuf,
    uploads: RwLock<HashMap<String, Arc<Mutex<UploadSession>>>>,
    downloads: RwLock<HashMap<String, Arc<Mutex<DownloadSession>>>>,
}

impl PackageStore {
    pub async fn new(base_dir: impl Into<PathBuf>) -> Result<Self, PlatformError> {
        let base_dir = base_dir.into();
        let tmp_dir = base_dir.join("tmp");
        tokio::fs::create_dir_all(&base_dir).await?;
        tokio::fs::create_dir_all(&tmp_dir).await?;
        Ok(Self {
            base_dir,
            tmp_dir,
            uploads: RwLock::new(HashMap::new()),
            downloads: RwLock::new(HashMap::new()),
        })
    }

    pub async fn upload_begin(&self, author: &str, expected: ExpectedMetadata) -> Result<String, PlatformError> {
        let session = UploadSession::begin(&self.tmp_dir, author, expected).await?;
        let upload_id = session.upload_id.clone();
        self.uploads
            .write()
            .expect("uploads lock poisoned")
            .insert(upload_id.clone(), Arc::new(Mutex::new(session)));
        Ok(upload_id)
    }

    fn upload_handle(&self, upload_id: &str) -> Result<Arc<Mutex<UploadSession>>, PlatformError> {
        self.uploads
            .read()
            .expect("uploads lock poisoned")
            .get(upload_id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("unknown upload session: {upload_id}")))
    }

    pub async fn upload_chunk(&self, upload_id: &str, seq: u64, data: &[u8]) -> Result<(), PlatformError> {
        let handle = self.upload_handle(upload_id)?;
        let mut session = handle.lock().await;
        session.write_chunk(seq, data).await
    }

    /// Finalizes an upload: extract, validate, publish, and drop the session
    /// from the table regardless of outcome.
    pub async fn upload_end(&self, upload_id: &str, catalog: &Catalog) -> Result<(i64, i64), PlatformError> {
        let handle = self
            .uploads
            .write()
            .expect("uploads lock poisoned")
            .remove(upload_id)
            .ok_or_else(|| PlatformError::NotFound(format!("unknown upload session: {upload_id}")))?;
        let session = Arc::try_unwrap(handle)
            .map_err(|_| PlatformError::Internal("upload session in use by another request".into()))?
            .into_inner();
        session.commit(&self.base_dir, catalog).await
    }

    pub async fn upload_abort(&self, upload_id: &str) {
        let handle = self.uploads.write().expect("uploads lock poisoned").remove(upload_id);
        if let Some(handle) = handle
            && let Ok(session) = Arc::try_unwrap(handle)
        {
            session.into_inner().abort().await;
        }
    }

    pub fn package_dir(&self, game_name: &str, version: i64) -> PathBuf {
        self.base_dir.join(game_name).join(version.to_string())
    }

    /// Loads the manifest of an already-published package, used by the room
    /// launcher when a host starts a match.
    pub async fn load_manifest(&self, game_name: &str, version: i64) -> Result<crate::package::manifest::Manifest, PlatformError> {
        let path = self.package_dir(game_name, version).join("manifest.json");
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| PlatformError::NotFound(format!("no published package for {game_name} v{version}")))?;
        serde_json::from_str(&text).map_err(|e| PlatformError::Internal(format!("stored manifest is corrupt: {e}")))
    }

    pub async fn download_begin(&self, game_name: &str, version: i64) -> Result<(String, u64), PlatformError> {
        let package_dir = self.base_dir.join(game_name).join(version.to_string());
        let session = DownloadSession::begin(&self.tmp_dir, &package_dir, game_name, version).await?;
        let download_id = session.download_id.clone();
        let total_len = session.total_len();
        self.downloads
            .write()
            .expect("downloads lock poisoned")
            .insert(download_id.clone(), Arc::new(Mutex::new(session)));
        Ok((download_id, total_len))
    }

    fn download_handle(&self, download_id: &str) -> Result<Arc<Mutex<DownloadSession>>, PlatformError> {
        self.downloads
            .read()
            .expect("downloads lock poisoned")
            .get(download_id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("unknown download session: {download_id}")))
    }

    pub async fn download_chunk(&self, download_id: &str, seq: u64) -> Result<Option<Vec<u8>>, PlatformError> {
        let handle = self.download_handle(download_id)?;
        let mut session = handle.lock().await;
        session.next_chunk(seq).await
    }

    /// Completes a download and reports `(game_name, version)` so the
    /// caller can record review eligibility. Drops the session from the
    /// table unconditionally.
    pub async fn download_end(&self, download_id: &str) -> Result<(String, i64), PlatformError> {
        let handle = self
            .downloads
            .write()
            .expect("downloads lock poisoned")
            .remove(download_id)
            .ok_or_else(|| PlatformError::NotFound(format!("unknown download session: {download_id}")))?;
        let session = Arc::try_unwrap(handle)
            .map_err(|_| PlatformError::Internal("download session in use by another request".into()))?
            .into_inner();
        let (game_name, version) = (session.game_name.clone(), session.version);
        session.end().await;
        Ok((game_name, version))
    }

    pub async fn download_abort(&self, download_id: &str) {
        let handle = self.downloads.write().expect("downloads lock poisoned").remove(download_id);
        if let Some(handle) = handle
            && let Ok(session) = Arc::try_unwrap(handle)
        {
            session.into_inner().abort().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use sqlx::SqlitePool;

    fn make_upload_archive(path: &std::path::Path) {
        let manifest = serde_json::json!({
            "game_name": "G",
            "version": "ignored",
            "type": "CLI",
            "max_players": 2,
            "description": "d",
            "server": {"command": "bin --port {port}", "working_dir": ".", "env": {}},
            "client": {"command": "bin --host {host}", "working_dir": ".", "env": {}},
            "assets": [],
            "healthcheck": null,
        })
        .to_string();
        let file = std::fs::File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest.len() as u64);
        header.set_cksum();
        builder.append_data(&mut header, "manifest.json", manifest.as_bytes()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[tokio::test]
    async fn upload_then_download_round_trip() {
        let root = std::env::temp_dir().join(format!("arcadehost-pkg-{}", Uuid::new_v4()));
        let store = PackageStore::new(root.join("base")).await.unwrap();
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let catalog = Catalog::new(pool).await.unwrap();

        let expected = ExpectedMetadata {
            game_name: "G".into(),
            type_: "CLI".into(),
            max_players: 2,
            description: "d".into(),
        };
        let upload_id = store.upload_begin("alice", expected).await.unwrap();

        let archive_tmp = std::env::temp_dir().join(format!("arcadehost-src-{}", Uuid::new_v4()));
        make_upload_archive(&archive_tmp);
        let bytes = std::fs::read(&archive_tmp).unwrap();
        let _ = std::fs::remove_file(&archive_tmp);
        store.upload_chunk(&upload_id, 0, &bytes).await.unwrap();
        let (version, max_players) = store.upload_end(&upload_id, &catalog).await.unwrap();
        assert_eq!(version, 0);
        assert_eq!(max_players, 2);

        let (download_id, total_len) = store.download_begin("G", version).await.unwrap();
        assert!(total_len > 0);
        let mut collected = Vec::new();
        let mut seq = 0;
        loop {
            match store.download_chunk(&download_id, seq).await.unwrap() {
                Some(chunk) => {
                    collected.extend(chunk);
                    seq += 1;
                }
                None => break,
            }
        }
        let (game_name, ended_version) = store.download_end(&download_id).await.unwrap();
        assert_eq!(game_name, "G");
        assert_eq!(ended_version, version);
        assert_eq!(collected.len() as u64, total_len);

        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn unknown_upload_id_is_not_found() {
        let root = std::env::temp_dir().join(format!("arcadehost-pkg-{}", Uuid::new_v4()));
        let store = PackageStore::new(root.join("base")).await.unwrap();
        let err = store.upload_chunk("nope", 0, b"x").await.unwrap_err();
        assert!(matches!(err, PlatformError::NotFound(_)));
        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
