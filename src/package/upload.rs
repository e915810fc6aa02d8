use std::path::PathBuf;

use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::error::PlatformError;
use crate::package::manifest::Manifest;
use crate::package::staging;

/// Metadata the uploader declares at `GAME.UPLOAD_BEGIN`, before the
/// manifest inside the archive has even been read. The manifest is
/// cross-checked against this once the archive is unpacked.
#[derive(Debug, Clone)]
pub struct ExpectedMetadata {
    pub game_name: String,
    pub type_: String,
    pub max_players: i64,
    pub description: String,
}

/// One in-flight chunked upload. Chunks must arrive in order; anything out
/// of sequence aborts the session rather than silently reordering bytes.
pub struct UploadSession {
    pub upload_id: String,
    staging_dir: PathBuf,
    archive_path: PathBuf,
    writer: File,
    next_seq: u64,
    author: String,
    expected: ExpectedMetadata,
}

impl UploadSession {
    pub async fn begin(tmp_root: &std::path::Path, author: &str, expected: ExpectedMetadata) -> Result<Self, PlatformError> {
        let upload_id = Uuid::new_v4().to_string();
        let staging_dir = tmp_root.join(format!("upload-{upload_id}"));
        tokio::fs::create_dir_all(&staging_dir).await?;
        let archive_path = staging_dir.join("upload.tar.gz");
        let writer = File::create(&archive_path).await?;
        Ok(Self {
            upload_id,
            staging_dir,
            archive_path,
            writer,
            next_seq: 0,
            author: author.to_string(),
            expected,
        })
    }

    pub async fn write_chunk(&mut self, seq: u64, data: &[u8]) -> Result<(), PlatformError> {
        if seq != self.next_seq {
            return Err(PlatformError::Validation(format!(
                "out-of-order upload chunk: expected seq {}, got {seq}",
                self.next_seq
            )));
        }
        self.writer.write_all(data).await?;
        self.next_seq += 1;
        Ok(())
    }

    /// Extracts the staged archive, validates its manifest, assigns the next
    /// catalog version, and atomically renames the extraction into the
    /// published tree. Returns the published `(version, max_players)`.
    ///
    /// The rename happens before the catalog row is inserted; if the insert
    /// fails (e.g. a concurrent publisher raced us to the same version) the
    /// renamed directory is removed so no orphaned tree survives.
    pub async fn commit(mut self, base_dir: &std::path::Path, catalog: &Catalog) -> Result<(i64, i64), PlatformError> {
        self.writer.flush().await?;

        let extract_dir = self.staging_dir.join("extracted");
        tokio::fs::create_dir_all(&extract_dir).await?;

        let archive_path = self.archive_path.clone();
        let extract_dir_clone = extract_dir.clone();
        tokio::task::spawn_blocking(move || staging::extract_tar_gz(&archive_path, &extract_dir_clone))
            .await
            .map_err(|e| PlatformError::Internal(e.to_string()))??;

        let extract_dir_clone = extract_dir.clone();
        let manifest_path = tokio::task::spawn_blocking(move || staging::find_manifest(&extract_dir_clone))
            .await
            .map_err(|e| PlatformError::Internal(e.to_string()))??;
        let manifest_text = tokio::fs::read_to_string(&manifest_path).await?;
        let manifest: Manifest = serde_json::from_str(&manifest_text)
            .map_err(|e| PlatformError::Validation(format!("invalid manifest.json: {e}")))?;

        manifest.validate()?;
        manifest.cross_check(&self.expected.game_name, &self.expected.type_)?;

        let package_root = manifest_path.parent().unwrap_or(&extract_dir).to_path_buf();

        let version = catalog
            .next_version(&self.author, &self.expected.game_name, &self.expected.type_)
            .await?;
        let target_dir = base_dir.join(&self.expected.game_name).join(version.to_string());
        if target_dir.exists() {
            self.cleanup().await;
            return Err(PlatformError::Conflict("target version already exists on disk".into()));
        }
        if let Some(parent) = target_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&package_root, &target_dir).await?;

        let publish_result = catalog
            .publish(
                &self.author,
                &self.expected.game_name,
                version,
                &self.expected.type_,
                self.expected.max_players,
                &self.expected.description,
            )
            .await;

        if let Err(err) = publish_result {
            let _ = tokio::fs::remove_dir_all(&target_dir).await;
            self.cleanup().await;
            return Err(err);
        }

        self.cleanup().await;
        Ok((version, self.expected.max_players))
    }

    pub async fn abort(self) {
        self.cleanup().await;
    }

    async fn cleanup(&self) {
        let _ = tokio::fs::remove_dir_all(&self.staging_dir).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use sqlx::SqlitePool;

    fn make_upload_archive(path: &std::path::Path, manifest_json: &str) {
        let file = std::fs::File::create(path).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest_json.len() as u64);
        header.set_cksum();
        builder.append_data(&mut header, "manifest.json", manifest_json.as_bytes()).unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }

    fn valid_manifest_json() -> String {
        serde_json::json!({
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
        .to_string()
    }

    #[tokio::test]
    async fn commit_publishes_archive_and_assigns_version() {
        let root = std::env::temp_dir().join(format!("arcadehost-up-{}", Uuid::new_v4()));
        let tmp_root = root.join("tmp");
        let base_dir = root.join("base");
        tokio::fs::create_dir_all(&tmp_root).await.unwrap();
        tokio::fs::create_dir_all(&base_dir).await.unwrap();

        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let catalog = Catalog::new(pool).await.unwrap();

        let expected = ExpectedMetadata {
            game_name: "G".into(),
            type_: "CLI".into(),
            max_players: 2,
            description: "d".into(),
        };
        let mut session = UploadSession::begin(&tmp_root, "alice", expected).await.unwrap();

        let archive_bytes = {
            let tmp = std::env::temp_dir().join(format!("arcadehost-src-{}", Uuid::new_v4()));
            make_upload_archive(&tmp, &valid_manifest_json());
            let bytes = std::fs::read(&tmp).unwrap();
            let _ = std::fs::remove_file(&tmp);
            bytes
        };
        session.write_chunk(0, &archive_bytes).await.unwrap();

        let (version, max_players) = session.commit(&base_dir, &catalog).await.unwrap();
        assert_eq!(version, 0);
        assert_eq!(max_players, 2);
        assert!(base_dir.join("G").join("0").join("manifest.json").is_file());

        let _ = tokio::fs::remove_dir_all(&root).await;
    }

    #[tokio::test]
    async fn out_of_order_chunk_is_rejected() {
        let root = std::env::temp_dir().join(format!("arcadehost-up-{}", Uuid::new_v4()));
        tokio::fs::create_dir_all(&root).await.unwrap();
        let expected = ExpectedMetadata {
            game_name: "G".into(),
            type_: "CLI".into(),
            max_players: 2,
            description: "d".into(),
        };
        let mut session = UploadSession::begin(&root, "alice", expected).await.unwrap();
        let err = session.write_chunk(1, b"data").await.unwrap_err();
        assert!(matches!(err, PlatformError::Validation(_)));
        session.abort().await;
        let _ = tokio::fs::remove_dir_all(&root).await;
    }
}
