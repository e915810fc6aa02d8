use std::path::PathBuf;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;

use crate::error::PlatformError;
use crate::package::staging;

pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// One in-flight chunked download. The published tree is packed into a
/// fresh archive under a temp dir at `begin`, then streamed out in
/// `DEFAULT_CHUNK_SIZE` slices; `end`/`abort` both remove the temp archive.
#[derive(Debug)]
pub struct DownloadSession {
    pub download_id: String,
    pub game_name: String,
    pub version: i64,
    archive_path: PathBuf,
    reader: Option<File>,
    next_seq: u64,
    cursor: u64,
    total_len: u64,
    done: bool,
}

impl DownloadSession {
    pub async fn begin(
        tmp_root: &std::path::Path,
        package_dir: &std::path::Path,
        game_name: &str,
        version: i64,
    ) -> Result<Self, PlatformError> {
        if !package_dir.is_dir() {
            return Err(PlatformError::NotFound(format!("package not found: {game_name} v{version}")));
        }
        let download_id = Uuid::new_v4().to_string();
        let staging_dir = tmp_root.join(format!("download-{download_id}"));
        tokio::fs::create_dir_all(&staging_dir).await?;
        let archive_path = staging_dir.join("download.tar.gz");

        let src = package_dir.to_path_buf();
        let dest = archive_path.clone();
        tokio::task::spawn_blocking(move || staging::create_tar_gz(&src, &dest))
            .await
            .map_err(|e| PlatformError::Internal(e.to_string()))??;

        let meta = tokio::fs::metadata(&archive_path).await?;
        let reader = File::open(&archive_path).await?;

        Ok(Self {
            download_id,
            game_name: game_name.to_string(),
            version,
            archive_path,
            reader: Some(reader),
            next_seq: 0,
            cursor: 0,
            total_len: meta.len(),
            done: false,
        })
    }

    pub fn total_len(&self) -> u64 {
        self.total_len
    }

    /// Reads the next `DEFAULT_CHUNK_SIZE`-sized slice, enforcing the same
    /// strict sequence order the upload side enforces. Returns `None` once
    /// the archive has been fully drained.
    pub async fn next_chunk(&mut self, seq: u64) -> Result<Option<Vec<u8>>, PlatformError> {
        if seq != self.next_seq {
            return Err(PlatformError::Validation(format!(
                "out-of-order download chunk request: expected seq {}, got {seq}",
                self.next_seq
            )));
        }
        if self.done {
            return Ok(None);
        }
        let reader = self.reader.as_mut().ok_or(PlatformError::Internal("download session already closed".into()))?;
        reader.seek(std::io::SeekFrom::Start(self.cursor)).await?;

        let mut buf = vec![0u8; DEFAULT_CHUNK_SIZE];
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            self.done = true;
            return Ok(None);
        }
        buf.truncate(n);
        self.cursor += n as u64;
        self.next_seq += 1;
        if self.cursor >= self.total_len {
            self.done = true;
        }
        Ok(Some(buf))
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub async fn end(self) {
        self.cleanup().await;
    }

    pub async fn abort(self) {
        self.cleanup().await;
    }

    async fn cleanup(&self) {
        if let Some(parent) = self.archive_path.parent() {
            let _ = tokio::fs::remove_dir_all(parent).await;
        }
    }
}
