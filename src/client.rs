//! Client-side helpers only: a thin substrate for whatever joins a match,
//! not an interactive CLI. Covers the three things every client needs —
//! chunked download assembly, tracking which version is installed locally,
//! and spawning the rendered launch descriptor — so a real client only has
//! to supply UI and a transport connection.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::PlatformError;
use crate::rooms::launcher::ClientLaunchDescriptor;

/// What's actually installed locally for a game, tracked so a client can
/// decide whether `GAME.DOWNLOAD_BEGIN` is needed before joining a room.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct InstalledVersions {
    #[serde(flatten)]
    installed: HashMap<String, i64>,
}

/// Persists installed-version bookkeeping to a small JSON file next to the
/// client's local install directory — the client-side analogue of the
/// catalog's version table.
pub struct LocalVersionTracker {
    path: PathBuf,
}

impl LocalVersionTracker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> InstalledVersions {
        std::fs::read_to_string(&self.path)
            .ok()
            .and_then(|text| serde_json::from_str(&text).ok())
            .unwrap_or_default()
    }

    pub fn installed_version(&self, game_name: &str) -> Option<i64> {
        self.load().installed.get(game_name).copied()
    }

    pub fn needs_download(&self, game_name: &str, latest_version: i64) -> bool {
        self.installed_version(game_name).is_none_or(|v| v < latest_version)
    }

    pub fn record_install(&self, game_name: &str, version: i64) -> Result<(), PlatformError> {
        let mut state = self.load();
        state.installed.insert(game_name.to_string(), version);
        let text = serde_json::to_string_pretty(&state).expect("InstalledVersions always serializes");
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, text)?;
        Ok(())
    }
}

/// Assembles chunks returned by `GAME.DOWNLOAD_CHUNK` into the local
/// install directory's archive file, in order.
pub struct DownloadAssembler {
    file: std::fs::File,
    next_seq: u64,
}

impl DownloadAssembler {
    pub fn create(dest: &Path) -> Result<Self, PlatformError> {
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self {
            file: std::fs::File::create(dest)?,
            next_seq: 0,
        })
    }

    pub fn append(&mut self, seq: u64, data: &[u8]) -> Result<(), PlatformError> {
        use std::io::Write;
        if seq != self.next_seq {
            return Err(PlatformError::Validation(format!(
                "out-of-order download chunk received locally: expected {}, got {seq}",
                self.next_seq
            )));
        }
        self.file.write_all(data)?;
        self.next_seq += 1;
        Ok(())
    }
}

/// Fills in the one placeholder the server intentionally left unresolved
/// (`{player_name}`) and spawns the client process. Token secrets are never
/// on this path's argv — `Manifest::validate` already guaranteed that for
/// every template the server rendered.
pub async fn launch_local_game(
    descriptor: &ClientLaunchDescriptor,
    player_name: &str,
) -> Result<tokio::process::Child, PlatformError> {
    let substitute = |s: &str| s.replace("{player_name}", player_name);

    let mut argv = descriptor.command_template.iter().map(|t| substitute(t));
    let program = argv.next().ok_or_else(|| PlatformError::Internal("empty client command template".into()))?;
    let args: Vec<String> = argv.collect();

    let env: HashMap<String, String> = descriptor.env.iter().map(|(k, v)| (k.clone(), substitute(v))).collect();

    tokio::process::Command::new(program)
        .args(args)
        .current_dir(&descriptor.working_dir)
        .envs(env)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PlatformError::Internal(format!("failed to spawn client process: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_installed_versions_across_loads() {
        let path = std::env::temp_dir().join(format!("arcadehost-client-{}.json", uuid::Uuid::new_v4()));
        let tracker = LocalVersionTracker::new(&path);
        assert!(tracker.needs_download("G", 0));
        tracker.record_install("G", 0).unwrap();
        assert!(!tracker.needs_download("G", 0));
        assert!(tracker.needs_download("G", 1));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn download_assembler_rejects_out_of_order_chunks() {
        let path = std::env::temp_dir().join(format!("arcadehost-dl-{}.tar.gz", uuid::Uuid::new_v4()));
        let mut assembler = DownloadAssembler::create(&path).unwrap();
        assembler.append(0, b"abc").unwrap();
        let err = assembler.append(2, b"def").unwrap_err();
        assert!(matches!(err, PlatformError::Validation(_)));
        let _ = std::fs::remove_file(&path);
    }
}
