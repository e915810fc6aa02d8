use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;

use tokio::net::TcpListener;
use uuid::Uuid;

use crate::error::PlatformError;
use crate::package::manifest::{render_template, render_template_partial, LaunchSpec, Manifest};
use crate::protocol::random_token;
use crate::rooms::registry::Room;

const MAX_PORT_ALLOC_ATTEMPTS: u32 = 20;

/// Everything the launcher needs to know that isn't in the manifest or the
/// room itself: where the platform listens for child reports, and the
/// protocol version every launched process should be told about.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub bind_host: String,
    pub report_host: String,
    pub report_port: u16,
    pub platform_protocol_version: String,
    pub secrets_root: PathBuf,
}

/// A rendered, ready-to-hand-to-the-client description of how to join a
/// running match. The server side has already been spawned by the time this
/// is constructed; this is what `GAME.START`'s response payload carries.
#[derive(Debug, Clone)]
pub struct ClientLaunchDescriptor {
    pub command_template: Vec<String>,
    pub working_dir: String,
    pub env: HashMap<String, String>,
}

pub struct Launch {
    pub child: tokio::process::Child,
    pub port: u16,
    pub match_id: String,
    pub report_token: String,
    pub client_token: String,
    pub client: ClientLaunchDescriptor,
    secrets_dir: PathBuf,
}

/// Binds a free port by letting the OS choose (port 0), then immediately
/// drops the probe listener so the child process can bind it itself.
/// Retries on the rare chance the kernel hands back a port this process has
/// already handed to another in-flight launch.
async fn alloc_port(reserved: &Mutex<HashSet<u16>>) -> Result<u16, PlatformError> {
    for _ in 0..MAX_PORT_ALLOC_ATTEMPTS {
        let listener = TcpListener::bind(("0.0.0.0", 0)).await?;
        let port = listener.local_addr()?.port();
        drop(listener);

        let mut guard = reserved.lock().expect("reserved ports lock poisoned");
        if guard.insert(port) {
            return Ok(port);
        }
    }
    Err(PlatformError::Internal("exhausted port allocation attempts".into()))
}

fn render_argv(command_template: &str, context: &HashMap<String, String>) -> Result<Vec<String>, PlatformError> {
    command_template
        .split_whitespace()
        .map(|token| render_template(token, context))
        .collect()
}

fn render_argv_partial(command_template: &str, context: &HashMap<String, String>) -> Vec<String> {
    command_template
        .split_whitespace()
        .map(|token| render_template_partial(token, context))
        .collect()
}

fn render_env(spec: &LaunchSpec, context: &HashMap<String, String>) -> Result<HashMap<String, String>, PlatformError> {
    spec.env
        .iter()
        .map(|(k, v)| render_template(v, context).map(|rendered| (k.clone(), rendered)))
        .collect()
}

fn render_env_partial(spec: &LaunchSpec, context: &HashMap<String, String>) -> HashMap<String, String> {
    spec.env
        .iter()
        .map(|(k, v)| (k.clone(), render_template_partial(v, context)))
        .collect()
}

/// Launches `manifest.server` for `room`, spawning the game process with its
/// secrets delivered via environment/files, never argv — enforced upstream
/// by `Manifest::validate`, not re-checked here.
pub async fn launch(
    manifest: &Manifest,
    room: &Room,
    config: &LaunchConfig,
    reserved_ports: &Mutex<HashSet<u16>>,
) -> Result<Launch, PlatformError> {
    let port = alloc_port(reserved_ports).await?;
    let match_id = Uuid::new_v4().to_string();
    let client_token = random_token();
    let report_token = random_token();

    let secrets_dir = config.secrets_root.join(&match_id);
    tokio::fs::create_dir_all(&secrets_dir).await?;
    let client_token_path = secrets_dir.join("client_token");
    let report_token_path = secrets_dir.join("report_token");
    tokio::fs::write(&client_token_path, &client_token).await?;
    tokio::fs::write(&report_token_path, &report_token).await?;

    let mut context = HashMap::new();
    context.insert("host".to_string(), config.bind_host.clone());
    context.insert("bind_host".to_string(), config.bind_host.clone());
    context.insert("port".to_string(), port.to_string());
    context.insert("room_id".to_string(), room.room_id.to_string());
    context.insert("match_id".to_string(), match_id.clone());
    context.insert("client_token".to_string(), client_token.clone());
    context.insert("report_token".to_string(), report_token.clone());
    context.insert("client_token_path".to_string(), client_token_path.display().to_string());
    context.insert("report_token_path".to_string(), report_token_path.display().to_string());
    context.insert("report_host".to_string(), config.report_host.clone());
    context.insert("report_port".to_string(), config.report_port.to_string());
    context.insert(
        "platform_protocol_version".to_string(),
        config.platform_protocol_version.clone(),
    );
    context.insert("player_count".to_string(), room.players.len().to_string());
    context.insert(
        "players_csv".to_string(),
        room.players.join(","),
    );
    let players_json = serde_json::to_string(&room.players).expect("Vec<String> always serializes");
    context.insert("players_json".to_string(), players_json.clone());
    let players_json_path = secrets_dir.join("players.json");
    tokio::fs::write(&players_json_path, &players_json).await?;
    context.insert("players_json_path".to_string(), players_json_path.display().to_string());
    for (i, player) in room.players.iter().enumerate() {
        context.insert(format!("p{}", i + 1), player.clone());
    }

    let argv = render_argv(&manifest.server.command, &context)?;
    let Some((program, args)) = argv.split_first() else {
        return Err(PlatformError::Internal("server command template is empty".into()));
    };
    let env = render_env(&manifest.server, &context)?;

    log::info!("launching match {match_id} for room {} on port {port}", room.room_id);

    let child = tokio::process::Command::new(program)
        .args(args)
        .current_dir(&manifest.server.working_dir)
        .envs(env)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PlatformError::Internal(format!("failed to spawn server process: {e}")))?;

    // player_name is intentionally left unresolved: the client shim fills it
    // in locally for whichever player is running the command.
    let client_argv = render_argv_partial(&manifest.client.command, &context);
    let client_env = render_env_partial(&manifest.client, &context);

    Ok(Launch {
        child,
        port,
        match_id,
        report_token,
        client_token,
        client: ClientLaunchDescriptor {
            command_template: client_argv,
            working_dir: manifest.client.working_dir.clone(),
            env: client_env,
        },
        secrets_dir,
    })
}

impl Launch {
    pub async fn cleanup_secrets(&self) {
        let _ = tokio::fs::remove_dir_all(&self.secrets_dir).await;
    }
}

pub fn release_port(reserved: &Mutex<HashSet<u16>>, port: u16) {
    reserved.lock().expect("reserved ports lock poisoned").remove(&port);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_argv_splits_on_whitespace_and_substitutes() {
        let mut context = HashMap::new();
        context.insert("host".to_string(), "127.0.0.1".to_string());
        context.insert("port".to_string(), "9000".to_string());
        let argv = render_argv("server --host {host} --port {port}", &context).unwrap();
        assert_eq!(argv, vec!["server", "--host", "127.0.0.1", "--port", "9000"]);
    }

    #[test]
    fn render_argv_partial_leaves_player_name_untouched() {
        let context = HashMap::new();
        let argv = render_argv_partial("client --name {player_name}", &context);
        assert_eq!(argv, vec!["client", "--name", "{player_name}"]);
    }

    #[tokio::test]
    async fn alloc_port_never_reuses_reserved_ports() {
        let reserved = Mutex::new(HashSet::new());
        let a = alloc_port(&reserved).await.unwrap();
        let b = alloc_port(&reserved).await.unwrap();
        assert_ne!(a, b);
        release_port(&reserved, a);
        assert!(!reserved.lock().unwrap().contains(&a));
    }
}
