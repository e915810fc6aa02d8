use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{json, Value};

use crate::catalog::Catalog;
use crate::config::Config;
use crate::error::PlatformError;
use crate::identity::{IdentityStore, Role};
use crate::package::PackageStore;
use crate::protocol::envelope::{types, Request, Response};
use crate::reviews::ReviewStore;
use crate::rooms::launcher::{self, LaunchConfig};
use crate::rooms::registry::{RoomMetadata, RoomRegistry};

/// Healthcheck window used when a manifest doesn't declare its own
/// `healthcheck.timeout_sec` (spec default).
const DEFAULT_HEALTHCHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a handler needs: the stores plus process-wide state shared
/// across connections. One instance lives for the lifetime of the server.
pub struct Platform {
    pub identity: IdentityStore,
    pub catalog: Catalog,
    pub reviews: ReviewStore,
    pub packages: PackageStore,
    pub rooms: Arc<RoomRegistry>,
    pub reserved_ports: Arc<Mutex<HashSet<u16>>>,
    pub config: Config,
}

/// Parses a request, runs it through the dispatch table, and always
/// produces a `Response` — this is the single point where a `PlatformError`
/// becomes an envelope, so handlers themselves never touch wire format.
pub async fn dispatch(platform: &Platform, request: Request) -> Response {
    let request_id = request.request_id.clone();
    match handle(platform, &request).await {
        Ok(payload) => Response::ok(&request.type_, request_id, payload),
        Err(err) => {
            log::warn!("{} failed: {err}", request.type_);
            Response::error(&request.type_, request_id, &err)
        }
    }
}

async fn handle(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    match request.type_.as_str() {
        types::ACCOUNT_REGISTER_PLAYER => account_register(platform, request, Role::Player).await,
        types::ACCOUNT_REGISTER_DEVELOPER => account_register(platform, request, Role::Developer).await,
        types::ACCOUNT_LOGIN_PLAYER => account_login(platform, request, Role::Player).await,
        types::ACCOUNT_LOGIN_DEVELOPER => account_login(platform, request, Role::Developer).await,
        types::ACCOUNT_LOGOUT_PLAYER | types::ACCOUNT_LOGOUT_DEVELOPER => account_logout(platform, request).await,

        types::GAME_LIST_GAME => game_list(platform, request).await,
        types::GAME_GET_DETAILS => game_get_details(platform, request).await,
        types::GAME_UPLOAD_BEGIN => game_upload_begin(platform, request).await,
        types::GAME_UPLOAD_CHUNK => game_upload_chunk(platform, request).await,
        types::GAME_UPLOAD_END => game_upload_end(platform, request).await,
        types::GAME_DOWNLOAD_BEGIN => game_download_begin(platform, request).await,
        types::GAME_DOWNLOAD_CHUNK => game_download_chunk(platform, request).await,
        types::GAME_DOWNLOAD_END => game_download_end(platform, request).await,
        types::GAME_START => game_start(platform, request).await,

        types::LOBBY_LIST_ROOMS => lobby_list_rooms(platform, request).await,
        types::LOBBY_CREATE_ROOM => lobby_create_room(platform, request).await,
        types::LOBBY_JOIN_ROOM => lobby_join_room(platform, request).await,
        types::LOBBY_LEAVE_ROOM => lobby_leave_room(platform, request).await,

        types::ROOM_GET => room_get(platform, request).await,
        types::ROOM_READY => room_ready(platform, request).await,

        types::REVIEW_SEARCH_AUTHOR => review_search_author(platform, request).await,
        types::REVIEW_SEARCH_GAME => review_search_game(platform, request).await,
        types::REVIEW_ADD => review_add(platform, request).await,
        types::REVIEW_EDIT => review_edit(platform, request).await,
        types::REVIEW_DELETE => review_delete(platform, request).await,
        types::REVIEW_ELIGIBILITY_CHECK => review_eligibility_check(platform, request).await,

        types::USER_LIST => user_list(platform, request).await,

        other => Err(PlatformError::UnknownType(other.to_string())),
    }
}

fn field_str<'a>(payload: &'a Value, key: &str) -> Result<&'a str, PlatformError> {
    payload
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| PlatformError::Validation(format!("missing or invalid field: {key}")))
}

fn field_i64(payload: &Value, key: &str) -> Result<i64, PlatformError> {
    payload
        .get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| PlatformError::Validation(format!("missing or invalid field: {key}")))
}

fn field_i64_opt(payload: &Value, key: &str) -> Option<i64> {
    payload.get(key).and_then(Value::as_i64)
}

fn field_u64(payload: &Value, key: &str) -> Result<u64, PlatformError> {
    payload
        .get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| PlatformError::Validation(format!("missing or invalid field: {key}")))
}

fn field_bool_opt(payload: &Value, key: &str) -> bool {
    payload.get(key).and_then(Value::as_bool).unwrap_or(false)
}

/// Splits a `host:port` bind address into its parts, used to keep
/// `report_host`/`report_port` distinct template values instead of handing a
/// manifest template the whole `"host:port"` string under `{report_host}`.
fn split_host_port(bind: &str) -> (String, u16) {
    match bind.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(0)),
        None => (bind.to_string(), 0),
    }
}

fn require_token<'a>(request: &'a Request) -> Result<&'a str, PlatformError> {
    request.token.as_deref().ok_or(PlatformError::InvalidToken("missing token"))
}

fn auth(platform: &Platform, request: &Request, role: Option<Role>) -> Result<(String, Role), PlatformError> {
    platform.identity.validate(require_token(request)?, role)
}

async fn account_register(platform: &Platform, request: &Request, role: Role) -> Result<Value, PlatformError> {
    let username = field_str(&request.payload, "username")?;
    let password = field_str(&request.payload, "password")?;
    let token = platform.identity.register(username, password, role).await?;
    Ok(json!({"token": token, "username": username, "role": role.as_str()}))
}

async fn account_login(platform: &Platform, request: &Request, role: Role) -> Result<Value, PlatformError> {
    let username = field_str(&request.payload, "username")?;
    let password = field_str(&request.payload, "password")?;
    let token = platform.identity.login(username, password, role).await?;
    Ok(json!({"token": token, "username": username, "role": role.as_str()}))
}

async fn account_logout(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    let token = require_token(request)?;
    let logged_out = platform.identity.logout(token);
    Ok(json!({"logged_out": logged_out}))
}

async fn game_list(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    let games = if let Some(author) = request.payload.get("author").and_then(Value::as_str) {
        platform.catalog.list_by_author(author).await?
    } else {
        return Err(PlatformError::Validation("author is required".into()));
    };
    Ok(json!({"games": games}))
}

async fn game_get_details(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    let game_name = field_str(&request.payload, "game_name")?;
    let row = match field_i64_opt(&request.payload, "version") {
        Some(version) => platform.catalog.get(game_name, version).await?,
        None => platform.catalog.get_latest(game_name).await?,
    };
    let row = row.ok_or_else(|| PlatformError::NotFound(format!("no such game: {game_name}")))?;
    Ok(serde_json::to_value(row).expect("GameRow always serializes"))
}

async fn game_upload_begin(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    let (author, _) = auth(platform, request, Some(Role::Developer))?;
    let expected = crate::package::upload::ExpectedMetadata {
        game_name: field_str(&request.payload, "game_name")?.to_string(),
        type_: field_str(&request.payload, "type")?.to_string(),
        max_players: field_i64(&request.payload, "max_players")?,
        description: field_str(&request.payload, "description")?.to_string(),
    };
    let upload_id = platform.packages.upload_begin(&author, expected).await?;
    Ok(json!({"upload_id": upload_id}))
}

async fn game_upload_chunk(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    auth(platform, request, Some(Role::Developer))?;
    let upload_id = field_str(&request.payload, "upload_id")?;
    let seq = field_u64(&request.payload, "seq")?;
    let data_b64 = field_str(&request.payload, "data")?;
    let data = BASE64
        .decode(data_b64)
        .map_err(|e| PlatformError::Validation(format!("invalid base64 chunk: {e}")))?;
    platform.packages.upload_chunk(upload_id, seq, &data).await?;
    Ok(json!({}))
}

async fn game_upload_end(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    auth(platform, request, Some(Role::Developer))?;
    let upload_id = field_str(&request.payload, "upload_id")?;
    let (version, max_players) = platform.packages.upload_end(upload_id, &platform.catalog).await?;
    Ok(json!({"version": version, "max_players": max_players}))
}

async fn game_download_begin(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    auth(platform, request, None)?;
    let game_name = field_str(&request.payload, "game_name")?;
    let version = match field_i64_opt(&request.payload, "version") {
        Some(v) => v,
        None => {
            platform
                .catalog
                .get_latest(game_name)
                .await?
                .ok_or_else(|| PlatformError::NotFound(format!("no such game: {game_name}")))?
                .version
        }
    };
    let (download_id, total_len) = platform.packages.download_begin(game_name, version).await?;
    Ok(json!({"download_id": download_id, "version": version, "total_bytes": total_len}))
}

async fn game_download_chunk(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    auth(platform, request, None)?;
    let download_id = field_str(&request.payload, "download_id")?;
    let seq = field_u64(&request.payload, "seq")?;
    let chunk = platform.packages.download_chunk(download_id, seq).await?;
    match chunk {
        Some(bytes) => {
            let encoded = BASE64.encode(&bytes);
            Ok(json!({"data": encoded, "done": false}))
        }
        None => Ok(json!({"data": Value::Null, "done": true})),
    }
}

async fn game_download_end(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    let (username, _) = auth(platform, request, None)?;
    let download_id = field_str(&request.payload, "download_id")?;
    let (game_name, version) = platform.packages.download_end(download_id).await?;
    platform.reviews.record_download(&username, &game_name, version).await?;
    Ok(json!({"game_name": game_name, "version": version}))
}

async fn game_start(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    let (username, _) = auth(platform, request, None)?;
    let room_id = field_u64(&request.payload, "room_id")?;
    let room = platform.rooms.get_room(room_id)?;
    let manifest = platform.packages.load_manifest(&room.metadata.game_name, room.metadata.version).await?;

    let (report_host, report_port) = split_host_port(&platform.config.report_bind);
    let launch_config = LaunchConfig {
        bind_host: "0.0.0.0".to_string(),
        report_host,
        report_port,
        platform_protocol_version: platform.config.platform_protocol_version.clone(),
        secrets_root: platform.config.data_dir.join("secrets"),
    };

    let mut launch = launcher::launch(&manifest, &room, &launch_config, &platform.reserved_ports).await?;
    let port = launch.port;
    let match_id = launch.match_id.clone();
    let report_token = launch.report_token.clone();

    let started = platform.rooms.start_match(room_id, &username, port, &match_id, &report_token);
    if let Err(err) = started {
        launch.cleanup_secrets().await;
        launcher::release_port(&platform.reserved_ports, port);
        return Err(err);
    }

    let timeout = manifest
        .healthcheck
        .as_ref()
        .map(|h| Duration::from_secs(h.timeout_sec))
        .unwrap_or(DEFAULT_HEALTHCHECK_TIMEOUT);
    let started_rx = platform.rooms.await_started(&match_id);

    let failure = tokio::select! {
        result = started_rx => result.is_err(),
        _ = launch.child.wait() => true,
        _ = tokio::time::sleep(timeout) => true,
    };

    if failure {
        platform.rooms.cancel_start_watch(&match_id);
        platform.rooms.revert_to_waiting(room_id);
        let _ = launch.child.start_kill();
        launch.cleanup_secrets().await;
        launcher::release_port(&platform.reserved_ports, port);
        return Err(PlatformError::Internal(format!(
            "match {match_id} for room {room_id} did not report STARTED within {}s",
            timeout.as_secs()
        )));
    }

    platform.rooms.store_child(room_id, launch.child);

    Ok(json!({
        "match_id": match_id,
        "port": port,
        "client_token": launch.client_token,
        "client": {
            "command": launch.client.command_template,
            "working_dir": launch.client.working_dir,
            "env": launch.client.env,
        },
    }))
}

async fn lobby_list_rooms(platform: &Platform, _request: &Request) -> Result<Value, PlatformError> {
    Ok(json!({"rooms": platform.rooms.list_rooms()}))
}

async fn lobby_create_room(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    let (username, _) = auth(platform, request, None)?;
    let room_name = field_str(&request.payload, "room_name")?;
    let game_name = field_str(&request.payload, "game_name")?;
    let game = platform
        .catalog
        .get_latest(game_name)
        .await?
        .ok_or_else(|| PlatformError::NotFound(format!("no such game: {game_name}")))?;

    let metadata = RoomMetadata {
        game_name: game.game_name,
        version: game.version,
        max_players: game.max_players,
        type_: game.type_,
    };
    let room = platform.rooms.create_room(room_name, &username, metadata, chrono::Utc::now());
    Ok(serde_json::to_value(room).expect("Room always serializes"))
}

async fn lobby_join_room(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    let (username, _) = auth(platform, request, None)?;
    let room_id = field_u64(&request.payload, "room_id")?;
    let as_spectator = field_bool_opt(&request.payload, "spectator");
    let room = platform.rooms.join_room(room_id, &username, as_spectator)?;
    Ok(serde_json::to_value(room).expect("Room always serializes"))
}

async fn lobby_leave_room(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    let (username, _) = auth(platform, request, None)?;
    let room_id = field_u64(&request.payload, "room_id")?;
    let room = platform.rooms.leave_room(room_id, &username)?;
    Ok(json!({"room": room}))
}

async fn room_get(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    auth(platform, request, None)?;
    let room_id = field_u64(&request.payload, "room_id")?;
    Ok(serde_json::to_value(platform.rooms.get_room(room_id)?).expect("Room always serializes"))
}

async fn room_ready(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    let (username, _) = auth(platform, request, None)?;
    let room_id = field_u64(&request.payload, "room_id")?;
    let ready = field_bool_opt(&request.payload, "ready");
    let (room, all_ready) = platform.rooms.set_ready(room_id, &username, ready)?;
    Ok(json!({"room": room, "all_ready": all_ready}))
}

async fn review_search_author(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    let author = field_str(&request.payload, "author")?;
    Ok(json!({"reviews": platform.reviews.list_by_author(author).await?}))
}

async fn review_search_game(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    let game_name = field_str(&request.payload, "game_name")?;
    Ok(json!({"reviews": platform.reviews.list_by_game(game_name).await?}))
}

async fn review_add(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    let (username, _) = auth(platform, request, Some(Role::Player))?;
    let game_name = field_str(&request.payload, "game_name")?;
    let version = field_i64(&request.payload, "version")?;
    let content = field_str(&request.payload, "content")?;
    let score = field_i64(&request.payload, "score")?;
    platform.reviews.add(&platform.catalog, &username, game_name, version, content, score).await?;
    Ok(json!({}))
}

async fn review_edit(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    let (username, _) = auth(platform, request, Some(Role::Player))?;
    let game_name = field_str(&request.payload, "game_name")?;
    let version = field_i64(&request.payload, "version")?;
    let old_content = field_str(&request.payload, "old_content")?;
    let new_content = field_str(&request.payload, "new_content")?;
    let new_score = field_i64(&request.payload, "new_score")?;
    let (old_score, new_score) = platform
        .reviews
        .edit(&platform.catalog, &username, game_name, version, old_content, new_content, new_score)
        .await?;
    Ok(json!({"old_score": old_score, "new_score": new_score}))
}

async fn review_delete(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    let (username, _) = auth(platform, request, Some(Role::Player))?;
    let game_name = field_str(&request.payload, "game_name")?;
    let version = field_i64(&request.payload, "version")?;
    let content = field_str(&request.payload, "content")?;
    let deleted_score = platform.reviews.delete(&platform.catalog, &username, game_name, version, content).await?;
    Ok(json!({"deleted_score": deleted_score}))
}

async fn review_eligibility_check(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    let (username, _) = auth(platform, request, Some(Role::Player))?;
    let game_name = field_str(&request.payload, "game_name")?;
    let version = field_i64(&request.payload, "version")?;
    match platform.reviews.check_eligibility(&username, game_name, version).await {
        Ok(()) => Ok(json!({"eligible": true})),
        Err(_) => Ok(json!({"eligible": false})),
    }
}

async fn user_list(platform: &Platform, request: &Request) -> Result<Value, PlatformError> {
    auth(platform, request, None)?;
    let role = match request.payload.get("role").and_then(Value::as_str) {
        Some(r) => Some(Role::parse(r)?),
        None => None,
    };
    Ok(json!({"users": platform.identity.list_online(role)}))
}
