use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PlatformError;

/// Request envelope: `{type, payload, token?, request_id?}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    #[serde(rename = "type")]
    pub type_: String,
    #[serde(default)]
    pub payload: Value,
    pub token: Option<String>,
    pub request_id: Option<String>,
}

/// Response envelope: `{type, status, code, message?, payload, request_id?}`.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: &'static str,
    pub code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Response {
    pub fn ok(type_: &str, request_id: Option<String>, payload: Value) -> Self {
        Self {
            type_: type_.to_string(),
            status: "ok",
            code: 0,
            message: None,
            payload,
            request_id,
        }
    }

    pub fn error(type_: &str, request_id: Option<String>, err: &PlatformError) -> Self {
        Self {
            type_: type_.to_string(),
            status: "error",
            code: err.code(),
            message: Some(err.to_string()),
            payload: Value::Object(Default::default()),
            request_id,
        }
    }
}

/// Namespaced type constants, kept as plain `&str` so the dispatch table can
/// key on them directly without an intermediate enum round-trip.
pub mod types {
    pub const ACCOUNT_REGISTER_PLAYER: &str = "ACCOUNT.REGISTER_PLAYER";
    pub const ACCOUNT_LOGIN_PLAYER: &str = "ACCOUNT.LOGIN_PLAYER";
    pub const ACCOUNT_LOGOUT_PLAYER: &str = "ACCOUNT.LOGOUT_PLAYER";
    pub const ACCOUNT_REGISTER_DEVELOPER: &str = "ACCOUNT.REGISTER_DEVELOPER";
    pub const ACCOUNT_LOGIN_DEVELOPER: &str = "ACCOUNT.LOGIN_DEVELOPER";
    pub const ACCOUNT_LOGOUT_DEVELOPER: &str = "ACCOUNT.LOGOUT_DEVELOPER";

    pub const GAME_LIST_GAME: &str = "GAME.LIST_GAME";
    pub const GAME_GET_DETAILS: &str = "GAME.GET_DETAILS";
    pub const GAME_UPLOAD_BEGIN: &str = "GAME.UPLOAD_BEGIN";
    pub const GAME_UPLOAD_CHUNK: &str = "GAME.UPLOAD_CHUNK";
    pub const GAME_UPLOAD_END: &str = "GAME.UPLOAD_END";
    pub const GAME_DOWNLOAD_BEGIN: &str = "GAME.DOWNLOAD_BEGIN";
    pub const GAME_DOWNLOAD_CHUNK: &str = "GAME.DOWNLOAD_CHUNK";
    pub const GAME_DOWNLOAD_END: &str = "GAME.DOWNLOAD_END";
    pub const GAME_START: &str = "GAME.START";

    pub const LOBBY_LIST_ROOMS: &str = "LOBBY.LIST_ROOMS";
    pub const LOBBY_CREATE_ROOM: &str = "LOBBY.CREATE_ROOM";
    pub const LOBBY_JOIN_ROOM: &str = "LOBBY.JOIN_ROOM";
    pub const LOBBY_LEAVE_ROOM: &str = "LOBBY.LEAVE_ROOM";

    pub const ROOM_GET: &str = "ROOM.GET";
    pub const ROOM_READY: &str = "ROOM.READY";

    pub const REVIEW_SEARCH_AUTHOR: &str = "REVIEW.SEARCH_AUTHOR";
    pub const REVIEW_SEARCH_GAME: &str = "REVIEW.SEARCH_GAME";
    pub const REVIEW_ADD: &str = "REVIEW.ADD";
    pub const REVIEW_EDIT: &str = "REVIEW.EDIT";
    pub const REVIEW_DELETE: &str = "REVIEW.DELETE";
    pub const REVIEW_ELIGIBILITY_CHECK: &str = "REVIEW.ELIGIBILITY_CHECK";

    pub const USER_LIST: &str = "USER.LIST";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips_through_json() {
        let raw = r#"{"type":"ACCOUNT.LOGIN_PLAYER","payload":{"username":"alice"},"request_id":"r1"}"#;
        let req: Request = serde_json::from_str(raw).unwrap();
        assert_eq!(req.type_, "ACCOUNT.LOGIN_PLAYER");
        assert_eq!(req.token, None);
        assert_eq!(req.request_id.as_deref(), Some("r1"));
    }

    #[test]
    fn error_response_carries_code_and_message() {
        let err = PlatformError::NotFound("room 7".into());
        let resp = Response::error("ROOM.GET", None, &err);
        assert_eq!(resp.code, 103);
        assert_eq!(resp.status, "error");
        assert!(resp.message.unwrap().contains("room 7"));
    }
}
