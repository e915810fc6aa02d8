use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::PlatformError;

const ALLOWED_TYPES: &[&str] = &["CLI", "GUI", "2P", "Multi"];

const ALLOWED_PLACEHOLDERS: &[&str] = &[
    "host",
    "port",
    "room_id",
    "match_id",
    "client_token",
    "report_token",
    "client_token_path",
    "report_token_path",
    "player_name",
    "player_count",
    "players_json",
    "players_csv",
    "players_json_path",
    "bind_host",
    "report_host",
    "report_port",
    "platform_protocol_version",
];

const FORBIDDEN_ARGV_PLACEHOLDERS: &[&str] = &["client_token", "report_token"];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpec {
    pub command: String,
    pub working_dir: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Healthcheck {
    pub tcp_port: serde_json::Value,
    pub timeout_sec: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub game_name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub type_: String,
    pub max_players: i64,
    pub description: String,
    pub server: LaunchSpec,
    pub client: LaunchSpec,
    #[serde(default)]
    pub assets: Vec<String>,
    pub healthcheck: Option<Healthcheck>,
}

/// A filesystem-valued field must not be absolute and must not contain a
/// `..` segment — the defense against a manifest trying to escape the
/// published tree.
pub fn is_safe_relative_path(path: &str) -> bool {
    let p = std::path::Path::new(path);
    if p.is_absolute() {
        return false;
    }
    !p.components()
        .any(|c| matches!(c, std::path::Component::ParentDir))
}

pub(crate) fn extract_placeholders(template: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut chars = template.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if c == '{' {
            if let Some(end) = template[i + 1..].find('}') {
                out.push(template[i + 1..i + 1 + end].to_string());
            }
        }
    }
    out
}

fn is_allowed_placeholder(name: &str) -> bool {
    let key = name.to_ascii_lowercase();
    if ALLOWED_PLACEHOLDERS.contains(&key.as_str()) {
        return true;
    }
    key.strip_prefix('p')
        .is_some_and(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
}

/// Substitutes every `{placeholder}` in `template` with its value from
/// `context`. Used by the launcher once a manifest has already passed
/// `validate()`, so every placeholder present is guaranteed to be in the
/// closed set — an entry missing from `context` is a launcher bug, not a
/// manifest problem.
pub fn render_template(template: &str, context: &HashMap<String, String>) -> Result<String, PlatformError> {
    let mut rendered = template.to_string();
    for placeholder in extract_placeholders(template) {
        let value = context
            .get(&placeholder)
            .ok_or_else(|| PlatformError::Internal(format!("no launch context value for {{{placeholder}}}")))?;
        rendered = rendered.replace(&format!("{{{placeholder}}}"), value);
    }
    Ok(rendered)
}

/// Like `render_template`, but placeholders absent from `context` are left
/// in place rather than erroring. Used for the client launch descriptor,
/// where server-known values (host, port, tokens) are resolved up front but
/// per-player values like `{player_name}` are filled in by the client shim.
pub fn render_template_partial(template: &str, context: &HashMap<String, String>) -> String {
    let mut rendered = template.to_string();
    for placeholder in extract_placeholders(template) {
        if let Some(value) = context.get(&placeholder) {
            rendered = rendered.replace(&format!("{{{placeholder}}}"), value);
        }
    }
    rendered
}

impl Manifest {
    /// Validates required shape, the closed `type` set, `max_players > 0`,
    /// path safety for `working_dir`/`assets`, and the closed placeholder set
    /// — including the rule that `client_token`/`report_token` may never
    /// appear in a `command` argument vector.
    pub fn validate(&self) -> Result<(), PlatformError> {
        if !ALLOWED_TYPES.contains(&self.type_.as_str()) {
            return Err(PlatformError::Validation(format!("unknown type: {}", self.type_)));
        }
        if self.max_players <= 0 {
            return Err(PlatformError::Validation("max_players must be positive".into()));
        }
        for (label, spec) in [("server", &self.server), ("client", &self.client)] {
            if !is_safe_relative_path(&spec.working_dir) {
                return Err(PlatformError::Validation(format!("{label}.working_dir is unsafe")));
            }
            self.validate_template(label, "command", &spec.command, true)?;
            for (key, value) in &spec.env {
                self.validate_template(label, &format!("env[{key}]"), value, false)?;
            }
        }
        for asset in &self.assets {
            if !is_safe_relative_path(asset) {
                return Err(PlatformError::Validation(format!("unsafe asset path: {asset}")));
            }
        }
        Ok(())
    }

    fn validate_template(&self, section: &str, field: &str, template: &str, is_argv: bool) -> Result<(), PlatformError> {
        for placeholder in extract_placeholders(template) {
            if !is_allowed_placeholder(&placeholder) {
                return Err(PlatformError::Validation(format!(
                    "{section}.{field} uses unknown placeholder: {{{placeholder}}}"
                )));
            }
            if is_argv && FORBIDDEN_ARGV_PLACEHOLDERS.contains(&placeholder.to_ascii_lowercase().as_str()) {
                return Err(PlatformError::Validation(format!(
                    "{section}.{field} passes token via args: {{{placeholder}}}"
                )));
            }
        }
        Ok(())
    }

    /// Cross-checks the manifest against the metadata the uploader declared
    /// at `UPLOAD_BEGIN`, so an uploaded manifest can't silently rename the
    /// game it claimed to be publishing.
    pub fn cross_check(&self, expected_game_name: &str, expected_type: &str) -> Result<(), PlatformError> {
        if self.game_name != expected_game_name {
            return Err(PlatformError::Validation("manifest game_name does not match upload metadata".into()));
        }
        if self.type_ != expected_type {
            return Err(PlatformError::Validation("manifest type does not match upload metadata".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Manifest {
        Manifest {
            game_name: "G".into(),
            version: "1".into(),
            type_: "CLI".into(),
            max_players: 2,
            description: "d".into(),
            server: LaunchSpec {
                command: "bin --port {port}".into(),
                working_dir: "srv".into(),
                env: HashMap::new(),
            },
            client: LaunchSpec {
                command: "bin --host {host} --port {port}".into(),
                working_dir: "cli".into(),
                env: HashMap::new(),
            },
            assets: vec![],
            healthcheck: None,
        }
    }

    #[test]
    fn valid_manifest_passes() {
        manifest().validate().unwrap();
    }

    #[test]
    fn rejects_nonpositive_max_players() {
        let mut m = manifest();
        m.max_players = 0;
        assert!(m.validate().is_err());
    }

    #[test]
    fn rejects_unknown_type() {
        let mut m = manifest();
        m.type_ = "RTS".into();
        assert!(m.validate().is_err());
    }

    #[test]
    fn rejects_client_token_in_argv() {
        let mut m = manifest();
        m.server.command = "bin --token {client_token}".into();
        assert!(m.validate().is_err());
    }

    #[test]
    fn allows_report_token_via_env() {
        let mut m = manifest();
        m.server.env.insert("REPORT_TOKEN".into(), "{report_token}".into());
        m.validate().unwrap();
    }

    #[test]
    fn rejects_unsafe_working_dir() {
        let mut m = manifest();
        m.server.working_dir = "../escape".into();
        assert!(m.validate().is_err());
    }

    #[test]
    fn rejects_unknown_placeholder() {
        let mut m = manifest();
        m.server.command = "bin {mystery}".into();
        assert!(m.validate().is_err());
    }

    #[test]
    fn accepts_numbered_player_placeholders() {
        let mut m = manifest();
        m.server.command = "bin {p1} {p2} {p10}".into();
        m.validate().unwrap();
    }

    #[test]
    fn render_template_substitutes_known_placeholders() {
        let mut context = HashMap::new();
        context.insert("host".to_string(), "127.0.0.1".to_string());
        context.insert("port".to_string(), "9000".to_string());
        let rendered = render_template("connect {host}:{port}", &context).unwrap();
        assert_eq!(rendered, "connect 127.0.0.1:9000");
    }

    #[test]
    fn render_template_errors_on_missing_context_value() {
        let context = HashMap::new();
        let err = render_template("bin {port}", &context).unwrap_err();
        assert!(matches!(err, PlatformError::Internal(_)));
    }
}
