use std::collections::HashMap;
use std::sync::RwLock;

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng};
use argon2::Argon2;
use sqlx::SqlitePool;

use crate::error::PlatformError;
use crate::protocol::random_token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Developer,
    Player,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Developer => "developer",
            Role::Player => "player",
        }
    }

    pub fn parse(s: &str) -> Result<Role, PlatformError> {
        match s {
            "developer" => Ok(Role::Developer),
            "player" => Ok(Role::Player),
            other => Err(PlatformError::Validation(format!("unknown role: {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
struct Identity {
    username: String,
    role: Role,
}

/// Users table plus an in-memory session index. The table is the durable
/// source of truth (password hashes never leave it); sessions are ephemeral
/// and enforce "at most one active session per (username, role)".
pub struct IdentityStore {
    pool: SqlitePool,
    // token -> identity, and the reverse index used to reject duplicate logins.
    sessions: RwLock<HashMap<String, Identity>>,
    token_index: RwLock<HashMap<(String, Role), String>>,
}

impl IdentityStore {
    pub async fn new(pool: SqlitePool) -> Result<Self, PlatformError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS users (
                username TEXT NOT NULL,
                role TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                PRIMARY KEY (username, role)
            )",
        )
        .execute(&pool)
        .await?;
        Ok(Self {
            pool,
            sessions: RwLock::new(HashMap::new()),
            token_index: RwLock::new(HashMap::new()),
        })
    }

    fn hash_password(password: &str) -> Result<String, PlatformError> {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| PlatformError::Internal(format!("hash failure: {e}")))
    }

    fn verify_password(password: &str, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok()
    }

    fn open_session(&self, username: &str, role: Role) -> String {
        let token = random_token();
        let key = (username.to_string(), role);
        self.sessions.write().expect("sessions lock poisoned").insert(
            token.clone(),
            Identity {
                username: username.to_string(),
                role,
            },
        );
        self.token_index
            .write()
            .expect("token index lock poisoned")
            .insert(key, token.clone());
        token
    }

    pub async fn register(&self, username: &str, password: &str, role: Role) -> Result<String, PlatformError> {
        let existing: Option<(String,)> =
            sqlx::query_as("SELECT username FROM users WHERE username = ? AND role = ?")
                .bind(username)
                .bind(role.as_str())
                .fetch_optional(&self.pool)
                .await?;
        if existing.is_some() {
            return Err(PlatformError::DuplicateRegistration(username.to_string()));
        }

        let hash = Self::hash_password(password)?;
        sqlx::query("INSERT INTO users (username, role, password_hash) VALUES (?, ?, ?)")
            .bind(username)
            .bind(role.as_str())
            .bind(hash)
            .execute(&self.pool)
            .await?;

        log::info!("registered user '{username}' with role '{}'", role.as_str());
        Ok(self.open_session(username, role))
    }

    pub async fn login(&self, username: &str, password: &str, role: Role) -> Result<String, PlatformError> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT password_hash FROM users WHERE username = ? AND role = ?")
                .bind(username)
                .bind(role.as_str())
                .fetch_optional(&self.pool)
                .await?;
        let Some((hash,)) = row else {
            return Err(PlatformError::BadCredentials);
        };
        if !Self::verify_password(password, &hash) {
            return Err(PlatformError::BadCredentials);
        }

        let already_active = self
            .token_index
            .read()
            .expect("token index lock poisoned")
            .contains_key(&(username.to_string(), role));
        if already_active {
            return Err(PlatformError::DuplicateLogin);
        }

        log::info!("login success for '{username}' role '{}'", role.as_str());
        Ok(self.open_session(username, role))
    }

    pub fn logout(&self, token: &str) -> bool {
        let identity = self.sessions.write().expect("sessions lock poisoned").remove(token);
        match identity {
            Some(Identity { username, role }) => {
                self.token_index
                    .write()
                    .expect("token index lock poisoned")
                    .remove(&(username, role));
                true
            }
            None => false,
        }
    }

    pub fn validate(&self, token: &str, expect_role: Option<Role>) -> Result<(String, Role), PlatformError> {
        let sessions = self.sessions.read().expect("sessions lock poisoned");
        let identity = sessions.get(token).ok_or(PlatformError::InvalidToken("unknown token"))?;
        if let Some(expected) = expect_role
            && identity.role != expected
        {
            return Err(PlatformError::InvalidToken("role mismatch"));
        }
        Ok((identity.username.clone(), identity.role))
    }

    pub fn list_online(&self, role: Option<Role>) -> Vec<String> {
        self.sessions
            .read()
            .expect("sessions lock poisoned")
            .values()
            .filter(|identity| role.is_none_or(|r| identity.role == r))
            .map(|identity| identity.username.clone())
            .collect()
    }
}
