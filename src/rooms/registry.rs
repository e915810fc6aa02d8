use std::collections::HashSet;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::Child;
use tokio::sync::oneshot;

use crate::error::PlatformError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoomStatus {
    Waiting,
    InGame,
    Terminated,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoomMetadata {
    pub game_name: String,
    pub version: i64,
    pub max_players: i64,
    #[serde(rename = "type")]
    pub type_: String,
}

/// A lobby room. `host` is always a member of `players`; leaving hosts are
/// reassigned to the next player, and a room with no players left but
/// spectators still present demotes to spectator-only rather than closing.
#[derive(Debug, Clone, Serialize)]
pub struct Room {
    pub room_id: u64,
    pub room_name: String,
    pub host: String,
    pub players: Vec<String>,
    pub spectators: Vec<String>,
    pub ready: HashSet<String>,
    pub metadata: RoomMetadata,
    pub status: RoomStatus,
    pub port: Option<u16>,
    #[serde(skip)]
    pub child_pid: Option<u32>,
    #[serde(skip)]
    pub report_token: Option<String>,
    #[serde(skip)]
    pub match_id: Option<String>,
    #[serde(skip)]
    pub last_heartbeat: Option<Instant>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Room {
    /// The host's readiness is implicit (spec §4.7 step 1); only non-host
    /// players must have explicitly toggled `ROOM.READY`.
    fn is_ready_to_start(&self) -> bool {
        !self.players.is_empty() && self.players.iter().all(|p| *p == self.host || self.ready.contains(p))
    }
}

/// In-memory room table. A single mutex serializes every mutation — rooms
/// are low cardinality and short lived, so contention is not worth
/// fine-graining into per-room locks. The match-start watchers and spawned
/// child handles live under their own locks since they're keyed and reaped
/// independently of room mutation.
pub struct RoomRegistry {
    inner: Mutex<Inner>,
    start_watchers: Mutex<std::collections::HashMap<String, oneshot::Sender<()>>>,
    children: Mutex<std::collections::HashMap<u64, Child>>,
}

struct Inner {
    rooms: std::collections::HashMap<u64, Room>,
    next_id: u64,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                rooms: std::collections::HashMap::new(),
                next_id: 1,
            }),
            start_watchers: Mutex::new(std::collections::HashMap::new()),
            children: Mutex::new(std::collections::HashMap::new()),
        }
    }

    pub fn create_room(
        &self,
        room_name: &str,
        host: &str,
        metadata: RoomMetadata,
        created_at: chrono::DateTime<chrono::Utc>,
    ) -> Room {
        let mut inner = self.inner.lock().expect("room registry lock poisoned");
        let room_id = inner.next_id;
        inner.next_id += 1;
        let room = Room {
            room_id,
            room_name: room_name.to_string(),
            host: host.to_string(),
            players: vec![host.to_string()],
            spectators: Vec::new(),
            ready: HashSet::new(),
            metadata,
            status: RoomStatus::Waiting,
            port: None,
            child_pid: None,
            report_token: None,
            match_id: None,
            last_heartbeat: None,
            created_at,
        };
        inner.rooms.insert(room_id, room.clone());
        room
    }

    pub fn list_rooms(&self) -> Vec<Room> {
        let inner = self.inner.lock().expect("room registry lock poisoned");
        let mut rooms: Vec<Room> = inner.rooms.values().cloned().collect();
        rooms.sort_by_key(|r| r.room_id);
        rooms
    }

    pub fn get_room(&self, room_id: u64) -> Result<Room, PlatformError> {
        let inner = self.inner.lock().expect("room registry lock poisoned");
        inner
            .rooms
            .get(&room_id)
            .cloned()
            .ok_or_else(|| PlatformError::NotFound(format!("room {room_id} not found")))
    }

    pub fn join_room(&self, room_id: u64, username: &str, as_spectator: bool) -> Result<Room, PlatformError> {
        let mut inner = self.inner.lock().expect("room registry lock poisoned");
        let room = inner
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| PlatformError::NotFound(format!("room {room_id} not found")))?;
        if room.status != RoomStatus::Waiting {
            return Err(PlatformError::Conflict("room is not accepting joins".into()));
        }
        if room.players.contains(&username.to_string()) || room.spectators.contains(&username.to_string()) {
            return Err(PlatformError::Conflict("already in room".into()));
        }
        if !as_spectator && (room.players.len() as i64) < room.metadata.max_players {
            room.players.push(username.to_string());
        } else {
            room.spectators.push(username.to_string());
        }
        Ok(room.clone())
    }

    /// Removes `username` from a room. If the host leaves, the next player
    /// (player-join order) is promoted to host. If the player list becomes
    /// empty but spectators remain, the first spectator is promoted to
    /// player and host. If the room is left with nobody at all, it is
    /// deleted outright.
    pub fn leave_room(&self, room_id: u64, username: &str) -> Result<Option<Room>, PlatformError> {
        let mut inner = self.inner.lock().expect("room registry lock poisoned");
        let room = inner
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| PlatformError::NotFound(format!("room {room_id} not found")))?;

        room.players.retain(|p| p != username);
        room.spectators.retain(|p| p != username);
        room.ready.remove(username);

        if room.players.is_empty() {
            if !room.spectators.is_empty() {
                let promoted = room.spectators.remove(0);
                room.players.push(promoted.clone());
                room.host = promoted;
            } else {
                let room_id = room.room_id;
                inner.rooms.remove(&room_id);
                return Ok(None);
            }
        } else if room.host == username {
            room.host = room.players[0].clone();
        }

        Ok(Some(room.clone()))
    }

    pub fn set_ready(&self, room_id: u64, username: &str, ready: bool) -> Result<(Room, bool), PlatformError> {
        let mut inner = self.inner.lock().expect("room registry lock poisoned");
        let room = inner
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| PlatformError::NotFound(format!("room {room_id} not found")))?;
        if !room.players.contains(&username.to_string()) {
            return Err(PlatformError::Validation("only players may mark ready".into()));
        }
        if ready {
            room.ready.insert(username.to_string());
        } else {
            room.ready.remove(username);
        }
        let all_ready = room.is_ready_to_start();
        Ok((room.clone(), all_ready))
    }

    /// Transitions a waiting, all-ready room into `IN_GAME`, recording the
    /// launch context. Returns the room's player list for the launcher.
    pub fn start_match(
        &self,
        room_id: u64,
        host: &str,
        port: u16,
        match_id: &str,
        report_token: &str,
    ) -> Result<Room, PlatformError> {
        let mut inner = self.inner.lock().expect("room registry lock poisoned");
        let room = inner
            .rooms
            .get_mut(&room_id)
            .ok_or_else(|| PlatformError::NotFound(format!("room {room_id} not found")))?;
        if room.host != host {
            return Err(PlatformError::InvalidToken("only the host may start the match"));
        }
        if room.status != RoomStatus::Waiting {
            return Err(PlatformError::Conflict("room is not waiting".into()));
        }
        if !room.is_ready_to_start() {
            return Err(PlatformError::Validation("not all players are ready".into()));
        }
        room.status = RoomStatus::InGame;
        room.port = Some(port);
        room.match_id = Some(match_id.to_string());
        room.report_token = Some(report_token.to_string());
        room.last_heartbeat = Some(Instant::now());
        Ok(room.clone())
    }

    /// Reverts a room to `WAITING` because the healthcheck window elapsed
    /// without a `STARTED` report, or the spawned process exited immediately.
    pub fn revert_to_waiting(&self, room_id: u64) {
        let mut inner = self.inner.lock().expect("room registry lock poisoned");
        if let Some(room) = inner.rooms.get_mut(&room_id) {
            room.status = RoomStatus::Waiting;
            room.port = None;
            room.child_pid = None;
            room.match_id = None;
            room.report_token = None;
            room.ready.clear();
        }
    }

    pub fn mark_started(&self, room_id: u64, child_pid: u32) {
        let mut inner = self.inner.lock().expect("room registry lock poisoned");
        if let Some(room) = inner.rooms.get_mut(&room_id) {
            room.child_pid = Some(child_pid);
            room.last_heartbeat = Some(Instant::now());
        }
    }

    pub fn mark_heartbeat(&self, room_id: u64) {
        let mut inner = self.inner.lock().expect("room registry lock poisoned");
        if let Some(room) = inner.rooms.get_mut(&room_id) {
            room.last_heartbeat = Some(Instant::now());
        }
    }

    /// Transitions a room to `TERMINATED` and kills its spawned child, if
    /// one was ever stored via `store_child` — the centralized reaper the
    /// design notes call for, so no other call site has to remember to do it.
    pub fn terminate(&self, room_id: u64) {
        {
            let mut inner = self.inner.lock().expect("room registry lock poisoned");
            if let Some(room) = inner.rooms.get_mut(&room_id) {
                room.status = RoomStatus::Terminated;
                room.port = None;
            }
        }
        if let Some(mut child) = self.children.lock().expect("child table lock poisoned").remove(&room_id) {
            let _ = child.start_kill();
        }
    }

    /// Registers a watcher for `match_id`'s `STARTED` report. The launcher
    /// awaits the returned receiver (racing it against the child's own exit
    /// and the healthcheck timeout) before treating `start_game` as successful.
    pub fn await_started(&self, match_id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.start_watchers
            .lock()
            .expect("start watchers lock poisoned")
            .insert(match_id.to_string(), tx);
        rx
    }

    /// Wakes whoever is awaiting `match_id`'s `STARTED` report. Idempotent:
    /// a second `STARTED` for the same match simply finds no watcher left.
    pub fn signal_started(&self, match_id: &str) {
        if let Some(tx) = self.start_watchers.lock().expect("start watchers lock poisoned").remove(match_id) {
            let _ = tx.send(());
        }
    }

    /// Drops a pending watcher that will never be satisfied (the launcher
    /// gave up after a crash or healthcheck timeout).
    pub fn cancel_start_watch(&self, match_id: &str) {
        self.start_watchers.lock().expect("start watchers lock poisoned").remove(match_id);
    }

    /// Hands the spawned server process to the registry once its `STARTED`
    /// report has been confirmed, so it's reaped by `terminate` instead of
    /// being killed the moment the launcher's local handle goes out of scope.
    pub fn store_child(&self, room_id: u64, child: Child) {
        self.children.lock().expect("child table lock poisoned").insert(room_id, child);
    }

    /// Rooms `IN_GAME` whose last heartbeat is older than `threshold` —
    /// consumed by the heartbeat watchdog background task.
    pub fn stale_rooms(&self, threshold: Duration) -> Vec<u64> {
        let inner = self.inner.lock().expect("room registry lock poisoned");
        inner
            .rooms
            .values()
            .filter(|r| r.status == RoomStatus::InGame)
            .filter(|r| r.last_heartbeat.is_none_or(|t| t.elapsed() > threshold))
            .map(|r| r.room_id)
            .collect()
    }

    pub fn validate_token(&self, room_id: u64, match_id: &str, token: &str) -> Result<(), PlatformError> {
        let inner = self.inner.lock().expect("room registry lock poisoned");
        let room = inner
            .rooms
            .get(&room_id)
            .ok_or_else(|| PlatformError::NotFound(format!("room {room_id} not found")))?;
        let expected_match = room.match_id.as_deref();
        let expected_token = room.report_token.as_deref();
        if expected_match == Some(match_id) && expected_token == Some(token) {
            Ok(())
        } else {
            Err(PlatformError::InvalidToken("report token does not match room"))
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> RoomMetadata {
        RoomMetadata {
            game_name: "G".into(),
            version: 0,
            max_players: 2,
            type_: "2P".into(),
        }
    }

    #[test]
    fn host_leaving_reassigns_to_next_player() {
        let registry = RoomRegistry::new();
        let room = registry.create_room("r1", "alice", metadata(), chrono::Utc::now());
        registry.join_room(room.room_id, "bob", false).unwrap();
        let after = registry.leave_room(room.room_id, "alice").unwrap().unwrap();
        assert_eq!(after.host, "bob");
        assert_eq!(after.players, vec!["bob".to_string()]);
    }

    #[test]
    fn spectator_promoted_when_players_empty() {
        let registry = RoomRegistry::new();
        let room = registry.create_room("r1", "alice", metadata(), chrono::Utc::now());
        registry.join_room(room.room_id, "carol", true).unwrap();
        let after = registry.leave_room(room.room_id, "alice").unwrap().unwrap();
        assert_eq!(after.host, "carol");
        assert!(after.spectators.is_empty());
    }

    #[test]
    fn room_deleted_when_fully_empty() {
        let registry = RoomRegistry::new();
        let room = registry.create_room("r1", "alice", metadata(), chrono::Utc::now());
        let after = registry.leave_room(room.room_id, "alice").unwrap();
        assert!(after.is_none());
        assert!(registry.get_room(room.room_id).is_err());
    }

    #[test]
    fn host_ready_is_implicit() {
        let registry = RoomRegistry::new();
        let room = registry.create_room("r1", "alice", metadata(), chrono::Utc::now());
        // A lone host never toggles ROOM.READY on themselves but should
        // still be able to start.
        let started = registry.start_match(room.room_id, "alice", 9000, "m1", "tok").unwrap();
        assert_eq!(started.status, RoomStatus::InGame);
    }

    #[test]
    fn start_match_requires_all_players_ready() {
        let registry = RoomRegistry::new();
        let room = registry.create_room("r1", "alice", metadata(), chrono::Utc::now());
        registry.join_room(room.room_id, "bob", false).unwrap();
        let err = registry.start_match(room.room_id, "alice", 9000, "m1", "tok").unwrap_err();
        assert!(matches!(err, PlatformError::Validation(_)));

        // Only bob (the non-host player) needs to toggle ready; the host's
        // readiness is implicit.
        registry.set_ready(room.room_id, "bob", true).unwrap();
        let started = registry.start_match(room.room_id, "alice", 9000, "m1", "tok").unwrap();
        assert_eq!(started.status, RoomStatus::InGame);
    }

    #[test]
    fn non_host_cannot_start_match() {
        let registry = RoomRegistry::new();
        let room = registry.create_room("r1", "alice", metadata(), chrono::Utc::now());
        registry.join_room(room.room_id, "bob", false).unwrap();
        registry.set_ready(room.room_id, "alice", true).unwrap();
        registry.set_ready(room.room_id, "bob", true).unwrap();
        let err = registry.start_match(room.room_id, "bob", 9000, "m1", "tok").unwrap_err();
        assert!(matches!(err, PlatformError::InvalidToken(_)));
    }
}
