use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Deserialize;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::TcpListener;

use crate::protocol::framing::{FrameOutcome, FrameReader};
use crate::rooms::launcher::release_port;
use crate::rooms::registry::RoomRegistry;

const HEARTBEAT_STALE_THRESHOLD: Duration = Duration::from_secs(60);
const WATCHDOG_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
enum ReportMessage {
    Started {
        room_id: u64,
        match_id: String,
        report_token: String,
        #[serde(default)]
        pid: Option<u32>,
    },
    Heartbeat {
        room_id: u64,
        match_id: String,
        report_token: String,
    },
    End {
        room_id: u64,
        match_id: String,
        report_token: String,
        #[serde(default)]
        results: Vec<serde_json::Value>,
        #[serde(default)]
        reason: String,
    },
    Error {
        room_id: u64,
        match_id: String,
        report_token: String,
        #[serde(default)]
        message: String,
    },
}

/// Runs the fixed-port report listener the spawned game processes call back
/// into. Independent of the control-plane accept loop: a client connection
/// dying never affects an in-flight match, and vice versa.
pub async fn run_report_listener(
    bind_addr: impl tokio::net::ToSocketAddrs,
    registry: Arc<RoomRegistry>,
    reserved_ports: Arc<Mutex<HashSet<u16>>>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind_addr).await?;
    log::info!("match report listener bound on {}", listener.local_addr()?);

    loop {
        let (stream, peer) = listener.accept().await?;
        let registry = registry.clone();
        let reserved_ports = reserved_ports.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_report_connection(stream, registry, reserved_ports).await {
                log::warn!("report connection from {peer} ended: {err}");
            }
        });
    }
}

async fn handle_report_connection(
    stream: tokio::net::TcpStream,
    registry: Arc<RoomRegistry>,
    reserved_ports: Arc<Mutex<HashSet<u16>>>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut frames = FrameReader::new(BufReader::new(read_half));

    loop {
        match frames.next_frame().await {
            FrameOutcome::Frame(bytes) => {
                let ack = process_report_frame(&bytes, &registry, &reserved_ports);
                let mut line = serde_json::to_vec(&ack).expect("ack always serializes");
                line.push(b'\n');
                write_half.write_all(&line).await?;
            }
            FrameOutcome::Dropped => continue,
            FrameOutcome::Eof | FrameOutcome::TimedOut => return Ok(()),
        }
    }
}

fn process_report_frame(
    bytes: &[u8],
    registry: &RoomRegistry,
    reserved_ports: &Mutex<HashSet<u16>>,
) -> serde_json::Value {
    let message: ReportMessage = match serde_json::from_slice(bytes) {
        Ok(m) => m,
        Err(e) => return serde_json::json!({"status": "error", "message": format!("malformed report: {e}")}),
    };

    let (room_id, match_id, token) = match &message {
        ReportMessage::Started { room_id, match_id, report_token, .. }
        | ReportMessage::Heartbeat { room_id, match_id, report_token }
        | ReportMessage::End { room_id, match_id, report_token, .. }
        | ReportMessage::Error { room_id, match_id, report_token, .. } => (*room_id, match_id.clone(), report_token.clone()),
    };
    if let Err(err) = registry.validate_token(room_id, &match_id, &token) {
        return serde_json::json!({"status": "error", "code": err.code(), "message": err.to_string()});
    }

    match message {
        ReportMessage::Started { room_id, pid, .. } => {
            if let Some(pid) = pid {
                registry.mark_started(room_id, pid);
            }
            registry.signal_started(&match_id);
            log::info!("match for room {room_id} reported STARTED");
        }
        ReportMessage::Heartbeat { room_id, .. } => {
            registry.mark_heartbeat(room_id);
        }
        ReportMessage::End { room_id, reason, results, .. } => {
            log::info!("match for room {room_id} ended ({reason}), {} results", results.len());
            registry.terminate(room_id);
            if let Ok(room) = registry.get_room(room_id)
                && let Some(port) = room.port
            {
                release_port(reserved_ports, port);
            }
        }
        ReportMessage::Error { room_id, message, .. } => {
            log::warn!("match for room {room_id} reported a fatal error: {message}");
            registry.terminate(room_id);
        }
    }

    serde_json::json!({"status": "ok"})
}

/// Background task: sweeps rooms with no heartbeat in `HEARTBEAT_STALE_THRESHOLD`
/// and marks them `TERMINATED`, releasing their port.
pub async fn run_heartbeat_watchdog(registry: Arc<RoomRegistry>, reserved_ports: Arc<Mutex<HashSet<u16>>>) {
    let mut ticker = tokio::time::interval(WATCHDOG_INTERVAL);
    loop {
        ticker.tick().await;
        for room_id in registry.stale_rooms(HEARTBEAT_STALE_THRESHOLD) {
            log::warn!("room {room_id} lost heartbeat; terminating");
            if let Ok(room) = registry.get_room(room_id)
                && let Some(port) = room.port
            {
                release_port(&reserved_ports, port);
            }
            registry.terminate(room_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rooms::registry::RoomMetadata;

    fn metadata() -> RoomMetadata {
        RoomMetadata { game_name: "G".into(), version: 0, max_players: 2, type_: "2P".into() }
    }

    #[test]
    fn report_with_wrong_token_is_rejected() {
        let registry = RoomRegistry::new();
        let room = registry.create_room("r1", "alice", metadata(), chrono::Utc::now());
        registry.join_room(room.room_id, "bob", false).unwrap();
        registry.set_ready(room.room_id, "alice", true).unwrap();
        registry.set_ready(room.room_id, "bob", true).unwrap();
        registry.start_match(room.room_id, "alice", 9000, "m1", "secret").unwrap();

        let reserved = Mutex::new(HashSet::new());
        let frame = serde_json::to_vec(&serde_json::json!({
            "type": "HEARTBEAT", "room_id": room.room_id, "match_id": "m1", "report_token": "wrong",
        }))
        .unwrap();
        let ack = process_report_frame(&frame, &registry, &reserved);
        assert_eq!(ack["status"], "error");
    }

    #[tokio::test]
    async fn started_report_wakes_the_registered_watcher() {
        let registry = RoomRegistry::new();
        let room = registry.create_room("r1", "alice", metadata(), chrono::Utc::now());
        registry.start_match(room.room_id, "alice", 9000, "m1", "secret").unwrap();
        let rx = registry.await_started("m1");

        let reserved = Mutex::new(HashSet::new());
        let frame = serde_json::to_vec(&serde_json::json!({
            "type": "STARTED", "room_id": room.room_id, "match_id": "m1", "report_token": "secret", "pid": 123,
        }))
        .unwrap();
        let ack = process_report_frame(&frame, &registry, &reserved);
        assert_eq!(ack["status"], "ok");
        rx.await.expect("watcher should be woken by STARTED report");
    }

    #[test]
    fn end_report_terminates_room_and_releases_port() {
        let registry = RoomRegistry::new();
        let room = registry.create_room("r1", "alice", metadata(), chrono::Utc::now());
        registry.join_room(room.room_id, "bob", false).unwrap();
        registry.set_ready(room.room_id, "alice", true).unwrap();
        registry.set_ready(room.room_id, "bob", true).unwrap();
        registry.start_match(room.room_id, "alice", 9000, "m1", "secret").unwrap();

        let reserved = Mutex::new(HashSet::from([9000u16]));
        let frame = serde_json::to_vec(&serde_json::json!({
            "type": "END", "room_id": room.room_id, "match_id": "m1", "report_token": "secret",
            "results": [], "reason": "completed",
        }))
        .unwrap();
        let ack = process_report_frame(&frame, &registry, &reserved);
        assert_eq!(ack["status"], "ok");
        assert!(!reserved.lock().unwrap().contains(&9000));
        assert_eq!(registry.get_room(room.room_id).unwrap().status, crate::rooms::registry::RoomStatus::Terminated);
    }
}
