use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufRead, AsyncBufReadExt};

pub const MAX_LINE_BYTES: usize = 64 * 1024;
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);
pub const DEFAULT_RATE_LIMIT: usize = 50;
pub const DEFAULT_RATE_WINDOW: Duration = Duration::from_secs(1);
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(1);
const SUSTAINED_VIOLATION_WINDOW: Duration = Duration::from_secs(10);
const SUSTAINED_VIOLATION_LIMIT: usize = 5;

/// Outcome of reading one line off the wire: a frame to dispatch, a frame we
/// silently dropped (oversize / rate-limited / unparseable), or end of stream.
pub enum FrameOutcome {
    Frame(Vec<u8>),
    Dropped,
    Eof,
    TimedOut,
}

/// Newline-delimited JSON frame reader shared by the control-plane listener
/// and the match-report listener. Enforces the inactivity timeout, the
/// maximum line length, and the token-bucket rate limit described in the
/// framing & transport design.
pub struct FrameReader<R> {
    reader: R,
    inactivity_timeout: Duration,
    max_line_bytes: usize,
    rate_limit: usize,
    rate_window: Duration,
    cooldown: Duration,
    msg_times: VecDeque<Instant>,
    rate_violations: VecDeque<Instant>,
    cooldown_until: Option<Instant>,
}

impl<R> FrameReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            max_line_bytes: MAX_LINE_BYTES,
            rate_limit: DEFAULT_RATE_LIMIT,
            rate_window: DEFAULT_RATE_WINDOW,
            cooldown: DEFAULT_COOLDOWN,
            msg_times: VecDeque::new(),
            rate_violations: VecDeque::new(),
            cooldown_until: None,
        }
    }

    /// Reads the next frame, applying inactivity timeout, oversize discard and
    /// rate limiting. Returns `Eof` on clean stream close and `TimedOut` once
    /// the connection has been idle past `inactivity_timeout` — both are fatal
    /// to the connection; everything else keeps it open.
    pub async fn next_frame(&mut self) -> FrameOutcome {
        let mut line = String::new();
        let read = tokio::time::timeout(self.inactivity_timeout, self.reader.read_line(&mut line)).await;

        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(_)) => return FrameOutcome::Eof,
            Err(_) => return FrameOutcome::TimedOut,
        };
        if n == 0 {
            return FrameOutcome::Eof;
        }

        if line.len() > self.max_line_bytes {
            log::warn!("discarding oversized line ({} bytes)", line.len());
            return FrameOutcome::Dropped;
        }

        let now = Instant::now();
        if let Some(until) = self.cooldown_until
            && now < until
        {
            return FrameOutcome::Dropped;
        }

        while matches!(self.msg_times.front(), Some(t) if now.duration_since(*t) > self.rate_window) {
            self.msg_times.pop_front();
        }
        if self.msg_times.len() >= self.rate_limit {
            self.rate_violations.push_back(now);
            while matches!(self.rate_violations.front(), Some(t) if now.duration_since(*t) > SUSTAINED_VIOLATION_WINDOW)
            {
                self.rate_violations.pop_front();
            }
            if self.rate_violations.len() >= SUSTAINED_VIOLATION_LIMIT {
                log::warn!("rate limit sustained; closing connection");
                return FrameOutcome::Eof;
            }
            self.cooldown_until = Some(now + self.cooldown);
            log::warn!("rate limit exceeded; dropping messages for cooldown window");
            return FrameOutcome::Dropped;
        }
        self.msg_times.push_back(now);

        let trimmed = line.trim_end_matches(['\n', '\r']);
        if trimmed.is_empty() {
            return FrameOutcome::Dropped;
        }
        FrameOutcome::Frame(trimmed.as_bytes().to_vec())
    }
}
