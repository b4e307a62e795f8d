//! Background thread tailing the device log stream.
//!
//! One reader runs per connection. It blocks on the stream, parses candidate
//! lines outside any lock and folds the result into the store and the action
//! queues. EOF or a read error ends the loop and reports
//! [`LinkEvent::StreamClosed`] to the supervisor; the reader never retries.

use std::io::BufRead;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use chrono::Local;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::action_queue::{ActionEvent, ActionQueues};
use super::error::BridgeError;
use super::store::{ControlStore, FlagTrigger};
use crate::protocol::{self, ControlMessage};

/// Notifications from a connection's background reader.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LinkEvent {
    StreamClosed { generation: u64 },
}

/// Write permission of one connection generation.
///
/// `revoke` waits for a write already in progress, so once it returns no
/// line from that generation reaches the store or the queues.
#[derive(Debug)]
pub struct WriteToken {
    live: RwLock<bool>,
}

impl WriteToken {
    pub fn new() -> Self {
        Self {
            live: RwLock::new(true),
        }
    }

    pub fn revoke(&self) {
        *self.live.write().unwrap_or_else(PoisonError::into_inner) = false;
    }

    pub fn is_live(&self) -> bool {
        *self.live.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn hold(&self) -> Option<RwLockReadGuard<'_, bool>> {
        let guard = self.live.read().unwrap_or_else(PoisonError::into_inner);
        if *guard {
            Some(guard)
        } else {
            None
        }
    }
}

impl Default for WriteToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Where parsed input goes.
#[derive(Clone)]
pub struct ReaderContext {
    pub store: Arc<ControlStore>,
    pub queues: Arc<ActionQueues>,
    pub trigger: FlagTrigger,
    token: Arc<WriteToken>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LineOutcome {
    /// No protocol keyword in the line
    Ignored,
    /// Keyword found but payload did not parse
    Dropped,
    /// Continuous value written to the store
    Applied,
    /// Flag stored and an action event queued
    Queued,
    /// Flag stored, no event under the trigger policy
    Suppressed,
    /// Parsed after the connection was closed; nothing written
    Revoked,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub lines: u64,
    pub matched: u64,
    pub dropped: u64,
    pub queued: u64,
}

impl ReaderStats {
    fn record(&mut self, outcome: LineOutcome) {
        self.lines += 1;
        match outcome {
            LineOutcome::Ignored | LineOutcome::Revoked => {}
            LineOutcome::Dropped => self.dropped += 1,
            LineOutcome::Applied | LineOutcome::Suppressed => self.matched += 1,
            LineOutcome::Queued => {
                self.matched += 1;
                self.queued += 1;
            }
        }
    }
}

impl ReaderContext {
    pub fn new(store: Arc<ControlStore>, queues: Arc<ActionQueues>, trigger: FlagTrigger) -> Self {
        Self {
            store,
            queues,
            trigger,
            token: Arc::new(WriteToken::new()),
        }
    }

    /// Same destinations under a fresh write token.
    pub fn for_generation(&self) -> Self {
        Self {
            token: Arc::new(WriteToken::new()),
            ..self.clone()
        }
    }

    pub fn write_token(&self) -> Arc<WriteToken> {
        self.token.clone()
    }

    /// Route one raw line. Parsing happens before any lock is taken.
    pub fn process_line(&self, line: &str) -> LineOutcome {
        if !protocol::is_candidate(line) {
            return LineOutcome::Ignored;
        }

        let Some(message) = protocol::parse(line) else {
            debug!("Dropping malformed protocol line: {}", line);
            return LineOutcome::Dropped;
        };

        // Held across the write so a concurrent revoke waits for it
        let Some(_live) = self.token.hold() else {
            debug!("Connection closed, discarding: {}", line);
            return LineOutcome::Revoked;
        };

        match message {
            ControlMessage::AxisPair(pair) => {
                self.store.apply_axis(pair);
                LineOutcome::Applied
            }
            ControlMessage::IntSelector(selector) => {
                self.store.apply_selector(selector);
                LineOutcome::Applied
            }
            ControlMessage::BooleanFlag(flag) => {
                let previous = self.store.apply_flag(flag);
                if self.trigger.delivers(previous, flag.value) {
                    debug!("Queued {} = {}", flag.name, flag.value);
                    self.queues.push(ActionEvent::new(flag.name, flag.value));
                    LineOutcome::Queued
                } else {
                    LineOutcome::Suppressed
                }
            }
        }
    }
}

/// Owner side of a running reader thread.
pub struct ReaderHandle {
    thread: Option<JoinHandle<ReaderStats>>,
    stop: Arc<AtomicBool>,
    generation: u64,
}

impl ReaderHandle {
    /// Ask the loop to exit after its current read. The stream must also be
    /// closed to unblock a pending read.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Wait up to `timeout` for the thread to exit. A thread still blocked
    /// after that is detached.
    pub fn join_timeout(mut self, timeout: Duration) -> Option<ReaderStats> {
        let thread = self.thread.take()?;

        let deadline = Instant::now() + timeout;
        while !thread.is_finished() {
            if Instant::now() >= deadline {
                warn!(
                    "Log reader {} did not exit within {:?}, detaching",
                    self.generation, timeout
                );
                return None;
            }
            std::thread::sleep(Duration::from_millis(5));
        }

        match thread.join() {
            Ok(stats) => Some(stats),
            Err(_) => {
                warn!("Log reader {} panicked", self.generation);
                None
            }
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn the reader thread for one connection generation.
pub fn spawn_reader(
    lines: Box<dyn BufRead + Send>,
    context: ReaderContext,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> Result<ReaderHandle, BridgeError> {
    let stop = Arc::new(AtomicBool::new(false));
    let thread_stop = stop.clone();

    let thread = std::thread::Builder::new()
        .name(format!("log-reader-{generation}"))
        .spawn(move || run_reader(lines, context, generation, events, thread_stop))
        .map_err(|e| BridgeError::InitializationError(format!("reader thread: {e}")))?;

    info!("Log reader {} started", generation);
    Ok(ReaderHandle {
        thread: Some(thread),
        stop,
        generation,
    })
}

fn run_reader(
    mut lines: Box<dyn BufRead + Send>,
    context: ReaderContext,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
    stop: Arc<AtomicBool>,
) -> ReaderStats {
    let mut total = ReaderStats::default();
    let mut window = ReaderStats::default();
    let mut last_log_time = Local::now();
    let log_interval = chrono::Duration::seconds(10);
    let mut buf = Vec::with_capacity(256);

    while !stop.load(Ordering::Acquire) {
        buf.clear();
        match lines.read_until(b'\n', &mut buf) {
            Ok(0) => {
                debug!("Log stream {} reached EOF", generation);
                break;
            }
            Ok(_) if stop.load(Ordering::Acquire) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(['\r', '\n']);
                if line.is_empty() {
                    continue;
                }
                let outcome = context.process_line(line);
                total.record(outcome);
                window.record(outcome);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Log stream {} read failed: {}", generation, e);
                break;
            }
        }

        let now = Local::now();
        if now - last_log_time > log_interval {
            info!(
                "Log reader stats: {} lines, {} matched, {} dropped, {} queued in last {} seconds",
                window.lines,
                window.matched,
                window.dropped,
                window.queued,
                log_interval.num_seconds()
            );
            window = ReaderStats::default();
            last_log_time = now;
        }
    }

    if stop.load(Ordering::Acquire) {
        debug!("Log reader {} stopped on request", generation);
    } else if events
        .send(LinkEvent::StreamClosed { generation })
        .is_err()
    {
        debug!("Supervisor gone, stream close of {} not reported", generation);
    }

    info!(
        "Log reader {} finished after {} lines ({} matched)",
        generation, total.lines, total.matched
    );
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::transport::scripted::ChannelReader;
    use crate::protocol::{ActionKind, AxisVector};
    use std::io::Cursor;

    fn context(trigger: FlagTrigger) -> ReaderContext {
        ReaderContext::new(
            Arc::new(ControlStore::default()),
            Arc::new(ActionQueues::new()),
            trigger,
        )
    }

    #[test]
    fn axis_line_updates_store() {
        let ctx = context(FlagTrigger::Press);
        assert_eq!(ctx.process_line("LEFTJOYSTICK: 0.5,-0.3"), LineOutcome::Applied);

        let snapshot = ctx.store.snapshot();
        assert_eq!(snapshot.left_axis, AxisVector::new(0.5, -0.3));
        assert_eq!(snapshot.yaw, 0.5);
        assert_eq!(snapshot.throttle, -0.3);
    }

    #[test]
    fn repeated_true_is_always_queued() {
        let ctx = context(FlagTrigger::Press);
        assert_eq!(ctx.process_line("RTLSTATE: True"), LineOutcome::Queued);
        assert_eq!(ctx.process_line("RTLSTATE: True"), LineOutcome::Queued);
        assert_eq!(ctx.queues.queue(ActionKind::ReturnToLaunch).len(), 2);
    }

    #[test]
    fn repeated_false_is_a_no_op() {
        for trigger in [FlagTrigger::Press, FlagTrigger::Change] {
            let ctx = context(trigger);
            ctx.process_line("RTLSTATE: True");
            ctx.queues.clear_all();

            ctx.process_line("RTLSTATE: False");
            let after_first = ctx.queues.total_len();
            assert_eq!(ctx.process_line("RTLSTATE: False"), LineOutcome::Suppressed);
            assert_eq!(ctx.queues.total_len(), after_first, "{trigger:?}");
            assert!(!ctx.store.snapshot().flags.return_to_launch);
        }
    }

    #[test]
    fn change_policy_delivers_release() {
        let ctx = context(FlagTrigger::Change);
        ctx.process_line("AUTOMATIONSTATE: true");
        assert_eq!(ctx.process_line("AUTOMATIONSTATE: false"), LineOutcome::Queued);

        let events = ctx.queues.queue(ActionKind::Automation).drain();
        let values: Vec<bool> = events.iter().map(|e| e.value).collect();
        assert_eq!(values, vec![true, false]);
    }

    #[test]
    fn press_policy_only_records_release() {
        let ctx = context(FlagTrigger::Press);
        ctx.process_line("AUTOMATIONSTATE: true");
        assert_eq!(ctx.process_line("AUTOMATIONSTATE: false"), LineOutcome::Suppressed);
        assert_eq!(ctx.queues.queue(ActionKind::Automation).len(), 1);
    }

    #[test]
    fn garbage_changes_nothing() {
        let ctx = context(FlagTrigger::Press);
        assert_eq!(ctx.process_line("GARBAGE not a protocol line"), LineOutcome::Ignored);
        assert!(ctx.store.snapshot().is_zero());
        assert_eq!(ctx.queues.total_len(), 0);
    }

    #[test]
    fn malformed_line_is_dropped() {
        let ctx = context(FlagTrigger::Press);
        assert_eq!(ctx.process_line("LEFTJOYSTICK: x,y"), LineOutcome::Dropped);
        assert!(ctx.store.snapshot().is_zero());
    }

    #[test]
    fn revoked_token_blocks_writes() {
        let ctx = context(FlagTrigger::Change);
        ctx.process_line("SPRAYSTATE: true");
        ctx.write_token().revoke();

        assert_eq!(ctx.process_line("RTLSTATE: true"), LineOutcome::Revoked);
        assert_eq!(ctx.process_line("LEFTJOYSTICK: 0.5,0.5"), LineOutcome::Revoked);
        assert_eq!(ctx.queues.queue(ActionKind::ReturnToLaunch).len(), 0);
        assert_eq!(ctx.store.snapshot().left_axis, AxisVector::ZERO);

        // A new generation writes again, the old token stays revoked
        let next = ctx.for_generation();
        assert_eq!(next.process_line("RTLSTATE: true"), LineOutcome::Queued);
        assert!(!ctx.write_token().is_live());
    }

    #[test]
    fn line_read_after_stop_is_not_processed() {
        let ctx = context(FlagTrigger::Press);
        let (line_tx, line_rx) = std::sync::mpsc::channel();
        let lines = std::io::BufReader::new(ChannelReader::new(line_rx));
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = spawn_reader(Box::new(lines), ctx.clone(), 3, tx).unwrap();
        // The reader is parked in a read when the stop arrives
        std::thread::sleep(Duration::from_millis(50));
        handle.stop();
        line_tx.send("CAPTURESTATE: true".to_string()).unwrap();

        let stats = handle.join_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(stats.lines, 0);
        assert_eq!(ctx.queues.total_len(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn eof_reports_stream_closed() {
        let ctx = context(FlagTrigger::Press);
        let input = "I/Unity: LEFTJOYSTICK: 0.2,0.6\n\n\
                     I/Unity: CAPTURESTATE: true\r\n\
                     noise\n\
                     I/Unity: SELECTEDCAM: 1\n";
        let (tx, mut rx) = mpsc::unbounded_channel();

        let handle = spawn_reader(Box::new(Cursor::new(input)), ctx.clone(), 7, tx).unwrap();
        let stats = handle.join_timeout(Duration::from_secs(5)).unwrap();

        assert_eq!(stats.lines, 4);
        assert_eq!(stats.matched, 3);
        assert_eq!(stats.queued, 1);
        assert_eq!(rx.try_recv().unwrap(), LinkEvent::StreamClosed { generation: 7 });

        let snapshot = ctx.store.snapshot();
        assert_eq!(snapshot.left_axis, AxisVector::new(0.2, 0.6));
        assert_eq!(snapshot.selected_camera, 1);
        assert_eq!(ctx.queues.queue(ActionKind::Capture).len(), 1);
    }

    #[test]
    fn invalid_utf8_does_not_end_the_stream() {
        let ctx = context(FlagTrigger::Press);
        let mut input = b"\xff\xfe broken\n".to_vec();
        input.extend_from_slice(b"THERMALSTATE: true\n");
        let (tx, _rx) = mpsc::unbounded_channel();

        let handle = spawn_reader(Box::new(Cursor::new(input)), ctx.clone(), 1, tx).unwrap();
        handle.join_timeout(Duration::from_secs(5)).unwrap();
        assert!(ctx.store.snapshot().flags.thermal);
    }
}
