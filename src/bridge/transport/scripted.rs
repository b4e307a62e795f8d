//! In-memory transport for driving the supervisor from tests.

use std::io::{BufReader, Read};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use super::{BridgeTransport, CaptureProcess, DeviceInfo, LogCapture};
use crate::bridge::error::TransportError;

type Feed = Arc<Mutex<Option<Sender<String>>>>;

#[derive(Default)]
struct Script {
    device_present: bool,
    executable_missing: bool,
    fail_capture: bool,
    capture_outlives_terminate: bool,
    probe_delay: Option<Duration>,
    feed: Option<Feed>,
    server_starts: usize,
    server_stops: usize,
    stray_kills: usize,
    captures_started: usize,
}

#[derive(Default)]
pub struct ScriptedTransport {
    script: Mutex<Script>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn script(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_device_present(&self, present: bool) {
        self.script().device_present = present;
    }

    pub fn set_executable_missing(&self, missing: bool) {
        self.script().executable_missing = missing;
    }

    pub fn set_fail_capture(&self, fail: bool) {
        self.script().fail_capture = fail;
    }

    /// Captures whose `terminate` leaves the stream open, like a subprocess
    /// that ignores the kill. Only `close_stream` ends them.
    pub fn set_capture_outlives_terminate(&self, outlives: bool) {
        self.script().capture_outlives_terminate = outlives;
    }

    pub fn set_probe_delay(&self, delay: Option<Duration>) {
        self.script().probe_delay = delay;
    }

    /// Push a line into the current capture. False when no capture is open.
    pub fn feed_line(&self, line: &str) -> bool {
        let Some(feed) = self.script().feed.clone() else {
            return false;
        };
        let sender = feed.lock().unwrap_or_else(PoisonError::into_inner);
        match sender.as_ref() {
            Some(tx) => tx.send(line.to_string()).is_ok(),
            None => false,
        }
    }

    /// End the current capture stream as if the subprocess died.
    pub fn close_stream(&self) {
        if let Some(feed) = self.script().feed.clone() {
            feed.lock().unwrap_or_else(PoisonError::into_inner).take();
        }
    }

    pub fn server_starts(&self) -> usize {
        self.script().server_starts
    }

    pub fn server_stops(&self) -> usize {
        self.script().server_stops
    }

    pub fn stray_kills(&self) -> usize {
        self.script().stray_kills
    }

    pub fn captures_started(&self) -> usize {
        self.script().captures_started
    }

    fn missing(&self) -> Result<(), TransportError> {
        if self.script().executable_missing {
            Err(TransportError::ExecutableNotFound("adb".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BridgeTransport for ScriptedTransport {
    async fn kill_stray_processes(&self) -> Result<(), TransportError> {
        self.missing()?;
        self.script().stray_kills += 1;
        Ok(())
    }

    async fn start_server(&self) -> Result<(), TransportError> {
        self.missing()?;
        self.script().server_starts += 1;
        Ok(())
    }

    async fn stop_server(&self) -> Result<(), TransportError> {
        self.missing()?;
        self.script().server_stops += 1;
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        self.missing()?;
        let delay = self.script().probe_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.script().device_present {
            Ok(vec![DeviceInfo::ready("scripted-device")])
        } else {
            Ok(Vec::new())
        }
    }

    async fn start_log_capture(&self) -> Result<LogCapture, TransportError> {
        self.missing()?;
        let mut script = self.script();
        if script.fail_capture {
            return Err(TransportError::CommandFailed {
                command: "adb logcat".to_string(),
                status: "exit status: 1".to_string(),
                stderr: "error: closed".to_string(),
            });
        }

        let (tx, rx) = mpsc::channel();
        let feed: Feed = Arc::new(Mutex::new(Some(tx)));
        script.feed = Some(feed.clone());
        script.captures_started += 1;

        Ok(LogCapture {
            lines: Box::new(BufReader::new(ChannelReader::new(rx))),
            process: Box::new(ScriptedCapture {
                feed,
                outlives_terminate: script.capture_outlives_terminate,
            }),
        })
    }
}

struct ScriptedCapture {
    feed: Feed,
    outlives_terminate: bool,
}

impl CaptureProcess for ScriptedCapture {
    fn terminate(&mut self) {
        if self.outlives_terminate {
            return;
        }
        self.feed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl Drop for ScriptedCapture {
    fn drop(&mut self) {
        self.terminate();
    }
}

/// Byte stream over a channel of lines. Ends when every sender is gone.
pub struct ChannelReader {
    rx: Receiver<String>,
    pending: Vec<u8>,
    pos: usize,
}

impl ChannelReader {
    pub fn new(rx: Receiver<String>) -> Self {
        Self {
            rx,
            pending: Vec::new(),
            pos: 0,
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.pos >= self.pending.len() {
            match self.rx.recv() {
                Ok(line) => {
                    self.pending = line.into_bytes();
                    self.pending.push(b'\n');
                    self.pos = 0;
                }
                Err(_) => return Ok(0),
            }
        }

        let n = buf.len().min(self.pending.len() - self.pos);
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
