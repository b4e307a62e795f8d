//! One connect attempt as a typestate machine.
//!
//! ```text
//! Preparing ─start_server→ ServerReady ─start_capture→ Capturing
//!     ─start_reader→ Reading ─verify_device→ Verified ─into_link→ ActiveLink
//! ```
//!
//! Any step failing drops the attempt. The capture process and reader handle
//! it already holds stop themselves on drop.

use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use statum::{machine, state};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::error::BridgeError;
use super::log_reader::{spawn_reader, LinkEvent, ReaderContext, ReaderHandle, WriteToken};
use super::transport::{BridgeTransport, CaptureProcess, DeviceInfo};

#[state]
#[derive(Debug, Clone)]
pub enum ConnectStage {
    Preparing,
    ServerReady,
    Capturing,
    Reading,
    Verified,
}

#[machine]
pub struct ConnectAttempt<S: ConnectStage> {
    transport: Arc<dyn BridgeTransport>,
    context: ReaderContext,
    events: mpsc::UnboundedSender<LinkEvent>,
    generation: u64,

    // Filled in as the attempt progresses
    reader: Option<ReaderHandle>,
    process: Option<Box<dyn CaptureProcess>>,
    lines: Option<Box<dyn BufRead + Send>>,
    device: Option<DeviceInfo>,
}

impl<S: ConnectStage> ConnectAttempt<S> {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl ConnectAttempt<Preparing> {
    pub fn create(
        transport: Arc<dyn BridgeTransport>,
        context: ReaderContext,
        events: mpsc::UnboundedSender<LinkEvent>,
        generation: u64,
    ) -> Self {
        debug!("Preparing connect attempt {}", generation);
        Self::new(transport, context, events, generation, None, None, None, None)
    }

    /// Clear out stray bridge processes and start a fresh server.
    pub async fn start_server(self) -> Result<ConnectAttempt<ServerReady>, BridgeError> {
        if let Err(e) = self.transport.kill_stray_processes().await {
            warn!("Stray process cleanup failed: {}", e);
        }

        self.transport.start_server().await?;
        Ok(self.transition())
    }
}

impl ConnectAttempt<ServerReady> {
    pub async fn start_capture(mut self) -> Result<ConnectAttempt<Capturing>, BridgeError> {
        let capture = self.transport.start_log_capture().await?;
        self.lines = Some(capture.lines);
        self.process = Some(capture.process);
        Ok(self.transition())
    }
}

impl ConnectAttempt<Capturing> {
    pub fn start_reader(mut self) -> Result<ConnectAttempt<Reading>, BridgeError> {
        let lines = self.lines.take().ok_or_else(|| {
            BridgeError::InitializationError("log capture has no line source".to_string())
        })?;

        let reader = spawn_reader(
            lines,
            self.context.clone(),
            self.generation,
            self.events.clone(),
        )?;
        self.reader = Some(reader);
        Ok(self.transition())
    }
}

impl ConnectAttempt<Reading> {
    pub async fn verify_device(mut self) -> Result<ConnectAttempt<Verified>, BridgeError> {
        let devices = self.transport.list_devices().await?;
        let device = devices
            .into_iter()
            .find(DeviceInfo::is_ready)
            .ok_or(BridgeError::DeviceNotFound)?;

        info!("Device {} verified", device.serial);
        self.device = Some(device);
        Ok(self.transition())
    }
}

impl ConnectAttempt<Verified> {
    pub fn into_link(mut self) -> Result<ActiveLink, BridgeError> {
        let (Some(reader), Some(process), Some(device)) =
            (self.reader.take(), self.process.take(), self.device.take())
        else {
            return Err(BridgeError::InitializationError(
                "verified attempt is missing its reader or capture".to_string(),
            ));
        };

        Ok(ActiveLink {
            generation: self.generation,
            writes: self.context.write_token(),
            device,
            reader: Some(reader),
            process: Some(process),
        })
    }
}

/// Run every connect step in order.
pub async fn connect(
    transport: Arc<dyn BridgeTransport>,
    context: ReaderContext,
    events: mpsc::UnboundedSender<LinkEvent>,
    generation: u64,
) -> Result<ActiveLink, BridgeError> {
    ConnectAttempt::create(transport, context, events, generation)
        .start_server()
        .await?
        .start_capture()
        .await?
        .start_reader()?
        .verify_device()
        .await?
        .into_link()
}

/// An established connection: capture subprocess plus its reader thread.
pub struct ActiveLink {
    generation: u64,
    writes: Arc<WriteToken>,
    device: DeviceInfo,
    reader: Option<ReaderHandle>,
    process: Option<Box<dyn CaptureProcess>>,
}

impl ActiveLink {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn is_closed(&self) -> bool {
        self.process.is_none() && self.reader.is_none()
    }

    /// Stop the reader and the capture. Blocks for at most `join_timeout`
    /// while the reader thread exits. Calling it again does nothing.
    ///
    /// Once this returns the reader can no longer write, even if its thread
    /// had to be detached.
    pub fn close(&mut self, join_timeout: Duration) {
        self.writes.revoke();
        if let Some(reader) = self.reader.as_ref() {
            reader.stop();
        }
        // Closing the stream is what unblocks a pending read
        if let Some(mut process) = self.process.take() {
            process.terminate();
        }
        if let Some(reader) = self.reader.take() {
            reader.join_timeout(join_timeout);
            info!("Link {} to {} closed", self.generation, self.device.serial);
        }
    }
}

impl Drop for ActiveLink {
    fn drop(&mut self) {
        self.close(Duration::ZERO);
    }
}
