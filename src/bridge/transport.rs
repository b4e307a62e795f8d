//! Subprocess seam between the supervisor and the debug bridge.
//!
//! [`BridgeTransport`] is the only way the bridge touches external processes.
//! [`AdbTransport`] drives a real `adb` executable; tests use the in-memory
//! `scripted` transport instead.

use std::io::{BufRead, BufReader};
use std::process::{Child, Stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::error::TransportError;

#[cfg(test)]
pub(crate) mod scripted;

/// Connection state column of `adb devices`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Device,
    Offline,
    Unauthorized,
    Other(String),
}

impl From<&str> for DeviceState {
    fn from(value: &str) -> Self {
        match value {
            "device" => DeviceState::Device,
            "offline" => DeviceState::Offline,
            "unauthorized" => DeviceState::Unauthorized,
            other => DeviceState::Other(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub serial: String,
    pub state: DeviceState,
}

impl DeviceInfo {
    pub fn ready(serial: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            state: DeviceState::Device,
        }
    }

    /// Only fully attached devices stream logs.
    pub fn is_ready(&self) -> bool {
        self.state == DeviceState::Device
    }
}

/// Parse the output of `adb devices`.
pub fn parse_device_list(output: &str) -> Vec<DeviceInfo> {
    output
        .lines()
        .skip_while(|line| !line.starts_with("List of devices"))
        .skip(1)
        .filter_map(|line| {
            let mut columns = line.split_whitespace();
            let serial = columns.next()?;
            let state = columns.next()?;
            Some(DeviceInfo {
                serial: serial.to_string(),
                state: DeviceState::from(state),
            })
        })
        .collect()
}

/// Handle on a running log capture subprocess.
///
/// Implementations terminate the process when dropped.
pub trait CaptureProcess: Send {
    /// Stop the capture and close its stream. Safe to call repeatedly.
    fn terminate(&mut self);
}

/// A running log capture: the line source plus the process behind it.
pub struct LogCapture {
    pub lines: Box<dyn BufRead + Send>,
    pub process: Box<dyn CaptureProcess>,
}

#[async_trait]
pub trait BridgeTransport: Send + Sync {
    /// Best effort cleanup of bridge processes left over from earlier runs.
    async fn kill_stray_processes(&self) -> Result<(), TransportError>;

    async fn start_server(&self) -> Result<(), TransportError>;

    async fn stop_server(&self) -> Result<(), TransportError>;

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, TransportError>;

    /// Clear the device log history and start streaming new lines.
    async fn start_log_capture(&self) -> Result<LogCapture, TransportError>;
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AdbSettings {
    pub executable: String,
    pub log_args: Vec<String>,
    pub clear_args: Vec<String>,
    pub stop_server_on_exit: bool,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            executable: "adb".to_string(),
            log_args: ["logcat", "-v", "time", "Unity:V", "*:S"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            clear_args: vec!["logcat".to_string(), "-c".to_string()],
            stop_server_on_exit: true,
        }
    }
}

pub struct AdbTransport {
    settings: AdbSettings,
}

impl AdbTransport {
    pub fn new(settings: AdbSettings) -> Self {
        info!("Using bridge executable '{}'", settings.executable);
        Self { settings }
    }

    fn describe(&self, args: &[&str]) -> String {
        format!("{} {}", self.settings.executable, args.join(" "))
    }

    fn spawn_error(&self, command: String, err: std::io::Error) -> TransportError {
        if err.kind() == std::io::ErrorKind::NotFound {
            TransportError::ExecutableNotFound(self.settings.executable.clone())
        } else {
            TransportError::SpawnFailed {
                command,
                source: err,
            }
        }
    }

    /// Run a short bridge command to completion and return its stdout.
    async fn run(&self, args: &[&str]) -> Result<String, TransportError> {
        let command = self.describe(args);
        debug!("Running '{}'", command);

        let output = Command::new(&self.settings.executable)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| self.spawn_error(command.clone(), e))?;

        if !output.status.success() {
            return Err(TransportError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn kill_platform_processes(&self) -> Result<(), TransportError> {
        #[cfg(windows)]
        let (program, args) = ("taskkill", ["/F", "/IM", "adb.exe"]);
        #[cfg(not(windows))]
        let (program, args) = ("pkill", ["-x", "adb"]);

        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| TransportError::SpawnFailed {
                command: program.to_string(),
                source: e,
            })?;

        // Both tools report "nothing matched" through a non-zero status
        debug!("{} finished with {}", program, status);
        Ok(())
    }
}

#[async_trait]
impl BridgeTransport for AdbTransport {
    async fn kill_stray_processes(&self) -> Result<(), TransportError> {
        let server = self.run(&["kill-server"]).await;
        if let Err(e) = self.kill_platform_processes().await {
            warn!("Failed to kill stray bridge processes: {}", e);
        }
        server.map(|_| ())
    }

    async fn start_server(&self) -> Result<(), TransportError> {
        self.run(&["start-server"]).await?;
        info!("Bridge server started");
        Ok(())
    }

    async fn stop_server(&self) -> Result<(), TransportError> {
        self.run(&["kill-server"]).await?;
        info!("Bridge server stopped");
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        let output = self.run(&["devices"]).await?;
        Ok(parse_device_list(&output))
    }

    async fn start_log_capture(&self) -> Result<LogCapture, TransportError> {
        let clear: Vec<&str> = self.settings.clear_args.iter().map(String::as_str).collect();
        self.run(&clear).await?;

        let args: Vec<&str> = self.settings.log_args.iter().map(String::as_str).collect();
        let command = self.describe(&args);
        info!("Starting log capture '{}'", command);

        // Read from a plain thread, so this stays a std child
        let mut child = std::process::Command::new(&self.settings.executable)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.spawn_error(command, e))?;

        let Some(stdout) = child.stdout.take() else {
            let mut process = AdbCaptureProcess { child: Some(child) };
            process.terminate();
            return Err(TransportError::MissingStdout);
        };

        Ok(LogCapture {
            lines: Box::new(BufReader::new(stdout)),
            process: Box::new(AdbCaptureProcess { child: Some(child) }),
        })
    }
}

struct AdbCaptureProcess {
    child: Option<Child>,
}

impl CaptureProcess for AdbCaptureProcess {
    fn terminate(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };

        // Killing the child closes its stdout and unblocks the reader
        if let Err(e) = child.kill() {
            debug!("Log capture already exited: {}", e);
        }
        // Runs from drop paths on async workers, so never block on the reap
        match child.try_wait() {
            Ok(Some(status)) => debug!("Log capture exited with {}", status),
            Ok(None) => reap_in_background(child),
            Err(e) => warn!("Failed to reap log capture process: {}", e),
        }
    }
}

fn reap_in_background(mut child: Child) {
    let pid = child.id();
    let spawned = std::thread::Builder::new()
        .name(format!("reap-{pid}"))
        .spawn(move || match child.wait() {
            Ok(status) => debug!("Log capture {} exited with {}", pid, status),
            Err(e) => warn!("Failed to reap log capture {}: {}", pid, e),
        });
    if let Err(e) = spawned {
        warn!("Could not start reaper for log capture {}: {}", pid, e);
    }
}

impl Drop for AdbCaptureProcess {
    fn drop(&mut self) {
        self.terminate();
    }
}
