use std::time::Duration;

/// Failures talking to the bridge executable or its subprocesses.
///
/// All of these are recovered by the supervisor's reconnect loop, with the
/// exception of [`TransportError::ExecutableNotFound`] before the server has
/// ever been started.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Bridge executable not found: {0}")]
    ExecutableNotFound(String),

    #[error("Failed to spawn '{command}': {source}")]
    SpawnFailed {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with status {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("'{0}' timed out after {1:?}")]
    Timeout(String, Duration),

    #[error("Log capture has no stdout")]
    MissingStdout,

    #[error("Transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True when retrying cannot help until the user fixes their environment.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::ExecutableNotFound(_))
    }
}

/// Errors surfaced by the bridge subsystem.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("No device connected")]
    DeviceNotFound,

    #[error("Connect attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("Initialization error: {0}")]
    InitializationError(String),

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),
}

impl BridgeError {
    pub fn is_fatal(&self) -> bool {
        match self {
            BridgeError::Transport(e) => e.is_fatal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_missing_executable_is_fatal() {
        let missing = BridgeError::from(TransportError::ExecutableNotFound("adb".into()));
        assert!(missing.is_fatal());

        let timeout = BridgeError::from(TransportError::Timeout(
            "adb devices".into(),
            Duration::from_millis(1500),
        ));
        assert!(!timeout.is_fatal());
        assert!(!BridgeError::DeviceNotFound.is_fatal());
    }
}
