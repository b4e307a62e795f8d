//! Device control bridge
//!
//! Tails the debug bridge's log stream, turns protocol lines into control
//! state and action events, and keeps the connection alive across device
//! loss. Three concurrency domains meet here:
//!
//! - one reader thread per connection ([`log_reader`])
//! - the async connection supervisor ([`supervisor`])
//! - the single-threaded consumer ([`consumer`], [`dispatcher`])
//!
//! [`DeviceBridge`] wires them together.

pub mod action_queue;
pub mod bridge_handle;
pub mod connect_sequence;
pub mod consumer;
pub mod control_state;
pub mod dispatcher;
pub mod error;
pub mod log_reader;
pub mod store;
pub mod supervisor;
pub mod transport;

pub use action_queue::{ActionEvent, ActionQueue, ActionQueues};
pub use bridge_handle::{BridgeSettings, DeviceBridge};
pub use consumer::{ConsumerAdapter, GatePhase, InputGate};
pub use control_state::{ControlState, DeadzoneSettings, FlagStates};
pub use dispatcher::{DrainReport, MainThreadDispatcher};
pub use error::{BridgeError, TransportError};
pub use store::{ControlStore, FlagTrigger};
pub use supervisor::{ConnectionState, ConnectionStatus, SupervisorHandle, SupervisorSettings};
pub use transport::{AdbSettings, AdbTransport, BridgeTransport, DeviceInfo, DeviceState};
