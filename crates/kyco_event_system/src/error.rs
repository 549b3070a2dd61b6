//! Error types shared by the pipeline, the NApp manager and NApps themselves.

use crate::channels::ChannelKind;
use crate::connection::ConnectionId;
use std::any::Any;
use std::path::PathBuf;

/// Errors raised while handling a single event.
///
/// A listener returning one of these is logged at the dispatch boundary and
/// never stops the stage that invoked it.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    /// The payload did not have the shape the listener expected
    #[error("Payload of {event_type} is not {expected}")]
    PayloadMismatch {
        event_type: String,
        expected: &'static str,
    },
    /// JSON payload could not be decoded into the requested type
    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
    /// Listener reported a failure of its own
    #[error("Listener execution error: {0}")]
    ListenerExecution(String),
    /// Listener panicked while handling the event
    #[error("Listener panicked: {0}")]
    ListenerPanicked(String),
    /// Re-emitting onto a channel failed
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// Writing to a switch connection failed
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Errors raised when enqueueing onto a channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// Bounded channel stayed full for the whole put timeout
    #[error("{0} channel is full")]
    Full(ChannelKind),
    /// Every receiver of the channel is gone
    #[error("{0} channel is closed")]
    Closed(ChannelKind),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionError {
    #[error("Connection {0} not found")]
    NotFound(ConnectionId),
    #[error("Connection {0} is closed")]
    Closed(ConnectionId),
}

/// Errors raised while loading, running or unloading a NApp.
///
/// Every load-time variant carries the NApp name so a failed batch load can
/// report each failure on its own.
#[derive(Debug, thiserror::Error)]
pub enum NAppError {
    /// The NApp directory does not exist
    #[error("NApp {name}: path not found: {}", path.display())]
    PathNotFound { name: String, path: PathBuf },
    /// The entry file or the entry it names could not be resolved
    #[error("NApp {name}: entry not found: {reason}")]
    EntryNotFound { name: String, reason: String },
    /// The entry file exists but could not be parsed
    #[error("NApp {name}: invalid manifest: {reason}")]
    InvalidManifest { name: String, reason: String },
    /// The shared library could not be opened or lacks the entry symbol
    #[error("NApp {name}: library error: {reason}")]
    Library { name: String, reason: String },
    /// The entry constructor failed or panicked
    #[error("NApp {name}: initialization failed: {reason}")]
    InitializationFailed { name: String, reason: String },
    /// A NApp with the same name is already loaded for this kind
    #[error("NApp {0} is already loaded")]
    AlreadyLoaded(String),
    /// Unload requested for a name that is not loaded
    #[error("NApp not found: {0}")]
    NotFound(String),
    /// Failure reported by NApp code itself (constructor or shutdown hook)
    #[error("NApp runtime error: {0}")]
    Runtime(String),
    /// Filesystem error while discovering NApps
    #[error("NApp discovery failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Extracts the message from a payload caught by `catch_unwind`.
///
/// Used wherever NApp code runs behind a panic boundary: listener dispatch,
/// NApp construction and shutdown hooks.
pub fn panic_message(panic_info: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
