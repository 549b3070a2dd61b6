use crate::controller::ControllerState;
use kyco_event_system::{ChannelKind, NAppError};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    /// `start`/`stop` called in a state that does not allow it
    #[error("Cannot {operation} a controller that is {state}")]
    InvalidState {
        operation: &'static str,
        state: ControllerState,
    },
    #[error("Failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("Network error: {0}")]
    Network(String),
    #[error("Failed to spawn {kind} stage: {source}")]
    StageSpawn {
        kind: ChannelKind,
        #[source]
        source: std::io::Error,
    },
    /// Some stages were still running when the join timeout expired
    #[error("Stages did not stop within {timeout:?}: {}", format_kinds(.stuck))]
    StageJoinTimeout {
        timeout: Duration,
        stuck: Vec<ChannelKind>,
    },
    #[error("{0} stage panicked")]
    StagePanicked(ChannelKind),
    #[error(transparent)]
    NApp(#[from] NAppError),
}

fn format_kinds(kinds: &[ChannelKind]) -> String {
    kinds
        .iter()
        .map(ChannelKind::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
