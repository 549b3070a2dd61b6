//! # Kyco Event System
//!
//! The event pipeline at the heart of the Kyco controller. Switch traffic enters
//! as raw events, flows through four dedicated channels and is handed to the
//! listeners that NApps registered for each event type.
//!
//! ## Architecture
//!
//! * **Events** - Immutable typed messages ([`Event`]) with an opaque [`Payload`]
//! * **Channels** - Four FIFO queues ([`ChannelSet`]): raw, inbound, application
//!   and outbound, each drained by exactly one stage
//! * **Listener Registry** - Event type to ordered listener handles
//!   ([`ListenerRegistry`]), safe to mutate while stages dispatch
//! * **Dispatch Stages** - One OS thread per channel ([`spawn_stage`])
//! * **Connection Pool** - Live switch connections keyed by id ([`ConnectionPool`])
//! * **NApp Contract** - The trait and entry descriptor every NApp implements
//!   ([`NApp`], [`NAppDescriptor`])
//!
//! ## Message Flow
//!
//! ```text
//! connection -> raw -> raw stage -> inbound / application
//!            inbound stage -> application / outbound
//!            application stage -> outbound
//!            outbound stage -> connection
//! ```
//!
//! Within a channel events are dispatched in enqueue order and the listeners
//! for one event type run in registration order on the stage's own thread.

pub mod channels;
pub mod connection;
pub mod error;
pub mod event;
pub mod napp;
pub mod registry;
pub mod stage;

pub use channels::{Channel, ChannelConfig, ChannelKind, ChannelSet, ChannelStats, Envelope, Producer};
pub use connection::{ConnectionHandle, ConnectionId, ConnectionPool};
pub use error::{panic_message, ChannelError, ConnectionError, EventError, NAppError};
pub use event::{core_events, Event, Payload};
pub use napp::{
    DeclaredListener, ListenerMap, NApp, NAppConstructor, NAppContext, NAppDescriptor, NAppDescriptorFn,
    NAppKind, Privilege, NAPP_DESCRIPTOR_SYMBOL,
};
pub use registry::{
    DispatchOutcome, DispatchStats, Listener, ListenerFn, ListenerOwner, ListenerRegistry, ModuleGuard,
};
pub use stage::{run_stage, spawn_stage, StageHandle, StageReport};

/// Returns the current Unix timestamp in milliseconds.
///
/// Falls back to zero if the system clock reports a time before the epoch.
pub fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
