//! # Kyco Controller
//!
//! Ties the event pipeline together: a TCP protocol server feeding the raw
//! channel, one dispatch stage per channel, and the NApp manager that loads
//! core and ordinary NApps into the shared listener registry.
//!
//! ## Lifecycle
//!
//! ```text
//! Created --start--> Running --stop--> Stopping --> Stopped
//! ```
//!
//! `start` binds the server, spawns the four stages, then loads core NApps
//! followed by ordinary NApps. `stop` closes the server and its connections,
//! sends one stop sentinel per channel, unloads ordinary then core NApps and
//! joins the stages within the configured timeout. Events still queued after
//! the join are counted as dropped.

pub mod config;
pub mod controller;
pub mod error;
pub mod server;

pub use config::{ControllerConfig, ServerConfig, DEFAULT_HOST, DEFAULT_PORT};
pub use controller::{Controller, ControllerState, ControllerStats};
pub use error::ControllerError;
pub use server::{ConnectionInfo, ProtocolServer};
