//! The contract between the controller and a NApp.
//!
//! A NApp is published through an [`NAppDescriptor`]: a constructor plus the
//! capability flags the manager needs before instantiating it. The constructor
//! receives an [`NAppContext`] holding exactly the producers the NApp is
//! entitled to, and the resulting [`NApp`] declares its listeners as a
//! [`ListenerMap`].

use crate::channels::{ChannelKind, ChannelSet, Producer};
use crate::connection::ConnectionPool;
use crate::error::{EventError, NAppError};
use crate::event::Event;
use crate::registry::ListenerFn;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::Span;

/// Symbol a NApp shared library exports, see [`export_napp!`](crate::export_napp).
pub const NAPP_DESCRIPTOR_SYMBOL: &[u8] = b"kyco_napp_descriptor";

/// Signature of the exported descriptor function. Ownership of the returned
/// descriptor passes to the caller; null signals a failed construction.
#[allow(improper_ctypes_definitions)]
pub type NAppDescriptorFn = unsafe extern "C" fn() -> *mut NAppDescriptor;

/// Which root directory and table a NApp belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NAppKind {
    Core,
    Ordinary,
}

impl NAppKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NAppKind::Core => "core",
            NAppKind::Ordinary => "ordinary",
        }
    }
}

impl fmt::Display for NAppKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Privilege tag carried by an entry.
///
/// A `Core` entry may receive the inbound producer even when it is installed
/// as an ordinary NApp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Privilege {
    Core,
    #[default]
    Standard,
}

/// Everything a NApp constructor is handed.
#[derive(Debug, Clone)]
pub struct NAppContext {
    pub name: String,
    pub kind: NAppKind,
    pub outbound: Producer,
    pub application: Producer,
    /// Present only when the entry asked for it and is entitled to it
    pub inbound: Option<Producer>,
    pub connections: Arc<ConnectionPool>,
    /// Span the NApp should log under
    pub span: Span,
}

impl NAppContext {
    /// Binds producers from `channels`; `grant_inbound` decides whether the
    /// inbound producer is included.
    pub fn from_channels(
        name: impl Into<String>,
        kind: NAppKind,
        channels: &ChannelSet,
        grant_inbound: bool,
        connections: Arc<ConnectionPool>,
    ) -> Self {
        let name = name.into();
        let span = tracing::info_span!("napp", napp = %name, kind = %kind);
        Self {
            outbound: channels.producer(ChannelKind::Outbound),
            application: channels.producer(ChannelKind::Application),
            inbound: grant_inbound.then(|| channels.producer(ChannelKind::Inbound)),
            name,
            kind,
            connections,
            span,
        }
    }
}

/// A listener as declared by a NApp, before it is owner-tagged.
#[derive(Clone)]
pub struct DeclaredListener {
    pub name: String,
    pub callback: ListenerFn,
}

impl fmt::Debug for DeclaredListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeclaredListener").field("name", &self.name).finish()
    }
}

/// Event type to the NApp's listeners for it, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct ListenerMap {
    entries: BTreeMap<String, Vec<DeclaredListener>>,
}

impl ListenerMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a listener for `event_type`.
    pub fn on<F>(mut self, event_type: impl Into<String>, name: impl Into<String>, callback: F) -> Self
    where
        F: Fn(&Event) -> Result<(), EventError> + Send + Sync + 'static,
    {
        self.insert(event_type, name, Arc::new(callback));
        self
    }

    pub fn insert(&mut self, event_type: impl Into<String>, name: impl Into<String>, callback: ListenerFn) {
        self.entries
            .entry(event_type.into())
            .or_default()
            .push(DeclaredListener {
                name: name.into(),
                callback,
            });
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<DeclaredListener>)> {
        self.entries.iter()
    }

    pub fn event_types(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// Number of declared listeners across all event types.
    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl IntoIterator for ListenerMap {
    type Item = (String, Vec<DeclaredListener>);
    type IntoIter = std::collections::btree_map::IntoIter<String, Vec<DeclaredListener>>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

/// A loaded network application.
pub trait NApp: Send + Sync {
    fn name(&self) -> &str;

    fn version(&self) -> &str {
        "0.1.0"
    }

    /// The listeners to merge into the registry. Called once, right after
    /// construction.
    fn listeners(&self) -> ListenerMap;

    /// Called once on unload, before the NApp's listeners are removed.
    fn shutdown(&mut self) -> Result<(), NAppError> {
        Ok(())
    }
}

pub type NAppConstructor =
    Arc<dyn Fn(NAppContext) -> Result<Box<dyn NApp>, NAppError> + Send + Sync>;

/// A constructor plus the capability flags checked before it runs.
#[derive(Clone)]
pub struct NAppDescriptor {
    pub entry: String,
    pub privilege: Privilege,
    pub wants_inbound: bool,
    pub constructor: NAppConstructor,
}

impl NAppDescriptor {
    pub fn new<F>(entry: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(NAppContext) -> Result<Box<dyn NApp>, NAppError> + Send + Sync + 'static,
    {
        Self {
            entry: entry.into(),
            privilege: Privilege::Standard,
            wants_inbound: false,
            constructor: Arc::new(constructor),
        }
    }

    pub fn privileged(mut self) -> Self {
        self.privilege = Privilege::Core;
        self
    }

    pub fn with_inbound(mut self) -> Self {
        self.wants_inbound = true;
        self
    }

    /// Whether a NApp of `kind` built from this entry receives the inbound
    /// producer.
    pub fn entitled_to_inbound(&self, kind: NAppKind) -> bool {
        self.wants_inbound && (kind == NAppKind::Core || self.privilege == Privilege::Core)
    }

    pub fn instantiate(&self, context: NAppContext) -> Result<Box<dyn NApp>, NAppError> {
        (self.constructor)(context)
    }
}

impl fmt::Debug for NAppDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NAppDescriptor")
            .field("entry", &self.entry)
            .field("privilege", &self.privilege)
            .field("wants_inbound", &self.wants_inbound)
            .finish()
    }
}

/// Exports a NApp descriptor from a `cdylib` crate.
///
/// ```rust,ignore
/// kyco_event_system::export_napp!(NAppDescriptor::new("flow_stats", FlowStats::create));
/// ```
///
/// Panics while building the descriptor are caught and reported to the
/// loader as a null pointer.
#[macro_export]
macro_rules! export_napp {
    ($descriptor:expr) => {
        #[no_mangle]
        #[allow(improper_ctypes_definitions)]
        pub unsafe extern "C" fn kyco_napp_descriptor() -> *mut $crate::NAppDescriptor {
            match ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| $descriptor)) {
                Ok(descriptor) => ::std::boxed::Box::into_raw(::std::boxed::Box::new(descriptor)),
                Err(_) => ::std::ptr::null_mut(),
            }
        }
    };
}
