//! Runtime catalog of NApp factories, keyed by entry name.

use crate::builtin;
use dashmap::DashMap;
use kyco_event_system::{NAppDescriptor, Privilege};
use tracing::{debug, warn};

#[derive(Debug, Default)]
pub struct NAppCatalog {
    entries: DashMap<String, NAppDescriptor>,
}

impl NAppCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog pre-populated with the bundled NApps.
    pub fn with_builtins() -> Self {
        let catalog = Self::new();
        for descriptor in builtin::descriptors() {
            catalog.register(descriptor);
        }
        catalog
    }

    /// Adds or replaces an entry, returning the one it replaced.
    pub fn register(&self, descriptor: NAppDescriptor) -> Option<NAppDescriptor> {
        if descriptor.wants_inbound && descriptor.privilege != Privilege::Core {
            warn!(
                entry = %descriptor.entry,
                "Entry wants the inbound producer but is not privileged; it will only receive it when loaded as a core NApp"
            );
        }

        debug!(entry = %descriptor.entry, "Registered NApp entry");
        let previous = self.entries.insert(descriptor.entry.clone(), descriptor);
        if let Some(previous) = &previous {
            warn!(entry = %previous.entry, "Replaced existing NApp entry");
        }
        previous
    }

    pub fn get(&self, entry: &str) -> Option<NAppDescriptor> {
        self.entries.get(entry).map(|descriptor| descriptor.clone())
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries.contains_key(entry)
    }

    /// Registered entry names, sorted.
    pub fn entries(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}
