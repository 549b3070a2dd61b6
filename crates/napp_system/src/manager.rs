//! Loading, tracking and unloading of core and ordinary NApps.

use crate::catalog::NAppCatalog;
use crate::loader;
use crate::manifest::{EntrySource, NAppManifest};
use kyco_event_system::{
    core_events, panic_message, ChannelKind, ChannelSet, ConnectionPool, Event, Listener, ListenerMap, ListenerOwner,
    ListenerRegistry, ModuleGuard, NApp, NAppContext, NAppDescriptor, NAppError, NAppKind, Producer,
};
use libloading::Library;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::RwLock;
use tracing::{debug, error, info, info_span, warn, Span};

/// Public view of a loaded NApp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NAppInfo {
    pub name: String,
    pub kind: NAppKind,
    pub entry: String,
    pub version: String,
    pub path: PathBuf,
    pub listener_count: usize,
    pub inbound_granted: bool,
    pub loaded_at: SystemTime,
}

/// Payload of the `kyco/core.napp.loaded` and `kyco/core.napp.unloaded` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NAppLifecycleEvent {
    pub name: String,
    pub kind: NAppKind,
}

/// A loaded NApp with everything that must outlive it.
///
/// Fields drop in declaration order, so the instance goes before this
/// reference to its library. Every listener the NApp registered holds another
/// reference, so the library stays mapped while a stage may still run one.
struct LoadedNApp {
    napp: Box<dyn NApp>,
    info: NAppInfo,
    _library: Option<Arc<Library>>,
}

/// Descriptor resolved from a manifest; the library, if any, drops last.
struct ResolvedEntry {
    descriptor: NAppDescriptor,
    library: Option<Arc<Library>>,
}

/// Owns the core and ordinary NApp tables.
pub struct NAppManager {
    core_root: PathBuf,
    napps_root: PathBuf,
    catalog: Arc<NAppCatalog>,
    registry: Arc<ListenerRegistry>,
    channels: Arc<ChannelSet>,
    connections: Arc<ConnectionPool>,
    lifecycle: Producer,
    core: RwLock<HashMap<String, LoadedNApp>>,
    ordinary: RwLock<HashMap<String, LoadedNApp>>,
    span: Span,
}

impl NAppManager {
    pub fn new(
        core_root: impl AsRef<Path>,
        napps_root: impl AsRef<Path>,
        catalog: Arc<NAppCatalog>,
        registry: Arc<ListenerRegistry>,
        channels: Arc<ChannelSet>,
        connections: Arc<ConnectionPool>,
    ) -> Self {
        Self::with_span(
            core_root,
            napps_root,
            catalog,
            registry,
            channels,
            connections,
            &Span::current(),
        )
    }

    /// Manager whose log lines are recorded under a child of `parent`.
    pub fn with_span(
        core_root: impl AsRef<Path>,
        napps_root: impl AsRef<Path>,
        catalog: Arc<NAppCatalog>,
        registry: Arc<ListenerRegistry>,
        channels: Arc<ChannelSet>,
        connections: Arc<ConnectionPool>,
        parent: &Span,
    ) -> Self {
        Self {
            core_root: core_root.as_ref().to_path_buf(),
            napps_root: napps_root.as_ref().to_path_buf(),
            catalog,
            registry,
            lifecycle: channels.producer(ChannelKind::Application),
            channels,
            connections,
            core: RwLock::new(HashMap::new()),
            ordinary: RwLock::new(HashMap::new()),
            span: info_span!(parent: parent, "napp_manager"),
        }
    }

    pub fn root(&self, kind: NAppKind) -> &Path {
        match kind {
            NAppKind::Core => &self.core_root,
            NAppKind::Ordinary => &self.napps_root,
        }
    }

    pub fn catalog(&self) -> &Arc<NAppCatalog> {
        &self.catalog
    }

    fn table(&self, kind: NAppKind) -> &RwLock<HashMap<String, LoadedNApp>> {
        match kind {
            NAppKind::Core => &self.core,
            NAppKind::Ordinary => &self.ordinary,
        }
    }

    /// Names of the immediate subdirectories of the root for `kind`, sorted.
    ///
    /// A missing root is logged and treated as empty.
    pub async fn discover(&self, kind: NAppKind) -> Result<Vec<String>, NAppError> {
        let root = self.root(kind);
        if !tokio::fs::try_exists(root).await.unwrap_or(false) {
            warn!(parent: &self.span, kind = %kind, "NApp directory does not exist: {}", root.display());
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match entry.file_name().into_string() {
                Ok(name) => names.push(name),
                Err(raw) => {
                    warn!(parent: &self.span, kind = %kind, "Skipping NApp directory with non UTF-8 name: {:?}", raw);
                }
            }
        }

        names.sort();
        Ok(names)
    }

    async fn resolve_entry(&self, name: &str, dir: &Path) -> Result<(NAppManifest, ResolvedEntry), NAppError> {
        let manifest = NAppManifest::load(name, dir).await?;
        let resolved = match manifest.source(name, dir)? {
            EntrySource::Catalog(entry) => {
                let descriptor = self.catalog.get(&entry).ok_or_else(|| NAppError::EntryNotFound {
                    name: name.to_string(),
                    reason: format!("no catalog entry named {}", entry),
                })?;
                ResolvedEntry {
                    descriptor,
                    library: None,
                }
            }
            EntrySource::Library(path) => {
                let loaded = loader::load_library(name, &path)?;
                ResolvedEntry {
                    descriptor: loaded.descriptor,
                    library: Some(Arc::new(loaded.library)),
                }
            }
        };
        Ok((manifest, resolved))
    }

    /// Loads the NApp in `<root(kind)>/<name>` and merges its listeners into
    /// the registry.
    ///
    /// The directory's `napp.toml` names either a catalog entry or a shared
    /// library. The entry's declared capabilities decide whether the NApp gets
    /// the inbound producer: core NApps always do when they ask, ordinary ones
    /// only when their entry is privileged.
    ///
    /// # Arguments
    ///
    /// * `kind` - Which root to look in and which table to record the NApp in
    /// * `name` - The NApp's directory name, also its unique name per kind
    ///
    /// # Returns
    ///
    /// The [`NAppInfo`] of the loaded NApp, or an [`NAppError`] naming `name`.
    /// A failed load leaves the registry and the tables untouched.
    pub async fn load(&self, kind: NAppKind, name: &str) -> Result<NAppInfo, NAppError> {
        let dir = self.root(kind).join(name);
        if !tokio::fs::metadata(&dir).await.map(|m| m.is_dir()).unwrap_or(false) {
            return Err(NAppError::PathNotFound {
                name: name.to_string(),
                path: dir,
            });
        }

        if self.table(kind).read().await.contains_key(name) {
            return Err(NAppError::AlreadyLoaded(name.to_string()));
        }

        let (manifest, resolved) = self.resolve_entry(name, &dir).await?;

        let inbound_granted = resolved.descriptor.entitled_to_inbound(kind);
        if resolved.descriptor.wants_inbound && !inbound_granted {
            warn!(parent: &self.span, napp = name, kind = %kind, "Inbound producer withheld from unprivileged NApp");
        }

        let context = NAppContext::from_channels(
            name,
            kind,
            &self.channels,
            inbound_granted,
            self.connections.clone(),
        );

        let init_failed = |reason: String| NAppError::InitializationFailed {
            name: name.to_string(),
            reason,
        };
        let napp = catch_unwind(AssertUnwindSafe(|| resolved.descriptor.instantiate(context)))
            .map_err(|panic_info| init_failed(format!("NApp panicked: {}", panic_message(panic_info))))?
            .map_err(|e| init_failed(e.to_string()))?;
        let listeners = catch_unwind(AssertUnwindSafe(|| napp.listeners()))
            .map_err(|panic_info| init_failed(format!("NApp panicked: {}", panic_message(panic_info))))?;

        let owner = ListenerOwner::napp(kind, name);
        let info = NAppInfo {
            name: name.to_string(),
            kind,
            entry: resolved.descriptor.entry.clone(),
            version: manifest
                .version
                .clone()
                .unwrap_or_else(|| napp.version().to_string()),
            path: dir,
            listener_count: listeners.len(),
            inbound_granted,
            loaded_at: SystemTime::now(),
        };

        {
            let mut table = self.table(kind).write().await;
            if table.contains_key(name) {
                return Err(NAppError::AlreadyLoaded(name.to_string()));
            }

            let module = resolved.library.clone().map(|library| library as ModuleGuard);
            register_listeners(&self.registry, &owner, listeners, module.as_ref());

            table.insert(
                name.to_string(),
                LoadedNApp {
                    napp,
                    info: info.clone(),
                    _library: resolved.library,
                },
            );
        }

        info!(
            parent: &self.span,
            napp = name,
            kind = %kind,
            entry = %info.entry,
            listeners = info.listener_count,
            inbound = inbound_granted,
            "Loaded NApp"
        );
        self.emit_lifecycle(core_events::NAPP_LOADED, name, kind);

        Ok(info)
    }

    /// Loads every NApp under the root for `kind`, in name order.
    ///
    /// Failures are logged per NApp and do not stop the remaining loads.
    /// Returns the names that loaded.
    pub async fn load_all(&self, kind: NAppKind) -> Result<Vec<String>, NAppError> {
        let names = self.discover(kind).await?;
        let mut loaded = Vec::new();
        let mut failed = Vec::new();

        for name in names {
            match self.load(kind, &name).await {
                Ok(_) => loaded.push(name),
                Err(e) => {
                    error!(parent: &self.span, napp = %name, kind = %kind, "Failed to load NApp: {}", e);
                    failed.push(name);
                }
            }
        }

        if !failed.is_empty() {
            warn!(
                parent: &self.span,
                kind = %kind,
                "Failed to load {} NApps: {}",
                failed.len(),
                failed.join(", ")
            );
        }
        info!(parent: &self.span, kind = %kind, "{} NApps loaded from {}", loaded.len(), self.root(kind).display());

        Ok(loaded)
    }

    /// Runs the NApp's shutdown hook, removes its listeners and forgets it.
    ///
    /// A failing or panicking shutdown hook is logged; the NApp is removed
    /// regardless. Dispatches already in flight may still finish running its
    /// listeners, whose library stays loaded until they are done.
    ///
    /// # Returns
    ///
    /// [`NAppError::NotFound`] if no NApp called `name` is loaded for `kind`.
    pub async fn unload(&self, kind: NAppKind, name: &str) -> Result<(), NAppError> {
        let mut table = self.table(kind).write().await;
        let loaded = table
            .get_mut(name)
            .ok_or_else(|| NAppError::NotFound(name.to_string()))?;

        info!(parent: &self.span, napp = name, kind = %kind, "Unloading NApp");

        match catch_unwind(AssertUnwindSafe(|| loaded.napp.shutdown())) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(parent: &self.span, napp = name, "Error shutting down NApp: {}", e),
            Err(panic_info) => error!(
                parent: &self.span,
                napp = name,
                "NApp panicked during shutdown: {}",
                panic_message(panic_info)
            ),
        }

        let removed = self.registry.unregister_all(&ListenerOwner::napp(kind, name));
        table.remove(name);
        drop(table);

        debug!(parent: &self.span, napp = name, listeners = removed, "NApp listeners removed");
        self.emit_lifecycle(core_events::NAPP_UNLOADED, name, kind);
        Ok(())
    }

    /// Unloads every NApp of `kind`, iterating a snapshot of the loaded names.
    pub async fn unload_all(&self, kind: NAppKind) -> usize {
        let names = self.loaded(kind).await;
        let mut unloaded = 0;

        for name in names {
            match self.unload(kind, &name).await {
                Ok(()) => unloaded += 1,
                Err(e) => {
                    error!(parent: &self.span, napp = %name, kind = %kind, "Failed to unload NApp: {}", e);
                }
            }
        }

        info!(parent: &self.span, kind = %kind, "{} NApps unloaded", unloaded);
        unloaded
    }

    /// Loaded NApp names for `kind`.
    ///
    /// # Returns
    ///
    /// A sorted snapshot; NApps loaded or unloaded afterwards are not
    /// reflected in it.
    pub async fn loaded(&self, kind: NAppKind) -> Vec<String> {
        let mut names: Vec<String> = self.table(kind).read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn is_loaded(&self, kind: NAppKind, name: &str) -> bool {
        self.table(kind).read().await.contains_key(name)
    }

    pub async fn info(&self, kind: NAppKind, name: &str) -> Option<NAppInfo> {
        self.table(kind).read().await.get(name).map(|loaded| loaded.info.clone())
    }

    pub async fn count(&self) -> usize {
        self.core.read().await.len() + self.ordinary.read().await.len()
    }

    fn emit_lifecycle(&self, event_type: &str, name: &str, kind: NAppKind) {
        let payload = NAppLifecycleEvent {
            name: name.to_string(),
            kind,
        };

        let result = Event::from_serializable(event_type, &payload)
            .and_then(|event| self.lifecycle.put(event).map_err(Into::into));
        if let Err(e) = result {
            warn!(parent: &self.span, napp = name, "Failed to emit {}: {}", event_type, e);
        }
    }
}

/// Merges a NApp's declared listeners into the registry, after any listeners
/// already registered for the same event types.
///
/// Listeners whose code lives in a shared library retain `module`, so that
/// library outlives every dispatch snapshot that still contains them.
fn register_listeners(
    registry: &ListenerRegistry,
    owner: &ListenerOwner,
    listeners: ListenerMap,
    module: Option<&ModuleGuard>,
) {
    for (event_type, declared) in listeners {
        for declared_listener in declared {
            let mut listener = Listener::from_arc(declared_listener.name, owner.clone(), declared_listener.callback);
            if let Some(module) = module {
                listener = listener.retaining(module.clone());
            }
            registry.register(event_type.clone(), listener);
        }
    }
}
