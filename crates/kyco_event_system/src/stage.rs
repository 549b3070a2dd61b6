//! Dispatch stages: one OS thread per channel.

use crate::channels::{Channel, ChannelKind, Envelope};
use crate::registry::ListenerRegistry;
use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, info_span, Span};

/// What a stage did before it returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageReport {
    pub kind: ChannelKind,
    pub events_dispatched: u64,
}

/// Handle to a running stage thread.
#[derive(Debug)]
pub struct StageHandle {
    kind: ChannelKind,
    handle: JoinHandle<StageReport>,
}

impl StageHandle {
    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Waits for the stage to consume its stop sentinel.
    ///
    /// Returns `None` if the stage thread panicked.
    pub fn join(self) -> Option<StageReport> {
        self.handle.join().ok()
    }
}

/// Pulls envelopes from `channel` until the stop sentinel, dispatching each
/// event through `registry` on the calling thread.
///
/// Events queued ahead of the sentinel are dispatched; anything queued behind
/// it is left in the channel.
pub fn run_stage(channel: &Channel, registry: &ListenerRegistry) -> StageReport {
    let mut report = StageReport {
        kind: channel.kind(),
        events_dispatched: 0,
    };

    loop {
        match channel.get() {
            Envelope::Event(event) => {
                registry.dispatch(&event);
                report.events_dispatched += 1;
            }
            Envelope::Stop => {
                debug!(channel = %report.kind, "Stop sentinel received");
                return report;
            }
        }
    }
}

/// Starts the stage for `channel` on a dedicated thread named
/// `kyco-<channel>-dispatch`.
///
/// # Arguments
///
/// * `channel` - The channel this stage alone consumes
/// * `registry` - Shared listener registry the stage dispatches through
/// * `parent` - Span the stage's log lines are recorded under
///
/// # Returns
///
/// A [`StageHandle`] for joining the thread after the stop sentinel, or the
/// OS error if the thread could not be spawned.
pub fn spawn_stage(
    channel: Arc<Channel>,
    registry: Arc<ListenerRegistry>,
    parent: &Span,
) -> io::Result<StageHandle> {
    let kind = channel.kind();
    let span = info_span!(parent: parent, "stage", channel = %kind);

    let handle = thread::Builder::new()
        .name(format!("kyco-{kind}-dispatch"))
        .spawn(move || {
            let _enter = span.enter();
            info!("Dispatch stage started");
            let report = run_stage(&channel, &registry);
            info!(events = report.events_dispatched, "Dispatch stage stopped");
            report
        })?;

    Ok(StageHandle { kind, handle })
}
