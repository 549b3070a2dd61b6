//! The four pipeline channels and the producer handles bound to them.
//!
//! Each channel is a FIFO queue of [`Envelope`]s consumed by exactly one
//! dispatch stage. Producers are cheap clones that NApps, the protocol server
//! and listeners use to enqueue events.

use crate::error::ChannelError;
use crate::event::Event;
use crossbeam::channel::{self, Receiver, SendTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Identifies one of the four pipeline channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Raw,
    Inbound,
    Application,
    Outbound,
}

impl ChannelKind {
    /// All channels in pipeline order.
    pub const ALL: [ChannelKind; 4] = [
        ChannelKind::Raw,
        ChannelKind::Inbound,
        ChannelKind::Application,
        ChannelKind::Outbound,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelKind::Raw => "raw",
            ChannelKind::Inbound => "inbound",
            ChannelKind::Application => "application",
            ChannelKind::Outbound => "outbound",
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Item carried by a channel: an event or the stop sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Event(Event),
    Stop,
}

/// Sizing of the channel set.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// `None` for unbounded channels, otherwise the per-channel capacity
    pub capacity: Option<usize>,
    /// How long a producer may block on a full bounded channel
    pub put_timeout: Duration,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            put_timeout: Duration::from_secs(5),
        }
    }
}

/// A single FIFO queue.
///
/// The channel keeps its own sender and receiver, so it never reports
/// disconnection while it is alive; `get` only returns on an item.
///
/// A bounded channel is allocated one slot larger than its capacity. Events
/// are admitted through a permit queue of exactly `capacity` slots, so the
/// extra slot is always free for the stop sentinel and [`Channel::send_stop`]
/// never blocks, however full the channel is.
pub struct Channel {
    kind: ChannelKind,
    sender: Sender<Envelope>,
    receiver: Receiver<Envelope>,
    permits: Option<(Sender<()>, Receiver<()>)>,
    put_timeout: Duration,
    enqueued: AtomicU64,
    stop_sent: AtomicBool,
}

impl Channel {
    pub fn new(kind: ChannelKind, config: &ChannelConfig) -> Self {
        let (sender, receiver, permits) = match config.capacity {
            Some(capacity) => {
                let (sender, receiver) = channel::bounded(capacity + 1);
                (sender, receiver, Some(channel::bounded(capacity)))
            }
            None => {
                let (sender, receiver) = channel::unbounded();
                (sender, receiver, None)
            }
        };

        Self {
            kind,
            sender,
            receiver,
            permits,
            put_timeout: config.put_timeout,
            enqueued: AtomicU64::new(0),
            stop_sent: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    /// Whether producers can ever block on this channel.
    pub fn is_bounded(&self) -> bool {
        self.permits.is_some()
    }

    /// Enqueues an event.
    ///
    /// Unbounded channels never block. Bounded channels block for at most the
    /// configured put timeout and then report [`ChannelError::Full`].
    ///
    /// # Arguments
    ///
    /// * `event` - The event to append behind everything already queued
    ///
    /// # Returns
    ///
    /// `Ok(())` once the event is queued, [`ChannelError::Full`] if a bounded
    /// channel stayed full for the whole put timeout.
    pub fn put(&self, event: Event) -> Result<(), ChannelError> {
        if let Some((permit, _)) = &self.permits {
            match permit.send_timeout((), self.put_timeout) {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => return Err(ChannelError::Full(self.kind)),
                Err(SendTimeoutError::Disconnected(_)) => return Err(ChannelError::Closed(self.kind)),
            }
        }
        self.enqueue(event)
    }

    /// Enqueues an event only if that needs no waiting.
    pub fn try_put(&self, event: Event) -> Result<(), ChannelError> {
        if let Some((permit, _)) = &self.permits {
            match permit.try_send(()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => return Err(ChannelError::Full(self.kind)),
                Err(TrySendError::Disconnected(_)) => return Err(ChannelError::Closed(self.kind)),
            }
        }
        self.enqueue(event)
    }

    // Caller holds a permit (bounded) so the send below has room.
    fn enqueue(&self, event: Event) -> Result<(), ChannelError> {
        match self.sender.try_send(Envelope::Event(event)) {
            Ok(()) => {
                self.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => {
                self.release_permit();
                match e {
                    TrySendError::Full(_) => Err(ChannelError::Full(self.kind)),
                    TrySendError::Disconnected(_) => Err(ChannelError::Closed(self.kind)),
                }
            }
        }
    }

    fn release_permit(&self) {
        if let Some((_, permits)) = &self.permits {
            let _ = permits.try_recv();
        }
    }

    /// Blocks until the next envelope is available.
    pub fn get(&self) -> Envelope {
        // Disconnection is impossible while `self` holds a sender; treat it as stop.
        match self.receiver.recv() {
            Ok(Envelope::Event(event)) => {
                self.release_permit();
                Envelope::Event(event)
            }
            Ok(Envelope::Stop) | Err(_) => Envelope::Stop,
        }
    }

    /// Pushes one stop sentinel behind everything already queued.
    ///
    /// Never blocks: the sentinel uses the slot reserved for it. Later calls
    /// are no-ops, so a channel carries at most one sentinel.
    pub fn send_stop(&self) {
        if self.stop_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.sender.try_send(Envelope::Stop).is_err() {
            warn!(channel = %self.kind, "Stop sentinel could not be delivered");
        }
    }

    /// Number of envelopes currently waiting.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Total events accepted since creation.
    pub fn enqueued(&self) -> u64 {
        self.enqueued.load(Ordering::Relaxed)
    }

    /// Drops every queued envelope and returns how many events were discarded.
    pub fn drain_pending(&self) -> usize {
        let mut dropped = 0;
        while let Ok(envelope) = self.receiver.try_recv() {
            if let Envelope::Event(_) = envelope {
                self.release_permit();
                dropped += 1;
            }
        }
        dropped
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("kind", &self.kind)
            .field("pending", &self.len())
            .field("enqueued", &self.enqueued())
            .finish()
    }
}

/// Handle that enqueues onto one specific channel.
///
/// NApps receive producers through their [`NAppContext`](crate::NAppContext);
/// which channels they get producers for decides what they may emit.
#[derive(Debug, Clone)]
pub struct Producer {
    channel: Arc<Channel>,
}

impl Producer {
    pub fn kind(&self) -> ChannelKind {
        self.channel.kind()
    }

    pub fn is_bounded(&self) -> bool {
        self.channel.is_bounded()
    }

    /// Enqueues `event` on the bound channel.
    ///
    /// This is a blocking call on bounded channels: it waits up to the put
    /// timeout for room. Async callers should prefer [`Producer::try_put`]
    /// and move the blocking fallback off the runtime.
    ///
    /// # Returns
    ///
    /// `Ok(())` when queued, otherwise the [`ChannelError`] explaining why the
    /// event was dropped.
    pub fn put(&self, event: Event) -> Result<(), ChannelError> {
        let event_type = event.event_type().to_string();
        self.channel.put(event).map_err(|e| {
            debug!(channel = %self.channel.kind(), event_type = %event_type, "Dropped event: {}", e);
            e
        })
    }

    /// Non-blocking variant of [`Producer::put`]. A full channel is reported
    /// as [`ChannelError::Full`] immediately and is not logged.
    pub fn try_put(&self, event: Event) -> Result<(), ChannelError> {
        self.channel.try_put(event)
    }
}

/// Per-channel counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub kind: ChannelKind,
    pub enqueued: u64,
    pub pending: usize,
}

/// The raw, inbound, application and outbound channels.
#[derive(Debug)]
pub struct ChannelSet {
    raw: Arc<Channel>,
    inbound: Arc<Channel>,
    application: Arc<Channel>,
    outbound: Arc<Channel>,
    stop_sent: AtomicBool,
}

impl ChannelSet {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            raw: Arc::new(Channel::new(ChannelKind::Raw, config)),
            inbound: Arc::new(Channel::new(ChannelKind::Inbound, config)),
            application: Arc::new(Channel::new(ChannelKind::Application, config)),
            outbound: Arc::new(Channel::new(ChannelKind::Outbound, config)),
            stop_sent: AtomicBool::new(false),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(&ChannelConfig::default())
    }

    pub fn channel(&self, kind: ChannelKind) -> &Arc<Channel> {
        match kind {
            ChannelKind::Raw => &self.raw,
            ChannelKind::Inbound => &self.inbound,
            ChannelKind::Application => &self.application,
            ChannelKind::Outbound => &self.outbound,
        }
    }

    pub fn producer(&self, kind: ChannelKind) -> Producer {
        Producer {
            channel: self.channel(kind).clone(),
        }
    }

    /// Pushes exactly one stop sentinel per channel.
    ///
    /// Only the first call has an effect; each channel has a single consumer,
    /// so one sentinel per channel is what unblocks every stage exactly once.
    /// Never blocks, even when bounded channels are full or no stage is
    /// running, so it is safe from `Drop`.
    ///
    /// # Returns
    ///
    /// `false` if the sentinels had already been sent.
    pub fn send_stop_signal(&self) -> bool {
        if self.stop_sent.swap(true, Ordering::SeqCst) {
            return false;
        }

        for kind in ChannelKind::ALL {
            self.channel(kind).send_stop();
        }
        true
    }

    pub fn stop_sent(&self) -> bool {
        self.stop_sent.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> Vec<ChannelStats> {
        ChannelKind::ALL
            .iter()
            .map(|kind| {
                let channel = self.channel(*kind);
                ChannelStats {
                    kind: *kind,
                    enqueued: channel.enqueued(),
                    pending: channel.len(),
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let channels = ChannelSet::unbounded();
        let producer = channels.producer(ChannelKind::Inbound);

        for i in 0..3 {
            producer.put(Event::signal(format!("e{i}"))).expect("unbounded put");
        }

        let inbound = channels.channel(ChannelKind::Inbound);
        for i in 0..3 {
            match inbound.get() {
                Envelope::Event(event) => assert_eq!(event.event_type(), format!("e{i}")),
                Envelope::Stop => panic!("unexpected stop"),
            }
        }
        assert_eq!(inbound.enqueued(), 3);
        assert!(inbound.is_empty());
    }

    #[test]
    fn test_stop_signal_sent_once_per_channel() {
        let channels = ChannelSet::unbounded();

        assert!(channels.send_stop_signal());
        assert!(!channels.send_stop_signal());

        for kind in ChannelKind::ALL {
            let channel = channels.channel(kind);
            assert_eq!(channel.len(), 1, "{kind} should hold exactly one sentinel");
            assert_eq!(channel.get(), Envelope::Stop);
        }
    }

    #[test]
    fn test_stop_sentinel_queues_behind_events() {
        let channels = ChannelSet::unbounded();
        channels
            .producer(ChannelKind::Raw)
            .put(Event::signal("before"))
            .expect("put");
        channels.send_stop_signal();
        channels
            .producer(ChannelKind::Raw)
            .put(Event::signal("after"))
            .expect("put");

        let raw = channels.channel(ChannelKind::Raw);
        assert!(matches!(raw.get(), Envelope::Event(e) if e.event_type() == "before"));
        assert_eq!(raw.get(), Envelope::Stop);
        assert_eq!(raw.drain_pending(), 1);
    }

    #[test]
    fn test_bounded_put_times_out() {
        let config = ChannelConfig {
            capacity: Some(1),
            put_timeout: Duration::from_millis(20),
        };
        let channels = ChannelSet::new(&config);
        let producer = channels.producer(ChannelKind::Outbound);

        producer.put(Event::signal("first")).expect("room for one");
        assert_eq!(
            producer.put(Event::signal("second")),
            Err(ChannelError::Full(ChannelKind::Outbound))
        );
        assert_eq!(channels.channel(ChannelKind::Outbound).enqueued(), 1);
    }

    #[test]
    fn test_stop_fits_into_full_bounded_channel() {
        let config = ChannelConfig {
            capacity: Some(1),
            put_timeout: Duration::from_millis(20),
        };
        let channels = Arc::new(ChannelSet::new(&config));
        channels
            .producer(ChannelKind::Raw)
            .put(Event::signal("buffered"))
            .expect("room for one");

        let (tx, rx) = std::sync::mpsc::channel();
        let signaller = channels.clone();
        std::thread::spawn(move || {
            let _ = tx.send(signaller.send_stop_signal());
        });
        assert_eq!(rx.recv_timeout(Duration::from_secs(3)), Ok(true));

        let raw = channels.channel(ChannelKind::Raw);
        assert_eq!(raw.len(), 2);
        assert!(matches!(raw.get(), Envelope::Event(e) if e.event_type() == "buffered"));
        assert_eq!(raw.get(), Envelope::Stop);
    }

    #[test]
    fn test_bounded_capacity_recovers_after_get() {
        let config = ChannelConfig {
            capacity: Some(2),
            put_timeout: Duration::from_millis(20),
        };
        let channels = ChannelSet::new(&config);
        let producer = channels.producer(ChannelKind::Inbound);
        let inbound = channels.channel(ChannelKind::Inbound);

        producer.put(Event::signal("a")).expect("first slot");
        producer.put(Event::signal("b")).expect("second slot");
        assert_eq!(producer.try_put(Event::signal("c")), Err(ChannelError::Full(ChannelKind::Inbound)));

        assert!(matches!(inbound.get(), Envelope::Event(e) if e.event_type() == "a"));
        producer.try_put(Event::signal("c")).expect("slot freed by get");

        assert_eq!(inbound.drain_pending(), 2);
        producer.try_put(Event::signal("d")).expect("slots freed by drain");
        producer.try_put(Event::signal("e")).expect("slots freed by drain");
    }
}
