use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use tokio::sync::broadcast;

/// Receives every frame a [`Broadcaster`] delivers. Implementations must not
/// block; a slow consumer should hand the frame off and return.
pub trait FrameSink<F>: Send + Sync {
    fn on_frame(&self, frame: &Arc<F>);
}

impl<F, G> FrameSink<F> for G
where
    G: Fn(&Arc<F>) + Send + Sync,
{
    fn on_frame(&self, frame: &Arc<F>) {
        self(frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

/// Fan-out point. Every sink gets a reference to the same immutable frame.
pub struct Broadcaster<F> {
    sinks: RwLock<HashMap<SinkId, Arc<dyn FrameSink<F>>>>,
    next_id: AtomicU64,
}

impl<F> Default for Broadcaster<F> {
    fn default() -> Self {
        Self {
            sinks: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

impl<F> Broadcaster<F> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&self, sink: Arc<dyn FrameSink<F>>) -> SinkId {
        let id = SinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, sink);
        id
    }

    pub fn add_fn(&self, f: impl Fn(&Arc<F>) + Send + Sync + 'static) -> SinkId
    where
        F: 'static,
    {
        self.add_sink(Arc::new(f))
    }

    /// Returns whether the sink was registered.
    pub fn remove_sink(&self, id: SinkId) -> bool {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn sink_count(&self) -> usize {
        self.sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Hand `frame` to every sink registered right now. Sinks run outside the
    /// registry lock, so they may add or remove sinks themselves.
    pub fn deliver(&self, frame: Arc<F>) -> usize {
        let sinks: Vec<_> = self
            .sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for sink in &sinks {
            sink.on_frame(&frame);
        }
        sinks.len()
    }
}

/// Forwards frames into a tokio broadcast channel. Receivers that fall behind
/// skip frames rather than holding up delivery.
pub struct ChannelSink<F> {
    tx: broadcast::Sender<Arc<F>>,
}

impl<F> ChannelSink<F> {
    pub fn new(capacity: usize) -> (Self, broadcast::Receiver<Arc<F>>) {
        let (tx, rx) = broadcast::channel(capacity);
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<F>> {
        self.tx.subscribe()
    }
}

impl<F: Send + Sync> FrameSink<F> for ChannelSink<F> {
    fn on_frame(&self, frame: &Arc<F>) {
        // No receivers is fine.
        self.tx.send(frame.clone()).ok();
    }
}
