use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

/// Receives a live copy of captured output.
pub trait Observer: Send + Sync {
    fn write(&self, chunk: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

impl ObserverId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

pub(crate) struct Registered {
    pub(crate) id: ObserverId,
    pub(crate) observer: Arc<dyn Observer>,
}

/// Forwards chunks into an unbounded channel, e.g. for a websocket.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl Observer for ChannelObserver {
    fn write(&self, chunk: &str) {
        let _ = self.tx.send(chunk.to_string());
    }
}
