//! Registry of the logical streams open on one transport

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{TransportError, TransportResult};

/// Stream identifier, unique within one transport
pub type StreamId = u64;

/// What a data channel is used for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    /// Liveness probes; not counted as an active connection
    Control,
    /// One proxied TCP connection
    Proxy,
}

impl StreamKind {
    pub fn from_label(label: &str) -> Self {
        if label == peerlink_proto::CONTROL_CHANNEL_LABEL {
            StreamKind::Control
        } else {
            StreamKind::Proxy
        }
    }
}

/// Delivery point for inbound data channel messages.
///
/// Taking the sender out closes the stream's read side: the reader drains
/// what was already queued, then observes end-of-stream.
#[derive(Debug, Clone, Default)]
pub struct InboundSlot(Arc<Mutex<Option<mpsc::Sender<Bytes>>>>);

impl InboundSlot {
    pub(crate) fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self(Arc::new(Mutex::new(Some(tx))))
    }

    pub(crate) fn sender(&self) -> Option<mpsc::Sender<Bytes>> {
        lock(&self.0).clone()
    }

    pub(crate) fn close(&self) {
        lock(&self.0).take();
    }
}

struct Entry {
    kind: StreamKind,
    label: String,
    inbound: InboundSlot,
}

/// Non-owning index of the streams multiplexed over one transport.
///
/// Streams register on open and release exactly once on close, whichever side
/// closes first. Closing the registry releases every remaining stream and
/// cancels the shared shutdown token.
pub struct StreamRegistry {
    next_id: AtomicU64,
    entries: Mutex<HashMap<StreamId, Entry>>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for StreamRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamRegistry")
            .field("streams", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a stream and allocate its identifier
    pub fn register(
        &self,
        kind: StreamKind,
        label: &str,
        inbound: InboundSlot,
    ) -> TransportResult<StreamId> {
        let mut entries = lock(&self.entries);

        // Checked under the lock so close_all cannot miss this entry
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.insert(
            id,
            Entry {
                kind,
                label: label.to_string(),
                inbound,
            },
        );

        trace!(stream_id = id, label, "Stream registered");
        Ok(id)
    }

    /// Remove a stream and close its read side.
    ///
    /// Returns `true` only for the call that actually removed it.
    pub fn release(&self, id: StreamId) -> bool {
        let entry = lock(&self.entries).remove(&id);

        match entry {
            Some(entry) => {
                entry.inbound.close();
                debug!(stream_id = id, label = %entry.label, kind = ?entry.kind, "Stream released");
                true
            }
            None => false,
        }
    }

    /// Streams of kind [`StreamKind::Proxy`] that have not been released
    pub fn active_streams(&self) -> usize {
        lock(&self.entries)
            .values()
            .filter(|e| e.kind == StreamKind::Proxy)
            .count()
    }

    pub fn contains(&self, id: StreamId) -> bool {
        lock(&self.entries).contains_key(&id)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Release every stream and refuse new ones. Idempotent.
    pub fn close_all(&self) {
        let drained: Vec<(StreamId, Entry)> = {
            let mut entries = lock(&self.entries);
            if self.closed.swap(true, Ordering::SeqCst) {
                return;
            }
            entries.drain().collect()
        };

        debug!(streams = drained.len(), "Closing all streams");
        for (_, entry) in drained {
            entry.inbound.close();
        }
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Token cancelled once the registry is closed
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// Registry state stays consistent across a panicking holder, so poisoning is ignored
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> (InboundSlot, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(4);
        (InboundSlot::new(tx), rx)
    }

    #[test]
    fn test_register_allocates_unique_ids() {
        let registry = StreamRegistry::new();
        let a = registry.register(StreamKind::Proxy, "proxy", slot().0).unwrap();
        let b = registry.register(StreamKind::Proxy, "proxy", slot().0).unwrap();

        assert_ne!(a, b);
        assert_eq!(registry.active_streams(), 2);
    }

    #[test]
    fn test_control_is_not_counted() {
        let registry = StreamRegistry::new();
        registry.register(StreamKind::Control, "control", slot().0).unwrap();
        registry.register(StreamKind::Proxy, "proxy", slot().0).unwrap();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.active_streams(), 1);
    }

    #[test]
    fn test_release_exactly_once() {
        let registry = StreamRegistry::new();
        let id = registry.register(StreamKind::Proxy, "proxy", slot().0).unwrap();

        assert!(registry.release(id));
        assert!(!registry.release(id));
        assert_eq!(registry.active_streams(), 0);
    }

    #[test]
    fn test_n_minus_m() {
        let registry = StreamRegistry::new();
        let ids: Vec<_> = (0..5)
            .map(|_| registry.register(StreamKind::Proxy, "proxy", slot().0).unwrap())
            .collect();

        for id in &ids[..3] {
            registry.release(*id);
        }
        assert_eq!(registry.active_streams(), 2);
    }

    #[tokio::test]
    async fn test_release_closes_read_side() {
        let registry = StreamRegistry::new();
        let (inbound, mut rx) = slot();
        let id = registry
            .register(StreamKind::Proxy, "proxy", inbound.clone())
            .unwrap();

        let tx = inbound.sender().unwrap();
        tx.send(Bytes::from_static(b"queued")).await.unwrap();
        drop(tx);

        registry.release(id);
        assert!(inbound.sender().is_none());
        assert_eq!(rx.recv().await, Some(Bytes::from_static(b"queued")));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = StreamRegistry::new();
        let token = registry.shutdown_token();
        let (inbound, mut rx) = slot();
        registry.register(StreamKind::Proxy, "proxy", inbound).unwrap();

        registry.close_all();
        registry.close_all();

        assert!(token.is_cancelled());
        assert_eq!(registry.active_streams(), 0);
        assert_eq!(rx.recv().await, None);
        assert!(matches!(
            registry.register(StreamKind::Proxy, "proxy", slot().0),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn test_kind_from_label() {
        assert_eq!(StreamKind::from_label("control"), StreamKind::Control);
        assert_eq!(StreamKind::from_label("proxy"), StreamKind::Proxy);
    }
}
