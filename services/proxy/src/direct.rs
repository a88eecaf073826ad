// Direct proxy (splice) support: the pending-frame queue used while the
// backend connection is being established, and the byte pump used once both
// sockets are live.
use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use egret_wire::{BrokerUrl, Frame};

use crate::stats::TopicStatsRegistry;

/// Streams the proxy can splice: plain TCP or TLS on either side.
pub trait ProxyStream: AsyncRead + AsyncWrite {}
impl<T: AsyncRead + AsyncWrite> ProxyStream for T {}

/// Boxed IO handed to the splice pump once framing is disabled.
pub type ProxyIo = Box<dyn ProxyStream + Unpin + Send>;

const SPLICE_BUF_INITIAL: usize = 1024;
const SPLICE_BUF_MAX: usize = 1024 * 1024;

#[derive(Debug, Error)]
#[error("pending frame queue full ({0} frames)")]
pub struct PendingQueueFull(pub usize);

/// Per-splice state owned by the connection: the chosen backend, the topic
/// the splice was established for, and frames buffered until the backend
/// handshake finishes.
pub struct DirectProxyHandler {
    pub target: BrokerUrl,
    pub topic: Option<String>,
    pending: VecDeque<Frame>,
    max_pending: usize,
    pub rate: Arc<SpliceRate>,
}

impl DirectProxyHandler {
    pub fn new(target: BrokerUrl, topic: Option<String>, max_pending: usize) -> Self {
        Self {
            target,
            topic,
            pending: VecDeque::new(),
            max_pending: max_pending.max(1),
            rate: Arc::new(SpliceRate::default()),
        }
    }

    /// Buffer a frame received while the backend is still connecting.
    /// Overflow is a hard failure: the caller closes the connection rather
    /// than dropping frames silently.
    pub fn push_pending(&mut self, frame: Frame) -> Result<(), PendingQueueFull> {
        if self.pending.len() >= self.max_pending {
            return Err(PendingQueueFull(self.max_pending));
        }
        self.pending.push_back(frame);
        Ok(())
    }

    /// Drain the queue exactly once, in arrival order.
    pub fn take_pending(&mut self) -> VecDeque<Frame> {
        std::mem::take(&mut self.pending)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Inbound request-rate sampler for one splice, calculated on the shared
/// 60 s stats schedule.
#[derive(Debug, Default)]
pub struct SpliceRate {
    bytes: AtomicU64,
    bytes_at_rollup: AtomicU64,
    rate_1m: AtomicU64,
}

impl SpliceRate {
    pub fn record(&self, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn calculate(&self) {
        let bytes = self.bytes.load(Ordering::Relaxed);
        let previous = self.bytes_at_rollup.swap(bytes, Ordering::Relaxed);
        self.rate_1m
            .store(bytes.saturating_sub(previous), Ordering::Relaxed);
    }

    pub fn rate_1m(&self) -> u64 {
        self.rate_1m.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }
}

/// Shared hooks the pump feeds as bytes move.
#[derive(Clone)]
pub struct SpliceContext {
    pub rate: Arc<SpliceRate>,
    pub topic_stats: Option<(Arc<TopicStatsRegistry>, String)>,
}

/// Forward opaque bytes both ways until both sides have finished.
///
/// Half-close: when one side sends FIN, the pump finishes writing what it
/// has and shuts down the peer's send half; the opposite direction keeps
/// running until it also reaches FIN or errors. Returns
/// `(client_to_broker, broker_to_client)` byte totals.
pub async fn splice(
    client: ProxyIo,
    broker: ProxyIo,
    ctx: SpliceContext,
) -> io::Result<(u64, u64)> {
    let (client_read, client_write) = tokio::io::split(client);
    let (broker_read, broker_write) = tokio::io::split(broker);

    let inbound_ctx = ctx.clone();
    let inbound = copy_direction(client_read, broker_write, move |n| {
        metrics::counter!("pulsar_proxy_binary_bytes").increment(n);
        inbound_ctx.rate.record(n);
        if let Some((stats, topic)) = &inbound_ctx.topic_stats {
            stats.record_bytes(topic, n);
        }
    });
    let outbound = copy_direction(broker_read, client_write, move |n| {
        metrics::counter!("pulsar_proxy_binary_bytes").increment(n);
    });

    // try_join keeps the surviving direction alive across a peer FIN but
    // tears the whole splice down on the first socket error.
    tokio::try_join!(inbound, outbound)
}

async fn copy_direction<R, W, F>(mut read: R, mut write: W, on_bytes: F) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(u64),
{
    // Adaptive buffer: starts small for chatty control traffic, grows while
    // reads keep filling it.
    let mut buf = vec![0u8; SPLICE_BUF_INITIAL];
    let mut total = 0u64;
    loop {
        let n = read.read(&mut buf).await?;
        if n == 0 {
            // Peer FIN. Everything read so far has been written, so the
            // send half can be closed immediately.
            write.shutdown().await?;
            return Ok(total);
        }
        write.write_all(&buf[..n]).await?;
        total += n as u64;
        on_bytes(n as u64);
        if n == buf.len() && buf.len() < SPLICE_BUF_MAX {
            let grown = (buf.len() * 2).min(SPLICE_BUF_MAX);
            buf.resize(grown, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn handler() -> DirectProxyHandler {
        DirectProxyHandler::new(BrokerUrl::new("broker-a", 6650, false), None, 2)
    }

    fn frame(tag: &'static [u8]) -> Frame {
        Frame::new(Bytes::from_static(tag), Bytes::new()).expect("frame")
    }

    #[test]
    fn pending_queue_preserves_order_and_drains_once() {
        let mut handler = handler();
        handler.push_pending(frame(b"a")).expect("push");
        handler.push_pending(frame(b"b")).expect("push");
        let drained = handler.take_pending();
        assert_eq!(
            drained.iter().map(|f| &f.command[..]).collect::<Vec<_>>(),
            vec![b"a".as_slice(), b"b".as_slice()]
        );
        assert_eq!(handler.pending_len(), 0);
        assert!(handler.take_pending().is_empty());
    }

    #[test]
    fn pending_queue_overflow_is_an_error() {
        let mut handler = handler();
        handler.push_pending(frame(b"a")).expect("push");
        handler.push_pending(frame(b"b")).expect("push");
        let err = handler.push_pending(frame(b"c")).expect_err("overflow");
        assert_eq!(err.0, 2);
    }

    #[test]
    fn splice_rate_tracks_deltas() {
        let rate = SpliceRate::default();
        rate.record(100);
        rate.calculate();
        assert_eq!(rate.rate_1m(), 100);
        rate.calculate();
        assert_eq!(rate.rate_1m(), 0);
        rate.record(40);
        rate.calculate();
        assert_eq!(rate.rate_1m(), 40);
        assert_eq!(rate.total(), 140);
    }

    #[tokio::test]
    async fn splice_forwards_bytes_both_ways_and_half_closes() {
        let (client_side, mut client_peer) = tokio::io::duplex(4096);
        let (broker_side, mut broker_peer) = tokio::io::duplex(4096);

        let ctx = SpliceContext {
            rate: Arc::new(SpliceRate::default()),
            topic_stats: None,
        };
        let rate = Arc::clone(&ctx.rate);
        let pump = tokio::spawn(splice(Box::new(client_side), Box::new(broker_side), ctx));

        client_peer.write_all(b"to-broker").await.expect("write");
        client_peer.shutdown().await.expect("fin");

        let mut seen = vec![0u8; 9];
        broker_peer.read_exact(&mut seen).await.expect("read");
        assert_eq!(&seen, b"to-broker");

        // The client FIN propagated; broker sees EOF next.
        let n = broker_peer.read(&mut [0u8; 8]).await.expect("eof");
        assert_eq!(n, 0);

        // The reverse direction is still alive after the client FIN.
        broker_peer.write_all(b"to-client").await.expect("write");
        broker_peer.shutdown().await.expect("fin");
        let mut seen = Vec::new();
        client_peer.read_to_end(&mut seen).await.expect("read");
        assert_eq!(&seen, b"to-client");

        let (inbound, outbound) = pump.await.expect("join").expect("splice");
        assert_eq!(inbound, 9);
        assert_eq!(outbound, 9);
        assert_eq!(rate.total(), 9);
    }

    #[tokio::test]
    async fn splice_attributes_inbound_bytes_to_topic() {
        let (client_side, mut client_peer) = tokio::io::duplex(4096);
        let (broker_side, mut broker_peer) = tokio::io::duplex(4096);
        let registry = Arc::new(TopicStatsRegistry::new(8));

        let ctx = SpliceContext {
            rate: Arc::new(SpliceRate::default()),
            topic_stats: Some((Arc::clone(&registry), "persistent://t/n/x".to_string())),
        };
        let pump = tokio::spawn(splice(Box::new(client_side), Box::new(broker_side), ctx));

        client_peer.write_all(b"12345").await.expect("write");
        client_peer.shutdown().await.expect("fin");
        let mut sink = Vec::new();
        broker_peer.read_to_end(&mut sink).await.expect("drain");
        broker_peer.shutdown().await.expect("fin");
        drop(broker_peer);
        drop(client_peer);
        let _ = pump.await.expect("join");

        let stats = registry.get("persistent://t/n/x").expect("stats");
        assert_eq!(stats.totals().0, 5);
    }
}
