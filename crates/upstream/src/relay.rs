//! Chunk-by-chunk relay of a streamed upstream response
//!
//! `relay` pulls one chunk from the upstream, writes it to the sink, and only
//! then pulls the next, so a slow client slows the upstream read instead of
//! growing a buffer. A client that goes away stops the upstream read at once,
//! including while a read is pending.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::outcome::{ChunkItem, UpstreamFailure};

/// The far end of the sink is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("client disconnected")]
pub struct SinkClosed;

/// Destination of relayed chunks (usually the client response body).
pub trait ChunkSink: Send {
    /// Deliver one chunk. Waits while the sink is full.
    fn write(&mut self, chunk: Bytes) -> impl Future<Output = Result<(), SinkClosed>> + Send;

    /// Whether the far end has gone away.
    fn is_closed(&self) -> bool;

    /// Resolves once the far end has gone away.
    fn closed(&self) -> impl Future<Output = ()> + Send;

    /// Finish the response normally.
    fn close(self) -> impl Future<Output = ()> + Send
    where
        Self: Sized;

    /// Terminate the response abnormally. The client sees a cut connection,
    /// not an error frame.
    fn abort(self, failure: &UpstreamFailure) -> impl Future<Output = ()> + Send
    where
        Self: Sized;
}

/// How a relay ended. `chunks` counts the chunks delivered to the sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnd {
    Completed { chunks: usize },
    UpstreamFailed { failure: UpstreamFailure, chunks: usize },
    ClientGone { chunks: usize },
}

/// Drain `chunks` into `sink` until the upstream ends, fails, or the client
/// goes away.
pub async fn relay<St, S>(mut chunks: St, mut sink: S) -> RelayEnd
where
    St: Stream<Item = ChunkItem> + Unpin,
    S: ChunkSink,
{
    let mut written = 0usize;
    loop {
        if sink.is_closed() {
            info!(chunks = written, "client went away, stopping relay");
            return RelayEnd::ClientGone { chunks: written };
        }

        let next = tokio::select! {
            biased;
            () = sink.closed() => {
                info!(chunks = written, "client went away during upstream read");
                return RelayEnd::ClientGone { chunks: written };
            }
            next = chunks.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                if chunk.is_empty() {
                    continue;
                }
                if sink.write(chunk).await.is_err() {
                    info!(chunks = written, "client went away during write");
                    return RelayEnd::ClientGone { chunks: written };
                }
                written += 1;
            }
            Some(Err(failure)) => {
                warn!(chunks = written, error = %failure, "upstream stream failed, aborting response");
                sink.abort(&failure).await;
                return RelayEnd::UpstreamFailed {
                    failure,
                    chunks: written,
                };
            }
            None => {
                debug!(chunks = written, "upstream stream complete");
                sink.close().await;
                return RelayEnd::Completed { chunks: written };
            }
        }
    }
}

/// Bounded channel sink; the paired `ChunkReceiver` becomes the response body.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

/// Receiving half of a `ChannelSink`. Dropping it closes the sink.
#[derive(Debug)]
pub struct ChunkReceiver {
    rx: mpsc::Receiver<io::Result<Bytes>>,
}

impl ChannelSink {
    /// Create a sink holding at most `capacity` undelivered chunks.
    pub fn channel(capacity: usize) -> (ChannelSink, ChunkReceiver) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (ChannelSink { tx }, ChunkReceiver { rx })
    }
}

impl ChunkSink for ChannelSink {
    async fn write(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        self.tx.send(Ok(chunk)).await.map_err(|_| SinkClosed)
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    async fn closed(&self) {
        self.tx.closed().await
    }

    async fn close(self) {
        drop(self.tx);
    }

    async fn abort(self, failure: &UpstreamFailure) {
        let _ = self
            .tx
            .send(Err(io::Error::other(failure.to_string())))
            .await;
    }
}

impl Stream for ChunkReceiver {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::FailureKind;
    use futures_util::stream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Default)]
    struct Recorded {
        chunks: Vec<Bytes>,
        closed: bool,
        aborted: Option<UpstreamFailure>,
    }

    /// In-memory sink that can pretend the client left after N writes.
    struct RecordingSink {
        state: Arc<Mutex<Recorded>>,
        gone_after: Option<usize>,
    }

    impl RecordingSink {
        fn new(gone_after: Option<usize>) -> (Self, Arc<Mutex<Recorded>>) {
            let state = Arc::new(Mutex::new(Recorded::default()));
            (
                Self {
                    state: Arc::clone(&state),
                    gone_after,
                },
                state,
            )
        }
    }

    impl ChunkSink for RecordingSink {
        async fn write(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
            if self.is_closed() {
                return Err(SinkClosed);
            }
            self.state.lock().unwrap().chunks.push(chunk);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.gone_after
                .is_some_and(|n| self.state.lock().unwrap().chunks.len() >= n)
        }

        async fn closed(&self) {
            if !self.is_closed() {
                std::future::pending::<()>().await;
            }
        }

        async fn close(self) {
            self.state.lock().unwrap().closed = true;
        }

        async fn abort(self, failure: &UpstreamFailure) {
            self.state.lock().unwrap().aborted = Some(failure.clone());
        }
    }

    fn ok(chunk: &'static str) -> ChunkItem {
        Ok(Bytes::from_static(chunk.as_bytes()))
    }

    #[tokio::test]
    async fn relays_chunks_in_order_then_closes() {
        let (sink, state) = RecordingSink::new(None);
        let end = relay(stream::iter(vec![ok("a"), ok("b"), ok("c")]), sink).await;

        assert_eq!(end, RelayEnd::Completed { chunks: 3 });
        let state = state.lock().unwrap();
        assert_eq!(state.chunks, vec!["a", "b", "c"]);
        assert!(state.closed);
        assert!(state.aborted.is_none());
    }

    #[tokio::test]
    async fn client_gone_after_first_chunk_stops_upstream_reads() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulls);
        let upstream = stream::iter(vec![ok("a"), ok("b"), ok("c")]).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let (sink, state) = RecordingSink::new(Some(1));
        let end = relay(upstream, sink).await;

        assert_eq!(end, RelayEnd::ClientGone { chunks: 1 });
        assert_eq!(pulls.load(Ordering::SeqCst), 1, "no second upstream read");
        let state = state.lock().unwrap();
        assert_eq!(state.chunks, vec!["a"]);
        assert!(!state.closed);
    }

    #[tokio::test]
    async fn mid_stream_failure_aborts_without_close() {
        let failure = UpstreamFailure::new(500, "connection reset", FailureKind::Transport);
        let (sink, state) = RecordingSink::new(None);
        let end = relay(
            stream::iter(vec![ok("a"), Err(failure.clone()), ok("never")]),
            sink,
        )
        .await;

        assert_eq!(
            end,
            RelayEnd::UpstreamFailed {
                failure: failure.clone(),
                chunks: 1
            }
        );
        let state = state.lock().unwrap();
        assert_eq!(state.chunks, vec!["a"]);
        assert!(!state.closed);
        assert_eq!(state.aborted.as_ref(), Some(&failure));
    }

    #[tokio::test]
    async fn empty_chunks_are_skipped() {
        let (sink, state) = RecordingSink::new(None);
        let end = relay(stream::iter(vec![ok(""), ok("a"), ok("")]), sink).await;
        assert_eq!(end, RelayEnd::Completed { chunks: 1 });
        assert_eq!(state.lock().unwrap().chunks, vec!["a"]);
    }

    #[tokio::test]
    async fn channel_sink_delivers_then_ends() {
        let (sink, mut receiver) = ChannelSink::channel(1);
        let task = tokio::spawn(relay(stream::iter(vec![ok("a"), ok("b")]), sink));

        assert_eq!(receiver.next().await.unwrap().unwrap(), "a");
        assert_eq!(receiver.next().await.unwrap().unwrap(), "b");
        assert!(receiver.next().await.is_none());
        assert_eq!(task.await.unwrap(), RelayEnd::Completed { chunks: 2 });
    }

    #[tokio::test]
    async fn channel_sink_abort_surfaces_as_body_error() {
        let failure = UpstreamFailure::new(502, "upstream reset", FailureKind::Transport);
        let (sink, mut receiver) = ChannelSink::channel(4);
        let end = relay(stream::iter(vec![ok("a"), Err(failure)]), sink).await;
        assert!(matches!(end, RelayEnd::UpstreamFailed { chunks: 1, .. }));

        assert_eq!(receiver.next().await.unwrap().unwrap(), "a");
        let err = receiver.next().await.unwrap().unwrap_err();
        assert!(err.to_string().contains("upstream reset"));
        assert!(receiver.next().await.is_none());
    }

    #[tokio::test]
    async fn dropped_receiver_interrupts_pending_upstream_read() {
        let (sink, mut receiver) = ChannelSink::channel(1);
        let upstream = stream::iter(vec![ok("a")]).chain(stream::pending());
        let task = tokio::spawn(relay(upstream, sink));

        assert_eq!(receiver.next().await.unwrap().unwrap(), "a");
        drop(receiver);

        let end = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("relay should notice the client leaving")
            .unwrap();
        assert_eq!(end, RelayEnd::ClientGone { chunks: 1 });
    }
}
