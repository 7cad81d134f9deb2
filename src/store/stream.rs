//! Channel-backed record streams.
//!
//! Every store call spawns exactly one producer task and hands back a
//! [`RecordStream`]. The producer pushes decoded records into a bounded channel,
//! so slow consumers apply backpressure instead of growing memory. Dropping the
//! stream closes the channel, which stops the producer and releases whatever
//! cursor or connection it held.
//!
//! ```text
//!   producer task ──mpsc(capacity)──▶ RecordStream ──▶ consumer
//!        │                                 ▲
//!        └──────── oneshot(StreamSummary) ─┘
//! ```
//!
//! A failure before the producer calls [`Emitter::started`] is returned to the
//! caller of [`spawn_producer`]. Later failures end the stream early and are
//! reported in the [`StreamSummary`].

use crate::error::StoreError;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};

/// End-of-sequence record for one stream.
#[derive(Debug, Default)]
pub struct StreamSummary {
    /// Records handed to the channel
    pub emitted: usize,
    /// Rows dropped because they failed to decode
    pub skipped: usize,
    /// Iteration error that ended production early
    pub error: Option<StoreError>,
    /// The consumer went away before the producer finished
    pub consumer_closed: bool,
}

impl StreamSummary {
    pub fn is_clean(&self) -> bool {
        self.error.is_none() && self.skipped == 0
    }
}

/// Single-pass, receive-only sequence of records produced in the background.
pub struct RecordStream<T> {
    label: String,
    rx: mpsc::Receiver<T>,
    summary: oneshot::Receiver<StreamSummary>,
}

impl<T> RecordStream<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Next record, or `None` once the producer has finished.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Stop consuming and wait for the producer's summary.
    ///
    /// Unread records are discarded. Safe to call before the stream is exhausted.
    pub async fn finish(self) -> StreamSummary {
        let RecordStream {
            label,
            mut rx,
            summary,
        } = self;
        rx.close();
        drop(rx);

        match summary.await {
            Ok(summary) => summary,
            Err(_) => {
                log::warn!("{}: producer exited without a summary", label);
                StreamSummary {
                    consumer_closed: true,
                    ..Default::default()
                }
            }
        }
    }

    /// Drain every record, then return them with the summary.
    pub async fn collect_all(mut self) -> (Vec<T>, StreamSummary) {
        let mut items = Vec::new();
        while let Some(item) = self.rx.recv().await {
            items.push(item);
        }
        let summary = self.finish().await;
        (items, summary)
    }
}

impl<T> Stream for RecordStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}

/// Producer side of a [`RecordStream`].
pub struct Emitter<T> {
    label: String,
    tx: mpsc::Sender<T>,
    ready: Option<oneshot::Sender<Result<(), StoreError>>>,
    emitted: usize,
    skipped: usize,
}

impl<T> Emitter<T> {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Mark the initial query as issued. Errors after this point no longer fail
    /// the call that created the stream.
    pub fn started(&mut self) {
        if let Some(ready) = self.ready.take() {
            let _ = ready.send(Ok(()));
        }
    }

    /// Hand one record to the consumer. Returns `false` once the consumer is gone.
    pub async fn emit(&mut self, item: T) -> bool {
        self.started();
        if self.tx.send(item).await.is_err() {
            return false;
        }
        self.emitted += 1;
        true
    }

    /// Record a row that failed to decode. The stream keeps going.
    pub fn skip(&mut self, err: &StoreError) {
        self.skipped += 1;
        log::warn!("{}: skipping row: {}", self.label, err);
    }

    /// Resolves when the consumer has dropped or finished the stream.
    pub async fn closed(&self) {
        self.tx.closed().await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn `produce` as the single background producer of a new stream.
///
/// Waits only until the producer either calls [`Emitter::started`] (or emits its
/// first record), finishes, or fails. A failure before that point is returned
/// here instead of a stream.
pub async fn spawn_producer<T, F, Fut>(
    label: impl Into<String>,
    capacity: usize,
    produce: F,
) -> Result<RecordStream<T>, StoreError>
where
    T: Send + 'static,
    F: FnOnce(Emitter<T>) -> Fut + Send + 'static,
    Fut: Future<Output = (Emitter<T>, Result<(), StoreError>)> + Send + 'static,
{
    let label = label.into();
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let (ready_tx, ready_rx) = oneshot::channel();
    let (summary_tx, summary_rx) = oneshot::channel();

    let emitter = Emitter {
        label: label.clone(),
        tx,
        ready: Some(ready_tx),
        emitted: 0,
        skipped: 0,
    };

    let task_label = label.clone();
    tokio::spawn(async move {
        log::debug!("{}: producer started", task_label);
        let (mut emitter, result) = produce(emitter).await;

        let mut summary = StreamSummary {
            emitted: emitter.emitted,
            skipped: emitter.skipped,
            error: None,
            consumer_closed: emitter.is_closed(),
        };

        match (emitter.ready.take(), result) {
            (Some(ready), Err(err)) => {
                // Nothing was handed out yet: fail the call instead of the stream.
                let _ = ready.send(Err(err));
            }
            (None, Err(err)) => {
                log::warn!(
                    "{}: stream ended early after {} records: {}",
                    task_label,
                    summary.emitted,
                    err
                );
                summary.error = Some(err);
            }
            (ready, Ok(())) => {
                if let Some(ready) = ready {
                    let _ = ready.send(Ok(()));
                }
                log::debug!(
                    "{}: producer finished ({} emitted, {} skipped)",
                    task_label,
                    summary.emitted,
                    summary.skipped
                );
            }
        }

        // Closes the channel for the consumer before the summary is published.
        drop(emitter);
        let _ = summary_tx.send(summary);
    });

    match ready_rx.await {
        Ok(Err(err)) => Err(err),
        // A producer that panicked before signalling still yields a stream; it
        // ends immediately and `finish` reports the missing summary.
        Ok(Ok(())) | Err(_) => Ok(RecordStream {
            label,
            rx,
            summary: summary_rx,
        }),
    }
}
