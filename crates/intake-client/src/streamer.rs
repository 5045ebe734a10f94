//! The delta streamer: drains the store's change feed into a long-lived
//! client-streaming upload, re-enqueueing on failure for at-least-once
//! delivery. The upstream deduplicates on provider id, operation, and the
//! monotonic update time.

use crate::Client;
use proto_intake::{Delta, DeltaRequest, Event, EventType, Operation};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use work_queue::RateLimitingQueue;

/// Counters of streamer activity, for the metrics endpoint.
#[derive(Clone)]
pub struct Metrics {
    pub deltas_sent: prometheus::IntCounter,
    pub deltas_retried: prometheus::IntCounter,
    pub streams_opened: prometheus::IntCounter,
    pub streams_rotated: prometheus::IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            deltas_sent: prometheus::IntCounter::new(
                "intake_deltas_sent_total",
                "Deltas successfully written to the intake stream",
            )
            .expect("metric options are valid"),
            deltas_retried: prometheus::IntCounter::new(
                "intake_deltas_retried_total",
                "Deltas re-enqueued after a stream failure",
            )
            .expect("metric options are valid"),
            streams_opened: prometheus::IntCounter::new(
                "intake_streams_opened_total",
                "Intake streams opened",
            )
            .expect("metric options are valid"),
            streams_rotated: prometheus::IntCounter::new(
                "intake_streams_rotated_total",
                "Intake streams proactively rotated at max age",
            )
            .expect("metric options are valid"),
        }
    }

    pub fn register(&self, registry: &prometheus::Registry) -> prometheus::Result<()> {
        for collector in [
            &self.deltas_sent,
            &self.deltas_retried,
            &self.streams_opened,
            &self.streams_rotated,
        ] {
            registry.register(Box::new(collector.clone()))?;
        }
        Ok(())
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Streams store events to the intake service.
///
/// Two cooperating tasks: a producer translating events into deltas and
/// rate-limited queue entries, and a sender owning a lazily-established
/// upload stream which it rotates at `max_stream_age` and re-establishes
/// (with backoff) after failures.
pub struct DeltaStreamer {
    client: Client,
    queue: RateLimitingQueue<Delta>,
    max_stream_age: Duration,
    metrics: Metrics,
    stream: Option<ActiveStream>,
}

impl DeltaStreamer {
    pub fn new(client: Client, max_stream_age: Duration, metrics: Metrics) -> Self {
        Self {
            client,
            queue: RateLimitingQueue::new(),
            max_stream_age,
            metrics,
            stream: None,
        }
    }

    /// Run until `cancel` fires and the queue has drained.
    pub async fn run(mut self, events: mpsc::Receiver<Event>, cancel: CancellationToken) {
        let queue = self.queue.clone();
        let producer = produce(queue, events, cancel.clone());
        let sender = async move {
            self.send_loop(cancel).await;
        };
        let ((), ()) = tokio::join!(producer, sender);
    }

    async fn send_loop(&mut self, cancel: CancellationToken) {
        while let Some(delta) = self.queue.get().await {
            // Proactively rotate a stream that has reached its max age;
            // the send below re-establishes one.
            if let Some(stream) = self.stream.take() {
                if stream.opened_at.elapsed() >= self.max_stream_age {
                    tracing::debug!(age = ?stream.opened_at.elapsed(), "rotating intake stream");
                    self.metrics.streams_rotated.inc();
                    log_stream_result(close_and_recv(stream).await);
                } else {
                    self.stream = Some(stream);
                }
            }

            if !self.ensure_stream(&cancel).await {
                // Cancelled while opening. Hand the delta back (a no-op
                // once the queue drains) and keep consuming so the drain
                // can finish.
                self.queue.add_rate_limited(delta.clone());
                self.queue.done(&delta);
                continue;
            }

            let request = DeltaRequest {
                deltas: vec![(*delta).clone()],
            };
            let sent = match self.stream.as_ref() {
                Some(stream) => {
                    stream.tx.send(request).await.is_ok() && !stream.response.is_finished()
                }
                None => false,
            };
            if sent {
                self.metrics.deltas_sent.inc();
                self.queue.forget(&delta);
                self.queue.done(&delta);
                continue;
            }

            // The stream broke under us. Drain it, classify its status,
            // and re-enqueue the delta for the next stream.
            if let Some(stream) = self.stream.take() {
                log_stream_result(close_and_recv(stream).await);
            }
            self.metrics.deltas_retried.inc();
            self.queue.add_rate_limited(delta.clone());
            self.queue.done(&delta);
        }

        // Queue has shut down and drained; flush the active stream.
        if let Some(stream) = self.stream.take() {
            log_stream_result(close_and_recv(stream).await);
        }
    }

    // Open the upload stream if there is none. Retries with backoff until
    // it succeeds; returns false if cancelled first.
    async fn ensure_stream(&mut self, cancel: &CancellationToken) -> bool {
        let mut attempt = 0;
        while self.stream.is_none() {
            match ActiveStream::open(&self.client).await {
                Ok(stream) => {
                    self.metrics.streams_opened.inc();
                    self.stream = Some(stream);
                }
                Err(error) => {
                    tracing::warn!(%error, attempt, "failed to open intake stream");
                    tokio::select! {
                        () = cancel.cancelled() => return false,
                        () = tokio::time::sleep(crate::backoff(attempt)) => {}
                    }
                    attempt += 1;
                }
            }
        }
        true
    }
}

struct ActiveStream {
    tx: mpsc::Sender<DeltaRequest>,
    response: tokio::task::JoinHandle<Result<tonic::Response<proto_intake::DeltaResponse>, tonic::Status>>,
    opened_at: tokio::time::Instant,
}

impl ActiveStream {
    async fn open(client: &Client) -> Result<ActiveStream, tonic::transport::Error> {
        // Wait for transport readiness so that connection failures surface
        // here, where the caller retries, rather than inside the RPC.
        let mut channel = client.channel.clone();
        futures::future::poll_fn(|cx| {
            <tonic::transport::Channel as tonic::client::GrpcService<tonic::body::BoxBody>>::poll_ready(
                &mut channel, cx,
            )
        })
        .await?;

        let (tx, rx) = mpsc::channel(1);
        let mut grpc = client.grpc.clone();
        let response = tokio::spawn(async move { grpc.delta(ReceiverStream::new(rx)).await });
        Ok(ActiveStream {
            tx,
            response,
            opened_at: tokio::time::Instant::now(),
        })
    }
}

// Half-close the upload and receive the server's closing status.
async fn close_and_recv(stream: ActiveStream) -> Result<(), tonic::Status> {
    drop(stream.tx);
    match stream.response.await {
        Ok(Ok(_response)) => Ok(()),
        Ok(Err(status)) => Err(status),
        Err(join_error) => Err(tonic::Status::unknown(format!(
            "stream task failed: {join_error}"
        ))),
    }
}

fn log_stream_result(result: Result<(), tonic::Status>) {
    match result {
        Ok(()) => tracing::debug!("intake stream closed cleanly"),
        // Server-initiated rotation is routine, not an error.
        Err(status) if is_max_age_rotation(&status) => {
            tracing::debug!(message = status.message(), "intake stream rotated by server")
        }
        Err(status) => tracing::warn!(%status, "intake stream failed"),
    }
}

fn is_max_age_rotation(status: &tonic::Status) -> bool {
    status.code() == tonic::Code::Unavailable && status.message().contains("max_age")
}

// Translate feed events into queued deltas until the feed ends or the
// streamer is cancelled, then drain the queue.
async fn produce(
    queue: RateLimitingQueue<Delta>,
    mut events: mpsc::Receiver<Event>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(delta) = delta_of(event) else {
            continue;
        };
        queue.add_rate_limited(Arc::new(delta));
    }
    queue.shut_down_with_drain().await;
}

fn delta_of(event: Event) -> Option<Delta> {
    let op = match event.r#type() {
        EventType::Add => Operation::Create,
        EventType::Update => Operation::Update,
        EventType::Delete => Operation::Delete,
        EventType::InvalidEventType => {
            tracing::error!(?event, "dropping event of invalid type");
            return None;
        }
    };
    Some(Delta {
        op: op as i32,
        objects: event.objects,
    })
}
