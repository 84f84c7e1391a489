use std::sync::{Arc, Mutex};

use common_kafka::{Claim, ClaimFuture, ClaimHandler, ConsumerGroup, GroupError, KafkaGroup, OffsetMarker};
use common_types::{decoder_by_name, DecodeError, EventDecoder};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::ack::Ack;
use crate::config::Config;
use crate::error::{ConsumerError, SinkError};
use crate::marshal::{marshaler_by_name, Marshaler};
use crate::metrics_consts::{BROKER_ERRORS, DECODE_ERRORS, MESSAGES_CONSUMED};
use crate::sink::{BufferedSink, SinkMessage, SinkOptions, SinkReceivers};
use crate::target::{target_by_name, SinkWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Running,
    Closing,
    Closed,
}

/// Reads claimed partitions into a [`BufferedSink`] and marks what the sink has
/// flushed.
///
/// Cloning gives another handle to the same consumer, so one task can run
/// [`Consumer::start`] while another calls [`Consumer::close`].
pub struct Consumer<G: ConsumerGroup + 'static> {
    inner: Arc<Inner<G>>,
}

impl<G: ConsumerGroup + 'static> Clone for Consumer<G> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<G> {
    group: G,
    topics: Vec<String>,
    decoder: Arc<dyn EventDecoder>,
    sink: BufferedSink,
    receivers: Mutex<Option<SinkReceivers>>,
    shutdown: CancellationToken,
    handlers: TaskTracker,
    coordinator: Mutex<Option<JoinHandle<()>>>,
    // Set when the sink stops on its own
    failure: Mutex<Option<SinkError>>,
    state: watch::Sender<ConsumerState>,
}

impl Consumer<KafkaGroup> {
    /// Build the Kafka backed consumer described by `config`.
    pub fn from_config(config: &Config) -> Result<Self, ConsumerError> {
        let decoder = decoder_by_name(&config.event_decoder)?;
        let marshaler =
            marshaler_by_name(&config.sink.sink_marshaler, &config.sink.sink_marshaler_args)?;
        let writer = target_by_name(&config.sink.sink_target, &config.sink.sink_target_args)?;
        let group = KafkaGroup::new(&config.kafka, &config.consumer)?;

        Ok(Self::new(
            group,
            config.consumer.topics().to_vec(),
            decoder,
            writer,
            marshaler,
            config.sink.options(),
        ))
    }
}

impl<G: ConsumerGroup + 'static> Consumer<G> {
    /// Create the consumer and start its sink. Must be called within a tokio runtime.
    pub fn new(
        group: G,
        topics: Vec<String>,
        decoder: Box<dyn EventDecoder>,
        writer: SinkWriter,
        marshaler: Box<dyn Marshaler>,
        options: SinkOptions,
    ) -> Self {
        let (sink, receivers) = BufferedSink::spawn(writer, marshaler, options);
        let (state, _) = watch::channel(ConsumerState::Created);

        Self {
            inner: Arc::new(Inner {
                group,
                topics,
                decoder: Arc::from(decoder),
                sink,
                receivers: Mutex::new(Some(receivers)),
                shutdown: CancellationToken::new(),
                handlers: TaskTracker::new(),
                coordinator: Mutex::new(None),
                failure: Mutex::new(None),
                state,
            }),
        }
    }

    pub fn state(&self) -> ConsumerState {
        *self.inner.state.borrow()
    }

    pub fn group(&self) -> &G {
        &self.inner.group
    }

    /// Consume until the consumer is closed.
    ///
    /// Returns once the consumer reached [`ConsumerState::Closed`]. A consumer
    /// group error or a sink failure closes the consumer and is returned.
    pub async fn start(&self) -> Result<(), ConsumerError> {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == ConsumerState::Created {
                *state = ConsumerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(ConsumerError::AlreadyStarted);
        }

        let receivers = self
            .inner
            .receivers
            .lock()
            .ok()
            .and_then(|mut receivers| receivers.take())
            .ok_or(ConsumerError::AlreadyStarted)?;
        let broker_errors = self.inner.group.take_errors();
        let coordinator = tokio::spawn(self.inner.clone().coordinate(receivers, broker_errors));
        if let Ok(mut handle) = self.inner.coordinator.lock() {
            *handle = Some(coordinator);
        }

        info!(topics = ?self.inner.topics, "Consumer started");

        let handler: Arc<dyn ClaimHandler> = Arc::new(ClaimWorker {
            decoder: self.inner.decoder.clone(),
            input: self.inner.sink.input(),
            shutdown: self.inner.shutdown.clone(),
            tracker: self.inner.handlers.clone(),
        });

        let mut result: Result<(), ConsumerError> = Ok(());
        while !self.inner.shutdown.is_cancelled() {
            // Returns on every rebalance, the next session picks up the new assignment
            if let Err(e) = self
                .inner
                .group
                .consume(&self.inner.topics, handler.clone(), self.inner.shutdown.clone())
                .await
            {
                error!(error = %e, "Consumer group failed");
                result = Err(e.into());
                break;
            }
        }

        if result.is_err() {
            self.inner.close().await?;
        }
        self.inner.wait_closed().await;

        let failure = self.inner.failure.lock().ok().and_then(|mut f| f.take());
        match failure {
            Some(e) if result.is_ok() => Err(e.into()),
            _ => result,
        }
    }

    /// Flush the sink, stop the claim handlers and leave the group.
    ///
    /// Concurrent and repeated calls wait for the first close to finish.
    pub async fn close(&self) -> Result<(), ConsumerError> {
        self.inner.close().await
    }
}

impl<G: ConsumerGroup + 'static> Inner<G> {
    async fn close(&self) -> Result<(), ConsumerError> {
        let first = self.state.send_if_modified(|state| match state {
            ConsumerState::Created | ConsumerState::Running => {
                *state = ConsumerState::Closing;
                true
            }
            ConsumerState::Closing | ConsumerState::Closed => false,
        });
        if !first {
            self.wait_closed().await;
            return Ok(());
        }

        info!("Closing consumer");

        // The sink goes first: its last ack must still reach the coordinator
        self.sink.close().await;
        self.shutdown.cancel();

        self.handlers.close();
        self.handlers.wait().await;

        let coordinator = self.coordinator.lock().ok().and_then(|mut c| c.take());
        if let Some(coordinator) = coordinator {
            if let Err(e) = coordinator.await {
                error!(error = ?e, "Ack coordinator failed");
            }
        }

        let result = self.group.close().await.map_err(ConsumerError::from);
        if let Err(e) = &result {
            error!(error = %e, "Failed to close consumer group");
        }

        self.state.send_replace(ConsumerState::Closed);
        info!("Consumer closed");
        result
    }

    async fn wait_closed(&self) {
        let mut state = self.state.subscribe();
        if state
            .wait_for(|state| *state == ConsumerState::Closed)
            .await
            .is_err()
        {
            debug!("Consumer state dropped");
        }
    }

    async fn coordinate(
        self: Arc<Self>,
        mut receivers: SinkReceivers,
        broker_errors: Option<mpsc::UnboundedReceiver<GroupError>>,
    ) {
        let (mut broker_errors, mut broker_errors_open) = match broker_errors {
            Some(errors) => (errors, true),
            None => (mpsc::unbounded_channel().1, false),
        };
        let mut acks_open = true;
        let mut sink_errors_open = true;

        loop {
            tokio::select! {
                biased;

                ack = receivers.acks.recv(), if acks_open => match ack {
                    Some(ack) => mark(ack),
                    None => acks_open = false,
                },

                sink_error = receivers.errors.recv(), if sink_errors_open => match sink_error {
                    Some(e) => {
                        error!(error = %e, "Sink failed, closing consumer");
                        if let Ok(mut failure) = self.failure.lock() {
                            *failure = Some(e);
                        }
                        let inner = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = inner.close().await {
                                error!(error = %e, "Failed to close consumer");
                            }
                        });
                        break;
                    }
                    None => sink_errors_open = false,
                },

                broker_error = broker_errors.recv(), if broker_errors_open => match broker_error {
                    Some(e) => {
                        metrics::counter!(BROKER_ERRORS).increment(1);
                        warn!(error = %e, "Consumer group error");
                    }
                    None => broker_errors_open = false,
                },

                _ = self.shutdown.cancelled() => break,
            }
        }

        // The final flush of a close may still be waiting in the channel
        while let Ok(ack) = receivers.acks.try_recv() {
            mark(ack);
        }
        debug!("Ack coordinator stopped");
    }
}

fn mark(ack: Ack) {
    let (topic, partition, offset) = (ack.topic().to_string(), ack.partition(), ack.offset());
    if let Err(e) = ack.mark() {
        error!(topic = %topic, partition, offset, error = %e, "Failed to mark flushed offsets");
    }
}

/// Decodes the messages of a claim and feeds them to the sink.
struct ClaimWorker {
    decoder: Arc<dyn EventDecoder>,
    input: mpsc::Sender<SinkMessage>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl ClaimHandler for ClaimWorker {
    fn consume_claim(
        self: Arc<Self>,
        session: Arc<dyn OffsetMarker>,
        claim: Claim,
    ) -> ClaimFuture {
        // Held from dispatch, so closing waits even for claims not yet polled
        let tracked = self.tracker.token();
        Box::pin(async move {
            self.run(session, claim).await;
            drop(tracked);
        })
    }
}

impl ClaimWorker {
    async fn run(&self, session: Arc<dyn OffsetMarker>, mut claim: Claim) {
        info!(
            topic = %claim.topic,
            partition = claim.partition,
            "Consuming partition claim"
        );

        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = claim.messages.recv() => message,
            };
            let Some(message) = message else {
                break;
            };
            metrics::counter!(MESSAGES_CONSUMED).increment(1);

            let decoded = match message.payload.as_deref() {
                Some(payload) => self.decoder.decode(payload),
                None => Err(DecodeError::Empty),
            };
            let event = match decoded {
                Ok(event) => event,
                Err(e) => {
                    metrics::counter!(DECODE_ERRORS).increment(1);
                    warn!(
                        topic = %message.topic,
                        partition = message.partition,
                        offset = message.offset,
                        error = %e,
                        "Dropping undecodable message"
                    );
                    continue;
                }
            };

            let ack = Ack::new(
                session.clone(),
                &message.topic,
                message.partition,
                message.offset,
            );
            let sink_message = SinkMessage {
                topic: message.topic,
                event,
                ack,
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                sent = self.input.send(sink_message) => {
                    if sent.is_err() {
                        debug!("Sink input closed, leaving partition claim");
                        break;
                    }
                }
            }
        }

        debug!(
            topic = %claim.topic,
            partition = claim.partition,
            "Partition claim finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::CsvMarshaler;
    use crate::test_utils::{MemoryGroup, RecordingMarker, RecordingWriter};
    use common_types::JsonDecoder;

    fn payload(id: &str) -> Option<Vec<u8>> {
        Some(format!(r#"{{"event_id":"{id}","event":"v"}}"#).into_bytes())
    }

    fn consumer(group: MemoryGroup, writer: &RecordingWriter) -> Consumer<MemoryGroup> {
        Consumer::new(
            group,
            vec!["t".to_string()],
            Box::new(JsonDecoder),
            Box::new(writer.clone()),
            Box::new(CsvMarshaler::new(&["event_id"]).unwrap()),
            SinkOptions::default(),
        )
    }

    #[tokio::test]
    async fn close_before_start_closes_everything() {
        let writer = RecordingWriter::default();
        let consumer = consumer(MemoryGroup::default(), &writer);
        assert_eq!(consumer.state(), ConsumerState::Created);

        consumer.close().await.unwrap();
        assert_eq!(consumer.state(), ConsumerState::Closed);
        assert!(consumer.group().is_closed());
        assert!(matches!(
            consumer.start().await,
            Err(ConsumerError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn close_marks_everything_written() {
        let writer = RecordingWriter::default();
        let group = MemoryGroup::default().with_partition(
            "t",
            0,
            10,
            vec![payload("a"), payload("b"), payload("c")],
        );
        let session = group.session();
        let consumer = consumer(group, &writer);

        let running = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.start().await }
        });

        // Wait until every message reached the sink buffer
        while consumer.state() != ConsumerState::Running {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        consumer.close().await.unwrap();
        running.await.unwrap().unwrap();

        assert_eq!(writer.contents(), b"a\nb\nc\n");
        assert_eq!(session.highest("t", 0), Some(12));
        assert_eq!(consumer.state(), ConsumerState::Closed);
    }

    #[tokio::test]
    async fn broker_errors_do_not_stop_the_consumer() {
        let writer = RecordingWriter::default();
        let group = MemoryGroup::default();
        group.report_error(GroupError::Unavailable("broker down".to_string()));
        let consumer = consumer(group, &writer);

        let running = tokio::spawn({
            let consumer = consumer.clone();
            async move { consumer.start().await }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(consumer.state(), ConsumerState::Running);

        consumer.close().await.unwrap();
        running.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn dispatched_claims_are_tracked_before_first_poll() {
        let tracker = TaskTracker::new();
        let (input, _) = mpsc::channel(1);
        let worker = Arc::new(ClaimWorker {
            decoder: Arc::new(JsonDecoder),
            input,
            shutdown: CancellationToken::new(),
            tracker: tracker.clone(),
        });
        let (_messages, rx) = mpsc::channel(1);
        let claim = Claim {
            topic: "t".to_string(),
            partition: 0,
            messages: rx,
        };

        let pending = worker.consume_claim(Arc::new(RecordingMarker::default()), claim);
        tracker.close();
        assert_eq!(tracker.len(), 1);
        assert!(
            tokio::time::timeout(std::time::Duration::from_millis(20), tracker.wait())
                .await
                .is_err()
        );

        drop(pending);
        tracker.wait().await;
        assert!(tracker.is_empty());
    }

    #[tokio::test]
    async fn group_failure_closes_and_is_returned() {
        let writer = RecordingWriter::default();
        let group = MemoryGroup::default()
            .failing_with(GroupError::Unavailable("no brokers".to_string()));
        let consumer = consumer(group, &writer);

        let result = consumer.start().await;

        assert!(matches!(
            result,
            Err(ConsumerError::Group(GroupError::Unavailable(_)))
        ));
        assert_eq!(consumer.state(), ConsumerState::Closed);
        assert!(consumer.group().is_closed());
    }
}
