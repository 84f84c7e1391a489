//! In-memory stand-ins for the broker group, the offset session and the sink
//! target, shared by unit and pipeline tests.
use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common_kafka::{
    Claim, ClaimHandler, ConsumerGroup, GroupError, OffsetErr, OffsetMarker, RawMessage,
};
use common_types::EventLog;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// An event with the given id and event name.
pub fn event(id: &str, name: &str) -> EventLog {
    EventLog {
        event_id: id.to_string(),
        event: name.to_string(),
        ..Default::default()
    }
}

/// Records every mark, in call order.
#[derive(Default)]
pub struct RecordingMarker {
    marks: Mutex<Vec<(String, i32, i64)>>,
    failing: Option<(String, i32)>,
}

impl RecordingMarker {
    /// A marker that refuses marks for one partition.
    pub fn failing_on(topic: &str, partition: i32) -> Self {
        Self {
            marks: Mutex::default(),
            failing: Some((topic.to_string(), partition)),
        }
    }

    pub fn marks(&self) -> Vec<(String, i32, i64)> {
        self.marks.lock().unwrap().clone()
    }

    pub fn highest(&self, topic: &str, partition: i32) -> Option<i64> {
        self.marks
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, p, _)| t == topic && *p == partition)
            .map(|(_, _, offset)| *offset)
            .max()
    }

    pub fn marked_offsets(&self) -> HashMap<(String, i32), Vec<i64>> {
        let mut offsets: HashMap<(String, i32), Vec<i64>> = HashMap::new();
        for (topic, partition, offset) in self.marks() {
            offsets.entry((topic, partition)).or_default().push(offset);
        }
        offsets
    }
}

impl OffsetMarker for RecordingMarker {
    fn mark_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<(), OffsetErr> {
        if let Some((failing_topic, failing_partition)) = &self.failing {
            if failing_topic == topic && *failing_partition == partition {
                return Err(OffsetErr::Gone);
            }
        }
        self.marks
            .lock()
            .unwrap()
            .push((topic.to_string(), partition, offset));
        Ok(())
    }
}

/// A sink target that keeps every `write` call as a separate chunk.
#[derive(Clone, Default)]
pub struct RecordingWriter {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    flushes: Arc<AtomicUsize>,
}

impl RecordingWriter {
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.writes().concat()
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }
}

impl Write for RecordingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writes.lock().unwrap().push(buf.to_vec());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A sink target that fails every write.
pub struct FailingWriter;

impl Write for FailingWriter {
    fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::other("disk on fire"))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

type Assignment = Vec<(String, i32, Vec<RawMessage>)>;

/// A consumer group serving pre-loaded partitions from memory.
///
/// Each session claims the partitions of the next queued assignment and
/// delivers their messages. A session with another assignment queued behind it
/// ends once its claims are drained, like a rebalance. The last session lasts
/// until shutdown is cancelled.
pub struct MemoryGroup {
    assignments: Mutex<VecDeque<Assignment>>,
    session: Arc<RecordingMarker>,
    errors_tx: mpsc::UnboundedSender<GroupError>,
    errors_rx: Mutex<Option<mpsc::UnboundedReceiver<GroupError>>>,
    consume_error: Mutex<Option<GroupError>>,
    sessions: AtomicUsize,
    closed: AtomicBool,
}

impl Default for MemoryGroup {
    fn default() -> Self {
        Self::with_session(Arc::new(RecordingMarker::default()))
    }
}

impl MemoryGroup {
    pub fn with_session(session: Arc<RecordingMarker>) -> Self {
        let (errors_tx, errors_rx) = mpsc::unbounded_channel();
        Self {
            assignments: Mutex::new(VecDeque::from([Vec::new()])),
            session,
            errors_tx,
            errors_rx: Mutex::new(Some(errors_rx)),
            consume_error: Mutex::default(),
            sessions: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Queue `payloads` on a partition, at offsets starting from `first_offset`.
    pub fn with_partition(
        self,
        topic: &str,
        partition: i32,
        first_offset: i64,
        payloads: Vec<Option<Vec<u8>>>,
    ) -> Self {
        let messages = payloads
            .into_iter()
            .zip(first_offset..)
            .map(|(payload, offset)| RawMessage {
                topic: topic.to_string(),
                partition,
                offset,
                payload,
            })
            .collect();
        self.assignments
            .lock()
            .unwrap()
            .back_mut()
            .unwrap()
            .push((topic.to_string(), partition, messages));
        self
    }

    /// End the current assignment; partitions added later go to the next session.
    pub fn rebalance(self) -> Self {
        self.assignments.lock().unwrap().push_back(Vec::new());
        self
    }

    /// Make the next session fail with `error`.
    pub fn failing_with(self, error: GroupError) -> Self {
        *self.consume_error.lock().unwrap() = Some(error);
        self
    }

    pub fn session(&self) -> Arc<RecordingMarker> {
        self.session.clone()
    }

    /// Report a non-fatal broker error.
    pub fn report_error(&self, error: GroupError) {
        self.errors_tx.send(error).unwrap();
    }

    pub fn sessions(&self) -> usize {
        self.sessions.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConsumerGroup for MemoryGroup {
    async fn consume(
        &self,
        _topics: &[String],
        handler: Arc<dyn ClaimHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), GroupError> {
        self.sessions.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.consume_error.lock().unwrap().take() {
            return Err(error);
        }

        let (partitions, revoked) = {
            let mut assignments = self.assignments.lock().unwrap();
            let partitions = assignments.pop_front().unwrap_or_default();
            (partitions, !assignments.is_empty())
        };
        let mut claims = Vec::new();
        let mut handlers = JoinSet::new();
        for (topic, partition, messages) in partitions {
            let (tx, rx) = mpsc::channel(messages.len().max(1));
            for message in messages {
                tx.try_send(message).unwrap();
            }
            claims.push(tx);

            let claim = Claim {
                topic,
                partition,
                messages: rx,
            };
            let handler = handler.clone();
            let session: Arc<dyn OffsetMarker> = self.session.clone();
            handlers.spawn(handler.consume_claim(session, claim));
        }

        if !revoked {
            shutdown.cancelled().await;
        }

        drop(claims);
        while handlers.join_next().await.is_some() {}
        Ok(())
    }

    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<GroupError>> {
        self.errors_rx.lock().unwrap().take()
    }

    async fn close(&self) -> Result<(), GroupError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
