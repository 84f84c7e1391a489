//! Buffered, acknowledgment-chaining sink.
//!
//! A single actor task owns the output buffer and the pending [`Ack`]. Messages
//! are marshaled and appended to the buffer; whenever the buffer is handed to
//! the writer, the acks of every message in it come out as one chained ack.
//! An ack is only emitted after its bytes were written without error, so
//! marking it can never get ahead of the output.
use std::time::Instant;

use common_types::EventLog;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::ack::Ack;
use crate::error::SinkError;
use crate::marshal::Marshaler;
use crate::metrics_consts::{
    SINK_ACKS_EMITTED, SINK_BYTES_WRITTEN, SINK_FLUSHES, SINK_FLUSH_DURATION,
};
use crate::target::SinkWriter;

pub const DEFAULT_INPUT_BUFFER_SIZE: usize = 100;
pub const DEFAULT_OUTPUT_BUFFER_SIZE: usize = 4096;

/// One consumed event on its way to the sink.
#[derive(Debug)]
pub struct SinkMessage {
    pub topic: String,
    pub event: EventLog,
    pub ack: Ack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkOptions {
    input_buffer_size: usize,
    output_buffer_size: usize,
}

impl SinkOptions {
    /// Sizes below 1 are raised to 1.
    pub fn new(input_buffer_size: usize, output_buffer_size: usize) -> Self {
        Self {
            input_buffer_size: input_buffer_size.max(1),
            output_buffer_size: output_buffer_size.max(1),
        }
    }

    pub fn input_buffer_size(&self) -> usize {
        self.input_buffer_size
    }

    pub fn output_buffer_size(&self) -> usize {
        self.output_buffer_size
    }
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self::new(DEFAULT_INPUT_BUFFER_SIZE, DEFAULT_OUTPUT_BUFFER_SIZE)
    }
}

/// The consuming ends of a sink: chained acks in flush order, and at most one
/// terminal error.
pub struct SinkReceivers {
    pub acks: mpsc::Receiver<Ack>,
    pub errors: mpsc::Receiver<SinkError>,
}

pub struct BufferedSink {
    input: mpsc::Sender<SinkMessage>,
    shutdown: CancellationToken,
    actor: Mutex<Option<JoinHandle<()>>>,
}

impl BufferedSink {
    /// Start the sink actor on the current runtime.
    pub fn spawn(
        writer: SinkWriter,
        marshaler: Box<dyn Marshaler>,
        options: SinkOptions,
    ) -> (Self, SinkReceivers) {
        let (input_tx, input_rx) = mpsc::channel(options.input_buffer_size);
        let (acks_tx, acks_rx) = mpsc::channel(1);
        let (errors_tx, errors_rx) = mpsc::channel(1);
        let shutdown = CancellationToken::new();

        let actor = SinkActor {
            writer: Some(writer),
            marshaler,
            capacity: options.output_buffer_size,
            buffer: Vec::with_capacity(options.output_buffer_size),
            pending: None,
            input: input_rx,
            acks: acks_tx,
            errors: errors_tx,
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(actor.run());

        let sink = Self {
            input: input_tx,
            shutdown,
            actor: Mutex::new(Some(handle)),
        };
        let receivers = SinkReceivers {
            acks: acks_rx,
            errors: errors_rx,
        };
        (sink, receivers)
    }

    /// Sender into the bounded input queue. Sending waits while the queue is full
    /// and fails once the sink has stopped.
    pub fn input(&self) -> mpsc::Sender<SinkMessage> {
        self.input.clone()
    }

    /// Stop taking input, write out everything already queued or buffered, emit
    /// the last ack and wait for the actor to finish.
    ///
    /// Later calls wait for the first one and then return.
    pub async fn close(&self) {
        self.shutdown.cancel();

        let mut actor = self.actor.lock().await;
        if let Some(handle) = actor.take() {
            if let Err(e) = handle.await {
                error!(error = ?e, "Sink actor failed");
            }
            debug!("Sink closed");
        }
    }
}

struct SinkActor {
    // Only None while a flush is running on the blocking pool
    writer: Option<SinkWriter>,
    marshaler: Box<dyn Marshaler>,
    capacity: usize,
    buffer: Vec<u8>,
    pending: Option<Ack>,
    input: mpsc::Receiver<SinkMessage>,
    acks: mpsc::Sender<Ack>,
    errors: mpsc::Sender<SinkError>,
    shutdown: CancellationToken,
}

impl SinkActor {
    async fn run(mut self) {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                message = self.input.recv() => message,
            };
            let Some(message) = message else {
                break;
            };
            if let Err(e) = self.handle(message).await {
                self.fail(e).await;
                return;
            }
        }

        // New sends fail from here on, queued messages are still delivered
        self.input.close();
        while let Some(message) = self.input.recv().await {
            if let Err(e) = self.handle(message).await {
                self.fail(e).await;
                return;
            }
        }

        if let Err(e) = self.flush_and_ack().await {
            self.fail(e).await;
        }
    }

    async fn handle(&mut self, message: SinkMessage) -> Result<(), SinkError> {
        let SinkMessage { topic, event, ack } = message;

        let record = self
            .marshaler
            .marshal(&topic, &event)
            .map_err(|error| SinkError::Marshal { topic, error })?;

        let free = self.capacity.saturating_sub(self.buffer.len());
        if record.len() > free && !self.buffer.is_empty() {
            self.flush_and_ack().await?;
        }

        self.buffer.extend_from_slice(&record);
        match self.pending.as_mut() {
            Some(pending) => pending.chain(ack),
            None => self.pending = Some(ack),
        }

        // Only a record larger than the whole buffer gets here
        if self.buffer.len() > self.capacity {
            self.flush_and_ack().await?;
        }

        Ok(())
    }

    async fn flush_and_ack(&mut self) -> Result<(), SinkError> {
        if !self.buffer.is_empty() {
            self.flush().await?;
        }

        if let Some(ack) = self.pending.take() {
            metrics::counter!(SINK_ACKS_EMITTED).increment(1);
            if self.acks.send(ack).await.is_err() {
                warn!("Ack receiver dropped, flushed offsets will not be marked");
            }
        }

        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        let Some(mut writer) = self.writer.take() else {
            return Err(SinkError::Write(std::io::Error::other(
                "sink writer is gone",
            )));
        };
        let buffer = std::mem::take(&mut self.buffer);
        let started = Instant::now();

        let (writer, mut buffer, written) = tokio::task::spawn_blocking(move || {
            let written = writer.write_all(&buffer).and_then(|()| writer.flush());
            (writer, buffer, written)
        })
        .await?;
        written?;

        metrics::counter!(SINK_FLUSHES).increment(1);
        metrics::counter!(SINK_BYTES_WRITTEN).increment(buffer.len() as u64);
        metrics::histogram!(SINK_FLUSH_DURATION).record(started.elapsed().as_secs_f64());
        debug!(bytes = buffer.len(), "Flushed sink buffer");

        buffer.clear();
        self.buffer = buffer;
        self.writer = Some(writer);
        Ok(())
    }

    async fn fail(&mut self, e: SinkError) {
        error!(error = %e, "Sink stopped");
        self.input.close();
        if self.errors.send(e).await.is_err() {
            warn!("Sink error receiver dropped");
        }
    }
}
