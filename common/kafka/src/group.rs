//! The consumer-group contract the event-log pipeline is written against.
//!
//! A group hands out one [`Claim`] per assigned partition for the duration of a
//! session, and exposes the session as an [`OffsetMarker`] so processed offsets
//! can be stored for commit.
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Kafka client error: {error} ({reason})")]
    Client { error: KafkaError, reason: String },
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("invalid consumer configuration: {0}")]
    InvalidConfig(String),
}

#[derive(Debug, thiserror::Error)]
pub enum OffsetErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer gone")]
    Gone,
}

/// A message as delivered by the broker, detached from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
}

/// The messages of one partition, for one session.
///
/// The channel closes when the session ends.
pub struct Claim {
    pub topic: String,
    pub partition: i32,
    pub messages: mpsc::Receiver<RawMessage>,
}

pub trait OffsetMarker: Send + Sync {
    /// Mark the message at `offset` as processed.
    fn mark_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<(), OffsetErr>;
}

/// A running partition claim, spawned by the group.
pub type ClaimFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub trait ClaimHandler: Send + Sync {
    /// Called once per claimed partition, when the claim is dispatched. The
    /// returned futures may run concurrently for different partitions.
    fn consume_claim(
        self: Arc<Self>,
        session: Arc<dyn OffsetMarker>,
        claim: Claim,
    ) -> ClaimFuture;
}

#[async_trait]
pub trait ConsumerGroup: Send + Sync {
    /// Run one consume session.
    ///
    /// Returns `Ok(())` when the session ends, either because partitions were
    /// reassigned or because `shutdown` was cancelled. Callers loop on it.
    async fn consume(
        &self,
        topics: &[String],
        handler: Arc<dyn ClaimHandler>,
        shutdown: CancellationToken,
    ) -> Result<(), GroupError>;

    /// Non-fatal errors raised by the client outside of claim delivery.
    /// Only the first call returns the receiver.
    fn take_errors(&self) -> Option<mpsc::UnboundedReceiver<GroupError>>;

    async fn close(&self) -> Result<(), GroupError>;
}
