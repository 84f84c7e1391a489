use common_kafka::GroupError;
use common_types::DecodeError;
use thiserror::Error;

/// Errors turning an event into output bytes.
#[derive(Error, Debug)]
pub enum MarshalError {
    #[error("unknown marshaler: {0}")]
    UnknownMarshaler(String),
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("marshaler needs at least one field")]
    NoFields,
    #[error("json encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("csv encoding failed: {0}")]
    Csv(#[from] csv::Error),
}

/// Errors opening a sink target.
#[derive(Error, Debug)]
pub enum TargetError {
    #[error("unknown target: {0}")]
    UnknownTarget(String),
    #[error("invalid target arguments {args:?}: {reason}")]
    InvalidArgs { args: String, reason: String },
    #[error("failed to open target: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal errors of the sink actor.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to marshal event from {topic}: {error}")]
    Marshal { topic: String, error: MarshalError },
    #[error("failed to write to target: {0}")]
    Write(#[from] std::io::Error),
    #[error("flush task failed: {0}")]
    FlushTask(#[from] tokio::task::JoinError),
}

/// Errors of the consumer orchestration and its startup.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("consumer group error: {0}")]
    Group(#[from] GroupError),
    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("marshaler error: {0}")]
    Marshal(#[from] MarshalError),
    #[error("target error: {0}")]
    Target(#[from] TargetError),
    #[error("decoder error: {0}")]
    Decode(#[from] DecodeError),
    #[error("consumer already started")]
    AlreadyStarted,
    #[error("failed to serve metrics: {0}")]
    Metrics(String),
}
