pub mod config;
pub mod group;
pub mod kafka_consumer;

pub use group::{
    Claim, ClaimFuture, ClaimHandler, ConsumerGroup, GroupError, OffsetErr, OffsetMarker, RawMessage,
};
pub use kafka_consumer::KafkaGroup;
