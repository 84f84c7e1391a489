//! Event-log consumer: reads events off Kafka and writes them to a sink target,
//! marking offsets only once their records have been written.
pub mod ack;
pub mod config;
pub mod consumer;
pub mod error;
pub mod field;
pub mod marshal;
pub mod metrics;
pub mod metrics_consts;
pub mod rolling;
pub mod sink;
pub mod target;
pub mod test_utils;

pub use ack::Ack;
pub use consumer::{Consumer, ConsumerState};
pub use sink::{BufferedSink, SinkMessage, SinkOptions, SinkReceivers};
