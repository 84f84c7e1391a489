use std::convert::Infallible;
use std::str::FromStr;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String, // Comma separated broker addresses

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // Broker protocol version, e.g. "2.6.0". Only needed for brokers that can't
    // answer ApiVersion requests.
    pub kafka_version: Option<String>,
}

impl KafkaConfig {
    pub fn hosts(&self) -> Vec<String> {
        split_values(&self.kafka_hosts)
    }
}

#[derive(Envconfig, Clone)]
pub struct ConsumerConfig {
    #[envconfig(default = "default")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "event-log")]
    pub kafka_consumer_topics: CommaSeparated,

    // Where to start when the group has no committed offset yet
    #[envconfig(default = "newest")]
    pub kafka_consumer_offset_reset: OffsetReset, // newest, oldest

    // Interval (in milliseconds) between commits of the offsets marked by the sink
    #[envconfig(default = "5000")]
    pub kafka_consumer_auto_commit_interval_ms: u32,

    // Messages buffered per partition claim before the dispatcher waits on the handler
    #[envconfig(default = "100")]
    pub kafka_claim_buffer_size: usize,
}

impl ConsumerConfig {
    pub fn topics(&self) -> &[String] {
        &self.kafka_consumer_topics.0
    }
}

/// Initial offset policy for partitions without a committed position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetReset {
    Newest,
    Oldest,
}

impl OffsetReset {
    /// The `auto.offset.reset` value librdkafka expects.
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Newest => "latest",
            OffsetReset::Oldest => "earliest",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseOffsetResetError(pub String);

impl FromStr for OffsetReset {
    type Err = ParseOffsetResetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "newest" | "latest" => Ok(OffsetReset::Newest),
            "oldest" | "earliest" => Ok(OffsetReset::Oldest),
            _ => Err(ParseOffsetResetError(s.to_string())),
        }
    }
}

/// A comma separated list, with blank entries dropped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommaSeparated(pub Vec<String>);

impl FromStr for CommaSeparated {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CommaSeparated(split_values(s)))
    }
}

fn split_values(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(String::from)
        .collect()
}
