use common_kafka::config::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;

use crate::sink::SinkOptions;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3310")]
    pub port: u16,

    #[envconfig(default = "true")]
    pub export_prometheus: bool,

    // Wire format of the consumed messages: protobuf, json
    #[envconfig(default = "protobuf")]
    pub event_decoder: String,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,

    #[envconfig(nested = true)]
    pub sink: SinkConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Envconfig, Clone)]
pub struct SinkConfig {
    #[envconfig(default = "json")]
    pub sink_marshaler: String, // json, csv

    // For csv, the comma separated column names
    #[envconfig(default = "")]
    pub sink_marshaler_args: String,

    #[envconfig(default = "stdout")]
    pub sink_target: String, // stdout, file, rollingfile

    // For file, filename or filename:max_size[:max_age[:suffix_format]]
    #[envconfig(default = "")]
    pub sink_target_args: String,

    #[envconfig(default = "100")]
    pub sink_input_buffer_size: usize,

    #[envconfig(default = "4096")]
    pub sink_output_buffer_size: usize,
}

impl SinkConfig {
    pub fn options(&self) -> SinkOptions {
        SinkOptions::new(self.sink_input_buffer_size, self.sink_output_buffer_size)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use common_kafka::config::OffsetReset;

    #[test]
    fn defaults() {
        let config = Config::init_from_hashmap(&HashMap::new()).unwrap();

        assert_eq!(config.bind(), "0.0.0.0:3310");
        assert!(config.export_prometheus);
        assert_eq!(config.event_decoder, "protobuf");
        assert_eq!(config.kafka.kafka_hosts, "localhost:9092");
        assert_eq!(config.consumer.kafka_consumer_group, "default");
        assert_eq!(config.consumer.topics(), ["event-log".to_string()]);
        assert_eq!(
            config.consumer.kafka_consumer_offset_reset,
            OffsetReset::Newest
        );
        assert_eq!(config.sink.sink_marshaler, "json");
        assert_eq!(config.sink.sink_target, "stdout");
        assert_eq!(config.sink.options(), SinkOptions::new(100, 4096));
    }

    #[test]
    fn overrides() {
        let env: HashMap<String, String> = [
            ("KAFKA_CONSUMER_TOPICS", "clicks, views"),
            ("KAFKA_CONSUMER_OFFSET_RESET", "oldest"),
            ("SINK_MARSHALER", "csv"),
            ("SINK_MARSHALER_ARGS", "event_id,event"),
            ("SINK_OUTPUT_BUFFER_SIZE", "0"),
            ("BIND_PORT", "9000"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        let config = Config::init_from_hashmap(&env).unwrap();

        assert_eq!(config.consumer.topics(), ["clicks", "views"]);
        assert_eq!(
            config.consumer.kafka_consumer_offset_reset,
            OffsetReset::Oldest
        );
        assert_eq!(config.sink.sink_marshaler_args, "event_id,event");
        assert_eq!(config.sink.options().output_buffer_size(), 1);
        assert_eq!(config.bind(), "0.0.0.0:9000");
    }

    #[test]
    fn unknown_offset_reset_is_rejected() {
        let env = HashMap::from([(
            "KAFKA_CONSUMER_OFFSET_RESET".to_string(),
            "sideways".to_string(),
        )]);

        assert!(Config::init_from_hashmap(&env).is_err());
    }
}
