// ==== Consumption ====
/// Counter for messages received from partition claims
pub const MESSAGES_CONSUMED: &str = "log_consumer_messages_consumed_total";

/// Counter for messages dropped because their payload could not be decoded
pub const DECODE_ERRORS: &str = "log_consumer_decode_errors_total";

/// Counter for non-fatal errors reported by the broker client
pub const BROKER_ERRORS: &str = "log_consumer_broker_errors_total";

// ==== Sink ====
/// Counter for flushes of the output buffer to the target
pub const SINK_FLUSHES: &str = "log_consumer_sink_flushes_total";

/// Counter for bytes handed to the target
pub const SINK_BYTES_WRITTEN: &str = "log_consumer_sink_bytes_written_total";

/// Histogram for flush duration
pub const SINK_FLUSH_DURATION: &str = "log_consumer_sink_flush_duration_seconds";

/// Counter for chained acks emitted after a flush
pub const SINK_ACKS_EMITTED: &str = "log_consumer_sink_acks_emitted_total";

// ==== Offsets ====
/// Counter for (topic, partition) offsets marked on the session
pub const OFFSETS_MARKED: &str = "log_consumer_offsets_marked_total";

/// Counter for failed offset marks
pub const MARK_ERRORS: &str = "log_consumer_mark_errors_total";

/// Gauge for the last marked offset, labelled by topic and partition
pub const LAST_MARKED_OFFSET: &str = "log_consumer_last_marked_offset";
