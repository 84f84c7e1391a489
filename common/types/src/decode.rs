use prost::Message;
use thiserror::Error;

use crate::EventLog;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("received empty payload")]
    Empty,
    #[error("invalid protobuf payload: {0}")]
    Protobuf(#[from] prost::DecodeError),
    #[error("invalid json payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown event decoder: {0}")]
    UnknownDecoder(String),
}

/// Turns the raw bytes of a broker message into an `EventLog`.
///
/// Decoding is per-message: an error only concerns the payload it was given.
pub trait EventDecoder: Send + Sync {
    fn decode(&self, payload: &[u8]) -> Result<EventLog, DecodeError>;
}

/// The ingestion service's wire format.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProtobufDecoder;

impl EventDecoder for ProtobufDecoder {
    fn decode(&self, payload: &[u8]) -> Result<EventLog, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(EventLog::decode(payload)?)
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct JsonDecoder;

impl EventDecoder for JsonDecoder {
    fn decode(&self, payload: &[u8]) -> Result<EventLog, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::Empty);
        }
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Look up a decoder by its configured name.
pub fn decoder_by_name(name: &str) -> Result<Box<dyn EventDecoder>, DecodeError> {
    match name.trim().to_lowercase().as_str() {
        "protobuf" | "proto" => Ok(Box::new(ProtobufDecoder)),
        "json" => Ok(Box::new(JsonDecoder)),
        _ => Err(DecodeError::UnknownDecoder(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> EventLog {
        let mut event = EventLog {
            event_id: "my-event-id".to_string(),
            event: "click".to_string(),
            event_time: 1_600_000_000_123,
            screen_width: 1080,
            ..Default::default()
        };
        event
            .extend_info
            .insert("foo".to_string(), "bar".to_string());
        event
    }

    #[test]
    fn protobuf_wire_format_decodes() {
        let event = sample_event();
        let payload = event.encode_to_vec();

        let decoded = ProtobufDecoder.decode(&payload).expect("failed to decode");
        assert_eq!(decoded, event);
    }

    #[test]
    fn json_missing_fields_default() {
        let decoded = JsonDecoder
            .decode(br#"{"event_id": "abc", "extend_info": {"k": "v"}}"#)
            .expect("failed to decode");

        assert_eq!(decoded.event_id, "abc");
        assert_eq!(decoded.event_time, 0);
        assert_eq!(decoded.extend_info.get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            ProtobufDecoder.decode(&[0xff, 0xff, 0xff]),
            Err(DecodeError::Protobuf(_))
        ));
        assert!(matches!(
            JsonDecoder.decode(b"not json"),
            Err(DecodeError::Json(_))
        ));
    }

    #[test]
    fn empty_payload_is_rejected() {
        assert!(matches!(ProtobufDecoder.decode(&[]), Err(DecodeError::Empty)));
        assert!(matches!(JsonDecoder.decode(&[]), Err(DecodeError::Empty)));
    }

    #[test]
    fn decoders_resolve_by_name() {
        let payload = serde_json::to_vec(&sample_event()).unwrap();
        let decoder = decoder_by_name("JSON").expect("json decoder");
        assert_eq!(decoder.decode(&payload).unwrap(), sample_event());

        assert!(decoder_by_name("protobuf").is_ok());
        assert!(matches!(
            decoder_by_name("avro"),
            Err(DecodeError::UnknownDecoder(_))
        ));
    }
}
