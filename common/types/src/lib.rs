mod decode;
mod event;

// Events
pub use event::EventLog;

// Decoding
pub use decode::decoder_by_name;
pub use decode::DecodeError;
pub use decode::EventDecoder;
pub use decode::JsonDecoder;
pub use decode::ProtobufDecoder;
