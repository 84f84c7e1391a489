use std::borrow::Cow;

use common_types::EventLog;
use csv::{QuoteStyle, Terminator, WriterBuilder};

use crate::error::MarshalError;
use crate::field::Field;

/// Turns an event into the bytes of one output record.
pub trait Marshaler: Send + Sync {
    fn marshal(&self, topic: &str, event: &EventLog) -> Result<Vec<u8>, MarshalError>;
}

/// One JSON object per line.
pub struct JsonMarshaler;

impl Marshaler for JsonMarshaler {
    fn marshal(&self, _topic: &str, event: &EventLog) -> Result<Vec<u8>, MarshalError> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        Ok(line)
    }
}

/// One CSV row per event, columns in the configured order, no header row.
pub struct CsvMarshaler {
    fields: Vec<Field>,
}

impl CsvMarshaler {
    pub fn new<S: AsRef<str>>(headers: &[S]) -> Result<Self, MarshalError> {
        if headers.is_empty() {
            return Err(MarshalError::NoFields);
        }

        let fields = headers
            .iter()
            .map(|header| Field::resolve(header.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { fields })
    }
}

impl Marshaler for CsvMarshaler {
    fn marshal(&self, _topic: &str, event: &EventLog) -> Result<Vec<u8>, MarshalError> {
        let values: Vec<String> = self.fields.iter().map(|field| field.value(event)).collect();
        if values.len() == 1 && values[0].is_empty() {
            return Ok(b"\n".to_vec());
        }

        // Fields arrive quoted already
        let mut writer = WriterBuilder::new()
            .has_headers(false)
            .quote_style(QuoteStyle::Never)
            .terminator(Terminator::Any(b'\n'))
            .from_writer(Vec::with_capacity(256));

        let quoted: Vec<Cow<'_, str>> = values.iter().map(|value| quote(value)).collect();
        writer.write_record(quoted.iter().map(|value| value.as_bytes()))?;

        writer
            .into_inner()
            .map_err(|e| MarshalError::Csv(e.into_error().into()))
    }
}

// Quoted when it holds a separator, a quote or a line break, or starts with
// whitespace. Embedded quotes are doubled.
fn quote(value: &str) -> Cow<'_, str> {
    let needs_quotes = value == r"\."
        || value.contains([',', '"', '\r', '\n'])
        || value.starts_with(char::is_whitespace);

    if needs_quotes {
        Cow::Owned(format!("\"{}\"", value.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(value)
    }
}

type MarshalerFactory = fn(&str) -> Result<Box<dyn Marshaler>, MarshalError>;

const MARSHALERS: &[(&str, MarshalerFactory)] = &[("json", json_marshaler), ("csv", csv_marshaler)];

fn json_marshaler(_args: &str) -> Result<Box<dyn Marshaler>, MarshalError> {
    Ok(Box::new(JsonMarshaler))
}

// Args are the comma separated column names
fn csv_marshaler(args: &str) -> Result<Box<dyn Marshaler>, MarshalError> {
    let headers: Vec<&str> = args
        .split(',')
        .map(str::trim)
        .filter(|header| !header.is_empty())
        .collect();

    Ok(Box::new(CsvMarshaler::new(&headers)?))
}

/// Build the marshaler registered under `name`.
pub fn marshaler_by_name(name: &str, args: &str) -> Result<Box<dyn Marshaler>, MarshalError> {
    let (_, factory) = MARSHALERS
        .iter()
        .find(|(registered, _)| *registered == name)
        .ok_or_else(|| MarshalError::UnknownMarshaler(name.to_string()))?;

    factory(args)
}
