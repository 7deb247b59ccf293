// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Envelope
//!
//! The delivered message, its decoded payload, the outcome a handler reports back and the
//! header contract carried on the wire:
//!
//! - `x-retry-count`: the only persisted retry state (absent means never retried)
//! - `x-death`: broker-native dead-letter history, read-only
//! - `x-done` / `x-fail`: terminal outcome record written by this crate
//! - `x-original-properties` / `x-fail-original-properties`: properties at forwarding time

use crate::errors::AmqpError;
use lapin::{
    types::{
        AMQPValue, FieldArray, FieldTable, LongLongInt, LongString, ShortString, ShortShortUInt,
    },
    BasicProperties,
};
use serde_json::Value;

/// Constant for the x-death header used in RabbitMQ's dead-lettering mechanism
pub const AMQP_HEADERS_X_DEATH: &str = "x-death";
/// Constant for the count field in the x-death header
pub const AMQP_HEADERS_COUNT: &str = "count";
/// Constant for the original-expiration field in the x-death header
pub const AMQP_HEADERS_ORIGINAL_EXPIRATION: &str = "original-expiration";
/// Constant for the header counting how many times a task was retried
pub const AMQP_HEADERS_RETRY_COUNT: &str = "x-retry-count";
/// Constant for the outcome record of a task that succeeded
pub const AMQP_HEADERS_DONE: &str = "x-done";
/// Constant for the outcome record of a task that failed for good
pub const AMQP_HEADERS_FAIL: &str = "x-fail";
/// Constant for the properties snapshot attached to a done record
pub const AMQP_HEADERS_ORIGINAL_PROPERTIES: &str = "x-original-properties";
/// Constant for the properties snapshot attached to a fail record
pub const AMQP_HEADERS_FAIL_ORIGINAL_PROPERTIES: &str = "x-fail-original-properties";

/// Default content type for JSON messages
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Default content encoding for published messages
pub const UTF8_CONTENT_ENCODING: &str = "utf-8";

/// A message delivered by the broker.
#[derive(Debug, Clone, Default)]
pub struct Message {
    /// Tag used to ack or nack the delivery on its channel.
    pub delivery_tag: u64,
    /// Exchange the message was published to, empty for the default exchange.
    pub exchange: String,
    pub routing_key: String,
    /// Set when the broker delivered the message before.
    pub redelivered: bool,
    /// Raw body.
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

impl Message {
    fn header(&self, key: &str) -> Option<&AMQPValue> {
        self.properties
            .headers()
            .as_ref()
            .and_then(|headers| headers.inner().get(key))
    }

    /// Value of `x-retry-count`, `None` when the message was never retried.
    pub fn retry_count(&self) -> Option<i64> {
        self.header(AMQP_HEADERS_RETRY_COUNT).and_then(as_i64)
    }

    /// First entry of the broker's `x-death` history, if the message was dead-lettered.
    pub fn death(&self) -> Option<DeathRecord> {
        let table = self
            .header(AMQP_HEADERS_X_DEATH)?
            .as_array()?
            .as_slice()
            .first()?
            .as_field_table()?
            .inner();

        Some(DeathRecord {
            original_expiration: table
                .get(AMQP_HEADERS_ORIGINAL_EXPIRATION)
                .and_then(as_i64)
                .unwrap_or_default()
                .max(0) as u64,
            count: table
                .get(AMQP_HEADERS_COUNT)
                .and_then(as_i64)
                .unwrap_or_default(),
        })
    }

    /// The per-message `expiration` property in milliseconds, 0 when absent.
    pub fn expiration(&self) -> u64 {
        self.properties
            .expiration()
            .as_ref()
            .and_then(|raw| raw.as_str().parse::<u64>().ok())
            .unwrap_or_default()
    }
}

/// Relevant part of one `x-death` entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeathRecord {
    /// Expiration the message carried when it was dead-lettered, in milliseconds.
    pub original_expiration: u64,
    /// How many times the message was dead-lettered for this reason.
    pub count: i64,
}

/// Message body after content decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Body of an `application/json` message.
    Json(Value),
    /// Body of any other content type, as text.
    Text(String),
}

impl Payload {
    /// Decodes `data` according to the declared content encoding and type.
    ///
    /// # Parameters
    /// * `data` - The raw message body
    /// * `props` - Message properties carrying `content_type` and `content_encoding`
    /// * `fallback` - Encoding used when the message declares none
    ///
    /// # Returns
    /// The decoded payload, or a `ParsePayloadError` when the encoding is unknown, the bytes
    /// are not valid for it or a JSON body does not parse
    pub fn decode(
        data: &[u8],
        props: &BasicProperties,
        fallback: &str,
    ) -> Result<Payload, AmqpError> {
        let encoding = props
            .content_encoding()
            .as_ref()
            .map(|e| e.as_str())
            .unwrap_or(fallback);
        let text = decode_text(data, Some(encoding))?;

        match props.content_type().as_ref().map(|t| t.as_str()) {
            Some(JSON_CONTENT_TYPE) => serde_json::from_str(&text)
                .map(Payload::Json)
                .map_err(|err| AmqpError::ParsePayloadError(err.to_string())),
            _ => Ok(Payload::Text(text)),
        }
    }
}

/// Turns raw bytes into text using one of the supported encodings.
pub fn decode_text(data: &[u8], encoding: Option<&str>) -> Result<String, AmqpError> {
    match encoding.map(|e| e.to_ascii_lowercase()).as_deref() {
        None | Some("utf-8") | Some("utf8") => String::from_utf8(data.to_vec())
            .map_err(|err| AmqpError::ParsePayloadError(err.to_string())),
        Some("ascii") => Ok(data.iter().map(|b| (b & 0x7f) as char).collect()),
        Some("latin1") | Some("binary") => Ok(data.iter().map(|b| *b as char).collect()),
        Some(other) => Err(AmqpError::ParsePayloadError(format!(
            "unsupported content encoding `{other}`"
        ))),
    }
}

/// What a handler decided to do with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Acknowledge. The optional result is mirrored to the done queue.
    Ack(Option<Value>),
    /// Negative-acknowledge and let the broker requeue it.
    Nack,
    /// Acknowledge and forward to the done/fail queue as a terminal rejection.
    Reject(Option<String>),
    /// Go through the retry path although the handler did not fail.
    Retry(String),
    /// The handler settled the delivery itself.
    Manual,
}

impl Outcome {
    /// Plain acknowledgement.
    pub fn ack() -> Outcome {
        Outcome::Ack(None)
    }

    /// Acknowledgement whose `result` is recorded in the done queue.
    pub fn ack_with(result: Value) -> Outcome {
        Outcome::Ack(Some(result))
    }

    /// Terminal rejection recorded with `reason` as its error.
    pub fn reject(reason: impl Into<String>) -> Outcome {
        Outcome::Reject(Some(reason.into()))
    }

    /// Retry as if the handler failed with `reason`.
    pub fn retry(reason: impl Into<String>) -> Outcome {
        Outcome::Retry(reason.into())
    }
}

/// Record attached to messages forwarded to the done/fail queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutcomeRecord {
    /// Why the task ended up here, e.g. `Max retries exceeded 10 >= 10`.
    pub reason: Option<String>,
    /// Last error reported by the handler.
    pub error: Option<String>,
    /// Result of a successful handler.
    pub result: Option<Value>,
}

impl OutcomeRecord {
    /// The record as a header table, omitting unset fields.
    pub fn to_table(&self) -> FieldTable {
        let mut table = FieldTable::default();
        if let Some(reason) = &self.reason {
            table.insert(
                ShortString::from("reason"),
                AMQPValue::LongString(LongString::from(reason.as_str())),
            );
        }
        if let Some(error) = &self.error {
            table.insert(
                ShortString::from("error"),
                AMQPValue::LongString(LongString::from(error.as_str())),
            );
        }
        if let Some(result) = &self.result {
            table.insert(ShortString::from("result"), json_to_amqp(result));
        }
        table
    }
}

/// Properties for a terminal copy of `props`: the original properties with the record and a
/// snapshot of the properties added to the headers.
pub(crate) fn terminal_properties(
    props: &BasicProperties,
    record_key: &str,
    properties_key: &str,
    record: &OutcomeRecord,
) -> BasicProperties {
    let mut headers = props.headers().clone().unwrap_or_default();
    headers.insert(
        ShortString::from(record_key),
        AMQPValue::FieldTable(record.to_table()),
    );
    headers.insert(
        ShortString::from(properties_key),
        AMQPValue::FieldTable(properties_table(props)),
    );
    props.clone().with_headers(headers)
}

/// Copy of the message properties as a header table.
pub fn properties_table(props: &BasicProperties) -> FieldTable {
    let mut table = FieldTable::default();
    let mut text = |key: &str, value: &Option<ShortString>| {
        if let Some(value) = value {
            table.insert(
                ShortString::from(key),
                AMQPValue::LongString(LongString::from(value.as_str())),
            );
        }
    };

    text("contentType", props.content_type());
    text("contentEncoding", props.content_encoding());
    text("correlationId", props.correlation_id());
    text("replyTo", props.reply_to());
    text("expiration", props.expiration());
    text("messageId", props.message_id());
    text("type", props.kind());
    text("userId", props.user_id());
    text("appId", props.app_id());

    if let Some(headers) = props.headers() {
        table.insert(
            ShortString::from("headers"),
            AMQPValue::FieldTable(headers.clone()),
        );
    }
    if let Some(mode) = props.delivery_mode() {
        table.insert(
            ShortString::from("deliveryMode"),
            AMQPValue::ShortShortUInt(ShortShortUInt::from(*mode)),
        );
    }
    if let Some(priority) = props.priority() {
        table.insert(
            ShortString::from("priority"),
            AMQPValue::ShortShortUInt(ShortShortUInt::from(*priority)),
        );
    }
    if let Some(timestamp) = props.timestamp() {
        table.insert(
            ShortString::from("timestamp"),
            AMQPValue::Timestamp(*timestamp),
        );
    }

    table
}

/// Reads any numeric header value (or a numeric string) as an `i64`.
pub(crate) fn as_i64(value: &AMQPValue) -> Option<i64> {
    match value {
        AMQPValue::ShortShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortInt(v) => Some(i64::from(*v)),
        AMQPValue::ShortUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongInt(v) => Some(i64::from(*v)),
        AMQPValue::LongUInt(v) => Some(i64::from(*v)),
        AMQPValue::LongLongInt(v) => Some(*v),
        AMQPValue::Timestamp(v) => i64::try_from(*v).ok(),
        AMQPValue::Float(v) => Some(*v as i64),
        AMQPValue::Double(v) => Some(*v as i64),
        AMQPValue::ShortString(v) => v.as_str().trim().parse().ok(),
        AMQPValue::LongString(v) => std::str::from_utf8(v.as_bytes())
            .ok()
            .and_then(|s| s.trim().parse().ok()),
        _ => None,
    }
}

/// Maps a JSON value onto the closest AMQP field value.
pub(crate) fn json_to_amqp(value: &Value) -> AMQPValue {
    match value {
        Value::Null => AMQPValue::Void,
        Value::Bool(v) => AMQPValue::Boolean(*v),
        Value::Number(n) => match n.as_i64() {
            Some(v) => AMQPValue::LongLongInt(LongLongInt::from(v)),
            None => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        },
        Value::String(v) => AMQPValue::LongString(LongString::from(v.as_str())),
        Value::Array(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(json_to_amqp).collect::<Vec<_>>()))
        }
        Value::Object(map) => {
            let mut table = FieldTable::default();
            for (key, item) in map {
                table.insert(ShortString::from(key.as_str()), json_to_amqp(item));
            }
            AMQPValue::FieldTable(table)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn message_with_headers(headers: FieldTable) -> Message {
        Message {
            properties: BasicProperties::default().with_headers(headers),
            ..Message::default()
        }
    }

    #[test]
    fn json_payload_is_parsed() {
        let props = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_content_encoding(ShortString::from("utf-8"));
        let payload = Payload::decode(br#"{"id":7}"#, &props, UTF8_CONTENT_ENCODING).unwrap();
        assert_eq!(payload, Payload::Json(json!({"id": 7})));
    }

    #[test]
    fn non_json_payload_passes_through_as_text() {
        let props = BasicProperties::default().with_content_type(ShortString::from("text/plain"));
        let payload = Payload::decode(b"hello", &props, UTF8_CONTENT_ENCODING).unwrap();
        assert_eq!(payload, Payload::Text("hello".to_owned()));
    }

    #[test]
    fn fallback_encoding_applies_when_none_is_declared() {
        let props = BasicProperties::default();
        let payload = Payload::decode(&[0x63, 0xe9], &props, "latin1").unwrap();
        assert_eq!(payload, Payload::Text("cé".to_owned()));
    }

    #[test]
    fn latin1_and_unknown_encodings() {
        assert_eq!(decode_text(&[0x63, 0xe9], Some("latin1")).unwrap(), "cé");
        assert!(matches!(
            decode_text(b"abc", Some("utf-16be")),
            Err(AmqpError::ParsePayloadError(_))
        ));
    }

    #[test]
    fn invalid_json_is_a_parse_error() {
        let props = BasicProperties::default().with_content_type(ShortString::from(JSON_CONTENT_TYPE));
        assert!(matches!(
            Payload::decode(b"{nope", &props, UTF8_CONTENT_ENCODING),
            Err(AmqpError::ParsePayloadError(_))
        ));
    }

    #[test]
    fn retry_count_accepts_numbers_and_strings() {
        let mut headers = FieldTable::default();
        assert_eq!(message_with_headers(headers.clone()).retry_count(), None);

        headers.insert(ShortString::from(AMQP_HEADERS_RETRY_COUNT), AMQPValue::LongInt(2));
        assert_eq!(message_with_headers(headers.clone()).retry_count(), Some(2));

        headers.insert(
            ShortString::from(AMQP_HEADERS_RETRY_COUNT),
            AMQPValue::LongString(LongString::from("-1")),
        );
        assert_eq!(message_with_headers(headers).retry_count(), Some(-1));
    }

    #[test]
    fn death_record_is_read_from_first_entry() {
        let mut entry = FieldTable::default();
        entry.insert(
            ShortString::from(AMQP_HEADERS_ORIGINAL_EXPIRATION),
            AMQPValue::LongString(LongString::from("4000")),
        );
        entry.insert(ShortString::from(AMQP_HEADERS_COUNT), AMQPValue::LongLongInt(2));

        let mut headers = FieldTable::default();
        headers.insert(
            ShortString::from(AMQP_HEADERS_X_DEATH),
            AMQPValue::FieldArray(FieldArray::from(vec![AMQPValue::FieldTable(entry)])),
        );

        assert_eq!(
            message_with_headers(headers).death(),
            Some(DeathRecord {
                original_expiration: 4000,
                count: 2
            })
        );
    }

    #[test]
    fn terminal_properties_keep_original_properties() {
        let mut headers = FieldTable::default();
        headers.insert(ShortString::from("tenant"), AMQPValue::LongString("acme".into()));
        let props = BasicProperties::default()
            .with_content_type(ShortString::from(JSON_CONTENT_TYPE))
            .with_headers(headers);

        let record = OutcomeRecord {
            reason: Some("General failure".to_owned()),
            error: Some("boom".to_owned()),
            result: None,
        };
        let terminal = terminal_properties(
            &props,
            AMQP_HEADERS_FAIL,
            AMQP_HEADERS_FAIL_ORIGINAL_PROPERTIES,
            &record,
        );

        assert_eq!(terminal.content_type(), props.content_type());
        let headers = terminal.headers().clone().unwrap();
        let inner = headers.inner();
        assert!(inner.contains_key("tenant"));
        assert_eq!(
            inner.get(AMQP_HEADERS_FAIL),
            Some(&AMQPValue::FieldTable(record.to_table()))
        );
        assert!(inner.contains_key(AMQP_HEADERS_FAIL_ORIGINAL_PROPERTIES));
    }

    #[test]
    fn json_results_become_field_tables() {
        let value = json_to_amqp(&json!({"ok": true, "n": 3}));
        let AMQPValue::FieldTable(table) = value else {
            panic!("expected a table");
        };
        assert_eq!(table.inner().get("ok"), Some(&AMQPValue::Boolean(true)));
        assert_eq!(table.inner().get("n"), Some(&AMQPValue::LongLongInt(3)));
    }
}
