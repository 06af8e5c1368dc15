//! Event envelope: payload plus routing metadata.
//!
//! An [`Envelope`] is immutable once built. Its wire form ([`WireMessage`])
//! is what every broker backend carries: an optional key, the payload bytes,
//! and an ordered header map whose values are UTF-8 bytes.
//!
//! Mandatory headers:
//! - `type`: event kind, drives routing and consumer dispatch
//! - `correlationId`: UUID generated per publish attempt
//! - `content-type`: payload encoding, `application/json` by default
//!
//! Every envelope built here also carries `timestamp`, the producer-side
//! creation time (RFC 3339, UTC). Foreign producers may leave it out; such
//! messages are stamped with the decode time.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::bus::{BusError, Result};

/// Header carrying the event type.
pub const TYPE_HEADER: &str = "type";
/// Header carrying the correlation id.
pub const CORRELATION_ID_HEADER: &str = "correlationId";
/// Header carrying the payload content type.
pub const CONTENT_TYPE_HEADER: &str = "content-type";
/// Header carrying the producer timestamp.
pub const TIMESTAMP_HEADER: &str = "timestamp";
/// Default payload encoding.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

const RESERVED_HEADERS: [&str; 4] = [
    TYPE_HEADER,
    CORRELATION_ID_HEADER,
    CONTENT_TYPE_HEADER,
    TIMESTAMP_HEADER,
];

/// Errors decoding a wire message into an envelope.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("missing header '{0}'")]
    MissingHeader(&'static str),

    #[error("header '{name}' is not valid UTF-8")]
    NotUtf8 { name: String },

    #[error("header '{name}' has invalid value '{value}': {reason}")]
    InvalidHeader {
        name: &'static str,
        value: String,
        reason: String,
    },

    #[error("payload is not valid {content_type}: {reason}")]
    Payload {
        content_type: String,
        reason: String,
    },
}

/// Ordered header map from name to byte value.
///
/// Insertion order is preserved; inserting an existing name replaces its value
/// in place. Lookups return the value bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Bytes)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a header.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    /// Value of a header.
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    /// Value of a header decoded as UTF-8.
    pub fn get_str(&self, name: &str) -> Option<std::result::Result<&str, DecodeError>> {
        self.get(name).map(|value| {
            std::str::from_utf8(value).map_err(|_| DecodeError::NotUtf8 {
                name: name.to_string(),
            })
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) -> Option<Bytes> {
        let index = self.entries.iter().position(|(k, _)| k == name)?;
        Some(self.entries.remove(index).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<Bytes>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (k, v) in iter {
            headers.insert(k, v);
        }
        headers
    }
}

/// Broker-neutral wire form of an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub key: Option<String>,
    pub payload: Bytes,
    pub headers: Headers,
}

/// Immutable event envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    key: Option<String>,
    payload: Bytes,
    event_type: String,
    correlation_id: Uuid,
    timestamp: DateTime<Utc>,
    content_type: String,
    headers: Headers,
}

impl Envelope {
    /// Start building an envelope around an already-serialized payload.
    pub fn builder(payload: impl Into<Bytes>, event_type: impl Into<String>) -> EnvelopeBuilder {
        EnvelopeBuilder {
            payload: payload.into(),
            event_type: event_type.into(),
            key: None,
            content_type: None,
            correlation_id: None,
            timestamp: None,
            extra: Headers::new(),
        }
    }

    /// Build an envelope with a JSON-serialized business object.
    pub fn json<T: Serialize>(event_type: impl Into<String>, payload: &T) -> Result<Self> {
        let body = serde_json::to_vec(payload)
            .map_err(|e| BusError::InvalidEnvelope(format!("payload serialization: {}", e)))?;
        Self::builder(body, event_type).build()
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn correlation_id(&self) -> Uuid {
        self.correlation_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Full header map, including the mandatory headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Decode the payload as JSON.
    pub fn decode_json<T: DeserializeOwned>(&self) -> std::result::Result<T, DecodeError> {
        serde_json::from_slice(&self.payload).map_err(|e| DecodeError::Payload {
            content_type: self.content_type.clone(),
            reason: e.to_string(),
        })
    }

    /// Copy of this envelope for a new publish attempt: fresh correlation id
    /// and timestamp, same key, payload, type and extra headers.
    pub fn reissue(&self) -> Self {
        let mut headers = self.headers.clone();
        let correlation_id = Uuid::new_v4();
        let timestamp = Utc::now();
        headers.insert(CORRELATION_ID_HEADER, correlation_id.to_string());
        headers.insert(TIMESTAMP_HEADER, format_timestamp(&timestamp));
        Self {
            correlation_id,
            timestamp,
            headers,
            ..self.clone()
        }
    }

    /// Encode into the broker-neutral wire form.
    pub fn to_wire(&self) -> WireMessage {
        WireMessage {
            key: self.key.clone(),
            payload: self.payload.clone(),
            headers: self.headers.clone(),
        }
    }

    /// Decode from the wire form.
    pub fn from_wire(message: WireMessage) -> std::result::Result<Self, DecodeError> {
        let WireMessage {
            key,
            payload,
            mut headers,
        } = message;

        let event_type = required_str(&headers, TYPE_HEADER)?.to_string();
        if event_type.is_empty() {
            return Err(DecodeError::InvalidHeader {
                name: TYPE_HEADER,
                value: event_type,
                reason: "empty event type".to_string(),
            });
        }

        let raw_id = required_str(&headers, CORRELATION_ID_HEADER)?;
        let correlation_id =
            Uuid::parse_str(raw_id).map_err(|e| DecodeError::InvalidHeader {
                name: CORRELATION_ID_HEADER,
                value: raw_id.to_string(),
                reason: e.to_string(),
            })?;

        let content_type = required_str(&headers, CONTENT_TYPE_HEADER)?.to_string();

        let timestamp = match headers.get_str(TIMESTAMP_HEADER).transpose()? {
            Some(raw_ts) => DateTime::parse_from_rfc3339(raw_ts)
                .map_err(|e| DecodeError::InvalidHeader {
                    name: TIMESTAMP_HEADER,
                    value: raw_ts.to_string(),
                    reason: e.to_string(),
                })?
                .with_timezone(&Utc),
            None => {
                let now = Utc::now();
                headers.insert(TIMESTAMP_HEADER, format_timestamp(&now));
                now
            }
        };

        Ok(Self {
            key,
            payload,
            event_type,
            correlation_id,
            timestamp,
            content_type,
            headers,
        })
    }
}

/// Builder for [`Envelope`].
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    payload: Bytes,
    event_type: String,
    key: Option<String>,
    content_type: Option<String>,
    correlation_id: Option<Uuid>,
    timestamp: Option<DateTime<Utc>>,
    extra: Headers,
}

impl EnvelopeBuilder {
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Add a non-reserved header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.extra.insert(name, value);
        self
    }

    /// Pin the correlation id (replay and tests).
    pub fn correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    /// Pin the timestamp (replay and tests).
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn build(self) -> Result<Envelope> {
        if self.event_type.trim().is_empty() {
            return Err(BusError::InvalidEnvelope(
                "event type must not be empty".to_string(),
            ));
        }
        if let Some((name, _)) = self
            .extra
            .iter()
            .find(|(name, _)| RESERVED_HEADERS.contains(name))
        {
            return Err(BusError::InvalidEnvelope(format!(
                "header '{}' is reserved",
                name
            )));
        }

        let correlation_id = self.correlation_id.unwrap_or_else(Uuid::new_v4);
        let timestamp = self.timestamp.unwrap_or_else(Utc::now);
        let content_type = self
            .content_type
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        let mut headers = Headers::new();
        headers.insert(TYPE_HEADER, self.event_type.clone());
        headers.insert(CORRELATION_ID_HEADER, correlation_id.to_string());
        headers.insert(CONTENT_TYPE_HEADER, content_type.clone());
        headers.insert(TIMESTAMP_HEADER, format_timestamp(&timestamp));
        for (name, value) in self.extra.iter() {
            headers.insert(name, value.clone());
        }

        Ok(Envelope {
            key: self.key,
            payload: self.payload,
            event_type: self.event_type,
            correlation_id,
            timestamp,
            content_type,
            headers,
        })
    }
}

fn required_str<'a>(
    headers: &'a Headers,
    name: &'static str,
) -> std::result::Result<&'a str, DecodeError> {
    headers
        .get_str(name)
        .ok_or(DecodeError::MissingHeader(name))?
}

/// RFC 3339 keeping sub-second digits, so decode reproduces the value exactly.
fn format_timestamp(timestamp: &DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)
}
