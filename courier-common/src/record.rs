//! The delivery record, the canonical entity exchanged between the
//! ingestion api and the delivery worker.
//!
//! Records travel through the queue as UTF-8 JSON. The wire format has
//! no schema version, so decoding must tolerate absent optional fields,
//! unknown keys, and an attempt counter that may arrive as an integer,
//! a float, or a numeric string depending on who last encoded it.

use std::fmt;

use serde::{de::Visitor, Deserialize, Deserializer, Serialize};

/// Payload sentinel meaning "no body", kept for wire compatibility with
/// producers that encode absent payloads as the literal string `NULL`.
pub const NULL_PAYLOAD: &str = "NULL";

/// A single pending webhook call.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct DeliveryRecord {
    /// HTTP verb to use against the target. Validated by the worker,
    /// not the decoder, so a missing field decodes to an empty string.
    #[serde(default)]
    pub method: String,
    /// Absolute target URL.
    #[serde(default)]
    pub url: String,
    /// Request body, pre-serialized by the producer. Empty and
    /// [`NULL_PAYLOAD`] both mean "no body".
    #[serde(default)]
    pub payload: String,
    /// Number of delivery attempts already executed for this record.
    #[serde(default, deserialize_with = "deserialize_attempts")]
    pub attempts: u32,
    /// Earliest eligible dispatch time, nanoseconds since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<u64>,
    /// Wall-clock expiry, seconds since the epoch. Expired records are
    /// dropped without an attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<i64>,
}

impl DeliveryRecord {
    /// A fresh record as produced by the ingestion api.
    pub fn new(method: &str, url: &str, payload: &str) -> Self {
        Self {
            method: method.to_owned(),
            url: url.to_owned(),
            payload: payload.to_owned(),
            attempts: 0,
            backoff: None,
            expires: None,
        }
    }

    /// The record to re-enqueue after a failed attempt. Carries only
    /// the routing fields plus the new attempt count and eligibility
    /// timestamp; the expiry window applies to the original submission
    /// and is not re-imposed on retries.
    pub fn retrying(&self, attempts: u32, backoff_ns: u64) -> Self {
        Self {
            method: self.method.clone(),
            url: self.url.clone(),
            payload: self.payload.clone(),
            attempts,
            backoff: Some(backoff_ns),
            expires: None,
        }
    }

    /// Whether both routing fields are present. Records failing this
    /// cannot make forward progress and are never requeued.
    pub fn is_routable(&self) -> bool {
        !self.method.is_empty() && !self.url.is_empty()
    }

    /// Whether the record's expiry window has passed.
    pub fn is_expired(&self, now_s: i64) -> bool {
        matches!(self.expires, Some(expires) if expires < now_s)
    }

    /// Whether the record is not yet eligible for dispatch.
    pub fn is_deferred(&self, now_ns: u64) -> bool {
        matches!(self.backoff, Some(backoff) if backoff > now_ns)
    }

    /// Whether the payload should be attached as a request body.
    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty() && self.payload != NULL_PAYLOAD
    }
}

struct AttemptsVisitor;

impl Visitor<'_> for AttemptsVisitor {
    type Value = u32;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "an attempt count as a number or numeric string")
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(u32::try_from(v).unwrap_or(u32::MAX))
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(u32::try_from(v).unwrap_or_default())
    }

    fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        // Saturating float-to-int conversion; NaN becomes 0.
        Ok(v as u32)
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(v.parse::<f64>().map(|parsed| parsed as u32).unwrap_or(0))
    }

    fn visit_unit<E>(self) -> Result<Self::Value, E>
    where
        E: serde::de::Error,
    {
        Ok(0)
    }
}

/// Coerce the wire representation of `attempts` into a `u32`,
/// defaulting to 0 on anything unparseable.
fn deserialize_attempts<'de, D>(deserializer: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    deserializer.deserialize_any(AttemptsVisitor)
}
