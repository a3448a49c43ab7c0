use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

use crate::error::{Result, VaultError};

pub const MILLISECONDS_PER_HOUR: i64 = 3_600_000;

pub(crate) const FIELD_ACCOUNT_ID: &str = "accountId";
pub(crate) const FIELD_EVENT_ID: &str = "eventId";
pub(crate) const FIELD_SECRET_ID: &str = "secretId";

/// One user action, as stored and exchanged with collaborators.
///
/// `payload` stays opaque ciphertext until the read path decrypts it;
/// anonymous-mode events are stored with a clear payload from the start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    /// ULID string; its embedded timestamp selects the hour bucket.
    pub event_id: String,
    /// Identifies the per-user symmetric key that encrypted this event,
    /// or `None` when it was encrypted under the account keypair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_id: Option<String>,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Encrypted(String),
    Decrypted(EventPayload),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_href: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    /// Validates the event against the expected shape and returns a
    /// normalized copy, or `None` when the event should be discarded.
    ///
    /// URL-valued payload fields are canonicalized so the path always
    /// ends with `/`. Events that still carry ciphertext, carry an
    /// invalid ULID, or miss required payload fields all fail.
    pub fn validate_and_parse(&self) -> Option<Event> {
        Ulid::from_string(&self.event_id).ok()?;
        let payload = match &self.payload {
            Payload::Decrypted(payload) => payload,
            Payload::Encrypted(_) => return None,
        };
        if payload.event_type.as_deref().is_none_or(str::is_empty) {
            return None;
        }
        if payload.session_id.as_deref().is_none_or(str::is_empty) {
            return None;
        }
        payload.timestamp?;

        let mut parsed = self.clone();
        let Payload::Decrypted(payload) = &mut parsed.payload else {
            unreachable!("payload checked above");
        };
        for field in [
            &mut payload.href,
            &mut payload.raw_href,
            &mut payload.referrer,
        ] {
            if let Some(url) = field {
                *field = Some(canonicalize_url(url)?);
            }
        }
        Some(parsed)
    }
}

/// Millisecond timestamp embedded in an event id.
pub fn event_timestamp_ms(event_id: &str) -> Result<i64> {
    let ulid = Ulid::from_string(event_id)
        .map_err(|err| VaultError::Serialization(format!("invalid event id {event_id}: {err}")))?;
    Ok(ulid.timestamp_ms() as i64)
}

/// Start of the hour bucket an event id falls into, in Unix milliseconds.
pub fn hour_bucket(event_id: &str) -> Result<i64> {
    Ok(hour_floor_ms(event_timestamp_ms(event_id)?))
}

pub fn hour_floor_ms(timestamp_ms: i64) -> i64 {
    timestamp_ms - timestamp_ms.rem_euclid(MILLISECONDS_PER_HOUR)
}

pub fn hour_floor(time: DateTime<Utc>) -> i64 {
    hour_floor_ms(time.timestamp_millis())
}

/// Smallest event id a between-query must include for events at `time`.
///
/// Encodes `time - 1ms` with zeroed randomness so an inclusive range scan
/// picks up every id minted at or after `time`.
pub fn id_lower_bound(time: DateTime<Utc>) -> String {
    let ms = (time.timestamp_millis() - 1).max(0) as u64;
    Ulid::from_parts(ms, 0).to_string()
}

/// Counterpart of [`id_lower_bound`]: encodes `time + 1ms`.
pub fn id_upper_bound(time: DateTime<Utc>) -> String {
    let ms = (time.timestamp_millis() + 1).max(0) as u64;
    Ulid::from_parts(ms, 0).to_string()
}

/// Flattens the event envelope and its decrypted payload into one record.
///
/// Envelope fields win should a payload ever carry a colliding key; absent
/// envelope fields flatten to explicit nulls so every record has the same
/// envelope columns.
pub fn normalize_event(event: &Event) -> Result<Map<String, Value>> {
    let payload = match &event.payload {
        Payload::Decrypted(payload) => payload,
        Payload::Encrypted(_) => {
            return Err(VaultError::Serialization(
                "cannot normalize an event with an encrypted payload".to_string(),
            ));
        }
    };
    let mut flat = match serde_json::to_value(payload)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    flat.insert(
        FIELD_ACCOUNT_ID.to_string(),
        event
            .account_id
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    flat.insert(
        FIELD_EVENT_ID.to_string(),
        Value::String(event.event_id.clone()),
    );
    flat.insert(
        FIELD_SECRET_ID.to_string(),
        event
            .secret_id
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    Ok(flat)
}

/// Inverse of [`normalize_event`]: splits the envelope fields back out and
/// wraps everything else up as the decrypted payload.
pub fn denormalize_event(mut flat: Map<String, Value>) -> Result<Event> {
    let account_id = take_string(&mut flat, FIELD_ACCOUNT_ID);
    let event_id = take_string(&mut flat, FIELD_EVENT_ID)
        .ok_or_else(|| VaultError::CorruptAggregate("record is missing an event id".to_string()))?;
    let secret_id = take_string(&mut flat, FIELD_SECRET_ID);
    let payload = serde_json::from_value(Value::Object(flat))?;
    Ok(Event {
        account_id,
        event_id,
        secret_id,
        payload: Payload::Decrypted(payload),
    })
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key) {
        Some(Value::String(value)) => Some(value),
        _ => None,
    }
}

fn canonicalize_url(raw: &str) -> Option<String> {
    let scheme_end = raw.find("://")?;
    let rest = &raw[scheme_end + 3..];
    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let (authority, tail) = rest.split_at(authority_end);
    if authority.is_empty() {
        return None;
    }
    let (path, suffix) = match tail.find(['?', '#']) {
        Some(idx) => tail.split_at(idx),
        None => (tail, ""),
    };
    let mut normalized = String::with_capacity(raw.len() + 1);
    normalized.push_str(&raw[..scheme_end + 3]);
    normalized.push_str(authority);
    normalized.push_str(path);
    if !path.ends_with('/') {
        normalized.push('/');
    }
    normalized.push_str(suffix);
    Some(normalized)
}
