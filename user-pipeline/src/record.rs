use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::DecodeError;
use crate::types::SourcePosition;

/// Placeholder date written by upstream extracts when the birth date is unknown
pub const UNKNOWN_DOB: &str = "0000-00-00";
pub const DOB_FORMAT: &str = "%Y-%m-%d";

/// Identity of a record at the sink. Upserts are keyed on it, so redelivered
/// records overwrite themselves.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKey {
    Int(i64),
    Str(String),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Int(id) => write!(f, "{id}"),
            RecordKey::Str(id) => f.write_str(id),
        }
    }
}

pub trait Identified {
    fn identity(&self) -> RecordKey;
}

/// Payload types the stream reader can build from raw message bytes. Decoding
/// includes validation and normalization, so anything returned is ready for a sink.
pub trait Decode: Sized {
    fn decode(payload: &[u8]) -> Result<Self, DecodeError>;
}

/// A decoded message together with where it came from. Immutable once built.
#[derive(Debug, Clone)]
pub struct Record<T> {
    key: RecordKey,
    position: SourcePosition,
    payload: T,
    size_bytes: usize,
}

impl<T: Identified> Record<T> {
    pub fn new(position: SourcePosition, payload: T, size_bytes: usize) -> Self {
        Self {
            key: payload.identity(),
            position,
            payload,
            size_bytes,
        }
    }
}

impl<T> Record<T> {
    pub fn key(&self) -> &RecordKey {
        &self.key
    }

    pub fn position(&self) -> &SourcePosition {
        &self.position
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Size of the serialized message this record was decoded from
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn into_payload(self) -> T {
        self.payload
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lon: f64,
    pub lat: f64,
}

/// A user profile as carried on the users topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dob: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caption: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<i32>,
}

impl User {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            email: None,
            dob: None,
            weight: None,
            height: None,
            nickname: None,
            country: None,
            city: None,
            caption: None,
            location: None,
            gender: None,
        }
    }

    /// Rewrites placeholder and unreadable birth dates to absent. The rest of
    /// the user is kept either way.
    pub fn normalize(mut self) -> Self {
        self.dob = match self.dob.take() {
            None => None,
            Some(dob) if dob == UNKNOWN_DOB || dob.is_empty() => None,
            Some(dob) if NaiveDate::parse_from_str(&dob, DOB_FORMAT).is_err() => {
                warn!(id = self.id, dob = %dob, "dropping unreadable birth date");
                None
            }
            Some(dob) => Some(dob),
        };
        self
    }

    pub fn date_of_birth(&self) -> Option<NaiveDate> {
        self.dob
            .as_deref()
            .and_then(|dob| NaiveDate::parse_from_str(dob, DOB_FORMAT).ok())
    }
}

impl Identified for User {
    fn identity(&self) -> RecordKey {
        RecordKey::Int(self.id)
    }
}

impl Decode for User {
    fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        if payload.is_empty() {
            return Err(DecodeError::EmptyPayload);
        }
        Ok(serde_json::from_slice::<User>(payload)?.normalize())
    }
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Partition;

    #[test]
    fn decodes_full_user() {
        let payload = br#"{"id":42,"email":"a@b.c","dob":"1990-01-31","weight":70,"height":180,
            "nickname":"neo","country":3,"city":"Zion","caption":"hi",
            "location":{"lon":13.4,"lat":52.5},"gender":1}"#;
        let user = User::decode(payload).unwrap();

        assert_eq!(user.id, 42);
        assert_eq!(user.email.as_deref(), Some("a@b.c"));
        assert_eq!(user.dob.as_deref(), Some("1990-01-31"));
        assert_eq!(
            user.date_of_birth(),
            NaiveDate::from_ymd_opt(1990, 1, 31)
        );
        assert_eq!(user.location, Some(Location { lon: 13.4, lat: 52.5 }));
        assert_eq!(user.identity(), RecordKey::Int(42));
    }

    #[test]
    fn unknown_dob_becomes_absent() {
        let user = User::decode(br#"{"id":7,"dob":"0000-00-00"}"#).unwrap();
        assert_eq!(user.dob, None);

        let encoded = String::from_utf8(encode(&user).unwrap()).unwrap();
        assert!(!encoded.contains("0000-00-00"));
        assert_eq!(encoded, r#"{"id":7}"#);
    }

    #[test]
    fn encode_then_decode_keeps_identity_and_normalizes() {
        let mut user = User::new(99);
        user.dob = Some(UNKNOWN_DOB.to_string());
        user.nickname = Some("trinity".to_string());

        let decoded = User::decode(&encode(&user).unwrap()).unwrap();
        assert_eq!(decoded.identity(), user.identity());
        assert_eq!(decoded.dob, None);
        assert_eq!(decoded.nickname, user.nickname);
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert!(matches!(
            User::decode(b""),
            Err(DecodeError::EmptyPayload)
        ));
        assert!(matches!(
            User::decode(b"not json"),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            User::decode(br#"{"email":"missing@id"}"#),
            Err(DecodeError::Malformed(_))
        ));
        assert!(matches!(
            User::decode(br#"{"id":"seven"}"#),
            Err(DecodeError::Malformed(_))
        ));
    }

    #[test]
    fn unreadable_dob_is_cleared_and_the_user_kept() {
        let user = User::decode(br#"{"id":1,"dob":"31/01/1990","nickname":"morpheus"}"#).unwrap();
        assert_eq!(user.id, 1);
        assert_eq!(user.dob, None);
        assert_eq!(user.nickname.as_deref(), Some("morpheus"));

        let user = User::decode(br#"{"id":2,"dob":"1990-02-30"}"#).unwrap();
        assert_eq!(user.dob, None);
    }

    #[test]
    fn record_carries_key_and_position() {
        let position = SourcePosition::new(Partition::new("users", 2), 17);
        let record = Record::new(position.clone(), User::new(5), 12);

        assert_eq!(record.key(), &RecordKey::Int(5));
        assert_eq!(record.key().to_string(), "5");
        assert_eq!(record.position(), &position);
        assert_eq!(record.size_bytes(), 12);
        assert_eq!(record.into_payload(), User::new(5));
    }
}
