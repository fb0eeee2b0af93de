//! Cache entry snapshot and its storage encoding.
//!
//! Entries are stored as JSON. The expiry is written as an RFC 3339 UTC
//! timestamp with nanosecond precision and the body as standard base64, so
//! a decoded entry is byte-for-byte the one that was encoded.

use std::time::Duration;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::{OffsetDateTime, UtcOffset};

/// Header multimap in first-appearance order: one pair per distinct name,
/// values in the order they were set.
pub type HeaderList = Vec<(String, Vec<String>)>;

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("failed to encode cache entry: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode cache entry: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("stored status `{0}` is not a valid HTTP status code")]
    InvalidStatus(u16),
    #[error("header `{name}` carries a value that is not valid UTF-8")]
    NonUtf8Header { name: String },
}

/// A captured response as persisted in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    pub status: u16,
    pub headers: HeaderList,
    #[serde(with = "base64_body")]
    pub body: Bytes,
}

impl CacheEntry {
    /// Snapshot a response.
    ///
    /// Fails when a header value is not UTF-8; such responses are not
    /// representable in the stored format and are simply not cached.
    pub fn from_parts(
        status: StatusCode,
        headers: &HeaderMap,
        body: Bytes,
        expires_at: OffsetDateTime,
    ) -> Result<Self, EntryError> {
        let mut list: HeaderList = Vec::with_capacity(headers.keys_len());
        for name in headers.keys() {
            let mut values = Vec::new();
            for value in headers.get_all(name) {
                let text = std::str::from_utf8(value.as_bytes()).map_err(|_| {
                    EntryError::NonUtf8Header {
                        name: name.to_string(),
                    }
                })?;
                values.push(text.to_string());
            }
            list.push((name.to_string(), values));
        }

        Ok(Self {
            expires_at: expires_at.to_offset(UtcOffset::UTC),
            status: status.as_u16(),
            headers: list,
            body,
        })
    }

    pub fn is_expired(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }

    /// Time left before expiry, zero once expired.
    pub fn remaining_ttl(&self, now: OffsetDateTime) -> Duration {
        Duration::try_from(self.expires_at - now).unwrap_or(Duration::ZERO)
    }

    /// `Cache-Control` value advertising the remaining freshness.
    pub fn max_age_header(&self, now: OffsetDateTime) -> String {
        format!("max-age={}", self.remaining_ttl(now).as_secs())
    }

    /// Rebuild the stored response: status, every header value in order,
    /// and the exact body bytes.
    pub fn into_response(self) -> Response {
        let mut builder = Response::builder().status(self.status);

        if let Some(headers) = builder.headers_mut() {
            for (name, values) in self.headers {
                let Ok(name) = HeaderName::from_bytes(name.as_bytes()) else {
                    continue;
                };
                for value in values {
                    if let Ok(value) = HeaderValue::from_str(&value) {
                        headers.append(name.clone(), value);
                    }
                }
            }
        }

        builder
            .body(Body::from(self.body))
            .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
    }
}

/// Encode an entry into its storage representation.
pub fn encode(entry: &CacheEntry) -> Result<Vec<u8>, EntryError> {
    serde_json::to_vec(entry).map_err(EntryError::Encode)
}

/// Decode a stored entry. Malformed or truncated input is an error that
/// callers treat as a miss.
pub fn decode(bytes: &[u8]) -> Result<CacheEntry, EntryError> {
    let mut entry: CacheEntry = serde_json::from_slice(bytes).map_err(EntryError::Decode)?;
    StatusCode::from_u16(entry.status).map_err(|_| EntryError::InvalidStatus(entry.status))?;
    entry.expires_at = entry.expires_at.to_offset(UtcOffset::UTC);
    Ok(entry)
}

mod base64_body {
    use base64::{Engine, engine::general_purpose::STANDARD};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer, de::Error as _};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use axum::http::header::{CACHE_CONTROL, CONTENT_TYPE, SET_COOKIE};
    use http_body_util::BodyExt;
    use time::macros::datetime;

    use super::*;

    fn sample_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/octet-stream"));
        headers.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        headers.insert("x-trace", HeaderValue::from_static("abc"));
        headers
    }

    fn sample_entry() -> CacheEntry {
        CacheEntry::from_parts(
            StatusCode::CREATED,
            &sample_headers(),
            Bytes::from_static(&[0, 159, 146, 150, 255, b'\n', 0]),
            datetime!(2030-01-02 03:04:05.123456789 +2),
        )
        .expect("snapshot")
    }

    #[test]
    fn encode_decode_preserves_everything() {
        let entry = sample_entry();
        let decoded = decode(&encode(&entry).expect("encode")).expect("decode");

        assert_eq!(decoded, entry);
        assert_eq!(decoded.status, 201);
        assert_eq!(decoded.body.as_ref(), &[0, 159, 146, 150, 255, b'\n', 0]);
        assert_eq!(
            decoded.expires_at,
            datetime!(2030-01-02 01:04:05.123456789 UTC)
        );
        assert_eq!(decoded.expires_at.offset(), UtcOffset::UTC);

        let cookies = decoded
            .headers
            .iter()
            .find(|(name, _)| name == "set-cookie")
            .map(|(_, values)| values.clone())
            .expect("set-cookie present");
        assert_eq!(cookies, vec!["a=1".to_string(), "b=2".to_string()]);
    }

    #[test]
    fn expiry_is_written_as_utc_rfc3339() {
        let encoded = encode(&sample_entry()).expect("encode");
        let text = String::from_utf8(encoded).expect("json is utf-8");
        assert!(
            text.contains("\"2030-01-02T01:04:05.123456789Z\""),
            "unexpected encoding: {text}"
        );
    }

    #[test]
    fn truncated_input_is_a_decode_error() {
        let encoded = encode(&sample_entry()).expect("encode");
        let truncated = &encoded[..encoded.len() / 2];
        assert!(matches!(decode(truncated), Err(EntryError::Decode(_))));
        assert!(matches!(decode(b"not json"), Err(EntryError::Decode(_))));
        assert!(matches!(decode(b""), Err(EntryError::Decode(_))));
    }

    #[test]
    fn invalid_base64_body_is_a_decode_error() {
        let raw = br#"{"expires_at":"2030-01-01T00:00:00Z","status":200,"headers":[],"body":"@@@"}"#;
        assert!(matches!(decode(raw), Err(EntryError::Decode(_))));
    }

    #[test]
    fn out_of_range_status_is_rejected() {
        let raw = br#"{"expires_at":"2030-01-01T00:00:00Z","status":42,"headers":[],"body":""}"#;
        assert!(matches!(decode(raw), Err(EntryError::InvalidStatus(42))));
    }

    #[test]
    fn non_utf8_header_values_are_not_representable() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-binary",
            HeaderValue::from_bytes(&[0xff, 0xfe]).expect("opaque header value"),
        );

        let err = CacheEntry::from_parts(
            StatusCode::OK,
            &headers,
            Bytes::new(),
            OffsetDateTime::now_utc(),
        )
        .expect_err("non utf-8 header");
        assert!(matches!(err, EntryError::NonUtf8Header { name } if name == "x-binary"));
    }

    #[test]
    fn remaining_ttl_saturates_at_zero() {
        let now = datetime!(2030-01-01 00:00:00 UTC);
        let entry = CacheEntry {
            expires_at: datetime!(2030-01-01 00:00:30.9 UTC),
            status: 200,
            headers: Vec::new(),
            body: Bytes::new(),
        };

        assert_eq!(entry.max_age_header(now), "max-age=30");
        assert!(!entry.is_expired(now));

        let later = datetime!(2030-01-01 00:01:00 UTC);
        assert_eq!(entry.remaining_ttl(later), Duration::ZERO);
        assert_eq!(entry.max_age_header(later), "max-age=0");
        assert!(entry.is_expired(later));
    }

    #[tokio::test]
    async fn into_response_replays_status_headers_and_body() {
        let mut headers = sample_headers();
        headers.insert(CACHE_CONTROL, HeaderValue::from_static("max-age=60"));
        let entry = CacheEntry::from_parts(
            StatusCode::ACCEPTED,
            &headers,
            Bytes::from_static(b"payload"),
            OffsetDateTime::now_utc(),
        )
        .expect("snapshot");

        let response = entry.into_response();
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        let cookies: Vec<_> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .map(|value| value.to_str().unwrap().to_string())
            .collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(response.headers()[CACHE_CONTROL], "max-age=60");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(b"payload"));
    }
}
