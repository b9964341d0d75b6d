//! Unverified decoding of compact JWTs.
//!
//! [`DecodedToken::decode`] only parses; nothing it returns may be trusted
//! until [`TokenValidator`](super::TokenValidator) has checked the signature.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::Deserialize;

use crate::types::{Issuer, KeyId, ScopeSet, Subject};

/// JOSE header fields we care about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenHeader {
    /// Declared signature algorithm (`alg`), verbatim.
    pub algorithm: String,
    pub key_id: Option<KeyId>,
}

/// Registered and scope claims, normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPayload {
    pub issuer: Option<Issuer>,
    pub subject: Option<Subject>,
    pub scopes: ScopeSet,
    /// `exp`, seconds since the epoch.
    pub expires_at: Option<i64>,
    /// `nbf`, seconds since the epoch.
    pub not_before: Option<i64>,
    pub audience: Vec<String>,
}

/// A parsed, *unverified* token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedToken {
    pub header: TokenHeader,
    pub payload: TokenPayload,
}

/// Structural decoding failure. Reported as `Malformed` by the validator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("expected 3 dot-separated segments, found {0}")]
    SegmentCount(usize),
    #[error("{segment} segment is not valid base64url: {reason}")]
    Base64 {
        segment: &'static str,
        reason: String,
    },
    #[error("{segment} segment is not valid JSON: {reason}")]
    Json {
        segment: &'static str,
        reason: String,
    },
}

/// A claim that may be a single string or an array of strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    fn into_scopes(self) -> ScopeSet {
        match self {
            Self::One(raw) => ScopeSet::from_delimited(&raw),
            Self::Many(list) => list.into_iter().collect(),
        }
    }

    fn into_list(self) -> Vec<String> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(list) => list,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawHeader {
    alg: String,
    kid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPayload {
    iss: Option<String>,
    sub: Option<String>,
    scp: Option<StringOrList>,
    scope: Option<StringOrList>,
    exp: Option<i64>,
    nbf: Option<i64>,
    aud: Option<StringOrList>,
}

impl DecodedToken {
    /// Split and parse a compact token without checking its signature.
    pub fn decode(raw: &str) -> Result<Self, DecodeError> {
        let segments: Vec<&str> = raw.split('.').collect();
        let [header, payload, _signature] = segments.as_slice() else {
            return Err(DecodeError::SegmentCount(segments.len()));
        };

        let header: RawHeader = decode_segment("header", header)?;
        let payload: RawPayload = decode_segment("payload", payload)?;

        // `scp` carries delegated permissions; `scope` is the RFC 8693/9068 name.
        let scopes = payload
            .scp
            .or(payload.scope)
            .map(StringOrList::into_scopes)
            .unwrap_or_default();

        Ok(Self {
            header: TokenHeader {
                algorithm: header.alg,
                key_id: header.kid.filter(|k| !k.is_empty()).map(KeyId::new),
            },
            payload: TokenPayload {
                issuer: payload.iss.filter(|i| !i.is_empty()).map(Issuer::new),
                subject: payload.sub.map(Subject::new),
                scopes,
                expires_at: payload.exp,
                not_before: payload.nbf,
                audience: payload.aud.map(StringOrList::into_list).unwrap_or_default(),
            },
        })
    }
}

fn decode_segment<T: serde::de::DeserializeOwned>(
    segment: &'static str,
    encoded: &str,
) -> Result<T, DecodeError> {
    let bytes = URL_SAFE_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|e| DecodeError::Base64 {
            segment,
            reason: e.to_string(),
        })?;
    serde_json::from_slice(&bytes).map_err(|e| DecodeError::Json {
        segment,
        reason: e.to_string(),
    })
}
