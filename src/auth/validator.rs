//! Bearer token verification.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, Validation, decode};
use tracing::debug;

use crate::auth::jwks::{KeyFetchError, KeySetCache};
use crate::auth::token::DecodedToken;
use crate::types::{BearerToken, Issuer, ScopeSet, Subject};

/// Scope every MCP caller must hold unless configured otherwise.
pub const DEFAULT_REQUIRED_SCOPE: &str = "mcp:tools";

/// The only accepted signature algorithm.
const ALLOWED_ALGORITHM: &str = "RS256";

/// Token validation settings.
#[derive(Debug, Clone)]
pub struct ValidatorConfig {
    /// Issuers whose keys may be fetched. A token from any other issuer is
    /// rejected before any network call.
    pub trusted_issuers: Vec<Issuer>,
    /// Expected `aud` value, if audience checking is enabled.
    pub audience: Option<String>,
    /// Scope enforced by [`TokenValidator::authenticate`].
    pub required_scope: Option<String>,
    /// Clock skew tolerance in seconds for `exp`/`nbf`. Zero by default.
    pub leeway_seconds: i64,
}

impl ValidatorConfig {
    pub fn new(trusted_issuers: Vec<Issuer>) -> Self {
        Self {
            trusted_issuers,
            audience: None,
            required_scope: Some(DEFAULT_REQUIRED_SCOPE.to_string()),
            leeway_seconds: 0,
        }
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    pub fn with_required_scope(mut self, scope: Option<String>) -> Self {
        self.required_scope = scope;
        self
    }

    pub fn with_leeway_seconds(mut self, leeway: i64) -> Self {
        self.leeway_seconds = leeway;
        self
    }

    fn trusts(&self, issuer: &Issuer) -> bool {
        self.trusted_issuers
            .iter()
            .any(|trusted| trusted.matches(issuer.as_str()))
    }
}

/// Why a token was rejected. Callers only ever see a generic failure; the
/// variant is for logs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Malformed token: {0}")]
    Malformed(String),
    #[error("Token has no issuer")]
    MissingIssuer,
    #[error("Token header has no key id")]
    MissingKeyId,
    #[error("Untrusted issuer: {0}")]
    UntrustedIssuer(Issuer),
    #[error("Signing key unavailable: {0}")]
    KeyUnavailable(#[from] KeyFetchError),
    #[error("Signature invalid: {0}")]
    SignatureInvalid(String),
    #[error("Token expired")]
    Expired,
    #[error("Token not yet valid")]
    NotYetValid,
    #[error("Token audience does not match")]
    AudienceMismatch,
    #[error("Missing required scope: {0}")]
    InsufficientScope(String),
}

impl ValidationError {
    /// Short stable name for log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Malformed(_) => "malformed",
            Self::MissingIssuer => "missing_issuer",
            Self::MissingKeyId => "missing_key_id",
            Self::UntrustedIssuer(_) => "untrusted_issuer",
            Self::KeyUnavailable(_) => "key_unavailable",
            Self::SignatureInvalid(_) => "signature_invalid",
            Self::Expired => "expired",
            Self::NotYetValid => "not_yet_valid",
            Self::AudienceMismatch => "audience_mismatch",
            Self::InsufficientScope(_) => "insufficient_scope",
        }
    }
}

/// Identity established by a successful validation.
///
/// Only [`TokenValidator`] constructs this type, so holding one proves the
/// signature, time window and scope checks passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    subject: Subject,
    issuer: Issuer,
    scopes: ScopeSet,
    raw_token: BearerToken,
    verified_at: DateTime<Utc>,
    expires_at: i64,
}

impl VerifiedIdentity {
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn issuer(&self) -> &Issuer {
        &self.issuer
    }

    pub fn scopes(&self) -> &ScopeSet {
        &self.scopes
    }

    /// The token this identity was verified from.
    pub fn raw_token(&self) -> &BearerToken {
        &self.raw_token
    }

    pub fn verified_at(&self) -> DateTime<Utc> {
        self.verified_at
    }

    /// `exp` of the underlying token, seconds since the epoch.
    pub fn expires_at(&self) -> i64 {
        self.expires_at
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at <= now
    }

    #[cfg(test)]
    pub(crate) fn for_tests(subject: &str, raw_token: &str, expires_at: i64) -> Self {
        Self {
            subject: Subject::new(subject),
            issuer: Issuer::new("https://issuer.test/v2.0"),
            scopes: ScopeSet::from_delimited(DEFAULT_REQUIRED_SCOPE),
            raw_token: BearerToken::new(raw_token),
            verified_at: Utc::now(),
            expires_at,
        }
    }
}

/// Verifies bearer tokens against the issuer's published keys.
pub struct TokenValidator {
    config: ValidatorConfig,
    keys: Arc<KeySetCache>,
}

impl TokenValidator {
    pub fn new(config: ValidatorConfig, keys: Arc<KeySetCache>) -> Self {
        Self { config, keys }
    }

    pub fn config(&self) -> &ValidatorConfig {
        &self.config
    }

    /// Validate with the configured required scope.
    pub async fn authenticate(&self, raw: &str) -> Result<VerifiedIdentity, ValidationError> {
        self.validate(raw, self.config.required_scope.as_deref())
            .await
    }

    /// Decode, verify and scope-check `raw`.
    ///
    /// Each call depends only on its inputs and the key cache; nothing is
    /// retried.
    pub async fn validate(
        &self,
        raw: &str,
        required_scope: Option<&str>,
    ) -> Result<VerifiedIdentity, ValidationError> {
        let decoded =
            DecodedToken::decode(raw).map_err(|e| ValidationError::Malformed(e.to_string()))?;

        let issuer = decoded
            .payload
            .issuer
            .clone()
            .ok_or(ValidationError::MissingIssuer)?;
        let kid = decoded
            .header
            .key_id
            .clone()
            .ok_or(ValidationError::MissingKeyId)?;

        if !self.config.trusts(&issuer) {
            return Err(ValidationError::UntrustedIssuer(issuer));
        }

        let key = self.keys.get_signing_key(&issuer, &kid).await?;

        if decoded.header.algorithm != ALLOWED_ALGORITHM {
            return Err(ValidationError::SignatureInvalid(format!(
                "algorithm {} is not allowed",
                decoded.header.algorithm
            )));
        }
        verify_signature(raw, &key.decoding_key)?;

        let now = Utc::now();
        let now_ts = now.timestamp();
        let leeway = self.config.leeway_seconds;

        let expires_at = decoded
            .payload
            .expires_at
            .ok_or_else(|| ValidationError::Malformed("missing exp claim".to_string()))?;
        if expires_at.saturating_add(leeway) <= now_ts {
            return Err(ValidationError::Expired);
        }
        if let Some(nbf) = decoded.payload.not_before
            && nbf.saturating_sub(leeway) > now_ts
        {
            return Err(ValidationError::NotYetValid);
        }

        if let Some(audience) = &self.config.audience
            && !decoded.payload.audience.iter().any(|a| a == audience)
        {
            return Err(ValidationError::AudienceMismatch);
        }

        if let Some(scope) = required_scope
            && !decoded.payload.scopes.contains(scope)
        {
            return Err(ValidationError::InsufficientScope(scope.to_string()));
        }

        let subject = decoded
            .payload
            .subject
            .ok_or_else(|| ValidationError::Malformed("missing sub claim".to_string()))?;

        debug!(subject = %subject, issuer = %issuer, kid = %kid, "Token verified");

        Ok(VerifiedIdentity {
            subject,
            issuer,
            scopes: decoded.payload.scopes,
            raw_token: BearerToken::new(raw),
            verified_at: now,
            expires_at,
        })
    }
}

/// Check the RS256 signature only; time and audience checks are done by the
/// caller so each failure maps to its own error.
fn verify_signature(
    raw: &str,
    key: &jsonwebtoken::DecodingKey,
) -> Result<(), ValidationError> {
    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    decode::<serde_json::Value>(raw, key, &validation)
        .map(|_| ())
        .map_err(|e| ValidationError::SignatureInvalid(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwks::KeySetConfig;
    use crate::test_support::*;
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup() -> (MockServer, TokenValidator, String) {
        let server = MockServer::start().await;
        mount_key_set(&server, trusted_key_set(), None).await;
        let issuer = issuer_for(&server);
        let validator = validator_for(ValidatorConfig::new(vec![Issuer::new(&issuer)]));
        (server, validator, issuer)
    }

    fn validator_for(config: ValidatorConfig) -> TokenValidator {
        let keys = KeySetCache::new(KeySetConfig::default(), reqwest::Client::new());
        TokenValidator::new(config, Arc::new(keys))
    }

    #[tokio::test]
    async fn test_valid_token_yields_identity() {
        let (_server, validator, issuer) = setup().await;
        let raw = trusted_token(&claims(&issuer, "user-1", "mcp:tools User.Read"));

        let identity = validator.authenticate(&raw).await.unwrap();
        assert_eq!(identity.subject().as_str(), "user-1");
        assert!(identity.issuer().matches(&issuer));
        assert!(identity.scopes().contains("mcp:tools"));
        assert!(identity.scopes().contains("User.Read"));
        assert_eq!(identity.raw_token().expose(), raw);
        assert!(!identity.is_expired_at(now()));
    }

    #[tokio::test]
    async fn test_identity_claims_round_trip_decoded_claims() {
        let (_server, validator, issuer) = setup().await;
        let raw = trusted_token(&claims(&issuer, "user-1", "mcp:tools Files.Read"));

        let decoded = DecodedToken::decode(&raw).unwrap();
        let identity = validator.authenticate(&raw).await.unwrap();

        assert_eq!(Some(identity.issuer().clone()), decoded.payload.issuer);
        assert_eq!(Some(identity.subject().clone()), decoded.payload.subject);
        assert_eq!(identity.scopes(), &decoded.payload.scopes);
        assert_eq!(Some(identity.expires_at()), decoded.payload.expires_at);
    }

    #[tokio::test]
    async fn test_scope_array_claim_accepted() {
        let (_server, validator, issuer) = setup().await;
        let mut c = claims(&issuer, "user-1", "");
        c["scp"] = json!(["User.Read", "mcp:tools"]);

        let identity = validator.authenticate(&trusted_token(&c)).await.unwrap();
        assert!(identity.scopes().contains("mcp:tools"));
    }

    #[tokio::test]
    async fn test_expired_token_rejected() {
        let (_server, validator, issuer) = setup().await;
        let mut c = claims(&issuer, "user-1", "mcp:tools");
        c["exp"] = json!(now() - 60);
        c["nbf"] = json!(now() - 3600);

        let err = validator
            .authenticate(&trusted_token(&c))
            .await
            .unwrap_err();
        assert_eq!(err, ValidationError::Expired);
    }

    #[tokio::test]
    async fn test_exp_equal_to_now_is_expired() {
        let (_server, validator, issuer) = setup().await;
        let mut c = claims(&issuer, "user-1", "mcp:tools");
        c["exp"] = json!(now());

        let err = validator
            .authenticate(&trusted_token(&c))
            .await
            .unwrap_err();
        assert_eq!(err, ValidationError::Expired);
    }

    #[tokio::test]
    async fn test_leeway_tolerates_small_skew() {
        let server = MockServer::start().await;
        mount_key_set(&server, trusted_key_set(), None).await;
        let issuer = issuer_for(&server);
        let validator = validator_for(
            ValidatorConfig::new(vec![Issuer::new(&issuer)]).with_leeway_seconds(120),
        );

        let mut c = claims(&issuer, "user-1", "mcp:tools");
        c["exp"] = json!(now() - 30);
        assert!(validator.authenticate(&trusted_token(&c)).await.is_ok());
    }

    #[tokio::test]
    async fn test_extreme_time_claims_do_not_overflow() {
        let server = MockServer::start().await;
        mount_key_set(&server, trusted_key_set(), None).await;
        let issuer = issuer_for(&server);
        let validator = validator_for(
            ValidatorConfig::new(vec![Issuer::new(&issuer)]).with_leeway_seconds(120),
        );

        let mut c = claims(&issuer, "user-1", "mcp:tools");
        c["exp"] = json!(i64::MAX);
        c["nbf"] = json!(i64::MIN);
        assert!(validator.authenticate(&trusted_token(&c)).await.is_ok());

        let mut c = claims(&issuer, "user-1", "mcp:tools");
        c["exp"] = json!(i64::MIN);
        let err = validator
            .authenticate(&trusted_token(&c))
            .await
            .unwrap_err();
        assert_eq!(err, ValidationError::Expired);

        let mut c = claims(&issuer, "user-1", "mcp:tools");
        c["nbf"] = json!(i64::MAX);
        let err = validator
            .authenticate(&trusted_token(&c))
            .await
            .unwrap_err();
        assert_eq!(err, ValidationError::NotYetValid);
    }

    #[tokio::test]
    async fn test_not_yet_valid_token_rejected() {
        let (_server, validator, issuer) = setup().await;
        let mut c = claims(&issuer, "user-1", "mcp:tools");
        c["nbf"] = json!(now() + 600);

        let err = validator
            .authenticate(&trusted_token(&c))
            .await
            .unwrap_err();
        assert_eq!(err, ValidationError::NotYetValid);
    }

    #[tokio::test]
    async fn test_missing_scope_rejected() {
        let (_server, validator, issuer) = setup().await;
        let raw = trusted_token(&claims(&issuer, "user-1", "User.Read"));

        let err = validator.authenticate(&raw).await.unwrap_err();
        assert_eq!(err, ValidationError::InsufficientScope("mcp:tools".to_string()));
    }

    #[tokio::test]
    async fn test_explicit_scope_overrides_configured() {
        let (_server, validator, issuer) = setup().await;
        let raw = trusted_token(&claims(&issuer, "user-1", "User.Read"));

        assert!(validator.validate(&raw, Some("User.Read")).await.is_ok());
        assert!(validator.validate(&raw, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_signing_key() {
        let (_server, validator, issuer) = setup().await;
        let raw = sign(
            ROGUE_PRIVATE_KEY,
            Some(ROGUE_KID),
            &claims(&issuer, "user-1", "mcp:tools"),
        );

        let err = validator.authenticate(&raw).await.unwrap_err();
        assert_eq!(
            err,
            ValidationError::KeyUnavailable(KeyFetchError::UnknownKey(ROGUE_KID.into()))
        );
    }

    #[tokio::test]
    async fn test_forged_signature_with_trusted_kid() {
        let (_server, validator, issuer) = setup().await;
        let raw = sign(
            ROGUE_PRIVATE_KEY,
            Some(TEST_KID),
            &claims(&issuer, "user-1", "mcp:tools"),
        );

        let err = validator.authenticate(&raw).await.unwrap_err();
        assert!(matches!(err, ValidationError::SignatureInvalid(_)));
    }

    #[tokio::test]
    async fn test_hmac_algorithm_confusion_rejected() {
        let (_server, validator, issuer) = setup().await;
        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(TEST_KID.to_string());
        let raw = encode(
            &header,
            &claims(&issuer, "user-1", "mcp:tools"),
            &EncodingKey::from_secret(TRUSTED_MODULUS.as_bytes()),
        )
        .unwrap();

        let err = validator.authenticate(&raw).await.unwrap_err();
        assert!(matches!(err, ValidationError::SignatureInvalid(_)));
    }

    #[tokio::test]
    async fn test_alg_none_rejected() {
        let (_server, validator, issuer) = setup().await;
        let header = URL_SAFE_NO_PAD.encode(json!({"alg": "none", "kid": TEST_KID}).to_string());
        let payload =
            URL_SAFE_NO_PAD.encode(claims(&issuer, "user-1", "mcp:tools").to_string());
        let raw = format!("{}.{}.", header, payload);

        let err = validator.authenticate(&raw).await.unwrap_err();
        assert!(matches!(err, ValidationError::SignatureInvalid(_)));
    }

    #[tokio::test]
    async fn test_untrusted_issuer_never_fetches_keys() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(trusted_key_set()))
            .expect(0)
            .mount(&server)
            .await;
        let issuer = issuer_for(&server);
        let validator = validator_for(ValidatorConfig::new(vec![Issuer::new(
            "https://login.example.com/other/v2.0",
        )]));

        let raw = trusted_token(&claims(&issuer, "user-1", "mcp:tools"));
        let err = validator.authenticate(&raw).await.unwrap_err();
        assert!(matches!(err, ValidationError::UntrustedIssuer(_)));
    }

    #[tokio::test]
    async fn test_missing_issuer_and_kid() {
        let (_server, validator, issuer) = setup().await;

        let mut c = claims(&issuer, "user-1", "mcp:tools");
        c.as_object_mut().unwrap().remove("iss");
        let err = validator
            .authenticate(&trusted_token(&c))
            .await
            .unwrap_err();
        assert_eq!(err, ValidationError::MissingIssuer);

        let raw = sign(
            TRUSTED_PRIVATE_KEY,
            None,
            &claims(&issuer, "user-1", "mcp:tools"),
        );
        let err = validator.authenticate(&raw).await.unwrap_err();
        assert_eq!(err, ValidationError::MissingKeyId);
    }

    #[tokio::test]
    async fn test_malformed_tokens() {
        let (_server, validator, _issuer) = setup().await;
        for raw in ["", "not-a-jwt", "a.b", "a.b.c.d", "!!!.???.sig"] {
            let err = validator.authenticate(raw).await.unwrap_err();
            assert!(matches!(err, ValidationError::Malformed(_)), "{raw}: {err:?}");
        }
    }

    #[tokio::test]
    async fn test_audience_enforced_when_configured() {
        let server = MockServer::start().await;
        mount_key_set(&server, trusted_key_set(), None).await;
        let issuer = issuer_for(&server);
        let validator = validator_for(
            ValidatorConfig::new(vec![Issuer::new(&issuer)]).with_audience("api://someone-else"),
        );

        let raw = trusted_token(&claims(&issuer, "user-1", "mcp:tools"));
        let err = validator.authenticate(&raw).await.unwrap_err();
        assert_eq!(err, ValidationError::AudienceMismatch);
    }

    #[tokio::test]
    async fn test_key_endpoint_down_is_key_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(key_set_path()))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let issuer = issuer_for(&server);
        let validator = validator_for(ValidatorConfig::new(vec![Issuer::new(&issuer)]));

        let raw = trusted_token(&claims(&issuer, "user-1", "mcp:tools"));
        let err = validator.authenticate(&raw).await.unwrap_err();
        assert!(matches!(
            err,
            ValidationError::KeyUnavailable(KeyFetchError::Unreachable(_))
        ));
        assert_eq!(err.kind(), "key_unavailable");
    }
}
