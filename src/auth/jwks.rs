//! Issuer signing-key discovery and caching.
//!
//! Keys are fetched from `<issuer><discovery_path>` and cached per issuer.
//! Concurrent callers that miss the cache for the same issuer share a single
//! outstanding fetch and all observe its result.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use jsonwebtoken::DecodingKey;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use url::Url;

use crate::types::{Issuer, KeyId};

/// Default cache TTL in seconds (24 hours).
pub const DEFAULT_CACHE_TTL_SECONDS: u64 = 86_400;

/// Default timeout for a single key-set fetch.
pub const DEFAULT_FETCH_TIMEOUT_SECONDS: u64 = 30;

/// Minimum spacing between refetches triggered by an unknown `kid`.
pub const DEFAULT_MIN_REFRESH_INTERVAL_SECONDS: u64 = 10;

/// Path appended to the issuer to locate its published key set.
pub const DEFAULT_DISCOVERY_PATH: &str = "/discovery/v2.0/keys";

/// Key cache configuration.
#[derive(Debug, Clone)]
pub struct KeySetConfig {
    pub cache_ttl: Duration,
    pub fetch_timeout: Duration,
    /// A fresh cache is not refetched for an unknown `kid` more often than this.
    pub min_refresh_interval: Duration,
    pub discovery_path: String,
}

impl Default for KeySetConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(DEFAULT_CACHE_TTL_SECONDS),
            fetch_timeout: Duration::from_secs(DEFAULT_FETCH_TIMEOUT_SECONDS),
            min_refresh_interval: Duration::from_secs(DEFAULT_MIN_REFRESH_INTERVAL_SECONDS),
            discovery_path: DEFAULT_DISCOVERY_PATH.to_string(),
        }
    }
}

/// A single JSON Web Key from a key set document.
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key type (e.g., "RSA")
    pub kty: String,
    /// Key ID, matched against the token header `kid`
    pub kid: Option<String>,
    /// Algorithm (e.g., "RS256")
    pub alg: Option<String>,
    /// Key use (e.g., "sig" for signature)
    #[serde(rename = "use")]
    pub key_use: Option<String>,
    /// RSA modulus (base64url encoded)
    pub n: Option<String>,
    /// RSA exponent (base64url encoded)
    pub e: Option<String>,
}

/// A key set document containing multiple keys.
#[derive(Debug, Clone, Deserialize)]
pub struct JwksDocument {
    pub keys: Vec<Jwk>,
}

/// A verified public signing key. Immutable once fetched; a refresh replaces
/// the whole set rather than mutating entries.
#[derive(Clone)]
pub struct SigningKey {
    pub key_id: KeyId,
    pub issuer: Issuer,
    pub decoding_key: DecodingKey,
    pub fetched_at: Instant,
}

impl fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKey")
            .field("key_id", &self.key_id)
            .field("issuer", &self.issuer)
            .field("fetched_at", &self.fetched_at)
            .finish_non_exhaustive()
    }
}

/// Errors that can occur when resolving a signing key.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyFetchError {
    /// The key set was fetched but does not contain the requested key.
    #[error("Key not found: {0}")]
    UnknownKey(KeyId),
    /// Network failure, timeout or non-success status from the key endpoint.
    #[error("Key endpoint unreachable: {0}")]
    Unreachable(String),
    /// The endpoint answered but the document was unusable.
    #[error("Invalid key set response: {0}")]
    InvalidResponse(String),
    #[error("Invalid discovery URL: {0}")]
    InvalidDiscoveryUrl(String),
}

/// All keys published by one issuer at one point in time.
#[derive(Debug)]
struct IssuerKeys {
    keys: HashMap<KeyId, Arc<SigningKey>>,
    fetched_at: Instant,
}

type FetchResult = Result<Arc<IssuerKeys>, KeyFetchError>;
type InFlightFetch = Shared<BoxFuture<'static, FetchResult>>;

/// Thread-safe, per-issuer signing key cache.
pub struct KeySetCache {
    config: KeySetConfig,
    /// Last successful fetch per issuer.
    issuers: RwLock<HashMap<Issuer, Arc<IssuerKeys>>>,
    /// Outstanding fetches, at most one per issuer.
    in_flight: Mutex<HashMap<Issuer, InFlightFetch>>,
    client: reqwest::Client,
}

impl KeySetCache {
    /// Create a new cache using `client` for discovery requests.
    pub fn new(config: KeySetConfig, client: reqwest::Client) -> Self {
        Self {
            config,
            issuers: RwLock::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            client,
        }
    }

    /// Resolve the signing key `kid` published by `issuer`.
    ///
    /// Serves from cache while the issuer's set is younger than the TTL.
    /// A miss or an expired set triggers a (shared) fetch.
    pub async fn get_signing_key(
        &self,
        issuer: &Issuer,
        kid: &KeyId,
    ) -> Result<Arc<SigningKey>, KeyFetchError> {
        if let Some(set) = self.cached(issuer).await {
            let age = set.fetched_at.elapsed();
            if age < self.config.cache_ttl {
                if let Some(key) = set.keys.get(kid) {
                    return Ok(key.clone());
                }
                if age < self.config.min_refresh_interval {
                    debug!(issuer = %issuer, kid = %kid, "Unknown key on recently fetched set");
                    return Err(KeyFetchError::UnknownKey(kid.clone()));
                }
                debug!(issuer = %issuer, kid = %kid, "Key not cached, refreshing key set");
            }
        }

        let set = self.refresh(issuer).await?;
        set.keys
            .get(kid)
            .cloned()
            .ok_or_else(|| KeyFetchError::UnknownKey(kid.clone()))
    }

    async fn cached(&self, issuer: &Issuer) -> Option<Arc<IssuerKeys>> {
        self.issuers.read().await.get(issuer).cloned()
    }

    /// Fetch the issuer's key set, joining an in-flight fetch if one exists.
    async fn refresh(&self, issuer: &Issuer) -> FetchResult {
        let fetch = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(issuer) {
                Some(fetch) => fetch.clone(),
                None => {
                    let url = self.discovery_url(issuer)?;
                    let fetch = fetch_key_set(
                        self.client.clone(),
                        url,
                        issuer.clone(),
                        self.config.fetch_timeout,
                    )
                    .boxed()
                    .shared();
                    in_flight.insert(issuer.clone(), fetch.clone());
                    fetch
                }
            }
        };

        let result = fetch.clone().await;

        {
            let mut in_flight = self.in_flight.lock().await;
            if in_flight.get(issuer).is_some_and(|f| f.ptr_eq(&fetch)) {
                in_flight.remove(issuer);
            }
        }

        if let Ok(set) = &result {
            let mut issuers = self.issuers.write().await;
            let newer = issuers
                .get(issuer)
                .is_none_or(|existing| existing.fetched_at <= set.fetched_at);
            if newer {
                issuers.insert(issuer.clone(), set.clone());
            }
        }

        result
    }

    fn discovery_url(&self, issuer: &Issuer) -> Result<Url, KeyFetchError> {
        let raw = format!(
            "{}{}",
            issuer.as_str().trim_end_matches('/'),
            self.config.discovery_path
        );
        Url::parse(&raw).map_err(|e| KeyFetchError::InvalidDiscoveryUrl(format!("{}: {}", raw, e)))
    }

    /// Number of keys cached for `issuer`.
    pub async fn key_count(&self, issuer: &Issuer) -> usize {
        self.cached(issuer).await.map_or(0, |set| set.keys.len())
    }

    /// Drop all cached sets.
    pub async fn clear(&self) {
        self.issuers.write().await.clear();
    }
}

async fn fetch_key_set(
    client: reqwest::Client,
    url: Url,
    issuer: Issuer,
    timeout: Duration,
) -> FetchResult {
    debug!(issuer = %issuer, url = %url, "Fetching signing keys");

    let response = client
        .get(url.clone())
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| {
            if e.is_timeout() {
                KeyFetchError::Unreachable(format!("timed out after {:?}", timeout))
            } else {
                KeyFetchError::Unreachable(e.to_string())
            }
        })?;

    if !response.status().is_success() {
        return Err(KeyFetchError::Unreachable(format!(
            "HTTP {} from key endpoint",
            response.status()
        )));
    }

    let document: JwksDocument = response
        .json()
        .await
        .map_err(|e| KeyFetchError::InvalidResponse(e.to_string()))?;

    let fetched_at = Instant::now();
    let mut keys = HashMap::new();

    for jwk in document.keys {
        // Only RSA signature keys for RS256.
        if jwk.kty != "RSA" {
            debug!("Skipping non-RSA key: {:?}", jwk.kty);
            continue;
        }
        if jwk.key_use.as_deref() == Some("enc") {
            debug!("Skipping encryption key");
            continue;
        }
        if jwk.alg.as_deref().is_some_and(|alg| alg != "RS256") {
            debug!("Skipping key with alg {:?}", jwk.alg);
            continue;
        }
        let Some(kid) = jwk.kid.clone().filter(|k| !k.is_empty()) else {
            debug!("Skipping key without kid");
            continue;
        };

        match jwk_to_decoding_key(&jwk) {
            Ok(decoding_key) => {
                let key_id = KeyId::new(kid);
                keys.insert(
                    key_id.clone(),
                    Arc::new(SigningKey {
                        key_id,
                        issuer: issuer.clone(),
                        decoding_key,
                        fetched_at,
                    }),
                );
            }
            Err(e) => warn!(issuer = %issuer, kid = %kid, "Failed to parse JWK: {}", e),
        }
    }

    if keys.is_empty() {
        return Err(KeyFetchError::InvalidResponse(
            "no usable signing keys in key set".to_string(),
        ));
    }

    debug!(issuer = %issuer, count = keys.len(), "Cached signing keys");
    Ok(Arc::new(IssuerKeys { keys, fetched_at }))
}

/// Convert a JWK to a jsonwebtoken DecodingKey from its RSA components.
fn jwk_to_decoding_key(jwk: &Jwk) -> Result<DecodingKey, KeyFetchError> {
    let n = jwk
        .n
        .as_ref()
        .ok_or_else(|| KeyFetchError::InvalidResponse("Missing 'n' in RSA key".to_string()))?;
    let e = jwk
        .e
        .as_ref()
        .ok_or_else(|| KeyFetchError::InvalidResponse("Missing 'e' in RSA key".to_string()))?;

    DecodingKey::from_rsa_components(n, e)
        .map_err(|e| KeyFetchError::InvalidResponse(format!("Invalid RSA components: {}", e)))
}
