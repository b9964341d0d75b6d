//! Inbound bearer-token authentication.
//!
//! A request flows through these pieces in order:
//!
//! - [`middleware::authorize_request`] pulls the token from `Authorization`
//!   or `x-api-key`.
//! - [`TokenValidator`] decodes it, checks the issuer against the trust list,
//!   resolves the signing key through [`KeySetCache`], verifies the RS256
//!   signature, and checks the time window and scope.
//! - The resulting [`VerifiedIdentity`] is wrapped in an [`AuthContext`] and
//!   attached to the request (stateless) or to the connection through a
//!   [`ConnectionAuthStore`] (stateful).
//!
//! Every validation failure is answered with the same `-32003` body; the
//! precise [`ValidationError`] only goes to the log.

mod context;
pub mod jwks;
pub mod middleware;
mod token;
mod validator;

pub use context::{AuthContext, ConnectionAuthStore, ConnectionLease};
pub use jwks::{
    DEFAULT_CACHE_TTL_SECONDS, DEFAULT_DISCOVERY_PATH, KeyFetchError, KeySetCache, KeySetConfig,
    SigningKey,
};
pub use middleware::{RpcErrorResponse, authorize_request, extract_credential, protect};
pub use token::{DecodeError, DecodedToken, TokenHeader, TokenPayload};
pub use validator::{
    DEFAULT_REQUIRED_SCOPE, TokenValidator, ValidationError, ValidatorConfig, VerifiedIdentity,
};
