//! Delegated access to downstream APIs.
//!
//! A handler that wants to call a protected API for the current user builds
//! an [`OnBehalfOfCredential`] from the request's verified identity and hands
//! it to an [`AuthenticatedClient`](crate::api_client::AuthenticatedClient).
//! The credential runs an on-behalf-of exchange through the shared
//! [`DelegationExchanger`] when the client asks for a token.

mod exchanger;
mod provider;

pub use exchanger::{
    DEFAULT_AUTHORITY_HOST, DEFAULT_EXCHANGE_TIMEOUT_SECONDS, DelegatedToken, DelegationConfig,
    DelegationError, DelegationExchanger, DelegationRequest, OnBehalfOfCredential,
};
pub use provider::{AccessToken, StaticTokenProvider, TokenFuture, TokenProvider};
