//! Authentication context for the lifetime of a request or connection.
//!
//! Two scopings are provided:
//!
//! - **Per request** (stateless servers): the validation middleware attaches
//!   an [`AuthContext`] to the request's extensions. It travels with that
//!   request only and is dropped with it, so concurrent requests can never
//!   observe each other's identity.
//! - **Per connection** (stateful servers): a [`ConnectionAuthStore`] maps
//!   connection ids to contexts. Entries are owned by a [`ConnectionLease`]
//!   that removes them when dropped, on every exit path.

use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use http::Extensions;
use http::request::Parts;
use tracing::debug;

use crate::auth::middleware::RpcErrorResponse;
use crate::auth::validator::VerifiedIdentity;
use crate::types::{BearerToken, ConnectionId, Subject};

/// Verified identity plus where it is attached.
///
/// Created by the validation middleware, read by handlers, discarded when the
/// request or connection ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    identity: VerifiedIdentity,
    connection_id: Option<ConnectionId>,
}

impl AuthContext {
    pub fn new(identity: VerifiedIdentity) -> Self {
        Self {
            identity,
            connection_id: None,
        }
    }

    pub fn with_connection(mut self, connection_id: ConnectionId) -> Self {
        self.connection_id = Some(connection_id);
        self
    }

    pub fn identity(&self) -> &VerifiedIdentity {
        &self.identity
    }

    pub fn subject(&self) -> &Subject {
        self.identity.subject()
    }

    pub fn raw_token(&self) -> &BearerToken {
        self.identity.raw_token()
    }

    pub fn connection_id(&self) -> Option<&ConnectionId> {
        self.connection_id.as_ref()
    }

    /// Attach this context to a single request.
    pub fn attach(self, extensions: &mut Extensions) {
        extensions.insert(self);
    }

    /// The context attached to this request, if any.
    pub fn from_extensions(extensions: &Extensions) -> Option<&AuthContext> {
        extensions.get::<AuthContext>()
    }
}

/// Handlers behind the validation middleware can take `AuthContext` directly.
impl<S> FromRequestParts<S> for AuthContext
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        AuthContext::from_extensions(&parts.extensions)
            .cloned()
            .ok_or_else(|| RpcErrorResponse::token_required().into_response())
    }
}

/// Connection-scoped contexts for stateful servers.
///
/// Cheap to clone; all clones share the same table.
#[derive(Debug, Clone, Default)]
pub struct ConnectionAuthStore {
    entries: Arc<DashMap<ConnectionId, AuthContext>>,
}

impl ConnectionAuthStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `context` for `connection_id`, replacing any previous entry.
    pub fn set(&self, connection_id: &ConnectionId, context: AuthContext) {
        let context = context.with_connection(connection_id.clone());
        self.entries.insert(connection_id.clone(), context);
    }

    pub fn get(&self, connection_id: &ConnectionId) -> Option<AuthContext> {
        self.entries
            .get(connection_id)
            .map(|entry| entry.value().clone())
    }

    /// Remove the entry for `connection_id`, returning it if present.
    pub fn clear(&self, connection_id: &ConnectionId) -> Option<AuthContext> {
        self.entries.remove(connection_id).map(|(_, ctx)| ctx)
    }

    /// Store `context` and return a lease that clears it when dropped.
    pub fn bind(&self, connection_id: ConnectionId, context: AuthContext) -> ConnectionLease {
        let subject = context.subject().clone();
        self.set(&connection_id, context);
        debug!(connection_id = %connection_id, subject = %subject, "Connection authenticated");
        ConnectionLease {
            store: self.clone(),
            connection_id,
            subject,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ownership of one connection's entry in a [`ConnectionAuthStore`].
///
/// The lease is bound to the subject that authenticated the connection.
/// Dropping it (normal close, error, panic unwind, task abort) removes the
/// entry.
#[derive(Debug)]
pub struct ConnectionLease {
    store: ConnectionAuthStore,
    connection_id: ConnectionId,
    subject: Subject,
}

impl ConnectionLease {
    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection_id
    }

    /// Subject the connection was bound to.
    pub fn subject(&self) -> &Subject {
        &self.subject
    }

    pub fn context(&self) -> Option<AuthContext> {
        self.store.get(&self.connection_id)
    }

    /// Replace the stored context with a newer token for the same subject.
    ///
    /// Returns `false`, leaving the entry untouched, when `context` belongs
    /// to a different subject.
    pub fn refresh(&self, context: AuthContext) -> bool {
        if context.subject() != &self.subject {
            return false;
        }
        self.store.set(&self.connection_id, context);
        true
    }
}

impl Drop for ConnectionLease {
    fn drop(&mut self) {
        if self.store.clear(&self.connection_id).is_some() {
            debug!(connection_id = %self.connection_id, "Connection context cleared");
        }
    }
}
