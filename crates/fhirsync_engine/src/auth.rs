//! Authenticated connections to a remote FHIR server.
//!
//! Token issuance, refresh and revocation live outside the engine. The
//! engine only asks an [`Authenticator`] for the client of the current
//! connection before every pass.

use crate::error::EngineResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::fmt;

/// A link to one remote FHIR source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    /// Stable connection ID.
    pub id: String,
    /// FHIR base URL.
    pub server_url: String,
    /// Patient the connection is scoped to.
    pub patient_id: Option<String>,
}

impl Connection {
    /// Creates a connection.
    pub fn new(id: impl Into<String>, server_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            server_url: server_url.into(),
            patient_id: None,
        }
    }

    /// Scopes the connection to a patient.
    pub fn with_patient(mut self, patient_id: impl Into<String>) -> Self {
        self.patient_id = Some(patient_id.into());
        self
    }
}

/// Opaque bearer token. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(String);

impl AccessToken {
    /// Wraps a raw token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Returns the raw token for an `Authorization` header.
    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

/// A connection together with usable credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedClient {
    /// The connection.
    pub connection: Connection,
    /// Token for the connection.
    pub access_token: AccessToken,
}

impl AuthenticatedClient {
    /// Creates an authenticated client.
    pub fn new(connection: Connection, access_token: AccessToken) -> Self {
        Self {
            connection,
            access_token,
        }
    }

    /// Returns the connection ID.
    pub fn connection_id(&self) -> &str {
        &self.connection.id
    }
}

/// Supplies the authenticated client for the current connection.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Returns the current client, or `None` when signed out.
    async fn authenticated_client(&self) -> EngineResult<Option<AuthenticatedClient>>;
}

/// An authenticator holding a fixed client that can be revoked.
#[derive(Debug, Default)]
pub struct StaticAuthenticator {
    client: RwLock<Option<AuthenticatedClient>>,
}

impl StaticAuthenticator {
    /// Creates an authenticator for a client.
    pub fn new(client: AuthenticatedClient) -> Self {
        Self {
            client: RwLock::new(Some(client)),
        }
    }

    /// Creates an authenticator with no connection.
    pub fn signed_out() -> Self {
        Self::default()
    }

    /// Drops the client, as a logout or revocation would.
    pub fn revoke(&self) {
        *self.client.write() = None;
    }

    /// Replaces the client.
    pub fn set_client(&self, client: AuthenticatedClient) {
        *self.client.write() = Some(client);
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticated_client(&self) -> EngineResult<Option<AuthenticatedClient>> {
        Ok(self.client.read().clone())
    }
}
