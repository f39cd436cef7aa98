// # Gateway adapter
//
// Client for the remote-access gateway's REST API. `GatewayApi` is the seam
// the rest of the core talks through; the Guacamole implementation hides
// token handling and the circuit breaker behind it.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;

pub mod client;
pub mod recording;

pub use client::GuacamoleClient;

/// One entry of the gateway's active-connection listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActiveConnection {
    /// Catalog entry the tunnel is attached to.
    #[serde(rename = "connectionIdentifier")]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[async_trait]
pub trait GatewayApi: Send + Sync {
    /// Usernames known to the gateway.
    async fn list_users(&self) -> Result<Vec<String>>;

    /// Group names the user belongs to.
    async fn user_groups(&self, username: &str) -> Result<Vec<String>>;

    /// Create a VNC catalog entry and return its identifier.
    async fn create_connection(
        &self,
        name: &str,
        host: &str,
        port: u16,
        password: &str,
        username: &str,
    ) -> Result<String>;

    /// Point an existing catalog entry at a new endpoint.
    async fn update_connection(
        &self,
        connection_id: &str,
        host: &str,
        port: u16,
        password: &str,
    ) -> Result<()>;

    /// Grant the user READ access to a catalog entry.
    async fn grant_permission(&self, username: &str, connection_id: &str) -> Result<()>;

    /// Delete a catalog entry; already-gone entries are success.
    async fn delete_connection(&self, connection_id: &str) -> Result<()>;

    /// Currently active tunnels, keyed by active-connection id.
    async fn list_active_connections(&self) -> Result<HashMap<String, ActiveConnection>>;

    /// Create the one-time "home" placeholder entry for a user. Idempotent:
    /// returns `None` when it already exists, and degrades to `None` on any
    /// failure rather than blocking provisioning.
    async fn create_home_placeholder(&self, username: &str) -> Result<Option<String>>;

    /// Rewrite a catalog entry's name and recording parameters from current
    /// config. Best-effort single attempt.
    async fn sync_connection_config(&self, connection_id: &str, username: &str) -> bool;
}
