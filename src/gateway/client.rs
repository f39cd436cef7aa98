// # Guacamole REST client
//
// All data-plane calls share one code path: acquire a token (refreshing
// when close to expiry), issue the request with the token as a query
// parameter, re-authenticate exactly once on 403, and surface anything
// else non-2xx as an upstream error. Every logical call runs through the
// gateway's circuit breaker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{BrokerError, Result};
use crate::gateway::recording::apply_recording;
use crate::gateway::{ActiveConnection, GatewayApi};
use crate::resilience::CircuitBreaker;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Gateway tokens live about an hour; refresh well before that.
const TOKEN_LIFETIME: Duration = Duration::from_secs(3500);
const REFRESH_MARGIN: Duration = Duration::from_secs(60);
const DEFAULT_DATA_SOURCE: &str = "postgresql";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(rename = "authToken")]
    auth_token: String,
    #[serde(rename = "availableDataSources", default)]
    available_data_sources: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct CreatedConnection {
    identifier: String,
}

#[derive(Clone)]
struct TokenState {
    token: String,
    data_source: String,
    expires_at: Instant,
}

pub struct GuacamoleClient {
    http: reqwest::Client,
    base_url: String,
    admin_user: String,
    admin_password: String,
    settings: Arc<Settings>,
    token: Mutex<Option<TokenState>>,
    breaker: Arc<CircuitBreaker>,
}

impl GuacamoleClient {
    pub fn new(settings: Arc<Settings>, breaker: Arc<CircuitBreaker>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BrokerError::Http(format!("gateway client: {e}")))?;
        Ok(Self {
            http,
            base_url: settings.guacamole.url.trim_end_matches('/').to_string(),
            admin_user: settings.guacamole.admin_user.clone(),
            admin_password: settings.guacamole.admin_password.clone(),
            settings,
            token: Mutex::new(None),
            breaker,
        })
    }

    async fn authenticate(&self) -> Result<TokenState> {
        let response = self
            .http
            .post(format!("{}/api/tokens", self.base_url))
            .form(&[
                ("username", self.admin_user.as_str()),
                ("password", self.admin_password.as_str()),
            ])
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::FORBIDDEN || status == StatusCode::UNAUTHORIZED {
            return Err(BrokerError::Forbidden(
                "gateway rejected admin credentials".into(),
            ));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BrokerError::Upstream {
                status: status.as_u16(),
                body,
            });
        }
        let token: TokenResponse = response.json().await?;
        let data_source = token
            .available_data_sources
            .first()
            .cloned()
            .unwrap_or_else(|| DEFAULT_DATA_SOURCE.to_string());
        info!("authenticated against gateway (data source {data_source})");
        Ok(TokenState {
            token: token.auth_token,
            data_source,
            expires_at: Instant::now() + TOKEN_LIFETIME,
        })
    }

    /// Token refresh is serialized behind the mutex; racing callers reuse
    /// whatever a concurrent refresh produced.
    async fn ensure_token(&self) -> Result<(String, String)> {
        let mut guard = self.token.lock().await;
        if let Some(state) = guard.as_ref() {
            if state.expires_at > Instant::now() + REFRESH_MARGIN {
                return Ok((state.token.clone(), state.data_source.clone()));
            }
        }
        let state = self.authenticate().await?;
        let result = (state.token.clone(), state.data_source.clone());
        *guard = Some(state);
        Ok(result)
    }

    /// Drop a token observed to be invalid. Comparing against the cached
    /// value keeps a racing caller from discarding a fresher token.
    async fn invalidate_token(&self, seen: &str) {
        let mut guard = self.token.lock().await;
        if guard.as_ref().is_some_and(|state| state.token == seen) {
            *guard = None;
        }
    }

    /// One data-plane request with the 403-retry policy, through the
    /// breaker. Statuses in `tolerate` are returned to the caller instead
    /// of failing.
    async fn data_request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        tolerate: &[StatusCode],
    ) -> Result<reqwest::Response> {
        self.breaker
            .call(async {
                let mut retried = false;
                loop {
                    let (token, data_source) = self.ensure_token().await?;
                    let url = format!(
                        "{}/api/session/data/{}/{}",
                        self.base_url, data_source, path
                    );
                    let mut request = self
                        .http
                        .request(method.clone(), &url)
                        .query(&[("token", token.as_str())]);
                    if let Some(body) = body {
                        request = request.json(body);
                    }
                    let response = request.send().await?;
                    let status = response.status();

                    if status == StatusCode::FORBIDDEN {
                        if retried {
                            return Err(BrokerError::Forbidden(format!("{method} {path}")));
                        }
                        debug!("403 on {method} {path}, re-authenticating once");
                        retried = true;
                        self.invalidate_token(&token).await;
                        continue;
                    }
                    if status.is_success() || tolerate.contains(&status) {
                        return Ok(response);
                    }
                    let body_text = response.text().await.unwrap_or_default();
                    return Err(BrokerError::Upstream {
                        status: status.as_u16(),
                        body: body_text,
                    });
                }
            })
            .await
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.data_request(Method::GET, path, None, &[]).await?;
        Ok(response.json().await?)
    }

    async fn try_create_home(&self, connection_name: &str, username: &str) -> Result<Option<String>> {
        let connections: HashMap<String, Value> = self.get_json("connections").await?;
        let exists = connections
            .values()
            .any(|c| c.get("name").and_then(Value::as_str) == Some(connection_name));
        if exists {
            return Ok(None);
        }

        // Points at an unavailable endpoint on purpose; its only job is to
        // make the gateway show the home screen instead of auto-connecting.
        let body = json!({
            "parentIdentifier": "ROOT",
            "name": connection_name,
            "protocol": "vnc",
            "parameters": {
                "hostname": "localhost",
                "port": "1",
                "read-only": "true"
            },
            "attributes": {
                "max-connections": "0",
                "max-connections-per-user": "0",
                "failover-only": "true"
            }
        });
        let created: CreatedConnection = self
            .data_request(Method::POST, "connections", Some(&body), &[])
            .await?
            .json()
            .await?;
        self.grant_permission(username, &created.identifier).await?;
        Ok(Some(created.identifier))
    }
}

#[async_trait::async_trait]
impl GatewayApi for GuacamoleClient {
    async fn list_users(&self) -> Result<Vec<String>> {
        let users: HashMap<String, Value> = self.get_json("users").await?;
        Ok(users.into_keys().collect())
    }

    async fn user_groups(&self, username: &str) -> Result<Vec<String>> {
        self.get_json(&format!("users/{username}/userGroups")).await
    }

    async fn create_connection(
        &self,
        name: &str,
        host: &str,
        port: u16,
        password: &str,
        username: &str,
    ) -> Result<String> {
        let mut parameters = Map::new();
        parameters.insert("hostname".into(), json!(host));
        parameters.insert("port".into(), json!(port.to_string()));
        parameters.insert("password".into(), json!(password));
        parameters.insert("color-depth".into(), json!("24"));
        parameters.insert("clipboard-encoding".into(), json!("UTF-8"));
        parameters.insert("resize-method".into(), json!("display-update"));
        apply_recording(&mut parameters, &self.settings.guacamole.recording, username);

        let body = json!({
            "parentIdentifier": "ROOT",
            "name": name,
            "protocol": "vnc",
            "parameters": parameters,
            "attributes": {"max-connections": "1", "max-connections-per-user": "1"}
        });
        let created: CreatedConnection = self
            .data_request(Method::POST, "connections", Some(&body), &[])
            .await?
            .json()
            .await?;
        Ok(created.identifier)
    }

    async fn update_connection(
        &self,
        connection_id: &str,
        host: &str,
        port: u16,
        password: &str,
    ) -> Result<()> {
        // The gateway returns the connection and its parameters separately;
        // both are merged back into the PUT body.
        let mut connection: Value = self.get_json(&format!("connections/{connection_id}")).await?;
        let mut parameters: Map<String, Value> = self
            .get_json(&format!("connections/{connection_id}/parameters"))
            .await?;
        parameters.insert("hostname".into(), json!(host));
        parameters.insert("port".into(), json!(port.to_string()));
        parameters.insert("password".into(), json!(password));
        connection["parameters"] = Value::Object(parameters);

        self.data_request(
            Method::PUT,
            &format!("connections/{connection_id}"),
            Some(&connection),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn grant_permission(&self, username: &str, connection_id: &str) -> Result<()> {
        let body = json!([{
            "op": "add",
            "path": format!("/connectionPermissions/{connection_id}"),
            "value": "READ"
        }]);
        self.data_request(
            Method::PATCH,
            &format!("users/{username}/permissions"),
            Some(&body),
            &[],
        )
        .await?;
        Ok(())
    }

    async fn delete_connection(&self, connection_id: &str) -> Result<()> {
        self.data_request(
            Method::DELETE,
            &format!("connections/{connection_id}"),
            None,
            &[StatusCode::NOT_FOUND],
        )
        .await?;
        Ok(())
    }

    async fn list_active_connections(&self) -> Result<HashMap<String, ActiveConnection>> {
        self.get_json("activeConnections").await
    }

    async fn create_home_placeholder(&self, username: &str) -> Result<Option<String>> {
        let connection_name = format!(
            "{} - {username}",
            self.settings.guacamole.home_connection_name
        );
        match self.try_create_home(&connection_name, username).await {
            Ok(created) => Ok(created),
            Err(e) => {
                warn!("could not create home connection for {username}: {e}");
                Ok(None)
            }
        }
    }

    async fn sync_connection_config(&self, connection_id: &str, username: &str) -> bool {
        let result: Result<()> = async {
            let mut connection: Value =
                self.get_json(&format!("connections/{connection_id}")).await?;
            let mut parameters: Map<String, Value> = self
                .get_json(&format!("connections/{connection_id}/parameters"))
                .await?;

            connection["name"] = json!(self.settings.containers.connection_name);
            apply_recording(&mut parameters, &self.settings.guacamole.recording, username);
            connection["parameters"] = Value::Object(parameters);

            self.data_request(
                Method::PUT,
                &format!("connections/{connection_id}"),
                Some(&connection),
                &[],
            )
            .await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                info!("synced config for connection {connection_id} (user: {username})");
                true
            }
            Err(e) => {
                warn!("failed to sync config for connection {connection_id}: {e}");
                false
            }
        }
    }
}
