use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use super::{SnapshotSource, UpstreamError};

/// Deribit HTTP client. Holds the cached bearer token and its expiry, so
/// every private call refreshes on demand instead of going through shared
/// mutable globals.
pub struct DeribitClient {
    http: reqwest::Client,
    base: String,
    credentials: Option<Credentials>,
    token: Mutex<Option<BearerToken>>,
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: String,
}

impl Credentials {
    /// Read `CLIENT_ID` / `API_KEY` from the environment. Returns `None`
    /// when either is unset; public endpoints work without them.
    pub fn from_env() -> Option<Self> {
        let client_id = std::env::var("CLIENT_ID").ok()?;
        let client_secret = std::env::var("API_KEY").ok()?;
        Some(Self {
            client_id,
            client_secret,
        })
    }
}

struct BearerToken {
    access_token: String,
    acquired_at: Instant,
    expires_in: Duration,
}

impl BearerToken {
    fn is_expired(&self) -> bool {
        self.acquired_at.elapsed() >= self.expires_in
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
pub struct AuthResult {
    pub access_token: String,
    #[serde(default = "default_expiry_secs")]
    pub expires_in: u64,
}

fn default_expiry_secs() -> u64 {
    900
}

#[derive(Debug, Clone, Copy)]
pub enum OrderDirection {
    Buy,
    Sell,
}

impl OrderDirection {
    fn as_str(self) -> &'static str {
        match self {
            OrderDirection::Buy => "buy",
            OrderDirection::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub instrument_name: String,
    pub amount: u64,
    /// Deribit order type, e.g. `market` or `limit`.
    pub kind: String,
    pub label: Option<String>,
}

impl DeribitClient {
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.into(),
            credentials: None,
            token: Mutex::new(None),
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base.trim_end_matches('/'), path)
    }

    /// Return a valid bearer token, refreshing via `public/auth` when the
    /// cached one is missing or expired.
    pub async fn bearer_token(&self) -> Result<String, UpstreamError> {
        {
            let cached = self.token.lock();
            if let Some(tok) = cached.as_ref() {
                if !tok.is_expired() {
                    return Ok(tok.access_token.clone());
                }
            }
        }

        let creds = self
            .credentials
            .as_ref()
            .ok_or(UpstreamError::MissingCredentials)?;
        let response = self
            .get_json(
                "public/auth",
                &[
                    ("client_id", creds.client_id.clone()),
                    ("client_secret", creds.client_secret.clone()),
                    ("grant_type", "client_credentials".to_string()),
                ],
                None,
            )
            .await?;

        let auth = parse_auth(&response)?;
        info!(expires_in = auth.expires_in, "acquired new bearer token");

        let access_token = auth.access_token.clone();
        *self.token.lock() = Some(BearerToken {
            access_token: auth.access_token,
            acquired_at: Instant::now(),
            expires_in: Duration::from_secs(auth.expires_in),
        });
        Ok(access_token)
    }

    /// Raw order-book snapshot, the payload the relay pushes to clients.
    pub async fn order_book_raw(
        &self,
        instrument: &str,
        depth: u32,
    ) -> Result<String, UpstreamError> {
        let response = self
            .http
            .get(self.endpoint("public/get_order_book"))
            .query(&[
                ("instrument_name", instrument.to_string()),
                ("depth", depth.to_string()),
            ])
            .send()
            .await?
            .error_for_status()?;
        Ok(response.text().await?)
    }

    pub async fn place_order(
        &self,
        direction: OrderDirection,
        order: &OrderRequest,
    ) -> Result<Value, UpstreamError> {
        let token = self.bearer_token().await?;
        let mut query = vec![
            ("amount", order.amount.to_string()),
            ("instrument_name", order.instrument_name.clone()),
            ("type", order.kind.clone()),
        ];
        if let Some(label) = &order.label {
            query.push(("label", label.clone()));
        }
        self.get_json(&format!("private/{}", direction.as_str()), &query, Some(&token))
            .await
    }

    pub async fn edit_order(
        &self,
        order_id: &str,
        amount: u64,
        price: f64,
        advanced: Option<&str>,
    ) -> Result<Value, UpstreamError> {
        let token = self.bearer_token().await?;
        let mut query = vec![
            ("order_id", order_id.to_string()),
            ("amount", amount.to_string()),
            ("price", price.to_string()),
        ];
        if let Some(advanced) = advanced {
            query.push(("advanced", advanced.to_string()));
        }
        self.get_json("private/edit", &query, Some(&token)).await
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<Value, UpstreamError> {
        let token = self.bearer_token().await?;
        self.get_json(
            "private/cancel",
            &[("order_id", order_id.to_string())],
            Some(&token),
        )
        .await
    }

    pub async fn positions(&self, currency: &str, kind: &str) -> Result<Value, UpstreamError> {
        let token = self.bearer_token().await?;
        self.get_json(
            "private/get_positions",
            &[
                ("currency", currency.to_string()),
                ("kind", kind.to_string()),
            ],
            Some(&token),
        )
        .await
    }

    async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
        bearer: Option<&str>,
    ) -> Result<Value, UpstreamError> {
        let mut request = self.http.get(self.endpoint(path)).query(query);
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        let body: Value = response.json().await?;
        if !status.is_success() {
            return Err(UpstreamError::Api {
                status,
                message: api_error_message(&body),
            });
        }
        Ok(body)
    }
}

#[async_trait]
impl SnapshotSource for DeribitClient {
    async fn fetch_snapshot(&self, instrument: &str, depth: u32) -> Result<String, UpstreamError> {
        self.order_book_raw(instrument, depth).await
    }
}

fn parse_auth(response: &Value) -> Result<AuthResult, UpstreamError> {
    serde_json::from_value(response["result"].clone()).map_err(|_| UpstreamError::Auth)
}

fn api_error_message(body: &Value) -> String {
    body["error"]["message"]
        .as_str()
        .unwrap_or("unknown error")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn endpoint_joins_base_and_path() {
        let client = DeribitClient::new("https://test.deribit.com/api/v2/");
        assert_eq!(
            client.endpoint("public/get_order_book"),
            "https://test.deribit.com/api/v2/public/get_order_book"
        );
    }

    #[test]
    fn parse_auth_reads_token_and_expiry() {
        let body = json!({
            "result": { "access_token": "tok-123", "expires_in": 300 }
        });
        let auth = parse_auth(&body).unwrap();
        assert_eq!(auth.access_token, "tok-123");
        assert_eq!(auth.expires_in, 300);
    }

    #[test]
    fn parse_auth_defaults_expiry_when_absent() {
        let body = json!({ "result": { "access_token": "tok" } });
        assert_eq!(parse_auth(&body).unwrap().expires_in, 900);
    }

    #[test]
    fn parse_auth_rejects_missing_token() {
        let body = json!({ "error": { "message": "invalid_credentials" } });
        assert!(matches!(parse_auth(&body), Err(UpstreamError::Auth)));
    }

    #[test]
    fn expired_token_forces_refresh_path() {
        let token = BearerToken {
            access_token: "tok".to_string(),
            acquired_at: Instant::now(),
            expires_in: Duration::ZERO,
        };
        assert!(token.is_expired());

        let fresh = BearerToken {
            access_token: "tok".to_string(),
            acquired_at: Instant::now(),
            expires_in: Duration::from_secs(900),
        };
        assert!(!fresh.is_expired());
    }

    #[test]
    fn api_error_message_falls_back_on_shapeless_bodies() {
        assert_eq!(
            api_error_message(&json!({"error": {"message": "order not found"}})),
            "order not found"
        );
        assert_eq!(api_error_message(&json!({"result": []})), "unknown error");
    }
}
