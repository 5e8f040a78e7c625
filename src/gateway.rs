use crate::config::BackendConfig;
use crate::error::{Result, SafetyError};
use crate::types::{DangerZone, GeoPoint, Severity, TrustedContact};
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use std::time::Duration;

const AUTH_HEADER: &str = "x-auth-token";

/// Error/ack body the backend sends as `{"msg": "..."}`
#[derive(Debug, Deserialize)]
struct MessageBody {
    msg: Option<String>,
}

#[derive(Debug, Serialize)]
struct LocationBody {
    latitude: f64,
    longitude: f64,
}

#[derive(Debug, Deserialize)]
struct LocationAck {
    location: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct TokenBody<'a> {
    token: &'a str,
}

/// Wire shape of `GET /api/dangerzones`
#[derive(Debug, Deserialize)]
struct ZoneRecord {
    #[serde(rename = "_id")]
    id: String,
    /// `[lat, lng]` pairs
    coordinates: Vec<[f64; 2]>,
    #[serde(default)]
    severity: Option<String>,
}

impl ZoneRecord {
    fn into_zone(self) -> Option<DangerZone> {
        let severity = match self.severity.as_deref().map(Severity::parse) {
            Some(Some(severity)) => severity,
            Some(None) | None => {
                log::warn!(
                    "Zone {} has unknown severity {:?}, treating as medium",
                    self.id,
                    self.severity
                );
                Severity::Medium
            }
        };
        let ring = self
            .coordinates
            .iter()
            .map(|[lat, lng]| GeoPoint::new(*lat, *lng))
            .collect();
        DangerZone::new(self.id, ring, severity)
    }
}

/// Body for contact create/update
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContactPayload {
    pub name: String,
    pub phone: String,
    pub email: String,
}

/// Typed client for the safety backend
///
/// # Authentication
/// Every endpoint here is gated on the `x-auth-token` header. While no token
/// is set, calls fail fast with `NotAuthenticated` without touching the
/// network.
///
/// # Error Handling
/// - Transport failure: `Network { status: None }`
/// - Non-2xx: `Network { status: Some(code) }` carrying the server's `msg`
///   when the body has one
/// - No retries and no backoff; callers log and move on
pub struct BackendGateway {
    client: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
}

impl BackendGateway {
    pub fn new(config: &BackendConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("safety_monitor_rs/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        BackendGateway {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(config.auth_token.clone()),
        }
    }

    pub fn set_auth_token(&self, token: Option<String>) {
        if let Ok(mut slot) = self.token.write() {
            *slot = token;
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.token
            .read()
            .map(|t| t.is_some())
            .unwrap_or(false)
    }

    fn auth_token(&self) -> Result<String> {
        self.token
            .read()
            .ok()
            .and_then(|t| t.clone())
            .ok_or(SafetyError::NotAuthenticated)
    }

    fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
        let token = self.auth_token()?;
        let url = format!("{}{}", self.base_url, path);
        Ok(self.client.request(method, url).header(AUTH_HEADER, token))
    }

    /// Map a non-2xx response to `Network` with the server's message
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response
            .json::<MessageBody>()
            .await
            .ok()
            .and_then(|b| b.msg)
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        Err(SafetyError::Network {
            status: Some(status.as_u16()),
            message,
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = Self::check(builder.send().await?).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| SafetyError::network(format!("invalid response body: {}", e)))
    }

    /// `PUT /api/safety/location`
    pub async fn push_location(&self, point: GeoPoint) -> Result<()> {
        let body = LocationBody {
            latitude: point.latitude,
            longitude: point.longitude,
        };
        let builder = self.request(Method::PUT, "/api/safety/location")?.json(&body);
        let ack: LocationAck = self.send_json(builder).await?;
        log::debug!("Location accepted by backend: {:?}", ack.location);
        Ok(())
    }

    /// `POST /api/safety/sos`; returns the server's acknowledgement message
    pub async fn send_sos(&self) -> Result<Option<String>> {
        let builder = self.request(Method::POST, "/api/safety/sos")?;
        let response = Self::check(builder.send().await?).await?;
        // the alert went out; an unreadable ack body doesn't change that
        Ok(response.json::<MessageBody>().await.ok().and_then(|b| b.msg))
    }

    /// `GET /api/safety/trusted-contacts`
    pub async fn fetch_trusted_contacts(&self) -> Result<Vec<TrustedContact>> {
        let builder = self.request(Method::GET, "/api/safety/trusted-contacts")?;
        self.send_json(builder).await
    }

    /// `POST /api/safety/trusted-contacts`
    pub async fn add_contact(&self, contact: &ContactPayload) -> Result<()> {
        let builder = self
            .request(Method::POST, "/api/safety/trusted-contacts")?
            .json(contact);
        Self::check(builder.send().await?).await?;
        Ok(())
    }

    /// `PUT /api/safety/trusted-contacts/:id`
    pub async fn update_contact(&self, id: &str, contact: &ContactPayload) -> Result<()> {
        let path = format!("/api/safety/trusted-contacts/{}", id);
        let builder = self.request(Method::PUT, &path)?.json(contact);
        Self::check(builder.send().await?).await?;
        Ok(())
    }

    /// `DELETE /api/safety/trusted-contacts/:id`
    pub async fn delete_contact(&self, id: &str) -> Result<()> {
        let path = format!("/api/safety/trusted-contacts/{}", id);
        let builder = self.request(Method::DELETE, &path)?;
        Self::check(builder.send().await?).await?;
        Ok(())
    }

    /// `GET /api/dangerzones`. Records with fewer than three vertices are
    /// dropped.
    pub async fn fetch_danger_zones(&self) -> Result<Vec<DangerZone>> {
        let builder = self.request(Method::GET, "/api/dangerzones")?;
        let records: Vec<ZoneRecord> = self.send_json(builder).await?;
        let total = records.len();
        let zones: Vec<DangerZone> = records
            .into_iter()
            .filter_map(ZoneRecord::into_zone)
            .collect();
        if zones.len() < total {
            log::warn!(
                "Dropped {} degenerate danger zone(s) from backend",
                total - zones.len()
            );
        }
        Ok(zones)
    }

    /// `POST /api/notifications/token`
    pub async fn register_push_token(&self, push_token: &str) -> Result<()> {
        let builder = self
            .request(Method::POST, "/api/notifications/token")?
            .json(&TokenBody { token: push_token });
        Self::check(builder.send().await?).await?;
        Ok(())
    }
}
