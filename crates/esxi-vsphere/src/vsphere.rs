//! vCenter REST session (`/api/...`), used only for name-filtered inventory
//! listings. Mutations and property collection go through
//! [`crate::soap::SoapClient`].

use crate::error::{VsphereError, VsphereErrorKind, VsphereResult};
use crate::types::VsphereConfig;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

const SESSION_HEADER: &str = "vmware-api-session-id";

pub struct VsphereClient {
    http: Client,
    base_url: String,
    session_id: Option<String>,
    host: String,
}

impl VsphereClient {
    /// No session is created until [`VsphereClient::login`].
    pub fn new(config: &VsphereConfig) -> VsphereResult<Self> {
        let http = Client::builder()
            .danger_accept_invalid_certs(config.insecure)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VsphereError::connection(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self { http, base_url: base_url(config)?, session_id: None, host: config.host.clone() })
    }

    /// `POST /api/session` with basic auth. The reply body is the quoted
    /// session id.
    pub async fn login(&mut self, username: &str, password: &str) -> VsphereResult<()> {
        let resp = self
            .http
            .post(format!("{}/api/session", self.base_url))
            .basic_auth(username, Some(password))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED => VsphereError::auth("Invalid credentials"),
                _ => status_error(status, &body),
            });
        }
        let sid: String = resp
            .json()
            .await
            .map_err(|e| VsphereError::parse(format!("Unexpected session reply: {e}")))?;
        log::debug!("REST session established with {}", self.host);
        self.session_id = Some(sid);
        Ok(())
    }

    /// Best effort; failures are logged.
    pub async fn logout(&self) {
        let Some(sid) = &self.session_id else { return };
        let sent = self
            .http
            .delete(format!("{}/api/session", self.base_url))
            .header(SESSION_HEADER, sid.as_str())
            .send()
            .await;
        if let Err(e) = sent {
            log::warn!("REST logout from {} failed: {e}", self.host);
        }
    }

    /// `GET path?names=a&names=b`. An empty `names` lists everything.
    pub async fn list<T: DeserializeOwned>(&self, path: &str, names: &[&str]) -> VsphereResult<Vec<T>> {
        let sid = self
            .session_id
            .as_deref()
            .ok_or_else(|| VsphereError::connection("No active REST session"))?;
        let query: Vec<(&str, &str)> = names.iter().map(|n| ("names", *n)).collect();
        let resp = self
            .http
            .get(format!("{}{path}", self.base_url))
            .header(SESSION_HEADER, sid)
            .query(&query)
            .send()
            .await?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| VsphereError::transient(format!("Failed to read {path} reply: {e}")))?;
        if !status.is_success() {
            return Err(status_error(status, &body));
        }
        decode_list(path, &body)
    }
}

fn status_error(status: StatusCode, body: &str) -> VsphereError {
    match status {
        StatusCode::UNAUTHORIZED => VsphereError::auth(format!("Session expired or invalid: {body}")),
        StatusCode::FORBIDDEN => VsphereError::new(VsphereErrorKind::AccessDenied, format!("Access denied: {body}")),
        StatusCode::NOT_FOUND => VsphereError::not_found(format!("Resource not found: {body}")),
        other => VsphereError::api(other.as_u16(), format!("API error {}: {body}", other.as_u16())),
    }
}

fn decode_list<T: DeserializeOwned>(path: &str, body: &str) -> VsphereResult<Vec<T>> {
    if body.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(body).map_err(|e| {
        let cut = body.char_indices().nth(300).map_or(body.len(), |(i, _)| i);
        VsphereError::parse(format!("Bad {path} listing: {e}; body: {}", &body[..cut]))
    })
}

/// `https://host:port`, validated.
pub(crate) fn base_url(config: &VsphereConfig) -> VsphereResult<String> {
    let host = config.host.trim();
    if host.is_empty() {
        return Err(VsphereError::connection("vCenter host is not configured"));
    }
    let raw = format!("https://{host}:{}", config.port);
    url::Url::parse(&raw).map_err(|e| VsphereError::connection(format!("Invalid vCenter host '{host}': {e}")))?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HostSummary;

    #[test]
    fn base_url_includes_port() {
        let cfg = VsphereConfig { host: " vc.lab.local ".into(), port: 8443, ..VsphereConfig::default() };
        assert_eq!(base_url(&cfg).unwrap(), "https://vc.lab.local:8443");
    }

    #[test]
    fn base_url_rejects_empty_host() {
        let err = base_url(&VsphereConfig::default()).unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::ConnectionError);
    }

    #[test]
    fn statuses_map_to_error_kinds() {
        assert_eq!(status_error(StatusCode::FORBIDDEN, "").kind, VsphereErrorKind::AccessDenied);
        assert_eq!(status_error(StatusCode::NOT_FOUND, "").kind, VsphereErrorKind::NotFound);
        assert_eq!(status_error(StatusCode::BAD_GATEWAY, "").kind, VsphereErrorKind::ApiError(502));
    }

    #[test]
    fn empty_listing_body_is_empty() {
        let hosts: Vec<HostSummary> = decode_list("/api/vcenter/host", "").unwrap();
        assert!(hosts.is_empty());
        assert!(decode_list::<HostSummary>("/api/vcenter/host", "{").is_err());
    }

    #[tokio::test]
    async fn listing_without_session_is_a_connection_error() {
        let client = VsphereClient::new(&VsphereConfig { host: "vc".into(), ..VsphereConfig::default() }).unwrap();
        let err = client.list::<HostSummary>("/api/vcenter/host", &[]).await.unwrap_err();
        assert_eq!(err.kind, VsphereErrorKind::ConnectionError);
    }
}
