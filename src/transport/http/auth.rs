//! Hub endpoints, TLS setup and token lifecycle for the HTTP transport

use crate::config::ClientConfig;
use crate::error::{HubError, HubResult};
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use url::Url;

pub const LOGIN_PATH: &str = "/authn/login";
pub const REFRESH_PATH: &str = "/authn/refresh";
pub const LOGOUT_PATH: &str = "/authn/logout";
pub const REQUEST_PATH: &str = "/hiveot/request";
pub const RESPONSE_PATH: &str = "/hiveot/response";
pub const NOTIFICATION_PATH: &str = "/hiveot/notification";

pub const CONNECTION_ID_HEADER: &str = "cid";
pub const CORRELATION_ID_HEADER: &str = "correlation-id";
pub const MESSAGE_ID_HEADER: &str = "message-id";

#[derive(Serialize)]
struct LoginArgs<'a> {
    login: &'a str,
    password: &'a str,
}

#[derive(Serialize)]
struct RefreshArgs<'a> {
    #[serde(rename = "clientID")]
    client_id: &'a str,
    #[serde(rename = "oldToken")]
    old_token: &'a str,
}

/// Build the HTTP client for one session
pub fn build_http_client(config: &ClientConfig) -> HubResult<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .connect_timeout(config.connect_timeout());

    if let Some(path) = &config.hub.ca_cert {
        let pem = std::fs::read(path).map_err(|e| {
            HubError::connection_failed(format!("cannot read CA certificate {}: {e}", path.display()))
        })?;
        // Text without any certificate block parses as an empty bundle
        let certs = reqwest::Certificate::from_pem_bundle(&pem)
            .map_err(|e| HubError::connection_failed(format!("invalid CA certificate: {e}")))?;
        if certs.is_empty() {
            return Err(HubError::connection_failed(format!(
                "invalid CA certificate: no certificate in {}",
                path.display()
            )));
        }
        for cert in certs {
            builder = builder.add_root_certificate(cert);
        }
    }
    if config.hub.disable_cert_check {
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|e| HubError::connection_failed(format!("cannot build HTTP client: {e}")))
}

/// Bearer header value
pub fn bearer(token: &str) -> String {
    format!("bearer {token}")
}

/// Map a non-success status to an error
pub fn status_error(status: StatusCode, context: &str) -> HubError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            HubError::unauthorized(format!("{context}: {status}"))
        }
        _ => HubError::connection_failed(format!("{context}: {status}")),
    }
}

/// Tokens come back either as a JSON string or as `{"token": ...}`
pub fn parse_token(body: &[u8]) -> HubResult<String> {
    let value: Value = serde_json::from_slice(body)?;
    let token = match &value {
        Value::String(token) => Some(token.as_str()),
        Value::Object(map) => map.get("token").and_then(Value::as_str),
        _ => None,
    };
    match token {
        Some(token) if !token.is_empty() => Ok(token.to_string()),
        _ => Err(HubError::protocol("authentication reply carries no token")),
    }
}

fn map_send_error(e: reqwest::Error, context: &str) -> HubError {
    HubError::connection_failed(format!("{context}: {e}"))
}

/// Exchange a password for a session token
pub async fn login(
    client: &reqwest::Client,
    base: &Url,
    login: &str,
    password: &str,
) -> HubResult<String> {
    let url = join(base, LOGIN_PATH)?;
    let response = client
        .post(url)
        .json(&LoginArgs { login, password })
        .send()
        .await
        .map_err(|e| map_send_error(e, "login"))?;

    let status = response.status();
    if !status.is_success() {
        return Err(status_error(status, "login rejected"));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| map_send_error(e, "login"))?;
    parse_token(&body)
}

/// Exchange a still valid token for a new one
pub async fn refresh(
    client: &reqwest::Client,
    base: &Url,
    client_id: &str,
    old_token: &str,
) -> HubResult<String> {
    let url = join(base, REFRESH_PATH)?;
    let response = client
        .post(url)
        .header(reqwest::header::AUTHORIZATION, bearer(old_token))
        .json(&RefreshArgs {
            client_id,
            old_token,
        })
        .send()
        .await
        .map_err(|e| map_send_error(e, "token refresh"))?;

    let status = response.status();
    if !status.is_success() {
        return Err(status_error(status, "token refresh rejected"));
    }
    let body = response
        .bytes()
        .await
        .map_err(|e| map_send_error(e, "token refresh"))?;
    parse_token(&body)
}

/// End the session on the hub
pub async fn logout(client: &reqwest::Client, base: &Url, token: &str) -> HubResult<()> {
    let url = join(base, LOGOUT_PATH)?;
    let response = client
        .post(url)
        .header(reqwest::header::AUTHORIZATION, bearer(token))
        .send()
        .await
        .map_err(|e| map_send_error(e, "logout"))?;

    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(status_error(status, "logout rejected"))
    }
}

/// Resolve a path or absolute href against the hub base URL
pub fn join(base: &Url, href: &str) -> HubResult<Url> {
    match Url::parse(href) {
        Ok(url) => Ok(url),
        Err(_) => base
            .join(href)
            .map_err(|e| HubError::protocol(format!("invalid href '{href}': {e}"))),
    }
}
