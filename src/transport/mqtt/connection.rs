//! Pure MQTT session configuration
//!
//! Everything here is free of I/O so broker options can be checked without a
//! broker.

use crate::config::{ClientConfig, Credentials};
use crate::error::{HubError, HubResult};
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use url::Url;

pub const KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Largest MQTT packet accepted or sent
pub const MAX_PACKET_SIZE: u32 = 256 * 1024;

/// Capacity of the request channel between client handle and event loop
pub const CHANNEL_CAPACITY: usize = 64;

const DEFAULT_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

/// Unique ID of one connection: `{clientID}-{hostname}-{millis}-{rand}`.
///
/// Used as MQTT client id and inbox suffix so two sessions of the same
/// client never share replies.
pub fn instance_id(client_id: &str) -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string());
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let rand = uuid::Uuid::new_v4().simple().to_string();
    format!("{client_id}-{host}-{millis}-{}", &rand[..8])
}

fn is_tls_scheme(scheme: &str) -> bool {
    matches!(scheme, "mqtts" | "ssl" | "wss")
}

fn is_websocket_scheme(scheme: &str) -> bool {
    matches!(scheme, "ws" | "wss")
}

fn tls_transport(config: &ClientConfig, websocket: bool) -> HubResult<RumqttcTransport> {
    match &config.hub.ca_cert {
        Some(path) => {
            let ca = std::fs::read(path).map_err(|e| {
                HubError::connection_failed(format!(
                    "cannot read CA certificate {}: {e}",
                    path.display()
                ))
            })?;
            Ok(if websocket {
                RumqttcTransport::wss(ca, None, None)
            } else {
                RumqttcTransport::tls(ca, None, None)
            })
        }
        None if websocket => Ok(RumqttcTransport::wss_with_default_config()),
        None => Ok(RumqttcTransport::tls_with_default_config()),
    }
}

/// Build broker options for one connection attempt
pub fn configure_mqtt_options(
    config: &ClientConfig,
    instance_id: &str,
    credentials: &Credentials,
) -> HubResult<MqttOptions> {
    let url = Url::parse(&config.hub.url)
        .map_err(|_| HubError::connection_failed(format!("invalid broker URL: {}", config.hub.url)))?;
    let host = url
        .host_str()
        .ok_or_else(|| HubError::connection_failed(format!("broker URL has no host: {url}")))?;
    let scheme = url.scheme();
    let tls = is_tls_scheme(scheme);
    let websocket = is_websocket_scheme(scheme);
    let port = url
        .port()
        .unwrap_or(if tls { DEFAULT_TLS_PORT } else { DEFAULT_PORT });

    // Websocket transports take the full URL as broker address
    let mut options = if websocket {
        MqttOptions::new(instance_id, url.as_str(), port)
    } else {
        MqttOptions::new(instance_id, host, port)
    };

    if tls {
        options.set_transport(tls_transport(config, websocket)?);
    } else if websocket {
        options.set_transport(RumqttcTransport::Ws);
    }

    match credentials {
        Credentials::Token { client_id, token } => {
            options.set_credentials(client_id.as_str(), token.as_str());
        }
        Credentials::Password {
            client_id,
            password,
        } => {
            options.set_credentials(client_id.as_str(), password.as_str());
        }
        Credentials::Anonymous { .. } => {}
    }

    options.set_keep_alive(KEEP_ALIVE);
    options.set_max_packet_size(Some(MAX_PACKET_SIZE));
    options.set_connection_timeout(config.connect_timeout().as_secs().max(1));
    options.set_clean_start(true);
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn anonymous() -> Credentials {
        Credentials::Anonymous {
            client_id: "lamp-agent".to_string(),
        }
    }

    #[test]
    fn test_instance_id_shape() {
        let a = instance_id("lamp-agent");
        let b = instance_id("lamp-agent");
        assert!(a.starts_with("lamp-agent-"));
        assert_ne!(a, b);
        assert_eq!(a.rsplit('-').next().unwrap().len(), 8);
    }

    #[test]
    fn test_plain_options() {
        let config = ClientConfig::new("lamp-agent", "mqtt://broker.local");
        let options = configure_mqtt_options(&config, "lamp-agent-1", &anonymous()).unwrap();
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(options.keep_alive(), KEEP_ALIVE);
        assert_eq!(options.client_id(), "lamp-agent-1");
    }

    #[test]
    fn test_tls_default_port() {
        let config = ClientConfig::new("lamp-agent", "mqtts://broker.local");
        let creds = Credentials::Token {
            client_id: "lamp-agent".to_string(),
            token: "tok".to_string(),
        };
        let options = configure_mqtt_options(&config, "id", &creds).unwrap();
        assert_eq!(options.broker_address().1, 8883);
    }

    #[test]
    fn test_invalid_url() {
        let config = ClientConfig::new("lamp-agent", "not a url");
        assert!(matches!(
            configure_mqtt_options(&config, "id", &anonymous()),
            Err(HubError::ConnectionFailed(_))
        ));
    }

    #[test]
    fn test_missing_ca_file() {
        let mut config = ClientConfig::new("lamp-agent", "mqtts://broker.local:8883");
        config.hub.ca_cert = Some("/no/such/ca.pem".into());
        assert!(configure_mqtt_options(&config, "id", &anonymous()).is_err());
    }
}
