//! Configuration endpoint payloads.
//!
//! A body is parsed once into a [`ConfigRequest`] and validated on the way;
//! the handler only ever sees well-formed requests.

use std::fmt;

use serde::Deserialize;

use super::MAX_CONFIG_BODY;
use crate::lights::{LightInfo, LIGHT_COUNT, NAME_MAX_LEN};
use crate::network::credentials::NetworkCredentials;
use crate::store::MQTT_URI_MAX_LEN;

const BROKER_SCHEMES: [&str; 4] = ["mqtt", "mqtts", "ws", "wss"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigRequest {
    LightLevel { index: usize, level: u8 },
    Credentials(NetworkCredentials),
    BrokerUri(String),
    LightSetup(Vec<LightInfo>),
    /// Legacy `H` / `L` bodies
    AllLights(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    TooLarge(usize),
    NotUtf8,
    Malformed(String),
    Unrecognized,
    Invalid(String),
}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestError::TooLarge(len) => {
                write!(f, "body of {} bytes exceeds {}", len, MAX_CONFIG_BODY)
            }
            RequestError::NotUtf8 => write!(f, "body is not UTF-8"),
            RequestError::Malformed(msg) => write!(f, "malformed JSON: {}", msg),
            RequestError::Unrecognized => write!(f, "request not recognized"),
            RequestError::Invalid(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for RequestError {}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawRequest {
    Light(RawLight),
    Credentials(RawCredentials),
    Broker(RawBroker),
    Setup(RawSetup),
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLight {
    light: usize,
    level: u32,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawCredentials {
    ssid: String,
    #[serde(default)]
    psk: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawBroker {
    mqtt_uri: String,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawSetup {
    lights: Vec<LightInfo>,
}

pub fn parse(body: &[u8]) -> Result<ConfigRequest, RequestError> {
    if body.len() > MAX_CONFIG_BODY {
        return Err(RequestError::TooLarge(body.len()));
    }
    let text = std::str::from_utf8(body).map_err(|_| RequestError::NotUtf8)?;
    match text.trim() {
        "H" => return Ok(ConfigRequest::AllLights(u8::MAX)),
        "L" => return Ok(ConfigRequest::AllLights(0)),
        _ => {}
    }

    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| RequestError::Malformed(e.to_string()))?;
    let raw = RawRequest::deserialize(value).map_err(|_| RequestError::Unrecognized)?;

    match raw {
        RawRequest::Light(RawLight { light, level }) => {
            if light >= LIGHT_COUNT {
                return Err(RequestError::Invalid(format!("no light {}", light)));
            }
            let level = u8::try_from(level)
                .map_err(|_| RequestError::Invalid(format!("level {} outside 0..=255", level)))?;
            Ok(ConfigRequest::LightLevel { index: light, level })
        }
        RawRequest::Credentials(RawCredentials { ssid, psk }) => NetworkCredentials::new(&ssid, &psk)
            .map(ConfigRequest::Credentials)
            .map_err(|e| RequestError::Invalid(e.to_string())),
        RawRequest::Broker(RawBroker { mqtt_uri }) => {
            validate_broker_uri(&mqtt_uri)?;
            Ok(ConfigRequest::BrokerUri(mqtt_uri))
        }
        RawRequest::Setup(RawSetup { lights }) => {
            if lights.len() > LIGHT_COUNT {
                return Err(RequestError::Invalid(format!(
                    "{} lights given, max {}",
                    lights.len(),
                    LIGHT_COUNT
                )));
            }
            if let Some(light) = lights.iter().find(|l| l.name.len() > NAME_MAX_LEN) {
                return Err(RequestError::Invalid(format!(
                    "light name '{}' longer than {} bytes",
                    light.name, NAME_MAX_LEN
                )));
            }
            Ok(ConfigRequest::LightSetup(lights))
        }
    }
}

fn validate_broker_uri(uri: &str) -> Result<(), RequestError> {
    if uri.len() > MQTT_URI_MAX_LEN {
        return Err(RequestError::Invalid(format!(
            "broker URI longer than {} bytes",
            MQTT_URI_MAX_LEN
        )));
    }
    let Some((scheme, rest)) = uri.split_once("://") else {
        return Err(RequestError::Invalid("broker URI has no scheme".into()));
    };
    if !BROKER_SCHEMES.contains(&scheme) {
        return Err(RequestError::Invalid(format!("unsupported scheme '{}'", scheme)));
    }
    if rest.is_empty() || rest.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(RequestError::Invalid("broker URI has no valid host".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_shortcuts() {
        assert_eq!(parse(b"H"), Ok(ConfigRequest::AllLights(255)));
        assert_eq!(parse(b"L\n"), Ok(ConfigRequest::AllLights(0)));
    }

    #[test]
    fn light_level_is_range_checked() {
        assert_eq!(
            parse(br#"{"light": 1, "level": 128}"#),
            Ok(ConfigRequest::LightLevel { index: 1, level: 128 })
        );
        assert!(matches!(
            parse(br#"{"light": 1, "level": 256}"#),
            Err(RequestError::Invalid(_))
        ));
        assert!(matches!(
            parse(br#"{"light": 4, "level": 1}"#),
            Err(RequestError::Invalid(_))
        ));
    }

    #[test]
    fn credentials_accept_boundary_lengths() {
        let body = format!(r#"{{"ssid": "{}", "psk": "{}"}}"#, "s".repeat(32), "p".repeat(63));
        let Ok(ConfigRequest::Credentials(creds)) = parse(body.as_bytes()) else {
            panic!("expected credentials");
        };
        assert_eq!(creds.ssid().len(), 32);
        assert_eq!(creds.passphrase().len(), 63);

        let body = format!(r#"{{"ssid": "{}", "psk": ""}}"#, "s".repeat(33));
        assert!(matches!(parse(body.as_bytes()), Err(RequestError::Invalid(_))));
    }

    #[test]
    fn open_network_credentials_may_omit_psk() {
        let Ok(ConfigRequest::Credentials(creds)) = parse(br#"{"ssid": "cafe"}"#) else {
            panic!("expected credentials");
        };
        assert!(creds.is_open());
    }

    #[test]
    fn broker_uri_schemes() {
        assert_eq!(
            parse(br#"{"mqtt_uri": "mqtts://broker.local:8883"}"#),
            Ok(ConfigRequest::BrokerUri("mqtts://broker.local:8883".into()))
        );
        assert!(parse(br#"{"mqtt_uri": "http://broker"}"#).is_err());
        assert!(parse(br#"{"mqtt_uri": "mqtt://"}"#).is_err());
    }

    #[test]
    fn light_setup_limits() {
        let ok = br#"{"lights": [{"name": "porch", "enabled": true, "level": 10}]}"#;
        assert!(matches!(parse(ok), Ok(ConfigRequest::LightSetup(l)) if l.len() == 1));

        let long = br#"{"lights": [{"name": "thirteen-char", "enabled": true}]}"#;
        assert!(matches!(parse(long), Err(RequestError::Invalid(_))));
    }

    #[test]
    fn rejects_garbage_unknown_and_oversize() {
        assert!(matches!(parse(b"{not json"), Err(RequestError::Malformed(_))));
        assert_eq!(parse(br#"{"colour": "red"}"#), Err(RequestError::Unrecognized));
        assert_eq!(parse(&[0xff, 0xfe]), Err(RequestError::NotUtf8));
        let big = vec![b' '; MAX_CONFIG_BODY + 1];
        assert_eq!(parse(&big), Err(RequestError::TooLarge(MAX_CONFIG_BODY + 1)));
    }
}
