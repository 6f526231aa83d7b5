mod common;

use std::collections::VecDeque;

use lightnode::http::{handlers, BasicAuth, BodySource, ReadError, RequestHeaders, MAX_CONFIG_BODY};
use lightnode::network::supervisor::NetworkMode;
use lightnode::store;
use serde_json::Value;

use common::Node;

struct Body(VecDeque<Result<Vec<u8>, ReadError>>);

impl BodySource for Body {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        match self.0.pop_front() {
            None => Ok(0),
            Some(Ok(bytes)) => {
                let n = bytes.len().min(buf.len());
                buf[..n].copy_from_slice(&bytes[..n]);
                Ok(n)
            }
            Some(Err(e)) => Err(e),
        }
    }
}

fn status_json(node: &Node) -> Value {
    let reply = handlers::status(&node.ctx);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.content_type, "application/json");
    serde_json::from_slice(&reply.body).unwrap()
}

#[test]
fn upload_page_requires_basic_auth() {
    let node = Node::boot(None);

    let reply = handlers::ota_page(&node.ctx, &RequestHeaders::default());
    assert_eq!(reply.status, 401);
    assert_eq!(reply.header("WWW-Authenticate"), Some("Basic realm=\"Hello\""));

    let wrong = RequestHeaders {
        authorization: Some(BasicAuth::header_value("admin", "guess")),
        ..RequestHeaders::default()
    };
    assert_eq!(handlers::ota_page(&node.ctx, &wrong).status, 401);

    let ota = &node.ctx.config.ota;
    let headers = RequestHeaders {
        authorization: Some(BasicAuth::header_value(&ota.auth_user, &ota.auth_password)),
        accept_encoding: Some("gzip, deflate".into()),
        ..RequestHeaders::default()
    };
    let reply = handlers::ota_page(&node.ctx, &headers);
    assert_eq!(reply.status, 200);
    assert_eq!(reply.header("Content-Encoding"), Some("gzip"));
}

#[test]
fn legacy_bodies_switch_every_wired_light() {
    let node = Node::boot(None);

    assert_eq!(handlers::configure(&node.ctx, b"H").status, 200);
    assert_eq!(node.dimmer.duties(), vec![255, 255]);

    assert_eq!(handlers::configure(&node.ctx, b"L").status, 200);
    assert_eq!(node.dimmer.duties(), vec![0, 0]);
}

#[test]
fn light_level_and_setup_requests() {
    let node = Node::boot(None);

    let reply = handlers::configure(&node.ctx, br#"{"light": 1, "level": 90}"#);
    assert_eq!(reply.status, 200);
    assert_eq!(node.dimmer.duties()[1], 90);

    let setup = br#"{"lights": [
        {"name": "porch", "enabled": false, "level": 200},
        {"name": "kitchen", "enabled": true, "level": 40}
    ]}"#;
    let reply = handlers::configure(&node.ctx, setup);
    assert_eq!(reply.status, 200);
    // Disabled named lights stay dark
    assert_eq!(node.dimmer.duties(), vec![0, 40]);

    let stored = store::with_store(&node.store, |s| store::load_lights(s)).unwrap();
    assert_eq!(stored[0].name, "porch");
    assert!(!stored[0].enabled);
    assert_eq!(stored[1].name, "kitchen");
    assert!(stored[1].enabled);

    let status = status_json(&node);
    assert_eq!(status["lights"][1]["level"], 40);
    assert_eq!(status["lights"][0]["name"], "porch");
}

#[test]
fn invalid_requests_get_coarse_errors() {
    let node = Node::boot(None);

    assert_eq!(handlers::configure(&node.ctx, br#"{"light": 9, "level": 1}"#).status, 400);
    assert_eq!(handlers::configure(&node.ctx, br#"{"volume": 11}"#).status, 400);
    assert_eq!(handlers::configure(&node.ctx, b"{oops").status, 400);

    let long_ssid = format!(r#"{{"ssid": "{}", "psk": ""}}"#, "x".repeat(33));
    assert_eq!(handlers::configure(&node.ctx, long_ssid.as_bytes()).status, 400);

    let oversize = vec![b' '; MAX_CONFIG_BODY + 1];
    let reply = handlers::configure(&node.ctx, &oversize);
    assert_eq!(reply.status, 413);
    assert!(!reply.body_str().contains("512"));
}

#[test]
fn broker_uri_is_persisted_and_reported() {
    let node = Node::boot(None);

    let reply = handlers::configure(&node.ctx, br#"{"mqtt_uri": "mqtt://broker.lan:1883"}"#);
    assert_eq!(reply.status, 200);
    let stored = store::with_store(&node.store, |s| store::load_broker_uri(s)).unwrap();
    assert_eq!(stored.as_deref(), Some("mqtt://broker.lan:1883"));
    assert_eq!(status_json(&node)["mqtt_uri"], "mqtt://broker.lan:1883");
}

#[test]
fn status_reports_network_update_and_version() {
    let mut node = Node::boot(None);
    node.supervisor.start(node.t0);

    let status = status_json(&node);
    assert_eq!(status["network"]["mode"], "ap_fallback");
    assert_eq!(status["network"]["retries"], 0);
    assert_eq!(status["network"]["address"], Value::Null);
    assert_eq!(status["update"]["status"], "idle");
    assert_eq!(status["update"]["bytes_written"], 0);
    assert_eq!(status["lights"].as_array().map(Vec::len), Some(4));
    assert_eq!(status["version"], lightnode::version::FIRMWARE_VERSION);
    assert_eq!(node.handle.snapshot().mode, NetworkMode::ApFallback);
}

#[test]
fn streamed_config_body_handles_timeouts() {
    let node = Node::boot(None);

    let mut body = Body(VecDeque::from(vec![Err(ReadError::Timeout), Ok(b"H".to_vec())]));
    assert_eq!(handlers::configure_stream(&node.ctx, &mut body).status, 200);

    let stalls = node.ctx.config.ota.recv_timeout_retries as usize + 1;
    let mut body = Body((0..stalls).map(|_| Err(ReadError::Timeout)).collect());
    assert_eq!(handlers::configure_stream(&node.ctx, &mut body).status, 408);

    let mut body = Body(VecDeque::from(vec![Err(ReadError::Closed)]));
    assert_eq!(handlers::configure_stream(&node.ctx, &mut body).status, 400);
}

#[test]
fn credentials_without_a_running_supervisor_report_unavailable() {
    let node = Node::boot(None);
    let ctx = node.ctx.clone();
    drop(node);

    let reply = handlers::configure(&ctx, br#"{"ssid": "Attic", "psk": "12345678"}"#);
    assert_eq!(reply.status, 503);
}
