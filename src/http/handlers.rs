use serde::Serialize;

use super::compression::compress_reply;
use super::request::{self, ConfigRequest, RequestError};
use super::upload::{read_body, receive_firmware, BodySource, ReadError};
use super::{AppContext, Reply, RequestHeaders, MAX_CONFIG_BODY};
use crate::lights::{LightBank, LightError, LightInfo, LIGHT_COUNT};
use crate::network::supervisor::NetworkSnapshot;
use crate::ota::session::UpdateProgress;
use crate::ota::slots::SlotStorage;
use crate::store;
use crate::templates::{INDEX_PAGE, OTA_PAGE};
use crate::version::FIRMWARE_VERSION;

#[derive(Serialize)]
struct StatusReport {
    network: NetworkSnapshot,
    lights: [LightInfo; LIGHT_COUNT],
    update: UpdateProgress,
    mqtt_uri: Option<String>,
    version: &'static str,
}

/// `GET /`
pub fn index(headers: &RequestHeaders) -> Reply {
    compress_reply(Reply::html(INDEX_PAGE), headers.accept_encoding.as_deref())
}

/// `GET /ota`, behind Basic auth
pub fn ota_page<S: SlotStorage>(ctx: &AppContext<S>, headers: &RequestHeaders) -> Reply {
    if !ctx.auth.check(headers.authorization.as_deref()) {
        log::warn!("Rejected unauthenticated request for the upload page");
        return ctx.auth.challenge();
    }
    compress_reply(Reply::html(OTA_PAGE), headers.accept_encoding.as_deref())
}

/// `POST /ota`
pub fn upload<S: SlotStorage, B: BodySource>(
    ctx: &AppContext<S>,
    headers: &RequestHeaders,
    body: &mut B,
) -> Reply {
    receive_firmware(&ctx.updates, headers, body, &ctx.config.ota)
}

/// `POST /` reading the body from the connection
pub fn configure_stream<S: SlotStorage, B: BodySource>(ctx: &AppContext<S>, body: &mut B) -> Reply {
    match read_body(body, MAX_CONFIG_BODY, ctx.config.ota.recv_timeout_retries) {
        Ok(bytes) => configure(ctx, &bytes),
        Err(ReadError::Timeout) => Reply::text(408, "Request timeout"),
        Err(e) => {
            log::warn!("Failed to read configuration body: {}", e);
            Reply::text(400, "Bad request")
        }
    }
}

/// `POST /`
pub fn configure<S: SlotStorage>(ctx: &AppContext<S>, body: &[u8]) -> Reply {
    let request = match request::parse(body) {
        Ok(request) => request,
        Err(e) => {
            log::warn!("Rejected configuration request: {}", e);
            return match e {
                RequestError::TooLarge(_) => Reply::text(413, "Payload too large"),
                RequestError::Unrecognized => Reply::text(400, "Request not recognized"),
                _ => Reply::text(400, "Invalid request"),
            };
        }
    };

    match request {
        ConfigRequest::AllLights(level) => {
            log::info!("All lights -> {}", level);
            with_lights(ctx, |lights| lights.set_all(level), "OK")
        }
        ConfigRequest::LightLevel { index, level } => {
            log::info!("Light {} -> {}", index, level);
            with_lights(ctx, |lights| lights.set_level(index, level), "OK")
        }
        ConfigRequest::LightSetup(entries) => {
            log::info!("Applying setup for {} light(s)", entries.len());
            let reply = with_lights(ctx, |lights| lights.apply_setup(&entries), "Lights updated");
            if reply.status == 200 {
                persist_lights(ctx);
            }
            reply
        }
        ConfigRequest::Credentials(credentials) => {
            log::info!("New station credentials received for SSID '{}'", credentials.ssid());
            match ctx.supervisor.apply_credentials(credentials) {
                Ok(()) => Reply::text(200, "Connecting to new network"),
                Err(e) => {
                    log::error!("{}", e);
                    Reply::text(503, "Network supervisor unavailable")
                }
            }
        }
        ConfigRequest::BrokerUri(uri) => {
            match store::with_store(&ctx.store, |s| store::save_broker_uri(s, &uri)) {
                Ok(()) => {
                    log::info!("Broker URI set to {}", uri);
                    Reply::text(200, "Broker saved")
                }
                Err(e) => {
                    log::error!("Failed to save broker URI: {}", e);
                    Reply::text(500, "Save failed")
                }
            }
        }
    }
}

/// `GET /status_update`
pub fn status<S: SlotStorage>(ctx: &AppContext<S>) -> Reply {
    let lights = match ctx.lights.lock() {
        Ok(lights) => lights.snapshot(),
        Err(poisoned) => poisoned.into_inner().snapshot(),
    };
    let mqtt_uri = store::with_store(&ctx.store, |s| store::load_broker_uri(s)).unwrap_or_else(|e| {
        log::warn!("Could not read broker URI: {}", e);
        None
    });

    let report = StatusReport {
        network: ctx.supervisor.snapshot(),
        lights,
        update: ctx.updates.progress(),
        mqtt_uri,
        version: FIRMWARE_VERSION,
    };
    match serde_json::to_vec(&report) {
        Ok(json) => Reply::json(json),
        Err(e) => {
            log::error!("Failed to serialize status: {}", e);
            Reply::text(500, "Internal error")
        }
    }
}

fn with_lights<S: SlotStorage>(
    ctx: &AppContext<S>,
    f: impl FnOnce(&mut LightBank) -> Result<(), LightError>,
    ok: &str,
) -> Reply {
    let mut lights = match ctx.lights.lock() {
        Ok(lights) => lights,
        Err(poisoned) => poisoned.into_inner(),
    };
    match f(&mut lights) {
        Ok(()) => Reply::text(200, ok),
        Err(e @ LightError::Driver(_)) => {
            log::error!("{}", e);
            Reply::text(500, "Light driver error")
        }
        Err(e) => {
            log::warn!("{}", e);
            Reply::text(400, "Invalid request")
        }
    }
}

fn persist_lights<S: SlotStorage>(ctx: &AppContext<S>) {
    let snapshot = match ctx.lights.lock() {
        Ok(lights) => lights.snapshot(),
        Err(poisoned) => poisoned.into_inner().snapshot(),
    };
    if let Err(e) = store::with_store(&ctx.store, |s| store::save_lights(s, &snapshot)) {
        log::error!("Failed to persist light settings: {}", e);
    }
}
