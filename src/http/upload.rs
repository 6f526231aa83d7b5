//! Streaming request bodies: the firmware upload and small config bodies.

use std::fmt;

use super::{Reply, RequestHeaders};
use crate::config::OtaConfig;
use crate::ota::session::{UpdateError, UpdateService};
use crate::ota::slots::SlotStorage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// No data within the socket timeout; worth retrying
    Timeout,
    Closed,
    Io(String),
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadError::Timeout => write!(f, "receive timed out"),
            ReadError::Closed => write!(f, "connection closed"),
            ReadError::Io(msg) => write!(f, "receive failed: {}", msg),
        }
    }
}

impl std::error::Error for ReadError {}

/// Incoming request body. `Ok(0)` marks the end of the body.
pub trait BodySource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, ReadError>;
}

/// Reads at most `limit + 1` bytes so oversize bodies can be told apart.
/// Timeouts are retried up to `timeout_retries` times in a row.
pub fn read_body<B: BodySource>(
    body: &mut B,
    limit: usize,
    timeout_retries: u32,
) -> Result<Vec<u8>, ReadError> {
    let mut data = Vec::new();
    let mut buf = [0u8; 128];
    let mut timeouts = 0;
    while data.len() <= limit {
        match body.read_chunk(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                timeouts = 0;
                data.extend_from_slice(&buf[..n]);
            }
            Err(ReadError::Timeout) if timeouts < timeout_retries => timeouts += 1,
            Err(e) => return Err(e),
        }
    }
    Ok(data)
}

fn parse_digest(hex: &str) -> Option<[u8; 32]> {
    let hex = hex.trim();
    if hex.len() != 64 || !hex.is_ascii() {
        return None;
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

fn failure(err: &UpdateError) -> Reply {
    log::error!("Firmware upload failed: {}", err);
    Reply::text(500, "Update failed")
}

/// Streams a firmware image from `body` into an update session.
///
/// 200 once the image is committed (the restart is already scheduled),
/// 500 for any failure. Failure details stay in the log.
pub fn receive_firmware<S: SlotStorage, B: BodySource>(
    updates: &UpdateService<S>,
    headers: &RequestHeaders,
    body: &mut B,
    config: &OtaConfig,
) -> Reply {
    let digest = match headers.firmware_sha256.as_deref() {
        Some(value) => match parse_digest(value) {
            Some(digest) => Some(digest),
            None => {
                log::warn!("Ignoring upload with malformed X-Firmware-Sha256 header");
                return Reply::text(500, "Update failed");
            }
        },
        None => None,
    };

    let mut session = match updates.begin() {
        Ok(session) => session,
        Err(e) => return failure(&e),
    };
    log::info!(
        "Receiving firmware{}",
        headers
            .content_length
            .map(|len| format!(" ({} bytes)", len))
            .unwrap_or_default()
    );

    let mut buf = vec![0u8; config.chunk_size.max(1)];
    let mut timeouts = 0u32;
    loop {
        match body.read_chunk(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                timeouts = 0;
                if let Err(e) = session.write(&buf[..n]) {
                    return failure(&e);
                }
            }
            Err(ReadError::Timeout) if timeouts < config.recv_timeout_retries => {
                timeouts += 1;
                log::debug!("Upload receive timeout, retry {}", timeouts);
            }
            Err(e) => {
                log::warn!("Upload interrupted after {} bytes: {}", session.bytes_written(), e);
                session.abort();
                return failure(&UpdateError::Disconnected);
            }
        }
    }

    match session.finalize(headers.content_length, digest.as_ref()) {
        Ok(()) => Reply::text(200, "Update committed, restarting"),
        Err(e) => failure(&e),
    }
}
