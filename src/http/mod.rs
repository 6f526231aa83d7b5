//! Transport-facing request handling.
//!
//! Handlers here are plain functions from request parts to a [`Reply`]; the
//! platform layer adapts them to the HTTP server's connection type. That
//! keeps every route testable on the host.

pub mod auth;
pub mod compression;
pub mod handlers;
pub mod request;
pub mod upload;

use std::sync::{Arc, Mutex};

use crate::config::SupervisorConfig;
use crate::lights::LightBank;
use crate::network::supervisor::SupervisorHandle;
use crate::ota::session::UpdateService;
use crate::ota::slots::SlotStorage;
use crate::store::SharedStore;

pub use auth::BasicAuth;
pub use request::{ConfigRequest, RequestError};
pub use upload::{BodySource, ReadError};

/// Largest accepted body on the configuration endpoint
pub const MAX_CONFIG_BODY: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: u16,
    pub content_type: &'static str,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
}

impl Reply {
    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain",
            headers: Vec::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn html(body: &str) -> Self {
        Self {
            status: 200,
            content_type: "text/html",
            headers: Vec::new(),
            body: body.as_bytes().to_vec(),
        }
    }

    pub fn json(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            content_type: "application/json",
            headers: Vec::new(),
            body,
        }
    }

    pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap_or("")
    }
}

/// The request headers the handlers look at
#[derive(Debug, Clone, Default)]
pub struct RequestHeaders {
    pub authorization: Option<String>,
    pub accept_encoding: Option<String>,
    pub content_length: Option<u64>,
    pub firmware_sha256: Option<String>,
}

/// Shared state every route closure captures
pub struct AppContext<S: SlotStorage> {
    pub supervisor: SupervisorHandle,
    pub lights: Arc<Mutex<LightBank>>,
    pub store: SharedStore,
    pub updates: UpdateService<S>,
    pub auth: BasicAuth,
    pub config: Arc<SupervisorConfig>,
}

impl<S: SlotStorage> Clone for AppContext<S> {
    fn clone(&self) -> Self {
        Self {
            supervisor: self.supervisor.clone(),
            lights: self.lights.clone(),
            store: self.store.clone(),
            updates: self.updates.clone(),
            auth: self.auth.clone(),
            config: self.config.clone(),
        }
    }
}
