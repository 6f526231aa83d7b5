//! `EspHttpServer` adapter for the route handlers in [`crate::http`].

use embedded_svc::http::Headers;
use esp_idf_svc::http::server::{Configuration, EspHttpConnection, EspHttpServer, Request};
use esp_idf_svc::http::Method;
use esp_idf_svc::io::{EspIOError, Read, Write};
use esp_idf_sys::HTTPD_SOCK_ERR_TIMEOUT;

use crate::http::{handlers, AppContext, BodySource, ReadError, Reply, RequestHeaders};
use crate::network::link::LinkRole;
use crate::network::service::{ServiceError, ServiceFactory};
use crate::ota::slots::SlotStorage;

type HttpRequest<'r, 'c> = Request<&'r mut EspHttpConnection<'c>>;

fn server_config() -> Configuration {
    Configuration {
        http_port: 80,
        // Firmware upload writes flash from the handler task
        stack_size: 10240,
        max_uri_handlers: 8,
        max_open_sockets: 7,
        lru_purge_enable: true,
        ..Default::default()
    }
}

fn request_headers(req: &impl Headers) -> RequestHeaders {
    RequestHeaders {
        authorization: req.header("Authorization").map(str::to_string),
        accept_encoding: req.header("Accept-Encoding").map(str::to_string),
        content_length: req.content_len(),
        firmware_sha256: req.header("X-Firmware-Sha256").map(str::to_string),
    }
}

fn send(req: HttpRequest<'_, '_>, reply: Reply) -> anyhow::Result<()> {
    let mut headers: Vec<(&str, &str)> = vec![("Content-Type", reply.content_type)];
    headers.extend(reply.headers.iter().map(|(name, value)| (*name, value.as_str())));
    let mut response = req.into_response(reply.status, None, &headers)?;
    response.write_all(&reply.body)?;
    Ok(())
}

/// Request body read straight off the socket
struct ConnectionBody<'a, R>(&'a mut R);

impl<R: Read<Error = EspIOError>> BodySource for ConnectionBody<'_, R> {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, ReadError> {
        self.0.read(buf).map_err(|e| {
            if e.0.code() == HTTPD_SOCK_ERR_TIMEOUT as i32 {
                ReadError::Timeout
            } else {
                ReadError::Io(e.to_string())
            }
        })
    }
}

/// Builds a fresh server with every route for each bind
pub struct HttpServiceFactory<S: SlotStorage> {
    ctx: AppContext<S>,
}

impl<S: SlotStorage> HttpServiceFactory<S> {
    pub fn new(ctx: AppContext<S>) -> Self {
        Self { ctx }
    }
}

impl<S> HttpServiceFactory<S>
where
    S: SlotStorage + Send + 'static,
    S::Slot: Send,
    S::Writer: Send,
{
    fn build(&self) -> anyhow::Result<EspHttpServer<'static>> {
        let mut server = EspHttpServer::new(&server_config())?;

        server.fn_handler("/", Method::Get, |req| {
            let headers = request_headers(&req);
            send(req, handlers::index(&headers))
        })?;

        let ctx = self.ctx.clone();
        server.fn_handler("/ota", Method::Get, move |req| {
            let headers = request_headers(&req);
            send(req, handlers::ota_page(&ctx, &headers))
        })?;

        let ctx = self.ctx.clone();
        server.fn_handler("/ota", Method::Post, move |mut req| {
            let headers = request_headers(&req);
            let reply = handlers::upload(&ctx, &headers, &mut ConnectionBody(&mut req));
            send(req, reply)
        })?;

        let ctx = self.ctx.clone();
        server.fn_handler("/", Method::Post, move |mut req| {
            let reply = handlers::configure_stream(&ctx, &mut ConnectionBody(&mut req));
            send(req, reply)
        })?;

        let ctx = self.ctx.clone();
        server.fn_handler("/status_update", Method::Get, move |req| {
            send(req, handlers::status(&ctx))
        })?;

        Ok(server)
    }
}

impl<S> ServiceFactory for HttpServiceFactory<S>
where
    S: SlotStorage + Send + 'static,
    S::Slot: Send,
    S::Writer: Send,
{
    type Service = EspHttpServer<'static>;

    fn bind(&mut self, role: LinkRole) -> Result<Self::Service, ServiceError> {
        let server = self.build().map_err(|e| ServiceError::Bind(e.to_string()))?;
        log::info!("HTTP server listening on port 80 ({})", role);
        Ok(server)
    }
}
