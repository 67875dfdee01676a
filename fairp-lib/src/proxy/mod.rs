//! The HTTP/1.1 front of the proxy.
//!
//! Every accepted connection is served on its own task. Requests are
//! dispatched by kind:
//!
//! - `CONNECT host:port` opens a rate limited tunnel
//! - paths starting with `/register` are acknowledged
//! - paths starting with `/health` report [`crate::RuntimeStats`]
//! - everything else is forwarded upstream with a rate limited response body

mod connect;
mod forward;
mod health;

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, header};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use uuid::Uuid;

use crate::ratelimit::HostKey;
use crate::{Result, Runner};

/// Body of every response the proxy sends
pub type ProxyBody = BoxBody<Bytes, io::Error>;

/// Default time allowed for connecting to a tunnel destination
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed `accept` before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// How the proxy reaches destinations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyOptions {
    /// Only connect to IPv6 addresses of tunnel destinations
    pub no_ipv4: bool,
    /// Time allowed for connecting to a tunnel destination
    pub dial_timeout: Duration,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            no_ipv4: false,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
        }
    }
}

/// A proxy serving clients through a shared [`Runner`]
#[derive(Debug, Clone)]
pub struct Proxy {
    runner: Arc<Runner>,
    client: reqwest::Client,
    options: ProxyOptions,
}

impl Proxy {
    /// Create a proxy relaying through `runner`
    ///
    /// # Errors
    ///
    /// Returns an error if the upstream HTTP client cannot be created.
    pub fn new(runner: Arc<Runner>, options: ProxyOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .build()?;

        Ok(Self {
            runner,
            client,
            options,
        })
    }

    /// The runner all transfers go through
    #[must_use]
    pub const fn runner(&self) -> &Arc<Runner> {
        &self.runner
    }

    /// Accept connections on `listener` until the runner shuts down
    ///
    /// # Errors
    ///
    /// Currently never fails; accept errors are logged and retried.
    pub async fn serve(self, listener: TcpListener) -> Result<()> {
        let shutdown = self.runner.shutdown_token();
        if let Ok(addr) = listener.local_addr() {
            log::info!("Proxy listening address={addr}");
        }

        loop {
            let accepted = tokio::select! {
                () = shutdown.cancelled() => {
                    log::info!("Proxy stopped accepting connections");
                    return Ok(());
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote_addr)) => {
                    let proxy = self.clone();
                    tokio::spawn(async move { proxy.serve_connection(stream, remote_addr).await });
                }
                Err(e) => {
                    log::warn!("Failed to accept connection: {e}");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }
    }

    async fn serve_connection(self, stream: TcpStream, remote_addr: SocketAddr) {
        let io = TokioIo::new(stream);
        let service = service_fn(move |req| {
            let proxy = self.clone();
            async move { Ok::<_, Infallible>(proxy.handle(req, remote_addr).await) }
        });

        if let Err(e) = http1::Builder::new()
            .serve_connection(io, service)
            .with_upgrades()
            .await
        {
            log::debug!("Connection ended remote_addr={remote_addr} error={e}");
        }
    }

    async fn handle(&self, req: Request<Incoming>, remote_addr: SocketAddr) -> Response<ProxyBody> {
        let trace_id = Uuid::new_v4();
        let remote_host = HostKey::from(remote_addr);
        log_request(&req, trace_id, remote_addr);

        if req.method() == Method::CONNECT {
            return connect::tunnel(self, req, trace_id, remote_host).await;
        }

        let url = req.uri().to_string();
        if url.starts_with("/register") {
            log::info!("Registered host trace_id={trace_id} url={url} remote_addr={remote_addr}");
            return text(StatusCode::OK, "Thank you for registering :)\n");
        }
        if url.starts_with("/health") {
            return health::report(self, remote_host).await;
        }

        forward::forward(self, req, trace_id, remote_host).await
    }
}

/// Serve `listener` through `runner` until the runner shuts down
///
/// # Errors
///
/// Returns an error if the proxy cannot be created.
pub async fn serve(runner: Arc<Runner>, listener: TcpListener, options: ProxyOptions) -> Result<()> {
    Proxy::new(runner, options)?.serve(listener).await
}

fn log_request(req: &Request<Incoming>, trace_id: Uuid, remote_addr: SocketAddr) {
    let header = |name: header::HeaderName| {
        req.headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
    };

    log::info!(
        "Got request trace_id={trace_id} method={} url={} host={} remote_addr={remote_addr} user_agent={:?}",
        req.method(),
        req.uri(),
        header(header::HOST),
        header(header::USER_AGENT),
    );
    log::debug!(
        "Request headers trace_id={trace_id} headers={:?}",
        req.headers()
    );
}

/// A plain text response
fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<ProxyBody> {
    let mut response = Response::new(
        Full::new(body.into())
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// An empty response
fn empty(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response
}

/// The error text as a response body, the way clients of the proxy expect
/// it
fn error_response(status: StatusCode, err: &impl std::fmt::Display) -> Response<ProxyBody> {
    text(status, format!("{err}\n"))
}
