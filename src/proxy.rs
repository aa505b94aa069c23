//! Proxy server implementation
//! Serves the local address and mirrors the public host through the rewriter

use crate::identity::Identity;
use crate::rewrite::Rewriter;
use crate::transport::Transport;
use anyhow::{anyhow, bail, Context, Result};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use socket2::{Domain, Protocol, SockRef, Socket, TcpKeepalive, Type};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// Default TCP keep-alive period for accepted connections.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(3 * 60);

const LISTEN_BACKLOG: i32 = 1024;

/// Headers that only describe a single hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "proxy-authenticate",
    "proxy-authorization",
];

/// Proxy server configuration
#[derive(Clone)]
pub struct ProxyConfig {
    pub listen_addr: SocketAddr,
    pub keepalive: Duration,
}

impl ProxyConfig {
    pub fn for_identity(identity: &Identity) -> Self {
        Self {
            listen_addr: identity.listen_addr(),
            keepalive: DEFAULT_KEEPALIVE,
        }
    }
}

/// Proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    rewriter: Arc<Rewriter>,
    transport: Arc<Transport>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: ProxyConfig, rewriter: Arc<Rewriter>, transport: Arc<Transport>) -> Self {
        Self {
            config,
            rewriter,
            transport,
        }
    }

    /// Bind and serve until the listener fails
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = bind_ipv6_only(self.config.listen_addr)?;
        info!("Proxy server listening on {}", self.config.listen_addr);
        info!(
            "Proxying from {} to {} via {}",
            self.rewriter.local_origin(),
            self.rewriter.public_origin(),
            self.transport.upstream()
        );

        self.serve(listener).await
    }

    /// Accept loop over an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, remote_addr) = listener.accept().await.context("accept failed")?;
            set_keepalive(&stream, self.config.keepalive);

            let rewriter = self.rewriter.clone();
            let transport = self.transport.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, remote_addr, rewriter, transport).await {
                    debug!("HTTP connection error from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handle a single HTTP connection
    async fn handle_connection(
        stream: TcpStream,
        remote_addr: SocketAddr,
        rewriter: Arc<Rewriter>,
        transport: Arc<Transport>,
    ) -> Result<()> {
        let io = TokioIo::new(stream);

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(false)
            .serve_connection(
                io,
                service_fn(move |req| {
                    let rewriter = rewriter.clone();
                    let transport = transport.clone();
                    async move { Self::handle_request(req, remote_addr, rewriter, transport).await }
                }),
            )
            .await
            .map_err(|e| anyhow!("HTTP service error: {}", e))
    }

    /// Handle incoming request
    async fn handle_request(
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        rewriter: Arc<Rewriter>,
        transport: Arc<Transport>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, Infallible> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        info!("Received request: {} {} from {}", method, uri, remote_addr);

        match Self::proxy_request(req, remote_addr, &rewriter, &transport).await {
            Ok(response) => {
                debug!("Sending response: {} for {} {}", response.status(), method, uri);
                Ok(response)
            }
            Err(e) => {
                error!("Proxy error for {} {} from {}: {:#}", method, uri, remote_addr, e);
                Ok(Self::error_response(StatusCode::BAD_GATEWAY, "Bad Gateway"))
            }
        }
    }

    /// Rewrite, forward and rewrite back one exchange
    async fn proxy_request(
        req: Request<Incoming>,
        remote_addr: SocketAddr,
        rewriter: &Rewriter,
        transport: &Transport,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>> {
        let (parts, body) = req.into_parts();

        let body_bytes = match body.collect().await {
            Ok(b) => b.to_bytes(),
            Err(e) => {
                warn!("Failed to read request body from {}: {}", remote_addr, e);
                return Ok(Self::error_response(StatusCode::BAD_REQUEST, "Bad Request"));
            }
        };

        let mut headers = rewriter.outbound_headers(&parts.headers, remote_addr);
        strip_hop_by_hop(&mut headers);
        headers.remove(HOST);

        let path = parts.uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

        let mut builder = Request::builder()
            .method(parts.method.clone())
            .uri(path)
            .version(Version::HTTP_11)
            .header(HOST, rewriter.public_host());
        if let Some(h) = builder.headers_mut() {
            h.extend(headers);
        }

        let proxy_req = builder
            .body(Full::new(body_bytes))
            .context("Failed to build backend request")?;

        let response = transport.send(proxy_req).await?;

        let (mut parts_out, body) = response.into_parts();
        let body_bytes = body.collect().await.context("Failed to read response body")?.to_bytes();

        let rewritten = rewriter.body(&body_bytes);
        let mut headers = rewriter.inbound_headers(&parts_out.headers);
        strip_hop_by_hop(&mut headers);

        if parts.method != Method::HEAD && !is_bodiless(parts_out.status) {
            headers.insert(CONTENT_LENGTH, rewritten.len().into());
        }

        parts_out.headers = headers;
        parts_out.version = Version::HTTP_11;

        Ok(Response::from_parts(parts_out, Self::full_body(rewritten)))
    }

    /// Create error response
    fn error_response(status: StatusCode, message: &str) -> Response<BoxBody<Bytes, hyper::Error>> {
        let mut response = Response::new(Self::full_body(Bytes::from(message.to_string())));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert("Content-Type", hyper::header::HeaderValue::from_static("text/plain"));
        response
    }

    /// Create full body
    fn full_body(bytes: Bytes) -> BoxBody<Bytes, hyper::Error> {
        Full::new(bytes).map_err(|never| match never {}).boxed()
    }
}

/// Bind a listener that only accepts IPv6 connections.
pub fn bind_ipv6_only(addr: SocketAddr) -> Result<TcpListener> {
    if !addr.is_ipv6() {
        bail!("refusing to listen on non-IPv6 address {}", addr);
    }

    let socket = Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_only_v6(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("Failed to bind {}", addr))?;
    socket.listen(LISTEN_BACKLOG)?;

    let listener = TcpListener::from_std(socket.into())?;
    Ok(listener)
}

/// Enable TCP keep-alive on an accepted connection.
fn set_keepalive(stream: &TcpStream, period: Duration) {
    let ka = TcpKeepalive::new().with_time(period);

    #[cfg(any(target_os = "linux", target_os = "macos", target_os = "windows"))]
    let ka = ka.with_interval(period);

    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&ka) {
        warn!("Failed to enable keep-alive: {}", e);
    }
}

/// Remove hop-by-hop headers, including any named in `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    headers.remove(TRANSFER_ENCODING);
}

fn is_bodiless(status: StatusCode) -> bool {
    status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED
}
