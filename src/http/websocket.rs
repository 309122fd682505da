//! WebSocket proxy engine.
//!
//! # Responsibilities
//! - Apply the resolver and authentication gate before upgrading
//! - Complete the upgrade with the caller, advertising its subprotocols
//! - Open the upstream WebSocket with the same subprotocols, headers and TLS
//! - Relay frames in both directions until either side finishes
//!
//! # Data Flow
//! ```text
//! Client ←──── WebSocket frames ────→ Proxy ←──── WebSocket frames ────→ Upstream
//!          inbound relay:  client  → upstream
//!          outbound relay: upstream → client
//! ```
//!
//! # Design Decisions
//! - Both legs are raw upgraded connections read through [`FrameCodec`]:
//!   nothing answers pings or close frames on the proxy's behalf
//! - TEXT, BINARY (with their continuation fragments), PING and PONG frames are
//!   relayed verbatim, one frame in flight per direction
//! - A close frame or error on either side ends that relay; the other relay is
//!   stopped through a watch channel, even mid-write, and both legs get a
//!   normal close
//! - The upstream handshake goes through the pooled reqwest client, so TLS
//!   policy matches the HTTP engine
//! - Upstream connect failures after the upgrade close the caller's socket

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::State,
    http::{
        header::{
            CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
            SEC_WEBSOCKET_VERSION, UPGRADE,
        },
        HeaderMap, HeaderName, HeaderValue, Method, Request, StatusCode,
    },
    response::{IntoResponse, Response},
    routing::any,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::{
    handshake::{client::generate_key, derive_accept_key},
    protocol::{
        frame::{
            coding::{CloseCode, Control, Data, OpCode},
            CloseFrame, Frame,
        },
        Role,
    },
};
use tokio_util::codec::{FramedRead, FramedWrite};
use url::Url;
use uuid::Uuid;

use crate::http::proxy::EngineSettings;
use crate::http::request::{route_params, ProxyRequest};
use crate::net::client::{redact, UpstreamClient, UpstreamError};
use crate::net::frame::FrameCodec;
use crate::observability::metrics::{self, SessionGauge};
use crate::routing::resolver::{authorize, ResolvedTarget, Resolver};
use crate::security::headers::outbound_headers;

const KIND: &str = "websocket";

/// How long teardown waits for a leg to take its close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Relays one inbound WebSocket session to the target picked by its resolver.
///
/// Serve the router with `into_make_service_with_connect_info::<SocketAddr>()`
/// so the caller's address lands in `X-Forwarded-For`; otherwise the hop is
/// recorded as `unknown`. The server must also allow HTTP upgrades
/// (`axum::serve` and `axum-server` both do).
#[derive(Clone)]
pub struct WebSocketProxy {
    resolver: Arc<dyn Resolver>,
    client: UpstreamClient,
    settings: EngineSettings,
}

impl WebSocketProxy {
    pub fn new(resolver: Arc<dyn Resolver>, client: UpstreamClient) -> Self {
        Self {
            resolver,
            client,
            settings: EngineSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Router serving this engine on `path`.
    pub fn into_router(self, path: &str) -> Router {
        Router::new()
            .route(path, any(upgrade_handler))
            .with_state(self)
    }

    pub async fn handle(&self, request: Request<Body>) -> Response {
        let start = Instant::now();
        let (mut parts, _body) = request.into_parts();
        let params = route_params(&mut parts).await;

        let (target, protocols, headers) = {
            let request = ProxyRequest::new(&parts).with_params(params);
            let target = match authorize(self.resolver.as_ref(), &request) {
                Ok(target) => target,
                Err(status) => {
                    metrics::record_request(KIND, status.as_u16(), start);
                    return status.into_response();
                }
            };
            let protocols = requested_protocols(request.headers());
            let headers = outbound_headers(
                request.headers(),
                target.headers.as_ref(),
                &request.forwarding(self.settings.inbound_scheme),
            );
            (target, protocols, headers)
        };

        let accept = match accept_key(&parts.method, &parts.headers) {
            Ok(accept) => accept,
            Err(status) => {
                metrics::record_request(KIND, status.as_u16(), start);
                return status.into_response();
            }
        };
        let Some(inbound) = parts.extensions.remove::<OnUpgrade>() else {
            metrics::record_request(KIND, StatusCode::UPGRADE_REQUIRED.as_u16(), start);
            return StatusCode::UPGRADE_REQUIRED.into_response();
        };

        let upstream = upstream_request(&target, &protocols, &headers)
            .and_then(|handshake| Ok((handshake, self.client.http(target.tls.as_ref())?)));
        let (handshake, client) = match upstream {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::warn!(
                    path = %parts.uri.path(),
                    target = %redact(&target.url),
                    error = %e,
                    "Invalid upstream websocket request"
                );
                metrics::record_upstream_error(KIND);
                metrics::record_request(KIND, 502, start);
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        metrics::record_request(KIND, 101, start);
        tokio::spawn(run_session(inbound, client, handshake, redact(&target.url)));
        switching_protocols(accept, protocols.first())
    }
}

impl fmt::Debug for WebSocketProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketProxy")
            .field("resolver", &self.resolver)
            .field("settings", &self.settings)
            .finish()
    }
}

async fn upgrade_handler(State(proxy): State<WebSocketProxy>, request: Request<Body>) -> Response {
    proxy.handle(request).await
}

/// Subprotocols named in Sec-WebSocket-Protocol, in order, trimmed.
pub fn requested_protocols(headers: &HeaderMap) -> Vec<String> {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Check an inbound upgrade request and derive its Sec-WebSocket-Accept.
pub fn accept_key(method: &Method, headers: &HeaderMap) -> Result<HeaderValue, StatusCode> {
    if *method != Method::GET {
        return Err(StatusCode::METHOD_NOT_ALLOWED);
    }
    if !has_token(headers, &CONNECTION, "upgrade") || !has_token(headers, &UPGRADE, "websocket") {
        return Err(StatusCode::BAD_REQUEST);
    }
    if !headers
        .get(SEC_WEBSOCKET_VERSION)
        .is_some_and(|v| v.as_bytes() == b"13")
    {
        return Err(StatusCode::BAD_REQUEST);
    }
    let key = headers.get(SEC_WEBSOCKET_KEY).ok_or(StatusCode::BAD_REQUEST)?;
    HeaderValue::from_str(&derive_accept_key(key.as_bytes())).map_err(|_| StatusCode::BAD_REQUEST)
}

fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn switching_protocols(accept: HeaderValue, protocol: Option<&String>) -> Response {
    let mut response = StatusCode::SWITCHING_PROTOCOLS.into_response();
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    if let Some(protocol) = protocol.and_then(|p| HeaderValue::from_str(p).ok()) {
        headers.insert(SEC_WEBSOCKET_PROTOCOL, protocol);
    }
    response
}

/// Opening handshake for the upstream leg.
#[derive(Debug, Clone)]
pub struct UpstreamHandshake {
    url: Url,
    headers: HeaderMap,
    key: String,
}

impl UpstreamHandshake {
    /// URL dialed for the upgrade (`ws`/`wss` targets as `http`/`https`).
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Sec-WebSocket-Accept value a conforming upstream answers with.
    pub fn expected_accept(&self) -> String {
        derive_accept_key(self.key.as_bytes())
    }
}

/// Handshake request for the upstream socket.
///
/// The outbound headers are carried over; the upgrade headers, a fresh key
/// and the subprotocol list (in the caller's order) are set on top.
pub fn upstream_request(
    target: &ResolvedTarget,
    protocols: &[String],
    headers: &HeaderMap,
) -> Result<UpstreamHandshake, UpstreamError> {
    let mut url = target.upstream_url()?;
    let scheme = match url.scheme() {
        "http" | "ws" => "http",
        "https" | "wss" => "https",
        other => return Err(UpstreamError::UnsupportedScheme(other.to_string())),
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|()| UpstreamError::UnsupportedScheme(url.scheme().to_string()))?;
    }

    let key = generate_key();
    let mut outbound = headers.clone();
    outbound.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
    outbound.insert(UPGRADE, HeaderValue::from_static("websocket"));
    outbound.insert(SEC_WEBSOCKET_VERSION, HeaderValue::from_static("13"));
    outbound.insert(SEC_WEBSOCKET_KEY, HeaderValue::from_str(&key)?);
    if !protocols.is_empty() {
        outbound.insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(&protocols.join(", "))?,
        );
    }
    Ok(UpstreamHandshake {
        url,
        headers: outbound,
        key,
    })
}

async fn connect_upstream(
    client: &reqwest::Client,
    handshake: UpstreamHandshake,
) -> Result<reqwest::Upgraded, UpstreamError> {
    let expected = handshake.expected_accept();
    let response = client
        .get(handshake.url)
        .headers(handshake.headers)
        .send()
        .await
        .map_err(UpstreamError::Request)?;

    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(UpstreamError::Handshake(format!(
            "upstream answered {}",
            response.status()
        )));
    }
    let accepted = response
        .headers()
        .get(SEC_WEBSOCKET_ACCEPT)
        .and_then(|v| v.to_str().ok());
    if accepted != Some(expected.as_str()) {
        return Err(UpstreamError::Handshake(
            "missing or wrong Sec-WebSocket-Accept".to_string(),
        ));
    }
    if let Some(protocol) = response.headers().get(SEC_WEBSOCKET_PROTOCOL) {
        tracing::debug!(protocol = ?protocol, "Upstream selected subprotocol");
    }

    response.upgrade().await.map_err(UpstreamError::Request)
}

async fn run_session(
    inbound: OnUpgrade,
    client: reqwest::Client,
    handshake: UpstreamHandshake,
    target: String,
) {
    let session = Uuid::new_v4();
    let inbound = match inbound.await {
        Ok(upgraded) => TokioIo::new(upgraded),
        Err(e) => {
            tracing::debug!(%session, error = %e, "Inbound upgrade failed");
            return;
        }
    };
    let (client_read, client_write) = tokio::io::split(inbound);
    let client_tx = FramedWrite::new(client_write, FrameCodec::new(Role::Server));

    let upstream = match connect_upstream(&client, handshake).await {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::warn!(%session, target = %target, error = %e, "Upstream websocket connect failed");
            metrics::record_upstream_error(KIND);
            close_leg(client_tx).await;
            return;
        }
    };

    let _gauge = SessionGauge::open();
    tracing::debug!(%session, target = %target, "WebSocket session established");

    let (upstream_read, upstream_write) = tokio::io::split(upstream);
    let client_rx = FramedRead::new(client_read, FrameCodec::new(Role::Server));
    let upstream_rx = FramedRead::new(upstream_read, FrameCodec::new(Role::Client));
    let upstream_tx = FramedWrite::new(upstream_write, FrameCodec::new(Role::Client));
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut inbound = tokio::spawn(relay(client_rx, upstream_tx, stop_rx.clone(), "inbound", session));
    let mut outbound = tokio::spawn(relay(upstream_rx, client_tx, stop_rx, "outbound", session));

    let (upstream_tx, client_tx) = tokio::select! {
        finished = &mut inbound => {
            let _ = stop_tx.send(true);
            (finished, outbound.await)
        }
        finished = &mut outbound => {
            let _ = stop_tx.send(true);
            (inbound.await, finished)
        }
    };

    if let Ok(sink) = upstream_tx {
        close_leg(sink).await;
    }
    if let Ok(sink) = client_tx {
        close_leg(sink).await;
    }
    tracing::debug!(%session, "WebSocket session closed");
}

/// What a relay does with one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Forward,
    End,
    Skip,
}

fn action(frame: &Frame) -> Action {
    match frame.header().opcode {
        OpCode::Data(Data::Text | Data::Binary | Data::Continue)
        | OpCode::Control(Control::Ping | Control::Pong) => Action::Forward,
        OpCode::Control(Control::Close) => Action::End,
        OpCode::Data(Data::Reserved(_)) | OpCode::Control(Control::Reserved(_)) => Action::Skip,
    }
}

/// Forward frames from `source` to `sink` until the source ends, a write
/// fails, or `stop` fires. Hands the sink back so the caller can close it.
async fn relay<R, W>(
    mut source: FramedRead<R, FrameCodec>,
    mut sink: FramedWrite<W, FrameCodec>,
    mut stop: watch::Receiver<bool>,
    direction: &'static str,
    session: Uuid,
) -> FramedWrite<W, FrameCodec>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = stop.changed() => break,
            next = source.next() => next,
        };

        let frame = match next {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                tracing::debug!(%session, direction, error = %e, "WebSocket read failed");
                break;
            }
            None => break,
        };

        match action(&frame) {
            Action::Forward => {}
            Action::Skip => continue,
            Action::End => {
                tracing::debug!(%session, direction, "Close frame received");
                break;
            }
        }

        // A peer that stopped reading must not hold up teardown.
        tokio::select! {
            _ = stop.changed() => break,
            sent = sink.send(frame) => {
                if let Err(e) = sent {
                    tracing::debug!(%session, direction, error = %e, "WebSocket write failed");
                    break;
                }
            }
        }
    }
    sink
}

async fn close_leg<W>(mut sink: FramedWrite<W, FrameCodec>)
where
    W: AsyncWrite + Unpin,
{
    let close = Frame::close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }));
    let _ = tokio::time::timeout(CLOSE_TIMEOUT, async move {
        if sink.send(close).await.is_ok() {
            let _ = sink.close().await;
        }
    })
    .await;
}
