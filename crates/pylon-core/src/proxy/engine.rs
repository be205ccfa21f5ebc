//! Forwarding admitted requests to the downstream.
//!
//! The engine owns the downstream connection lifetime. Responses branch on
//! the downstream content type: anything but `text/event-stream` streams
//! through as-is; event streams additionally get per-message rate
//! accounting, an idle timeout, and in-band `pylon_error` termination
//! frames.
//!
//! Every forwarded request carries a [`Finalizer`] through its response
//! body: a guard that, exactly once and on every exit path — completion,
//! client disconnect, downstream failure — releases the admission ticket and
//! hands the completion record to the recorder.

use crate::{
    admission::Ticket,
    limits::CheckRules,
    policy::PolicySnapshot,
    proxy::sse::{error_frame, FrameScanner},
    recorder::{Recorder, RequestRecord, STATUS_CLIENT_CLOSED},
};
use axum::{
    body::Body,
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::Response,
};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{
    stream::{BoxStream, Stream, StreamExt},
    TryStreamExt,
};
use std::{
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;
type ByteStream = BoxStream<'static, Result<Bytes, BoxError>>;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("failed to build downstream client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Headers never forwarded in either direction, plus the credentials we
/// consumed ourselves.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

const REQUEST_STRIP: &[&str] = &["authorization", "host", "content-length"];
const RESPONSE_STRIP: &[&str] = &["content-length"];

const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything the engine needs about one admitted request.
pub struct ForwardContext {
    pub method: Method,
    /// Path with leading slash, no query string.
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub client_ip: String,
    pub request_time: DateTime<Utc>,
    pub started: Instant,
    /// Caps for SSE message accounting, resolved at admission.
    pub rules: CheckRules,
}

pub struct ProxyEngine {
    client: reqwest::Client,
    bank: crate::limits::CounterBank,
    recorder: Arc<Recorder>,
}

impl ProxyEngine {
    /// # Errors
    ///
    /// Returns [`ProxyError::Client`] if the HTTP client cannot be built.
    pub fn new(
        bank: crate::limits::CounterBank,
        recorder: Arc<Recorder>,
    ) -> Result<Self, ProxyError> {
        // Downstream connections are direct; ambient proxy configuration
        // does not apply to them.
        let client = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self { client, bank, recorder })
    }

    /// Probes the downstream base address. Any response, error status
    /// included, counts as reachable.
    pub async fn health(&self, snapshot: &PolicySnapshot) -> bool {
        if snapshot.downstream.base_url.is_empty() {
            return false;
        }
        self.client
            .head(&snapshot.downstream.base_url)
            .timeout(HEALTH_PROBE_TIMEOUT)
            .send()
            .await
            .is_ok()
    }

    /// Forwards one admitted request and returns the client-facing response.
    ///
    /// Never fails: downstream trouble becomes a 502 (before any bytes were
    /// sent) or an in-band termination (mid-stream). The ticket and the
    /// completion record are handled by the finalizer on every path.
    pub async fn forward(
        &self,
        ticket: Ticket,
        ctx: ForwardContext,
        snapshot: &PolicySnapshot,
    ) -> Response {
        let url = build_url(&snapshot.downstream.base_url, &ctx.path, ctx.query.as_deref());
        let record = RequestRecord {
            api_key_id: ticket.identity_id().to_string(),
            api_identifier: ticket.api().to_string(),
            request_path: ctx.path.clone(),
            request_method: ctx.method.to_string(),
            response_status: STATUS_CLIENT_CLOSED,
            request_time: ctx.request_time,
            response_time_ms: 0,
            client_ip: ctx.client_ip.clone(),
            is_sse: ticket.kind() == crate::limits::TicketKind::Sse,
            sse_message_count: 0,
        };
        let identity = ticket.identity_id().to_string();
        let api = ticket.api().to_string();
        let mut finalizer = Finalizer::new(ticket, Arc::clone(&self.recorder), record, ctx.started);

        let request = self
            .client
            .request(ctx.method.clone(), url)
            .headers(filter_headers(&ctx.headers, REQUEST_STRIP))
            .body(ctx.body.clone());

        // The downstream deadline bounds connect plus response headers here,
        // and the body relay below. It must not be a whole-request timeout:
        // that would cut healthy long-lived event streams, which are bounded
        // by the SSE idle timeout instead.
        let deadline = snapshot.downstream.timeout_duration();
        let response = match tokio::time::timeout(deadline, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "downstream request failed");
                finalizer.set_status(StatusCode::BAD_GATEWAY.as_u16());
                finalizer.complete();
                return bad_gateway_response();
            }
            Err(_elapsed) => {
                tracing::warn!(timeout_s = snapshot.downstream.timeout, "downstream timed out");
                finalizer.set_status(StatusCode::BAD_GATEWAY.as_u16());
                finalizer.complete();
                return bad_gateway_response();
            }
        };

        let status = response.status();
        let response_headers = filter_headers(response.headers(), RESPONSE_STRIP);
        finalizer.set_status(status.as_u16());

        let stream: ByteStream = response.bytes_stream().map_err(|e| Box::new(e) as BoxError).boxed();

        if is_event_stream(&response_headers) {
            self.stream_sse(status, response_headers, stream, finalizer, identity, api, &ctx, snapshot)
        } else {
            let body = Body::from_stream(UnaryRelay {
                inner: stream,
                deadline: Box::pin(tokio::time::sleep(deadline)),
                finalizer: Some(finalizer),
            });
            into_response(status, response_headers, body)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn stream_sse(
        &self,
        status: StatusCode,
        mut headers: HeaderMap,
        stream: ByteStream,
        finalizer: Finalizer,
        identity: String,
        api: String,
        ctx: &ForwardContext,
        snapshot: &PolicySnapshot,
    ) -> Response {
        let idle = snapshot.sse.idle_timeout_duration();
        let relay = SseRelay {
            inner: stream,
            scanner: FrameScanner::new(),
            bank: self.bank.clone(),
            identity,
            api,
            rules: ctx.rules,
            idle,
            idle_timeout_secs: snapshot.sse.idle_timeout,
            deadline: Box::pin(tokio::time::sleep(idle)),
            finalizer,
            state: RelayState::Streaming,
        };

        headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
        headers.insert(
            HeaderName::from_static("x-accel-buffering"),
            HeaderValue::from_static("no"),
        );

        into_response(status, headers, Body::from_stream(relay))
    }
}

fn bad_gateway_response() -> Response {
    let body = serde_json::json!({
        "code": "downstream_error",
        "message": "Failed to reach downstream API",
    });
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("static response must build")
}

fn into_response(status: StatusCode, headers: HeaderMap, body: Body) -> Response {
    let mut response = Response::builder()
        .status(status)
        .body(body)
        .expect("response with validated parts must build");
    *response.headers_mut() = headers;
    response
}

fn build_url(base: &str, path: &str, query: Option<&str>) -> String {
    let mut url = String::with_capacity(base.len() + path.len() + 16);
    url.push_str(base.trim_end_matches('/'));
    url.push_str(path);
    if let Some(query) = query {
        url.push('?');
        url.push_str(query);
    }
    url
}

fn filter_headers(headers: &HeaderMap, extra_strip: &[&str]) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let lower = name.as_str();
        if HOP_BY_HOP.contains(&lower) || extra_strip.contains(&lower) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim_start().starts_with("text/event-stream"))
}

/// Releases the ticket and emits the completion record exactly once.
struct Finalizer {
    ticket: Option<Ticket>,
    recorder: Arc<Recorder>,
    record: RequestRecord,
    started: Instant,
    done: bool,
}

impl Finalizer {
    fn new(ticket: Ticket, recorder: Arc<Recorder>, record: RequestRecord, started: Instant) -> Self {
        Self { ticket: Some(ticket), recorder, record, started, done: false }
    }

    fn set_status(&mut self, status: u16) {
        if !self.done {
            self.record.response_status = status;
        }
    }

    fn add_messages(&mut self, n: i64) {
        self.record.sse_message_count += n;
    }

    fn complete(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.record.response_time_ms =
            i64::try_from(self.started.elapsed().as_millis()).unwrap_or(i64::MAX);
        // Slot first, then the record: the recorder observes released state.
        self.ticket.take();
        self.recorder.record(self.record.clone());
    }
}

impl Drop for Finalizer {
    fn drop(&mut self) {
        self.complete();
    }
}

/// Passthrough body for non-SSE responses, bounded by the downstream
/// deadline.
struct UnaryRelay {
    inner: ByteStream,
    deadline: Pin<Box<tokio::time::Sleep>>,
    finalizer: Option<Finalizer>,
}

impl Stream for UnaryRelay {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finalizer.is_none() {
            return Poll::Ready(None);
        }

        match this.inner.as_mut().poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => Poll::Ready(Some(Ok(chunk))),
            Poll::Ready(Some(Err(e))) => {
                tracing::warn!(error = %e, "downstream failed mid-response");
                if let Some(mut finalizer) = this.finalizer.take() {
                    finalizer.set_status(StatusCode::BAD_GATEWAY.as_u16());
                    finalizer.complete();
                }
                Poll::Ready(Some(Err(std::io::Error::other(e))))
            }
            Poll::Ready(None) => {
                if let Some(mut finalizer) = this.finalizer.take() {
                    finalizer.complete();
                }
                Poll::Ready(None)
            }
            Poll::Pending => {
                if this.deadline.as_mut().poll(cx).is_ready() {
                    tracing::warn!("downstream body read hit the request deadline");
                    if let Some(mut finalizer) = this.finalizer.take() {
                        finalizer.set_status(StatusCode::BAD_GATEWAY.as_u16());
                        finalizer.complete();
                    }
                    return Poll::Ready(Some(Err(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "downstream deadline exceeded",
                    ))));
                }
                Poll::Pending
            }
        }
    }
}

enum RelayState {
    Streaming,
    /// A termination frame is queued (`Some`) or was just sent (`None`).
    Emitting(Option<Bytes>),
    Done,
}

/// SSE passthrough with message accounting, idle timeout, and in-band
/// termination.
struct SseRelay {
    inner: ByteStream,
    scanner: FrameScanner,
    bank: crate::limits::CounterBank,
    identity: String,
    api: String,
    rules: CheckRules,
    idle: Duration,
    idle_timeout_secs: u64,
    deadline: Pin<Box<tokio::time::Sleep>>,
    finalizer: Finalizer,
    state: RelayState,
}

impl SseRelay {
    /// Charges completed events in the chunk against the rate window.
    /// Returns the allowed prefix length when a message was denied.
    fn account_chunk(&mut self, chunk: &[u8]) -> Option<usize> {
        let boundaries = self.scanner.scan(chunk);
        for (index, _) in boundaries.iter().enumerate() {
            match self.bank.try_record_message(&self.identity, &self.api, &self.rules) {
                Ok(()) => self.finalizer.add_messages(1),
                Err(_) => {
                    let cut = if index == 0 { 0 } else { boundaries[index - 1] };
                    return Some(cut);
                }
            }
        }
        None
    }
}

impl Stream for SseRelay {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            match &mut this.state {
                RelayState::Done => return Poll::Ready(None),
                RelayState::Emitting(frame) => {
                    if let Some(frame) = frame.take() {
                        return Poll::Ready(Some(Ok(frame)));
                    }
                    this.finalizer.complete();
                    this.state = RelayState::Done;
                    return Poll::Ready(None);
                }
                RelayState::Streaming => match this.inner.as_mut().poll_next(cx) {
                    Poll::Ready(Some(Ok(chunk))) => {
                        this.deadline
                            .as_mut()
                            .reset(tokio::time::Instant::now() + this.idle);

                        if let Some(cut) = this.account_chunk(&chunk) {
                            let frame = error_frame(
                                "rate_limit_exceeded",
                                "Message rate limit exceeded",
                            );
                            if cut == 0 {
                                this.state = RelayState::Emitting(None);
                                return Poll::Ready(Some(Ok(frame)));
                            }
                            this.state = RelayState::Emitting(Some(frame));
                            return Poll::Ready(Some(Ok(chunk.slice(..cut))));
                        }
                        return Poll::Ready(Some(Ok(chunk)));
                    }
                    Poll::Ready(Some(Err(e))) => {
                        tracing::warn!(error = %e, "downstream SSE stream failed");
                        this.state = RelayState::Emitting(None);
                        return Poll::Ready(Some(Ok(error_frame(
                            "downstream_error",
                            "Downstream stream error",
                        ))));
                    }
                    Poll::Ready(None) => {
                        this.finalizer.complete();
                        this.state = RelayState::Done;
                        return Poll::Ready(None);
                    }
                    Poll::Pending => {
                        if this.deadline.as_mut().poll(cx).is_ready() {
                            let message = format!(
                                "No data received for {} seconds",
                                this.idle_timeout_secs
                            );
                            this.state = RelayState::Emitting(None);
                            return Poll::Ready(Some(Ok(error_frame("idle_timeout", &message))));
                        }
                        return Poll::Pending;
                    }
                },
            }
        }
    }
}
