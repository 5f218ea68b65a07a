//! Tracing setup and the HTTP span/response hooks used by the trace layer.
//!
//! Events emitted inside a request span are prefixed with
//! `[request_id=...]` so log lines can be correlated without a JSON parser.

use std::{io::IsTerminal, time::Duration};

use axum::{body::HttpBody, extract::MatchedPath};
use tower_http::request_id::RequestId;
use tracing::{
    field::{Field, Visit},
    Event, Subscriber,
};
use tracing_subscriber::{
    fmt::{
        format::{Format as FmtFormat, Writer as FmtWriter},
        FmtContext, FormatEvent, FormatFields, MakeWriter,
    },
    layer::{Context as LayerContext, SubscriberExt},
    registry::LookupSpan,
    EnvFilter, Layer,
};

use crate::config::{LogFormat, ServerConfig};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const HTTP_SPAN_NAME: &str = "chatroom.http";
const DEFAULT_FILTER: &str = "info,chatroom_server=info";

pub fn init_tracing(config: &ServerConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let json = matches!(config.log_format(), LogFormat::Json);
    let ansi = std::io::stderr().is_terminal();
    let subscriber = build_subscriber(json, ansi, env_filter, std::io::stderr);

    // A second install (tests, embedded runs) keeps the first subscriber.
    if let Err(err) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to install tracing subscriber: {err}");
    }
}

/// `ansi` colours field output and should only be set for terminal writers.
pub fn build_subscriber<W>(
    json: bool,
    ansi: bool,
    env_filter: EnvFilter,
    make_writer: W,
) -> Box<dyn Subscriber + Send + Sync>
where
    W: for<'a> MakeWriter<'a> + Send + Sync + Clone + 'static,
{
    if json {
        let format = FmtFormat::default()
            .with_target(true)
            .with_level(true)
            .json();

        Box::new(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(RequestIdStorageLayer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_ansi(false)
                        .event_format(RequestIdEventFormat::new(format))
                        .with_writer(make_writer),
                ),
        )
    } else {
        let format = FmtFormat::default()
            .with_target(true)
            .with_level(true)
            .with_ansi(ansi);

        Box::new(
            tracing_subscriber::registry()
                .with(env_filter)
                .with(RequestIdStorageLayer)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(ansi)
                        .event_format(RequestIdEventFormat::new(format))
                        .with_writer(make_writer),
                ),
        )
    }
}

#[derive(Clone, Default)]
pub struct HttpSpanMaker;

impl<B> tower_http::trace::MakeSpan<B> for HttpSpanMaker
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let route = request
            .extensions()
            .get::<MatchedPath>()
            .map(|matched| matched.as_str().to_string())
            .unwrap_or_else(|| request.uri().path().to_string());
        let request_id = request
            .extensions()
            .get::<RequestId>()
            .and_then(|rid| rid.header_value().to_str().ok())
            .unwrap_or("unknown")
            .to_string();

        tracing::info_span!(
            HTTP_SPAN_NAME,
            method = %request.method(),
            route = %route,
            request_id = %request_id,
            status_code = tracing::field::Empty,
            latency_ms = tracing::field::Empty
        )
    }
}

#[derive(Clone, Default)]
pub struct HttpOnResponse;

impl<B> tower_http::trace::OnResponse<B> for HttpOnResponse
where
    B: HttpBody + Send + 'static,
    B::Data: Send,
{
    fn on_response(
        self,
        response: &axum::http::Response<B>,
        latency: Duration,
        span: &tracing::Span,
    ) {
        let latency_ms = latency.as_secs_f64() * 1000.0;
        let status = response.status().as_u16();
        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("unknown");

        span.record("status_code", tracing::field::display(status));
        span.record("latency_ms", tracing::field::display(latency_ms));

        tracing::debug!(
            parent: span,
            request_id = %request_id,
            status,
            latency_ms,
            "request completed"
        );
    }
}

/// Copies a span's `request_id` field into its extensions for the formatter.
#[derive(Default)]
struct RequestIdStorageLayer;

#[derive(Clone)]
struct RequestIdExtension(String);

#[derive(Default)]
struct RequestIdVisitor {
    request_id: Option<String>,
}

impl Visit for RequestIdVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "request_id" {
            self.request_id = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "request_id" && self.request_id.is_none() {
            let rendered = format!("{value:?}");
            self.request_id = Some(rendered.trim_matches('"').to_string());
        }
    }
}

impl<S> Layer<S> for RequestIdStorageLayer
where
    S: Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::Id,
        ctx: LayerContext<'_, S>,
    ) {
        let Some(span) = ctx.span(id) else {
            return;
        };
        let mut visitor = RequestIdVisitor::default();
        attrs.record(&mut visitor);
        if let Some(request_id) = visitor.request_id {
            span.extensions_mut().insert(RequestIdExtension(request_id));
        }
    }
}

struct RequestIdEventFormat<E> {
    inner: E,
}

impl<E> RequestIdEventFormat<E> {
    fn new(inner: E) -> Self {
        Self { inner }
    }
}

impl<S, N, E> FormatEvent<S, N> for RequestIdEventFormat<E>
where
    S: Subscriber + for<'span> LookupSpan<'span>,
    N: for<'writer> FormatFields<'writer> + 'static,
    E: FormatEvent<S, N>,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: FmtWriter<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        if let Some(span) = ctx.lookup_current() {
            if let Some(request_id) = span.extensions().get::<RequestIdExtension>() {
                write!(writer, "[request_id={}] ", request_id.0)?;
            }
        }

        self.inner.format_event(ctx, writer, event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};
    use tracing::info;

    #[derive(Clone, Default)]
    struct CaptureWriter {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl CaptureWriter {
        fn contents(&self) -> String {
            let data = self.buffer.lock().expect("lock");
            String::from_utf8_lossy(&data).to_string()
        }
    }

    struct CaptureHandle {
        buffer: Arc<Mutex<Vec<u8>>>,
    }

    impl<'a> MakeWriter<'a> for CaptureWriter {
        type Writer = CaptureHandle;

        fn make_writer(&'a self) -> Self::Writer {
            CaptureHandle {
                buffer: self.buffer.clone(),
            }
        }
    }

    impl Write for CaptureHandle {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.buffer.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn build_subscriber_emits_expected_formats() {
        let json_writer = CaptureWriter::default();
        let json_subscriber =
            build_subscriber(true, false, EnvFilter::new("info"), json_writer.clone());
        tracing::subscriber::with_default(json_subscriber, || {
            info!(message = "json-output");
        });
        assert!(json_writer.contents().contains("\"message\":\"json-output\""));

        let compact_writer = CaptureWriter::default();
        let compact_subscriber =
            build_subscriber(false, false, EnvFilter::new("info"), compact_writer.clone());
        tracing::subscriber::with_default(compact_subscriber, || {
            info!("compact-output");
        });
        let compact_output = compact_writer.contents();
        assert!(compact_output.contains("compact-output"));
        assert!(!compact_output.contains("\"compact-output\""));
    }

    #[test]
    fn events_inside_request_spans_carry_the_request_id() {
        let writer = CaptureWriter::default();
        let subscriber =
            build_subscriber(false, false, EnvFilter::new("info"), writer.clone());
        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!(HTTP_SPAN_NAME, request_id = %"req-42");
            let _entered = span.enter();
            info!("inside request");
        });
        assert!(writer.contents().contains("[request_id=req-42] "));
    }

    #[test]
    fn span_maker_prefers_the_assigned_request_id() {
        use axum::{body::Body, http::HeaderValue};
        use tower_http::trace::MakeSpan;

        let writer = CaptureWriter::default();
        let subscriber =
            build_subscriber(false, false, EnvFilter::new("info"), writer.clone());
        tracing::subscriber::with_default(subscriber, || {
            let mut request = axum::http::Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap();
            request
                .extensions_mut()
                .insert(RequestId::new(HeaderValue::from_static("trace-me")));
            let span = HttpSpanMaker.make_span(&request);
            let _entered = span.enter();
            info!("handled");
        });
        let output = writer.contents();
        assert!(output.contains("[request_id=trace-me] "));
        assert!(output.contains("route=/health"));
        assert!(!output.contains('\u{1b}'));
    }
}
