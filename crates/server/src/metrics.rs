#![cfg(feature = "metrics")]

use anyhow::Result;
use prometheus::{Encoder, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

#[derive(Clone)]
pub struct MetricsContext {
    registry: Registry,
    pub http_requests_total: IntCounterVec,
    messaging_rejections_total: IntCounterVec,
    websocket_connections: IntGauge,
}

impl MetricsContext {
    pub fn init() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let http_requests_total = IntCounterVec::new(
            Opts::new(
                "chatroom_http_requests_total",
                "Number of HTTP responses served, labeled by route and status",
            ),
            &["route", "status"],
        )?;
        registry.register(Box::new(http_requests_total.clone()))?;

        let messaging_rejections_total = IntCounterVec::new(
            Opts::new(
                "chatroom_messaging_rejections_total",
                "Messages and connections refused, labeled by reason",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(messaging_rejections_total.clone()))?;

        let websocket_connections = IntGauge::new(
            "chatroom_websocket_connections",
            "Currently active WebSocket sessions",
        )?;
        registry.register(Box::new(websocket_connections.clone()))?;

        Ok(Arc::new(Self {
            registry,
            http_requests_total,
            messaging_rejections_total,
            websocket_connections,
        }))
    }

    pub fn record_http_request(&self, route: &str, status: u16) {
        let status = status.to_string();
        self.http_requests_total
            .with_label_values(&[route, status.as_str()])
            .inc();
    }

    pub fn increment_messaging_rejection(&self, reason: &str) {
        self.messaging_rejections_total
            .with_label_values(&[reason])
            .inc();
    }

    pub fn track_websocket(&self, delta: i64) {
        self.websocket_connections.add(delta);
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_every_registered_family() {
        let metrics = MetricsContext::init().expect("metrics init");
        metrics.record_http_request("/health", 200);
        metrics.increment_messaging_rejection("rate_limited");
        metrics.track_websocket(2);
        metrics.track_websocket(-1);

        let text = String::from_utf8(metrics.encode().unwrap()).unwrap();
        assert!(text.contains("chatroom_http_requests_total{route=\"/health\",status=\"200\"} 1"));
        assert!(text.contains("chatroom_messaging_rejections_total{reason=\"rate_limited\"} 1"));
        assert!(text.contains("chatroom_websocket_connections 1"));
    }
}
