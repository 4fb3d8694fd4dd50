//! Typed channel for outbound events
//!
//! Producers never block: when the bounded channel is full the message is
//! dropped and counted.

use crate::domain::events::OutboundEvent;
use crate::domain::journey::epoch_ms;
use crate::infra::metrics::{Metrics, MetricsSummary};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// Messages consumed by the egress fan-out
#[derive(Debug)]
pub enum EgressMessage {
    /// Journey, charge or reconciliation event
    Event(EventPayload),
    /// Periodic metrics snapshot
    Metrics(MetricsPayload),
}

/// Outbound event stamped with site and publish time
#[derive(Debug, Clone, Serialize)]
pub struct EventPayload {
    pub site: String,
    /// Epoch ms at enqueue
    pub ts: i64,
    #[serde(flatten)]
    pub event: OutboundEvent,
}

impl EventPayload {
    pub fn kind(&self) -> &'static str {
        self.event.type_str()
    }
}

#[derive(Debug, Serialize)]
pub struct MetricsPayload {
    pub site: String,
    pub ts: i64,
    #[serde(flatten)]
    pub summary: MetricsSummary,
}

/// Sender handle for egress messages
///
/// Clone this to share across dispatcher shards.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    site_id: String,
    metrics: Arc<Metrics>,
}

impl EgressSender {
    pub fn new(tx: mpsc::Sender<EgressMessage>, site_id: String, metrics: Arc<Metrics>) -> Self {
        Self { tx, site_id, metrics }
    }

    /// Enqueue an event; returns false if it was dropped
    pub fn send_event(&self, event: OutboundEvent) -> bool {
        let payload = EventPayload { site: self.site_id.clone(), ts: epoch_ms(), event };
        let kind = payload.kind();
        if self.tx.try_send(EgressMessage::Event(payload)).is_err() {
            self.metrics.record_egress_dropped();
            debug!(kind, "egress_dropped");
            return false;
        }
        true
    }

    pub fn send_metrics(&self, summary: MetricsSummary) {
        let payload = MetricsPayload { site: self.site_id.clone(), ts: epoch_ms(), summary };
        if self.tx.try_send(EgressMessage::Metrics(payload)).is_err() {
            self.metrics.record_egress_dropped();
        }
    }
}

/// Create a new egress channel pair
///
/// `site_id` is stamped onto every payload for downstream consumers.
pub fn create_egress_channel(
    buffer_size: usize,
    site_id: String,
    metrics: Arc<Metrics>,
) -> (EgressSender, mpsc::Receiver<EgressMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EgressSender::new(tx, site_id, metrics), rx)
}
