//! Event egress - appends outbound events to a JSONL file

use crate::io::egress_channel::{EgressMessage, EventPayload};
use crate::io::mqtt_egress::MqttPublisher;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// JSONL writer for outbound events
pub struct Egress {
    file_path: String,
}

impl Egress {
    pub fn new(file_path: &str) -> Self {
        info!(file_path = %file_path, "egress_initialized");
        Self { file_path: file_path.to_string() }
    }

    /// Append one event; returns false on failure
    pub fn write_event(&self, payload: &EventPayload) -> bool {
        let json = match serde_json::to_string(payload) {
            Ok(json) => json,
            Err(e) => {
                error!(kind = payload.kind(), error = %e, "egress_serialize_failed");
                return false;
            }
        };

        match self.append_line(&json) {
            Ok(()) => {
                debug!(kind = payload.kind(), "event_egressed");
                true
            }
            Err(e) => {
                error!(kind = payload.kind(), error = %e, "event_egress_failed");
                false
            }
        }
    }

    fn append_line(&self, line: &str) -> std::io::Result<()> {
        let path = Path::new(&self.file_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    pub fn write_events(&self, payloads: &[EventPayload]) -> usize {
        payloads.iter().filter(|p| self.write_event(p)).count()
    }
}

/// Drain the egress channel into the file and, when configured, MQTT
///
/// Runs until the channel closes or shutdown is signalled; queued messages
/// are flushed before returning.
pub async fn run_egress(
    mut rx: mpsc::Receiver<EgressMessage>,
    egress: Egress,
    mqtt: Option<MqttPublisher>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut written = 0u64;
    loop {
        let msg = tokio::select! {
            msg = rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    while let Ok(msg) = rx.try_recv() {
                        written += deliver(&egress, mqtt.as_ref(), msg).await;
                    }
                    break;
                }
                continue;
            }
        };
        written += deliver(&egress, mqtt.as_ref(), msg).await;
    }
    info!(written, "egress_stopped");
}

async fn deliver(egress: &Egress, mqtt: Option<&MqttPublisher>, msg: EgressMessage) -> u64 {
    if let Some(mqtt) = mqtt {
        mqtt.publish(&msg).await;
    }
    match &msg {
        EgressMessage::Event(payload) => u64::from(egress.write_event(payload)),
        EgressMessage::Metrics(_) => 0,
    }
}
