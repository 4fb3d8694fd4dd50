//! MQTT publisher for outbound events
//!
//! Topics (names from config):
//! - events - zone entry, zone exit, journey cancellation
//! - charges - charge cancellations
//! - reconciliation - gate contact summaries
//! - metrics - periodic metrics snapshots (QoS 0)
//!
//! Anything that moves money is published at QoS 1.

use crate::domain::events::OutboundEvent;
use crate::infra::config::Config;
use crate::io::egress_channel::{EgressMessage, EventPayload};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub struct MqttPublisher {
    client: AsyncClient,
    events_topic: String,
    charges_topic: String,
    reconciliation_topic: String,
    metrics_topic: String,
}

impl MqttPublisher {
    /// Connect to the configured broker and spawn the event loop
    pub fn new(config: &Config) -> Self {
        let client_id = format!("toll-egress-{}", std::process::id());
        let mut mqttoptions = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);

        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 100);

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        debug!("mqtt_egress_puback");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        info!(
            host = %config.mqtt_host(),
            port = config.mqtt_port(),
            events = %config.mqtt_events_topic(),
            charges = %config.mqtt_charges_topic(),
            reconciliation = %config.mqtt_reconciliation_topic(),
            "mqtt_egress_started"
        );

        Self {
            client,
            events_topic: config.mqtt_events_topic().to_string(),
            charges_topic: config.mqtt_charges_topic().to_string(),
            reconciliation_topic: config.mqtt_reconciliation_topic().to_string(),
            metrics_topic: config.mqtt_metrics_topic().to_string(),
        }
    }

    fn route(&self, payload: &EventPayload) -> (&str, QoS) {
        match payload.event {
            OutboundEvent::ZoneEntry(_) | OutboundEvent::JourneyCancelled(_) => {
                (self.events_topic.as_str(), QoS::AtMostOnce)
            }
            OutboundEvent::ZoneExit(_) => (self.events_topic.as_str(), QoS::AtLeastOnce),
            OutboundEvent::ChargeCancelled(_) => (self.charges_topic.as_str(), QoS::AtLeastOnce),
            OutboundEvent::Reconciliation(_) => (self.reconciliation_topic.as_str(), QoS::AtLeastOnce),
        }
    }

    pub async fn publish(&self, msg: &EgressMessage) {
        let (topic, qos, json) = match msg {
            EgressMessage::Event(payload) => {
                let (topic, qos) = self.route(payload);
                (topic, qos, serde_json::to_string(payload))
            }
            EgressMessage::Metrics(payload) => {
                (self.metrics_topic.as_str(), QoS::AtMostOnce, serde_json::to_string(payload))
            }
        };

        let json = match json {
            Ok(json) => json,
            Err(e) => {
                error!(topic, error = %e, "mqtt_egress_serialize_failed");
                return;
            }
        };
        if let Err(e) = self.client.publish(topic, qos, false, json.into_bytes()).await {
            error!(topic, error = %e, "mqtt_egress_publish_failed");
        }
    }
}
