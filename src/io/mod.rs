//! IO modules - external system interfaces
//!
//! - `replay` - JSONL reader for position reports and gate contacts
//! - `egress_channel` - typed channel for outbound events
//! - `egress` - outbound events to file (JSONL format)
//! - `mqtt_egress` - MQTT publisher for outbound events
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod egress;
pub mod egress_channel;
pub mod mqtt_egress;
pub mod prometheus;
pub mod replay;

pub use egress_channel::{create_egress_channel, EgressMessage, EgressSender};
pub use mqtt_egress::MqttPublisher;
