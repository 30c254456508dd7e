//! Local-dev `MqttClient`: satisfies `fleet_pki::liveness::MqttClient`
//! without a broker connection. `spec.md` §1 puts wire-level MQTT out of
//! scope for this system — a real deployment wires a `rumqttc`-backed
//! implementation of the same trait in its place, following the shape the
//! corpus draws around `IoTClientTrait` in
//! `aws-iot-core/src/iot_client.rs`/`aws-iot-tests/src/mock_iot_client.rs`.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use fleet_pki::error::PkiError;
use fleet_pki::liveness::{ConnectionStatus, MessageCallback, MqttClient};

pub struct LocalMqttClient {
	next_packet_id: AtomicU16,
	callback: Mutex<Option<MessageCallback>>,
}

impl LocalMqttClient {
	pub fn new() -> Self {
		Self {
			next_packet_id: AtomicU16::new(1),
			callback: Mutex::new(None),
		}
	}
}

impl Default for LocalMqttClient {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl MqttClient for LocalMqttClient {
	async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<u16, PkiError> {
		let packet_id = self.next_packet_id.fetch_add(1, Ordering::Relaxed);
		tracing::debug!(topic, qos, bytes = payload.len(), packet_id, "mqtt publish (no broker attached)");
		Ok(packet_id)
	}

	async fn subscribe(&self, topic: &str) -> Result<(), PkiError> {
		tracing::debug!(topic, "mqtt subscribe (no broker attached)");
		Ok(())
	}

	fn set_message_callback(&self, callback: MessageCallback) {
		*self.callback.lock().expect("mqtt callback lock poisoned") = Some(callback);
	}

	fn connection_status(&self) -> ConnectionStatus {
		ConnectionStatus::Disconnected
	}
}
