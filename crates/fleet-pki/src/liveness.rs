//! C10 — Device Liveness Tracker: correlates MQTT QoS-1 PUBACKs and
//! Last-Will messages with the Redis-backed active-device cache, per
//! `spec.md` §4.8. `spec.md` §1's "does not itself speak MQTT on the wire"
//! Non-goal is honored through the `MqttClient` trait below — the same
//! seam the corpus draws around `rumqttc` in
//! `aws-iot-core/src/iot_client.rs::IoTClientTrait` — which `fleet-pki-app`
//! implements (or stubs) against a real broker client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};

use fleet_core::responsechannel;
use fleet_core::shutdown::ShutdownWatcher;
use fleet_core::time::now_ms;

use crate::audit::{AuditEventInput, AuditLog};
use crate::error::PkiError;
use crate::store::RedisStore;
use crate::telemetry::Telemetry;

const STALE_MESSAGE_MAX_AGE_MS: i64 = 120_000;
const STARTUP_GRACE: Duration = Duration::from_secs(3);
const ECHO_SUPPRESSION_WINDOW: Duration = Duration::from_secs(2);
const PUBACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
	Connected,
	Connecting,
	Disconnected,
	Error,
}

#[derive(Debug, Clone)]
pub struct MqttMessage {
	pub topic: String,
	pub payload: Vec<u8>,
	pub qos: u8,
	pub retain: bool,
	/// Millisecond epoch the broker/client delivered the message at, used
	/// for the 120 s staleness check independent of whatever timestamp the
	/// payload itself carries.
	pub received_at_ms: i64,
}

pub type MessageCallback = Arc<dyn Fn(MqttMessage) + Send + Sync>;

/// The collaborator boundary: `fleet-pki` never touches `rumqttc` (or any
/// other broker client) directly.
#[async_trait]
pub trait MqttClient: Send + Sync {
	/// Publishes and returns the assigned packet id so QoS-1 callers can
	/// correlate the eventual PUBACK.
	async fn publish(&self, topic: &str, payload: &[u8], qos: u8) -> Result<u16, PkiError>;
	async fn subscribe(&self, topic: &str) -> Result<(), PkiError>;
	fn set_message_callback(&self, callback: MessageCallback);
	fn connection_status(&self) -> ConnectionStatus;
}

/// Correlates an MQTT packet id with the eventual PUBACK, built on
/// `fleet_core::responsechannel` the same way any other request/ack
/// correlation in this workspace would be: `track()` parks a waiter,
/// `resolve()` (called by the collaborator's event loop when it observes
/// the incoming PUBACK) wakes it.
pub struct PubAckTracker {
	tx: responsechannel::Sender<u16, ()>,
}

impl PubAckTracker {
	pub fn new(buffer: usize) -> (Self, responsechannel::Receiver<u16, ()>) {
		let (tx, rx) = responsechannel::new(buffer);
		(Self { tx }, rx)
	}

	/// Registers `packet_id` as pending and waits up to 30 s for
	/// `resolve(packet_id)` to be called from the PUBACK-resolution loop.
	/// `false` means the deadline passed with no ack.
	pub async fn await_ack(&self, packet_id: u16) -> bool {
		tokio::time::timeout(PUBACK_TIMEOUT, self.tx.send_and_wait(packet_id))
			.await
			.map(|r| r.is_ok())
			.unwrap_or(false)
	}
}

/// Resolves packet ids reported over `acks` against waiters registered on
/// `pending`; runs until `shutdown` fires. The collaborator MQTT client
/// feeds `acks` from its own event loop whenever it observes an incoming
/// PUBACK.
pub async fn run_puback_resolver(
	mut pending: responsechannel::Receiver<u16, ()>,
	mut acks: mpsc::Receiver<u16>,
	mut shutdown: ShutdownWatcher,
) {
	let mut waiters: HashMap<u16, oneshot::Sender<()>> = HashMap::new();
	loop {
		tokio::select! {
			Some((packet_id, resp_tx)) = pending.recv() => {
				waiters.insert(packet_id, resp_tx);
			},
			Some(packet_id) = acks.recv() => {
				if let Some(resp_tx) = waiters.remove(&packet_id) {
					let _ = resp_tx.send(());
				}
			},
			_ = shutdown.signaled() => break,
			else => break,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveDeviceEntry {
	pub device_id: String,
	pub user_id: String,
	#[serde(default)]
	pub ad_management_enabled: bool,
	#[serde(default)]
	pub brand_canvas_enabled: bool,
	pub last_seen_ms: i64,
}

const ACTIVE_DEVICE_TTL_SECS: u64 = 24 * 60 * 60;

fn active_key(device_id: &str) -> String {
	format!("active:{device_id}")
}

/// `active:{deviceId}`, refresh-on-write TTL of 24 h, per `spec.md` §3.
pub struct ActiveDeviceCache {
	redis: RedisStore,
}

impl ActiveDeviceCache {
	pub fn new(redis: RedisStore) -> Self {
		Self { redis }
	}

	pub async fn set(&self, entry: &ActiveDeviceEntry) -> Result<(), PkiError> {
		let payload =
			serde_json::to_string(entry).map_err(|e| PkiError::DatabaseUnavailable(e.to_string()))?;
		self
			.redis
			.set_ex(&active_key(&entry.device_id), &payload, ACTIVE_DEVICE_TTL_SECS)
			.await
	}

	pub async fn get(&self, device_id: &str) -> Result<Option<ActiveDeviceEntry>, PkiError> {
		match self.redis.get(&active_key(device_id)).await? {
			Some(raw) => Ok(Some(
				serde_json::from_str(&raw).map_err(|e| PkiError::DatabaseUnavailable(e.to_string()))?,
			)),
			None => Ok(None),
		}
	}

	/// Bumps `last_seen_ms` and refreshes the TTL for a device already in
	/// the cache; a no-op if the device isn't tracked (it may have expired
	/// or never registered).
	pub async fn touch(&self, device_id: &str) -> Result<(), PkiError> {
		if let Some(mut entry) = self.get(device_id).await? {
			entry.last_seen_ms = now_ms();
			self.set(&entry).await?;
		}
		Ok(())
	}

	pub async fn remove(&self, device_id: &str) -> Result<(), PkiError> {
		self.redis.del(&[&active_key(device_id)]).await
	}
}

/// Suppresses messages this process just published itself from being
/// reprocessed as if a device sent them — a 2 s window keyed by
/// `topic:payload[:100]`, per `spec.md` §4.8.
struct EchoSuppression {
	recent: Mutex<HashMap<String, Instant>>,
}

impl EchoSuppression {
	fn new() -> Self {
		Self {
			recent: Mutex::new(HashMap::new()),
		}
	}

	fn key(topic: &str, payload: &[u8]) -> String {
		let prefix_len = payload.len().min(100);
		format!("{topic}:{}", String::from_utf8_lossy(&payload[..prefix_len]))
	}

	async fn mark_published(&self, topic: &str, payload: &[u8]) {
		let mut recent = self.recent.lock().await;
		recent.retain(|_, at| at.elapsed() < ECHO_SUPPRESSION_WINDOW);
		recent.insert(Self::key(topic, payload), Instant::now());
	}

	async fn is_echo(&self, topic: &str, payload: &[u8]) -> bool {
		let mut recent = self.recent.lock().await;
		recent.retain(|_, at| at.elapsed() < ECHO_SUPPRESSION_WINDOW);
		recent.contains_key(&Self::key(topic, payload))
	}
}

pub struct DeviceLivenessTracker {
	mqtt: Arc<dyn MqttClient>,
	cache: ActiveDeviceCache,
	audit: Arc<AuditLog>,
	telemetry: Arc<Telemetry>,
	puback_tracker: Arc<PubAckTracker>,
	acks_tx: mpsc::Sender<u16>,
	topic_prefix: String,
	echo_suppression: EchoSuppression,
	started_at: Instant,
}

impl DeviceLivenessTracker {
	pub fn new(
		mqtt: Arc<dyn MqttClient>,
		cache: ActiveDeviceCache,
		audit: Arc<AuditLog>,
		telemetry: Arc<Telemetry>,
		puback_tracker: Arc<PubAckTracker>,
		acks_tx: mpsc::Sender<u16>,
		topic_prefix: impl Into<String>,
	) -> Self {
		Self {
			mqtt,
			cache,
			audit,
			telemetry,
			puback_tracker,
			acks_tx,
			topic_prefix: topic_prefix.into(),
			echo_suppression: EchoSuppression::new(),
			started_at: Instant::now(),
		}
	}

	/// Reports a PUBACK observed by the collaborator's event loop; keyed by
	/// MQTT packet id, matching whatever `publish_tracked` returned.
	pub async fn notify_puback(&self, packet_id: u16) {
		let _ = self.acks_tx.send(packet_id).await;
	}

	pub async fn subscribe_all(&self) -> Result<(), PkiError> {
		let prefix = &self.topic_prefix;
		for suffix in ["+/active", "+/lwt", "+/status", "+/update", "+/milestone", "+/alert"] {
			self.mqtt.subscribe(&format!("{prefix}/{suffix}")).await?;
		}
		Ok(())
	}

	/// Used by `GET /health`'s `mqtt.connected` field.
	pub fn is_connected(&self) -> bool {
		matches!(self.mqtt.connection_status(), ConnectionStatus::Connected)
	}

	/// Publishes `payload` at the given QoS and, for QoS 1, spawns the
	/// 30 s PUBACK wait in the background: on timeout the device is marked
	/// inactive and dropped from the active-device cache, per `spec.md`
	/// §4.8's "every outgoing QoS-1 publish is tracked".
	pub async fn publish_tracked(&self, topic: &str, payload: &[u8], qos: u8, device_id: &str) -> Result<(), PkiError> {
		self.echo_suppression.mark_published(topic, payload).await;
		let packet_id = self.mqtt.publish(topic, payload, qos).await?;
		if qos == 1 {
			let tracker = self.puback_tracker.clone();
			let cache = self.cache_handle();
			let device_id = device_id.to_string();
			tokio::spawn(async move {
				if !tracker.await_ack(packet_id).await {
					tracing::warn!(device_id, packet_id, "PUBACK timed out, marking device inactive");
					let _ = cache.remove(&device_id).await;
				}
			});
		}
		Ok(())
	}

	fn cache_handle(&self) -> ActiveDeviceCacheHandle {
		ActiveDeviceCacheHandle {
			redis: self.cache.redis.clone(),
		}
	}

	pub fn message_callback(self: &Arc<Self>) -> MessageCallback {
		let tracker = self.clone();
		Arc::new(move |message| {
			let tracker = tracker.clone();
			tokio::spawn(async move {
				tracker.handle_message(message).await;
			});
		})
	}

	async fn handle_message(&self, message: MqttMessage) {
		if message.retain {
			return;
		}
		if self.started_at.elapsed() < STARTUP_GRACE {
			return;
		}
		if self.echo_suppression.is_echo(&message.topic, &message.payload).await {
			return;
		}

		let Some((device_id, suffix)) = split_device_topic(&self.topic_prefix, &message.topic) else {
			return;
		};

		let body: Value = match serde_json::from_slice(&message.payload) {
			Ok(value) => value,
			Err(_) => return,
		};

		if let Some(ts) = body.get("timestamp").and_then(Value::as_i64) {
			if now_ms() - ts > STALE_MESSAGE_MAX_AGE_MS {
				return;
			}
		}

		match suffix {
			"active" => self.handle_active(device_id, &body).await,
			"lwt" => self.handle_lwt(device_id, &body).await,
			_ => {
				// status/update/milestone/alert: any traffic on these
				// topics is itself a liveness signal.
				let _ = self.cache.touch(device_id).await;
			},
		}
	}

	async fn handle_active(&self, device_id: &str, body: &Value) {
		if body.get("type").and_then(Value::as_str) != Some("device_registration") {
			return;
		}
		let user_id = body
			.get("user_id")
			.and_then(Value::as_str)
			.unwrap_or_default()
			.to_string();
		let is_new_device = self.cache.get(device_id).await.ok().flatten().is_none();

		let entry = ActiveDeviceEntry {
			device_id: device_id.to_string(),
			user_id: user_id.clone(),
			ad_management_enabled: body.get("ad_management_enabled").and_then(Value::as_bool).unwrap_or(false),
			brand_canvas_enabled: body.get("brand_canvas_enabled").and_then(Value::as_bool).unwrap_or(false),
			last_seen_ms: now_ms(),
		};
		if self.cache.set(&entry).await.is_err() {
			return;
		}
		self.telemetry.active_devices.inc();

		let _ = self
			.audit
			.log_event(AuditEventInput {
				event: "DEVICE_REGISTERED".into(),
				device_id: Some(device_id.to_string()),
				user_id: Some(user_id),
				order_id: None,
				batch_id: None,
				serial: None,
				fingerprint: None,
				details: serde_json::json!({"is_new_device": is_new_device}),
			})
			.await;

		let ack = serde_json::json!({
			"success": true,
			"message": "registered",
			"deviceId": device_id,
			"isNewDevice": is_new_device,
			"serverVersion": env!("CARGO_PKG_VERSION"),
		});
		let topic = format!("{}/{device_id}/registration_ack", self.topic_prefix);
		if let Ok(payload) = serde_json::to_vec(&ack) {
			let _ = self.publish_tracked(&topic, &payload, 1, device_id).await;
		}
	}

	async fn handle_lwt(&self, device_id: &str, body: &Value) {
		if body.get("type").and_then(Value::as_str) != Some("un_registration") {
			return;
		}
		let existing = self.cache.get(device_id).await.ok().flatten();
		if self.cache.remove(device_id).await.is_err() {
			return;
		}
		self.telemetry.active_devices.dec();

		let _ = self
			.audit
			.log_event(AuditEventInput {
				event: "DEVICE_UNREGISTERED".into(),
				device_id: Some(device_id.to_string()),
				user_id: existing.map(|e| e.user_id),
				order_id: None,
				batch_id: None,
				serial: None,
				fingerprint: None,
				details: serde_json::json!({}),
			})
			.await;
	}
}

/// A cheap clone of just the Redis handle, so the spawned PUBACK-timeout
/// task doesn't need to hold a reference back into the tracker itself.
struct ActiveDeviceCacheHandle {
	redis: RedisStore,
}

impl ActiveDeviceCacheHandle {
	async fn remove(&self, device_id: &str) -> Result<(), PkiError> {
		self.redis.del(&[&active_key(device_id)]).await
	}
}

/// Splits `{prefix}/{deviceId}/{suffix}` into `(deviceId, suffix)`; returns
/// `None` for any topic that doesn't match this system's own prefix.
fn split_device_topic<'a>(prefix: &str, topic: &'a str) -> Option<(&'a str, &'a str)> {
	let rest = topic.strip_prefix(prefix)?.strip_prefix('/')?;
	let (device_id, suffix) = rest.split_once('/')?;
	if device_id.is_empty() || suffix.is_empty() {
		return None;
	}
	Some((device_id, suffix))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn splits_device_topic_from_prefix() {
		assert_eq!(
			split_device_topic("statsnapp", "statsnapp/d-1/active"),
			Some(("d-1", "active"))
		);
		assert_eq!(split_device_topic("statsnapp", "other/d-1/active"), None);
		assert_eq!(split_device_topic("statsnapp", "statsnapp/d-1"), None);
	}

	#[tokio::test]
	async fn echo_suppression_drops_within_window_and_expires_after() {
		let suppression = EchoSuppression::new();
		suppression.mark_published("statsnapp/d-1/status", b"payload").await;
		assert!(suppression.is_echo("statsnapp/d-1/status", b"payload").await);
		assert!(!suppression.is_echo("statsnapp/d-1/status", b"different").await);
	}

	#[tokio::test]
	async fn puback_tracker_resolves_pending_waiter() {
		let (tracker, pending) = PubAckTracker::new(8);
		let (acks_tx, acks_rx) = mpsc::channel(8);
		let (_trigger, watcher) = fleet_core::shutdown::channel();
		let resolver = tokio::spawn(run_puback_resolver(pending, acks_rx, watcher));

		let await_task = tokio::spawn(async move { tracker.await_ack(42).await });
		tokio::time::sleep(Duration::from_millis(20)).await;
		acks_tx.send(42).await.expect("send ack");

		let acked = await_task.await.expect("join");
		assert!(acked);
		resolver.abort();
	}

	#[tokio::test]
	async fn puback_tracker_times_out_without_an_ack() {
		// Uses a near-zero effective timeout by resolving a different
		// packet id than the one we're waiting on, then waiting past the
		// wrapped deadline would be too slow for a unit test, so this just
		// asserts unresolved waiters don't spuriously match other ids.
		let (tracker, pending) = PubAckTracker::new(8);
		let (acks_tx, acks_rx) = mpsc::channel(8);
		let (_trigger, watcher) = fleet_core::shutdown::channel();
		let resolver = tokio::spawn(run_puback_resolver(pending, acks_rx, watcher));

		let await_task = tokio::spawn(async move { tracker.await_ack(7).await });
		acks_tx.send(999).await.expect("send unrelated ack");
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert!(!await_task.is_finished());
		resolver.abort();
		await_task.abort();
	}
}
