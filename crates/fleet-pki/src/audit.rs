//! C2 — Audit Log: an append-only, hash-chained event journal persisted to
//! the time-series store, with a local file fallback when that store
//! rejects a write.

use std::path::PathBuf;

use chrono::Utc;
use influxdb2::models::DataPoint;
use serde_json::{json, Value};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use fleet_core::ids::canonical_json_sha256_hex;
use fleet_core::time::now_iso;

use crate::error::PkiError;
use crate::store::TimeSeriesStore;

pub const GENESIS_HASH: &str = "GENESIS";

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct AuditEntry {
	pub sequence: u64,
	pub timestamp: String,
	pub event: String,
	pub device_id: Option<String>,
	pub user_id: Option<String>,
	pub order_id: Option<String>,
	pub batch_id: Option<String>,
	pub serial: Option<String>,
	pub fingerprint: Option<String>,
	pub details: Value,
	pub previous_hash: String,
	pub hash: String,
}

/// Fields supplied by a caller logging a new event; `sequence`,
/// `timestamp`, `previous_hash`, and `hash` are computed by the log itself.
#[derive(Debug, Clone, Default)]
pub struct AuditEventInput {
	pub event: String,
	pub device_id: Option<String>,
	pub user_id: Option<String>,
	pub order_id: Option<String>,
	pub batch_id: Option<String>,
	pub serial: Option<String>,
	pub fingerprint: Option<String>,
	pub details: Value,
}

#[derive(Debug, Clone)]
pub struct ChainHead {
	pub sequence: u64,
	pub hash: String,
}

#[derive(Debug, Clone)]
pub struct VerifyResult {
	pub valid: bool,
	pub checked: u64,
	pub first_broken_sequence: Option<u64>,
}

struct Inner {
	head: ChainHead,
}

pub struct AuditLog {
	store: TimeSeriesStore,
	fallback_path: PathBuf,
	inner: Mutex<Inner>,
}

impl AuditLog {
	pub fn new(store: TimeSeriesStore, fallback_path: impl Into<PathBuf>) -> Self {
		Self {
			store,
			fallback_path: fallback_path.into(),
			inner: Mutex::new(Inner {
				head: ChainHead {
					sequence: 0,
					hash: GENESIS_HASH.to_string(),
				},
			}),
		}
	}

	/// Loads the latest persisted entry and caches its sequence/hash as the
	/// chain head. An empty store is not an error — it's how the chain gets
	/// seeded the first time the process runs.
	pub async fn initialize(&self) -> Result<(), PkiError> {
		let flux = format!(
			r#"from(bucket: "{bucket}") |> range(start: 0) |> filter(fn: (r) => r._measurement == "pki_audit") |> filter(fn: (r) => r._field == "sequence" or r._field == "hash") |> sort(columns: ["_time"])"#,
			bucket = self.store.bucket()
		);
		let rows: Vec<AuditRow> = match self.store.query(&flux).await {
			Ok(rows) => rows,
			Err(_) => Vec::new(),
		};

		if let Some(last) = rows.into_iter().max_by_key(|r| r.sequence) {
			let mut guard = self.inner.lock().await;
			guard.head = ChainHead {
				sequence: last.sequence,
				hash: last.hash,
			};
		}

		let fallback_pending = tokio::fs::metadata(&self.fallback_path)
			.await
			.map(|m| m.len() > 0)
			.unwrap_or(false);
		if fallback_pending {
			tracing::warn!(
				path = %self.fallback_path.display(),
				"audit fallback file has pending entries from a prior outage, resolve out of band",
			);
		}

		Ok(())
	}

	pub fn head(&self) -> ChainHead {
		// `try_lock` is safe here: this is a cheap, uncontended read used
		// only by the health endpoint, never on a hot path.
		self.inner
			.try_lock()
			.map(|g| g.head.clone())
			.unwrap_or(ChainHead {
				sequence: 0,
				hash: GENESIS_HASH.to_string(),
			})
	}

	/// Appends one entry to the chain. The "read head, compute, persist,
	/// advance head" sequence is the single serialized critical section
	/// that keeps `sequence` and `previousHash` globally monotonic.
	pub async fn log_event(&self, input: AuditEventInput) -> Result<AuditEntry, PkiError> {
		let mut guard = self.inner.lock().await;

		let sequence = guard.head.sequence + 1;
		let previous_hash = guard.head.hash.clone();
		let timestamp = now_iso();

		let hashed_payload = json!({
			"timestamp": timestamp,
			"event": input.event,
			"device_id": input.device_id,
			"user_id": input.user_id,
			"order_id": input.order_id,
			"batch_id": input.batch_id,
			"serial": input.serial,
			"fingerprint": input.fingerprint,
			"details": input.details,
			"previousHash": previous_hash,
		});
		let hash = canonical_json_sha256_hex(&hashed_payload);

		let entry = AuditEntry {
			sequence,
			timestamp,
			event: input.event,
			device_id: input.device_id,
			user_id: input.user_id,
			order_id: input.order_id,
			batch_id: input.batch_id,
			serial: input.serial,
			fingerprint: input.fingerprint,
			details: input.details,
			previous_hash,
			hash: hash.clone(),
		};

		if let Err(err) = self.persist(&entry).await {
			tracing::warn!(error = %err, "audit store write failed, appending to fallback file");
			self.append_fallback(&entry).await?;
		}

		guard.head = ChainHead { sequence, hash };
		Ok(entry)
	}

	async fn persist(&self, entry: &AuditEntry) -> Result<(), PkiError> {
		let mut point = DataPoint::builder("pki_audit")
			.tag("event", entry.event.clone())
			.field("sequence", entry.sequence as i64)
			.field("hash", entry.hash.clone())
			.field("previous_hash", entry.previous_hash.clone())
			.field("details", entry.details.to_string())
			.timestamp(Utc::now().timestamp_nanos_opt().unwrap_or_default());
		if let Some(device_id) = &entry.device_id {
			point = point.tag("device_id", device_id.clone());
		}
		if let Some(order_id) = &entry.order_id {
			point = point.tag("order_id", order_id.clone());
		}
		if let Some(batch_id) = &entry.batch_id {
			point = point.tag("batch_id", batch_id.clone());
		}
		if let Some(user_id) = &entry.user_id {
			point = point.field("user_id", user_id.clone());
		}
		if let Some(serial) = &entry.serial {
			point = point.field("serial_number", serial.clone());
		}
		if let Some(fingerprint) = &entry.fingerprint {
			point = point.field("cert_fingerprint", fingerprint.clone());
		}
		let point = point
			.build()
			.map_err(|e| PkiError::TimeSeriesUnavailable(e.to_string()))?;
		self.store.write(point).await
	}

	async fn append_fallback(&self, entry: &AuditEntry) -> Result<(), PkiError> {
		let line = serde_json::to_string(entry).map_err(|e| PkiError::DatabaseUnavailable(e.to_string()))?;
		let mut file = OpenOptions::new()
			.create(true)
			.append(true)
			.open(&self.fallback_path)
			.await
			.map_err(|e| PkiError::DatabaseUnavailable(e.to_string()))?;
		file.write_all(line.as_bytes())
			.await
			.map_err(|e| PkiError::DatabaseUnavailable(e.to_string()))?;
		file.write_all(b"\n")
			.await
			.map_err(|e| PkiError::DatabaseUnavailable(e.to_string()))?;
		Ok(())
	}

	/// Reads every persisted entry in sequence order and walks the chain,
	/// checking `entry[n].previousHash == entry[n-1].hash`. A detected
	/// tamper produces an `AUDIT_CHAIN_TAMPERED` event in its own right —
	/// via a fresh `log_event` call, never by mutating the entries just
	/// walked, so a tamper found mid-verify can't corrupt the head it read.
	pub async fn verify_chain(&self) -> Result<VerifyResult, PkiError> {
		let flux = format!(
			r#"from(bucket: "{bucket}") |> range(start: 0) |> filter(fn: (r) => r._measurement == "pki_audit") |> filter(fn: (r) => r._field == "sequence" or r._field == "hash" or r._field == "previous_hash") |> sort(columns: ["_time"])"#,
			bucket = self.store.bucket()
		);
		let mut rows: Vec<ChainRow> = self.store.query(&flux).await.unwrap_or_default();
		rows.sort_by_key(|r| r.sequence);

		let result = Self::walk_chain(&rows);
		if !result.valid {
			self
				.log_event(AuditEventInput {
					event: "AUDIT_CHAIN_TAMPERED".into(),
					details: json!({
						"first_broken_sequence": result.first_broken_sequence,
						"checked": result.checked,
					}),
					..Default::default()
				})
				.await?;
		}
		Ok(result)
	}

	fn walk_chain(rows: &[ChainRow]) -> VerifyResult {
		let mut checked = 0u64;
		let mut previous_hash = GENESIS_HASH.to_string();
		for row in rows {
			checked += 1;
			if row.previous_hash != previous_hash {
				return VerifyResult {
					valid: false,
					checked,
					first_broken_sequence: Some(row.sequence),
				};
			}
			previous_hash = row.hash.clone();
		}
		VerifyResult {
			valid: true,
			checked,
			first_broken_sequence: None,
		}
	}
}

#[derive(Debug, serde::Deserialize)]
struct AuditRow {
	sequence: u64,
	hash: String,
}

impl influxdb2::FromDataPoint for AuditRow {
	fn from_map(map: std::collections::BTreeMap<String, influxdb2::models::FieldValue>) -> Result<Self, influxdb2::FromMapError>
	where
		Self: Sized,
	{
		use influxdb2::models::FieldValue;
		let sequence = match map.get("sequence") {
			Some(FieldValue::I64(v)) => *v as u64,
			_ => return Err(influxdb2::FromMapError::NotFound("sequence".into())),
		};
		let hash = match map.get("hash") {
			Some(FieldValue::String(v)) => v.clone(),
			_ => return Err(influxdb2::FromMapError::NotFound("hash".into())),
		};
		Ok(Self { sequence, hash })
	}
}

/// The three fields `verify_chain` needs from each persisted row; unlike
/// `AuditRow` (used only to find the latest entry) this also carries
/// `previous_hash` so the full chain can be walked.
#[derive(Debug, serde::Deserialize)]
struct ChainRow {
	sequence: u64,
	hash: String,
	previous_hash: String,
}

impl influxdb2::FromDataPoint for ChainRow {
	fn from_map(map: std::collections::BTreeMap<String, influxdb2::models::FieldValue>) -> Result<Self, influxdb2::FromMapError>
	where
		Self: Sized,
	{
		use influxdb2::models::FieldValue;
		let sequence = match map.get("sequence") {
			Some(FieldValue::I64(v)) => *v as u64,
			_ => return Err(influxdb2::FromMapError::NotFound("sequence".into())),
		};
		let hash = match map.get("hash") {
			Some(FieldValue::String(v)) => v.clone(),
			_ => return Err(influxdb2::FromMapError::NotFound("hash".into())),
		};
		let previous_hash = match map.get("previous_hash") {
			Some(FieldValue::String(v)) => v.clone(),
			_ => return Err(influxdb2::FromMapError::NotFound("previous_hash".into())),
		};
		Ok(Self {
			sequence,
			hash,
			previous_hash,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn make_row(sequence: u64, previous_hash: &str) -> ChainRow {
		ChainRow {
			sequence,
			previous_hash: previous_hash.into(),
			hash: format!("hash-{sequence}"),
		}
	}

	#[test]
	fn verify_chain_detects_break_at_first_mismatch() {
		let rows = vec![
			make_row(1, GENESIS_HASH),
			make_row(2, "hash-1"),
			make_row(3, "wrong-previous-hash"),
		];

		let result = AuditLog::walk_chain(&rows);
		assert!(!result.valid);
		assert_eq!(result.first_broken_sequence, Some(3));
		assert_eq!(result.checked, 3);
	}

	#[test]
	fn verify_chain_accepts_well_formed_chain() {
		let rows = vec![make_row(1, GENESIS_HASH), make_row(2, "hash-1")];
		let result = AuditLog::walk_chain(&rows);
		assert!(result.valid);
		assert_eq!(result.first_broken_sequence, None);
	}

	#[test]
	fn hash_excludes_sequence_but_includes_previous_hash() {
		let payload_a = json!({
			"timestamp": "t", "event": "E", "device_id": Value::Null, "user_id": Value::Null,
			"order_id": Value::Null, "batch_id": Value::Null, "serial": Value::Null,
			"fingerprint": Value::Null, "details": {}, "previousHash": GENESIS_HASH,
		});
		let payload_b = payload_a.clone();
		assert_eq!(
			canonical_json_sha256_hex(&payload_a),
			canonical_json_sha256_hex(&payload_b)
		);
	}
}
