//! C5 — Certificate Authority: orchestrates the root CA lifecycle, CSR
//! signing pipeline, grace-period-aware lookup, and revocation described in
//! `spec.md` §4.5. `root`, `csr`, `validate`, `store`, and `model` each own
//! one slice of that; this module wires them together and is the only
//! place that appends to C2/C3 on issuance, per `spec.md` §4.5.2 steps 9-10.

pub mod csr;
pub mod model;
pub mod store;
pub mod validate;

mod root;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex as SyncMutex;
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use fleet_core::time::{now_iso, now_ms};

use crate::audit::{AuditEventInput, AuditLog};
use crate::error::{PkiError, PkiResult};
use crate::model::expected_cns;
use crate::telemetry::Telemetry;
use crate::transparency::TransparencyLog;

pub use self::model::{ActiveCertificateLookup, CertificateRecord, CertificateStatus, ExpiryStatus};
pub use self::root::RootCa;
pub use self::store::CertificateStore;
pub use self::validate::{ChainValidation, KeyUsageValidation, validate_chain, validate_key_usage_and_eku};

pub struct CaConfig {
	pub storage_path: String,
	pub root_ca_validity_years: i64,
	pub device_cert_validity_days: i64,
	pub cn_prefix: String,
	pub renewal_window_days: i64,
	pub grace_period_days: i64,
	pub transparency_log_enabled: bool,
}

pub struct SignOutcome {
	pub certificate_id: String,
	pub certificate_pem: String,
	pub ca_certificate_pem: String,
	pub expires_at: String,
	pub serial_number: String,
	pub transparency_index: Option<u64>,
	pub transparency_root_hash: Option<String>,
}

pub struct CertificateAuthority {
	root: RootCa,
	ca_certificate_pem: String,
	store: CertificateStore,
	audit: Arc<AuditLog>,
	transparency: Arc<TransparencyLog>,
	telemetry: Arc<Telemetry>,
	cfg: CaConfig,
	device_locks: SyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl CertificateAuthority {
	pub fn initialize(
		store: CertificateStore,
		audit: Arc<AuditLog>,
		transparency: Arc<TransparencyLog>,
		telemetry: Arc<Telemetry>,
		cfg: CaConfig,
	) -> PkiResult<Self> {
		let root = RootCa::initialize(Path::new(&cfg.storage_path), cfg.root_ca_validity_years)?;
		let ca_certificate_pem = String::from_utf8(root.cert.to_pem()?)
			.map_err(|e| PkiError::Internal(anyhow::anyhow!("root cert PEM is not UTF-8: {e}")))?;
		Ok(Self {
			root,
			ca_certificate_pem,
			store,
			audit,
			transparency,
			telemetry,
			cfg,
			device_locks: SyncMutex::new(HashMap::new()),
		})
	}

	pub fn ca_certificate_pem(&self) -> &str {
		&self.ca_certificate_pem
	}

	/// Per-device mutual exclusion for the CSR signing critical section
	/// (`spec.md` §5 guarantee 3) — the lock, not a persistence-level
	/// uniqueness index, enforces "at most one in-flight sign-csr per
	/// device".
	fn device_lock(&self, device_id: &str) -> Arc<AsyncMutex<()>> {
		self
			.device_locks
			.lock()
			.entry(device_id.to_string())
			.or_insert_with(|| Arc::new(AsyncMutex::new(())))
			.clone()
	}

	/// `spec.md` §4.5.2: parse, verify, validate, sign, persist, audit,
	/// and (if enabled) append a transparency entry. Steps 1-7 failures
	/// never touch the store; the provisioning token stays alive so the
	/// device can retry with a corrected CSR.
	pub async fn sign_csr(
		&self,
		csr_pem: &[u8],
		device_id: &str,
		user_id: &str,
		order_id: Option<&str>,
		batch_id: Option<&str>,
		replace_existing: bool,
	) -> PkiResult<SignOutcome> {
		let parsed = csr::parse_csr(csr_pem)?;

		if !csr::is_rsa_key(&parsed)? {
			return Err(PkiError::UnsupportedCsrKeyType);
		}
		if !csr::verify_self_signature(&parsed)? {
			return Err(PkiError::InvalidCsr {
				reason: "CSR self-signature does not verify".into(),
			});
		}
		if csr::rsa_key_bits(&parsed)? < csr::MIN_RSA_KEY_BITS {
			return Err(PkiError::InvalidCsr {
				reason: format!(
					"RSA key is smaller than {} bits, generate RSA 2048 and retry",
					csr::MIN_RSA_KEY_BITS
				),
			});
		}

		let subject_names = csr::csr_subject_names(&parsed)?;
		let expected = expected_cns(&self.cfg.cn_prefix, device_id, order_id, batch_id);
		let matched_cn = subject_names
			.into_iter()
			.find(|name| expected.contains(name))
			.ok_or(PkiError::InvalidCsrDeviceId)?;

		let lock = self.device_lock(device_id);
		let _guard = lock.lock().await;

		let existing = self.store.get_by_device(device_id).await?;
		let replace_target = match &existing {
			Some(record) if is_active_and_unexpired(record) => {
				if !replace_existing {
					return Err(PkiError::DeviceHasActiveCertificate);
				}
				Some(record.id.clone())
			},
			_ => None,
		};

		let signed = csr::sign(
			&parsed,
			csr::IssuanceParams {
				cn: matched_cn.clone(),
				validity_days: self.cfg.device_cert_validity_days,
				root_cert: &self.root.cert,
				root_key: &self.root.key,
			},
		)?;

		let certificate_pem = String::from_utf8(signed.certificate_pem)
			.map_err(|e| PkiError::Internal(anyhow::anyhow!("signed cert PEM is not UTF-8: {e}")))?;
		let created_at = now_iso();
		let expires_at = now_iso_plus_days(self.cfg.device_cert_validity_days);
		let certificate_id = replace_target.unwrap_or_else(|| Uuid::new_v4().to_string());

		let record = CertificateRecord {
			id: certificate_id.clone(),
			device_id: device_id.to_string(),
			user_id: user_id.to_string(),
			order_id: order_id.map(|s| s.to_string()),
			batch_id: batch_id.map(|s| s.to_string()),
			certificate_pem: certificate_pem.clone(),
			private_key_pem: None,
			ca_certificate_pem: self.ca_certificate_pem.clone(),
			cn: matched_cn.clone(),
			fingerprint: signed.fingerprint_hex.clone(),
			serial_number: signed.serial_hex.clone(),
			status: CertificateStatus::Active,
			created_at,
			expires_at: expires_at.clone(),
			revoked_at: None,
			last_used: None,
		};

		self.store.put(&record).await?;
		self.telemetry.certificates_issued.inc();

		self
			.audit
			.log_event(AuditEventInput {
				event: "CERTIFICATE_ISSUED".into(),
				device_id: Some(device_id.to_string()),
				user_id: Some(user_id.to_string()),
				order_id: order_id.map(|s| s.to_string()),
				batch_id: batch_id.map(|s| s.to_string()),
				serial: Some(signed.serial_hex.clone()),
				fingerprint: Some(signed.fingerprint_hex.clone()),
				details: json!({"cn": matched_cn, "certificate_id": certificate_id}),
			})
			.await?;

		let (transparency_index, transparency_root_hash) = if self.cfg.transparency_log_enabled {
			let entry = self
				.transparency
				.add_entry(
					&signed.fingerprint_hex,
					&signed.serial_hex,
					&matched_cn,
					device_id,
					None,
				)
				.await?;
			(Some(entry.index), Some(entry.root_hash))
		} else {
			(None, None)
		};

		Ok(SignOutcome {
			certificate_id,
			certificate_pem,
			ca_certificate_pem: self.ca_certificate_pem.clone(),
			expires_at,
			serial_number: signed.serial_hex,
			transparency_index,
			transparency_root_hash,
		})
	}

	/// `spec.md` §4.5.4: grace-period-aware lookup. Mutates the stored
	/// record's status on the `hard_expired` transition, per the "pre-save
	/// hook → explicit status-transition logic" design note.
	pub async fn find_active_certificate(
		&self,
		device_id: &str,
	) -> PkiResult<Option<ActiveCertificateLookup>> {
		let Some(record) = self.store.get_by_device(device_id).await? else {
			return Ok(None);
		};
		if !matches!(record.status, CertificateStatus::Active) {
			return Ok(None);
		}

		let expires_at_ms = parse_iso_ms(&record.expires_at)?;
		let days_until_expiry = days_until_expiry_from_remaining_ms(expires_at_ms - now_ms());
		let expiry_status = model::classify_expiry(
			days_until_expiry,
			self.cfg.renewal_window_days,
			self.cfg.grace_period_days,
		);

		match expiry_status {
			ExpiryStatus::HardExpired => {
				let expired = self
					.store
					.update_status(record.clone(), CertificateStatus::Expired, None)
					.await?;
				self
					.audit
					.log_event(AuditEventInput {
						event: "CERTIFICATE_EXPIRED".into(),
						device_id: Some(device_id.to_string()),
						user_id: Some(expired.user_id.clone()),
						order_id: expired.order_id.clone(),
						batch_id: expired.batch_id.clone(),
						serial: Some(expired.serial_number.clone()),
						fingerprint: Some(expired.fingerprint.clone()),
						details: json!({"days_past_expiry": -days_until_expiry}),
					})
					.await?;
				Ok(None)
			},
			ExpiryStatus::GracePeriod => {
				tracing::warn!(
					device_id,
					days_until_expiry,
					"certificate accepted during grace period"
				);
				self
					.audit
					.log_event(AuditEventInput {
						event: "CERTIFICATE_GRACE_ACCEPTED".into(),
						device_id: Some(device_id.to_string()),
						user_id: Some(record.user_id.clone()),
						order_id: record.order_id.clone(),
						batch_id: record.batch_id.clone(),
						serial: Some(record.serial_number.clone()),
						fingerprint: Some(record.fingerprint.clone()),
						details: json!({"days_until_expiry": days_until_expiry}),
					})
					.await?;
				Ok(Some(ActiveCertificateLookup {
					record,
					expiry_status,
					days_until_expiry,
				}))
			},
			_ => Ok(Some(ActiveCertificateLookup {
				record,
				expiry_status,
				days_until_expiry,
			})),
		}
	}

	pub async fn get_by_id(&self, id: &str) -> PkiResult<Option<CertificateRecord>> {
		self.store.get_by_id(id).await
	}

	/// Unlike `find_active_certificate`, returns whatever is on file for
	/// `device_id` regardless of status — the certificate-status endpoint
	/// reports revoked and expired certificates too, not just active ones.
	pub async fn get_by_device(&self, device_id: &str) -> PkiResult<Option<CertificateRecord>> {
		self.store.get_by_device(device_id).await
	}

	/// `spec.md` §4.5.5: accepts either the device id or the certificate
	/// id. Revoking an already-revoked certificate is idempotent (200,
	/// not an error).
	pub async fn revoke(&self, device_id_or_cert_id: &str) -> PkiResult<CertificateRecord> {
		let record = self
			.store
			.find_by_device_or_cert_id(device_id_or_cert_id)
			.await?
			.ok_or_else(|| PkiError::CertificateNotFound {
				id: device_id_or_cert_id.to_string(),
			})?;

		if matches!(record.status, CertificateStatus::Revoked) {
			return Ok(record);
		}

		let revoked = self
			.store
			.update_status(record, CertificateStatus::Revoked, Some(now_iso()))
			.await?;
		self.telemetry.certificates_revoked.inc();
		self
			.audit
			.log_event(AuditEventInput {
				event: "CERTIFICATE_REVOKED".into(),
				device_id: Some(revoked.device_id.clone()),
				user_id: Some(revoked.user_id.clone()),
				order_id: revoked.order_id.clone(),
				batch_id: revoked.batch_id.clone(),
				serial: Some(revoked.serial_number.clone()),
				fingerprint: Some(revoked.fingerprint.clone()),
				details: json!({}),
			})
			.await?;
		Ok(revoked)
	}

	/// **[ADDED — supplemental]** Bulk revocation over every active
	/// certificate tagged with `order_id`, per `spec.md` §3's "Structured
	/// CN enables bulk revocation by order or batch" — a direct
	/// generalization of `revoke()` over the set of rows it already knows
	/// how to look up.
	pub async fn revoke_by_order(&self, order_id: &str) -> PkiResult<Vec<CertificateRecord>> {
		let records = self.store.list_by_order(order_id).await?;
		self.revoke_many(records).await
	}

	pub async fn revoke_by_batch(&self, batch_id: &str) -> PkiResult<Vec<CertificateRecord>> {
		let records = self.store.list_by_batch(batch_id).await?;
		self.revoke_many(records).await
	}

	async fn revoke_many(&self, records: Vec<CertificateRecord>) -> PkiResult<Vec<CertificateRecord>> {
		let mut revoked = Vec::with_capacity(records.len());
		for record in records {
			if matches!(record.status, CertificateStatus::Active) {
				revoked.push(self.revoke(&record.device_id).await?);
			}
		}
		Ok(revoked)
	}
}

fn is_active_and_unexpired(record: &CertificateRecord) -> bool {
	matches!(record.status, CertificateStatus::Active)
		&& parse_iso_ms(&record.expires_at).map(|ms| ms > now_ms()).unwrap_or(false)
}

fn parse_iso_ms(iso: &str) -> PkiResult<i64> {
	chrono::DateTime::parse_from_rfc3339(iso)
		.map(|dt| dt.timestamp_millis())
		.map_err(|e| PkiError::Internal(anyhow::anyhow!("invalid stored timestamp {iso}: {e}")))
}

fn now_iso_plus_days(days: i64) -> String {
	fleet_core::time::to_iso(Utc::now() + chrono::Duration::days(days))
}

/// `spec.md` §4.5.4's `daysUntilExpiry` from the raw millisecond gap to
/// `expires_at`. A positive remainder is rounded *up*: a certificate with
/// six hours left must still read as `> 0` (renewal_window/valid), not `0`
/// (which `classify_expiry` would hand to the grace-period branch as if it
/// were already past `expires_at`). A non-positive remainder truncates
/// toward zero, which only ever under-counts how many days have already
/// expired — it never mistakes an expired certificate for a live one.
fn days_until_expiry_from_remaining_ms(remaining_ms: i64) -> i64 {
	if remaining_ms > 0 {
		(remaining_ms + 86_400_000 - 1) / 86_400_000
	} else {
		remaining_ms / 86_400_000
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn is_active_and_unexpired_rejects_past_expiry() {
		let record = CertificateRecord {
			id: "c1".into(),
			device_id: "d-1".into(),
			user_id: "u-1".into(),
			order_id: None,
			batch_id: None,
			certificate_pem: String::new(),
			private_key_pem: None,
			ca_certificate_pem: String::new(),
			cn: "PROOF-d-1".into(),
			fingerprint: "fp".into(),
			serial_number: "ser".into(),
			status: CertificateStatus::Active,
			created_at: now_iso(),
			expires_at: fleet_core::time::to_iso(Utc::now() - chrono::Duration::days(1)),
			revoked_at: None,
			last_used: None,
		};
		assert!(!is_active_and_unexpired(&record));
	}

	#[test]
	fn is_active_and_unexpired_accepts_future_expiry() {
		let mut record_expires_soon = CertificateRecord {
			id: "c2".into(),
			device_id: "d-2".into(),
			user_id: "u-1".into(),
			order_id: None,
			batch_id: None,
			certificate_pem: String::new(),
			private_key_pem: None,
			ca_certificate_pem: String::new(),
			cn: "PROOF-d-2".into(),
			fingerprint: "fp2".into(),
			serial_number: "ser2".into(),
			status: CertificateStatus::Active,
			created_at: now_iso(),
			expires_at: fleet_core::time::to_iso(Utc::now() + chrono::Duration::days(30)),
			revoked_at: None,
			last_used: None,
		};
		assert!(is_active_and_unexpired(&record_expires_soon));
		record_expires_soon.status = CertificateStatus::Revoked;
		assert!(!is_active_and_unexpired(&record_expires_soon));
	}

	#[test]
	fn sub_day_remaining_lifetime_rounds_up_to_one_day() {
		// 6 hours left must not truncate to 0, which `classify_expiry`
		// would read as already past `expires_at`.
		assert_eq!(days_until_expiry_from_remaining_ms(6 * 60 * 60 * 1000), 1);
	}

	#[test]
	fn exact_multiple_of_a_day_is_unchanged_by_rounding() {
		assert_eq!(days_until_expiry_from_remaining_ms(3 * 86_400_000), 3);
	}

	#[test]
	fn past_expiry_truncates_toward_zero_not_up() {
		// 6 hours past expiry must read as 0 days expired, not -1.
		assert_eq!(days_until_expiry_from_remaining_ms(-6 * 60 * 60 * 1000), 0);
		assert_eq!(days_until_expiry_from_remaining_ms(-7 * 86_400_000), -7);
	}
}
