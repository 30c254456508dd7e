//! Certificate record types owned exclusively by the Certificate Authority.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateStatus {
	Active,
	Revoked,
	Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryStatus {
	Valid,
	RenewalWindow,
	GracePeriod,
	HardExpired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
	pub id: String,
	pub device_id: String,
	pub user_id: String,
	pub order_id: Option<String>,
	pub batch_id: Option<String>,
	pub certificate_pem: String,
	/// Empty/`None` for device-held keys (the CSR flow, the only flow this
	/// system implements); reserved for a future CA-generates-keypair flow.
	pub private_key_pem: Option<String>,
	pub ca_certificate_pem: String,
	pub cn: String,
	pub fingerprint: String,
	pub serial_number: String,
	pub status: CertificateStatus,
	pub created_at: String,
	pub expires_at: String,
	pub revoked_at: Option<String>,
	pub last_used: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ActiveCertificateLookup {
	pub record: CertificateRecord,
	pub expiry_status: ExpiryStatus,
	pub days_until_expiry: i64,
}

/// Classifies a certificate's expiry state relative to `now`, per the
/// grace-period policy: valid while outside the renewal window, then a
/// renewal-window warning, then a grace period that still accepts the
/// certificate, then hard-expired.
pub fn classify_expiry(
	days_until_expiry: i64,
	renewal_window_days: i64,
	grace_period_days: i64,
) -> ExpiryStatus {
	if days_until_expiry > renewal_window_days {
		ExpiryStatus::Valid
	} else if days_until_expiry > 0 {
		ExpiryStatus::RenewalWindow
	} else if -days_until_expiry <= grace_period_days {
		ExpiryStatus::GracePeriod
	} else {
		ExpiryStatus::HardExpired
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn exactly_at_expiry_is_grace_period_when_grace_positive() {
		assert_eq!(classify_expiry(0, 30, 7), ExpiryStatus::GracePeriod);
	}

	#[test]
	fn within_renewal_window_is_flagged() {
		assert_eq!(classify_expiry(10, 30, 7), ExpiryStatus::RenewalWindow);
	}

	#[test]
	fn outside_renewal_window_is_valid() {
		assert_eq!(classify_expiry(90, 30, 7), ExpiryStatus::Valid);
	}

	#[test]
	fn past_grace_period_is_hard_expired() {
		assert_eq!(classify_expiry(-8, 30, 7), ExpiryStatus::HardExpired);
	}

	#[test]
	fn within_grace_period_is_accepted() {
		assert_eq!(classify_expiry(-7, 30, 7), ExpiryStatus::GracePeriod);
	}

	#[test]
	fn zero_grace_period_hard_expires_immediately_after_expiry() {
		assert_eq!(classify_expiry(-1, 30, 0), ExpiryStatus::HardExpired);
	}
}
