//! The single error type every fallible operation in this crate returns.
//!
//! One variant per error kind named in the provisioning protocol's error
//! table. Each variant owns the stable `code` string and HTTP status the
//! collaborator router puts in the response envelope; nothing downstream of
//! `PkiError` needs to know an HTTP status code exists.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PkiError {
	#[error("missing or empty bearer auth token")]
	AuthTokenMissing,

	#[error("auth token is invalid or expired")]
	AuthTokenInvalid,

	#[error("user not found")]
	UserNotFound,

	#[error("device not found: {device_id}")]
	DeviceNotFound { device_id: String },

	#[error("device is not associated with this user")]
	DeviceNotAssociated,

	#[error("device_id is required")]
	DeviceIdRequired,

	#[error("device already has an active certificate")]
	DeviceHasActiveCertificate,

	#[error("provisioning token missing from request")]
	TokenMissing,

	#[error("provisioning token expired")]
	TokenExpired,

	#[error("provisioning token already used")]
	TokenAlreadyUsed,

	#[error("provisioning token not found")]
	TokenNotFound,

	#[error("provisioning token has an invalid signature")]
	TokenInvalidSignature,

	#[error("provisioning token is malformed")]
	TokenInvalidFormat,

	#[error("provisioning token has the wrong type")]
	TokenInvalidType,

	#[error("provisioning token does not match the requesting device")]
	TokenDeviceMismatch,

	#[error("provisioning token is missing its user claim")]
	TokenUserMissing,

	#[error("provisioning token is invalid")]
	TokenInvalid,

	#[error("csr could not be parsed: {reason}")]
	InvalidCsr { reason: String },

	#[error("csr common name / SAN does not match the expected device identity")]
	InvalidCsrDeviceId,

	#[error("csr public key type is not supported, use RSA 2048 or larger")]
	UnsupportedCsrKeyType,

	#[error("certificate not found: {id}")]
	CertificateNotFound { id: String },

	#[error("root certificate authority is not initialized")]
	RootCaNotInitialized,

	#[error("rate limit exceeded: {limit_type}")]
	RateLimitExceeded {
		limit_type: String,
		retry_after_secs: u64,
		limit: u64,
		window_secs: u64,
	},

	#[error("audit log hash chain is tampered at sequence {sequence}")]
	AuditChainTampered { sequence: u64 },

	#[error("transparency log inclusion proof is invalid")]
	InclusionProofInvalid,

	#[error("backing database/store is unavailable: {0}")]
	DatabaseUnavailable(String),

	#[error("time series store is unavailable: {0}")]
	TimeSeriesUnavailable(String),

	#[error("mqtt client is unavailable: {0}")]
	MqttUnavailable(String),

	#[error("configuration error: {0}")]
	Config(String),

	#[error(transparent)]
	Internal(#[from] anyhow::Error),
}

impl PkiError {
	/// Stable machine-readable code for the `error.code` field of the
	/// response envelope. Never changes across releases.
	pub fn code(&self) -> &'static str {
		match self {
			PkiError::AuthTokenMissing => "AUTH_TOKEN_MISSING",
			PkiError::AuthTokenInvalid => "AUTH_TOKEN_INVALID",
			PkiError::UserNotFound => "USER_NOT_FOUND",
			PkiError::DeviceNotFound { .. } => "DEVICE_NOT_FOUND",
			PkiError::DeviceNotAssociated => "DEVICE_NOT_ASSOCIATED",
			PkiError::DeviceIdRequired => "DEVICE_ID_REQUIRED",
			PkiError::DeviceHasActiveCertificate => "DEVICE_HAS_ACTIVE_CERTIFICATE",
			PkiError::TokenMissing => "TOKEN_MISSING",
			PkiError::TokenExpired => "TOKEN_EXPIRED",
			PkiError::TokenAlreadyUsed => "TOKEN_ALREADY_USED",
			PkiError::TokenNotFound => "TOKEN_NOT_FOUND",
			PkiError::TokenInvalidSignature => "TOKEN_INVALID_SIGNATURE",
			PkiError::TokenInvalidFormat => "TOKEN_INVALID_FORMAT",
			PkiError::TokenInvalidType => "TOKEN_INVALID_TYPE",
			PkiError::TokenDeviceMismatch => "TOKEN_DEVICE_MISMATCH",
			PkiError::TokenUserMissing => "TOKEN_USER_MISSING",
			PkiError::TokenInvalid => "TOKEN_INVALID",
			PkiError::InvalidCsr { .. } => "INVALID_CSR",
			PkiError::InvalidCsrDeviceId => "INVALID_CSR_DEVICE_ID",
			PkiError::UnsupportedCsrKeyType => "UNSUPPORTED_CSR_KEY_TYPE",
			PkiError::CertificateNotFound { .. } => "CERTIFICATE_NOT_FOUND",
			PkiError::RootCaNotInitialized => "ROOT_CA_NOT_INITIALIZED",
			PkiError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
			PkiError::AuditChainTampered { .. } => "AUDIT_CHAIN_TAMPERED",
			PkiError::InclusionProofInvalid => "INCLUSION_PROOF_INVALID",
			PkiError::DatabaseUnavailable(_) => "DATABASE_UNAVAILABLE",
			PkiError::TimeSeriesUnavailable(_) => "TIME_SERIES_UNAVAILABLE",
			PkiError::MqttUnavailable(_) => "MQTT_UNAVAILABLE",
			PkiError::Config(_) => "CONFIG_ERROR",
			PkiError::Internal(_) => "INTERNAL_ERROR",
		}
	}

	/// HTTP status the collaborator router should use for this error. Kept
	/// here, next to `code`, so the two never drift out of sync.
	pub fn status_code(&self) -> u16 {
		match self {
			PkiError::AuthTokenMissing
			| PkiError::AuthTokenInvalid
			| PkiError::TokenMissing
			| PkiError::TokenExpired
			| PkiError::TokenAlreadyUsed
			| PkiError::TokenNotFound
			| PkiError::TokenInvalidSignature
			| PkiError::TokenInvalidFormat
			| PkiError::TokenInvalidType
			| PkiError::TokenDeviceMismatch
			| PkiError::TokenUserMissing
			| PkiError::TokenInvalid => 401,

			PkiError::DeviceNotAssociated => 403,

			PkiError::DeviceHasActiveCertificate => 409,

			PkiError::UserNotFound
			| PkiError::DeviceNotFound { .. }
			| PkiError::CertificateNotFound { .. } => 404,

			PkiError::DeviceIdRequired
			| PkiError::InvalidCsr { .. }
			| PkiError::InvalidCsrDeviceId
			| PkiError::UnsupportedCsrKeyType => 400,

			PkiError::RateLimitExceeded { .. } => 429,

			PkiError::RootCaNotInitialized
			| PkiError::DatabaseUnavailable(_)
			| PkiError::TimeSeriesUnavailable(_)
			| PkiError::MqttUnavailable(_) => 503,

			PkiError::AuditChainTampered { .. }
			| PkiError::InclusionProofInvalid
			| PkiError::Config(_)
			| PkiError::Internal(_) => 500,
		}
	}
}

impl From<redis::RedisError> for PkiError {
	fn from(err: redis::RedisError) -> Self {
		PkiError::DatabaseUnavailable(err.to_string())
	}
}

impl From<openssl::error::ErrorStack> for PkiError {
	fn from(err: openssl::error::ErrorStack) -> Self {
		PkiError::Internal(anyhow::anyhow!("openssl error: {err}"))
	}
}

impl From<jsonwebtoken::errors::Error> for PkiError {
	fn from(_: jsonwebtoken::errors::Error) -> Self {
		PkiError::TokenInvalidSignature
	}
}

pub type PkiResult<T> = Result<T, PkiError>;
