//! Environment-driven configuration. Every field here corresponds to a
//! documented environment variable; there is no other configuration
//! surface (no config file format, no remote config service).

use std::fmt;

use crate::error::PkiError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CnFormat {
	/// `{PREFIX}-{deviceId}`
	Legacy,
	/// `{PREFIX}-{ORDER}-{BATCH}-{DEVICE}`
	Structured,
}

impl std::str::FromStr for CnFormat {
	type Err = PkiError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"legacy" => Ok(CnFormat::Legacy),
			"structured" => Ok(CnFormat::Structured),
			other => Err(PkiError::Config(format!(
				"invalid CERT_CN_FORMAT: {other} (expected legacy|structured)"
			))),
		}
	}
}

#[derive(Clone)]
pub struct AppConfig {
	// Stores
	pub redis_url: String,
	pub directory_base_url: String,
	pub timeseries_url: String,
	pub timeseries_token: String,
	pub timeseries_org: String,
	pub timeseries_bucket: String,

	// Auth / PKI
	pub auth_secret: String,
	pub jwt_secret: String,
	pub provisioning_token_ttl_secs: u64,
	pub root_ca_validity_years: i64,
	pub device_cert_validity_days: i64,
	pub ca_storage_path: String,
	pub cert_cn_prefix: String,
	pub cert_cn_format: CnFormat,
	pub cert_renewal_window_days: i64,
	pub cert_grace_period_days: i64,
	pub allow_onboarding_with_active_cert: bool,

	// Rate limits
	pub rl_global_per_minute: u64,
	pub rl_ip_per_window: u64,
	pub rl_prov_ip_per_window: u64,
	pub rl_prov_device_per_window: u64,
	pub csr_global_per_minute: u64,
	pub csr_ip_per_window: u64,
	pub csr_provisioned_per_window: u64,
	pub csr_unprovisioned_per_window: u64,
	pub rate_limit_window_secs: u64,

	// Transparency
	pub transparency_log_enabled: bool,

	// MQTT
	pub mqtt_broker: String,
	pub mqtt_port: u16,
	pub mqtt_client_id: String,
	pub mqtt_username: Option<String>,
	pub mqtt_password: Option<String>,
	pub mqtt_topic_prefix: String,

	// HTTP
	pub http_port: u16,
	pub http_host: String,
}

impl AppConfig {
	pub fn from_env() -> Result<Self, PkiError> {
		Ok(Self {
			redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
			directory_base_url: env_or("DIRECTORY_BASE_URL", "http://127.0.0.1:8081"),
			timeseries_url: env_or("TIMESERIES_URL", "http://127.0.0.1:8086"),
			timeseries_token: env_or("TIMESERIES_TOKEN", ""),
			timeseries_org: env_or("TIMESERIES_ORG", "fleet-pki"),
			timeseries_bucket: env_or("TIMESERIES_BUCKET", "fleet-pki"),

			auth_secret: env_required("AUTH_SECRET")?,
			jwt_secret: env_required("JWT_SECRET")?,
			provisioning_token_ttl_secs: env_parse_or("PROVISIONING_TOKEN_TTL", 300)?,
			root_ca_validity_years: env_parse_or("ROOT_CA_VALIDITY_YEARS", 10)?,
			device_cert_validity_days: env_parse_or("DEVICE_CERT_VALIDITY_DAYS", 90)?,
			ca_storage_path: env_or("CA_STORAGE_PATH", "./ca-storage"),
			cert_cn_prefix: env_or("CERT_CN_PREFIX", "PROOF"),
			cert_cn_format: env_or("CERT_CN_FORMAT", "legacy").parse()?,
			cert_renewal_window_days: env_parse_or("CERT_RENEWAL_WINDOW_DAYS", 30)?,
			cert_grace_period_days: env_parse_or("CERT_GRACE_PERIOD_DAYS", 7)?,
			allow_onboarding_with_active_cert: env_parse_or(
				"ALLOW_ONBOARDING_WITH_ACTIVE_CERT",
				false,
			)?,

			rl_global_per_minute: env_parse_or("RATE_LIMIT_GLOBAL_PER_MINUTE", 1000)?,
			rl_ip_per_window: env_parse_or("RATE_LIMIT_IP_PER_WINDOW", 200)?,
			rl_prov_ip_per_window: env_parse_or("RATE_LIMIT_PROV_IP_PER_WINDOW", 30)?,
			rl_prov_device_per_window: env_parse_or("RATE_LIMIT_PROV_DEVICE_PER_WINDOW", 15)?,
			csr_global_per_minute: env_parse_or("RATE_LIMIT_CSR_GLOBAL_PER_MINUTE", 100)?,
			csr_ip_per_window: env_parse_or("RATE_LIMIT_CSR_IP_PER_WINDOW", 5)?,
			csr_provisioned_per_window: env_parse_or(
				"RATE_LIMIT_CSR_PROVISIONED_PER_WINDOW",
				10,
			)?,
			csr_unprovisioned_per_window: env_parse_or(
				"RATE_LIMIT_CSR_UNPROVISIONED_PER_WINDOW",
				3,
			)?,
			rate_limit_window_secs: env_parse_or("RATE_LIMIT_WINDOW", 900)?,

			transparency_log_enabled: env_parse_or("TRANSPARENCY_LOG_ENABLED", true)?,

			mqtt_broker: env_or("MQTT_BROKER", "127.0.0.1"),
			mqtt_port: env_parse_or("MQTT_PORT", 1883)?,
			mqtt_client_id: env_or("MQTT_CLIENT_ID", "fleet-pki"),
			mqtt_username: std::env::var("MQTT_USERNAME").ok(),
			mqtt_password: std::env::var("MQTT_PASSWORD").ok(),
			mqtt_topic_prefix: env_or("MQTT_TOPIC_PREFIX", "statsnapp"),

			http_port: env_port()?,
			http_host: env_or("HTTP_HOST", "0.0.0.0"),
		})
	}
}

impl fmt::Debug for AppConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("AppConfig")
			.field("redis_url", &self.redis_url)
			.field("directory_base_url", &self.directory_base_url)
			.field("timeseries_url", &self.timeseries_url)
			.field("timeseries_token", &"<redacted>")
			.field("timeseries_org", &self.timeseries_org)
			.field("timeseries_bucket", &self.timeseries_bucket)
			.field("auth_secret", &"<redacted>")
			.field("jwt_secret", &"<redacted>")
			.field("provisioning_token_ttl_secs", &self.provisioning_token_ttl_secs)
			.field("root_ca_validity_years", &self.root_ca_validity_years)
			.field("device_cert_validity_days", &self.device_cert_validity_days)
			.field("ca_storage_path", &self.ca_storage_path)
			.field("cert_cn_prefix", &self.cert_cn_prefix)
			.field("cert_cn_format", &self.cert_cn_format)
			.field("cert_renewal_window_days", &self.cert_renewal_window_days)
			.field("cert_grace_period_days", &self.cert_grace_period_days)
			.field(
				"allow_onboarding_with_active_cert",
				&self.allow_onboarding_with_active_cert,
			)
			.field("rl_global_per_minute", &self.rl_global_per_minute)
			.field("rl_ip_per_window", &self.rl_ip_per_window)
			.field("rl_prov_ip_per_window", &self.rl_prov_ip_per_window)
			.field("rl_prov_device_per_window", &self.rl_prov_device_per_window)
			.field("csr_global_per_minute", &self.csr_global_per_minute)
			.field("csr_ip_per_window", &self.csr_ip_per_window)
			.field("csr_provisioned_per_window", &self.csr_provisioned_per_window)
			.field(
				"csr_unprovisioned_per_window",
				&self.csr_unprovisioned_per_window,
			)
			.field("rate_limit_window_secs", &self.rate_limit_window_secs)
			.field("transparency_log_enabled", &self.transparency_log_enabled)
			.field("mqtt_broker", &self.mqtt_broker)
			.field("mqtt_port", &self.mqtt_port)
			.field("mqtt_client_id", &self.mqtt_client_id)
			.field("mqtt_username", &self.mqtt_username)
			.field("mqtt_password", &self.mqtt_password.as_ref().map(|_| "<redacted>"))
			.field("mqtt_topic_prefix", &self.mqtt_topic_prefix)
			.field("http_port", &self.http_port)
			.field("http_host", &self.http_host)
			.finish()
	}
}

fn env_or(key: &str, default: &str) -> String {
	std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_required(key: &str) -> Result<String, PkiError> {
	std::env::var(key).map_err(|_| PkiError::Config(format!("missing required env var {key}")))
}

/// `PORT` takes precedence over `HTTP_PORT`, matching the legacy
/// `PORT|HTTP_PORT` alias documented for this variable.
fn env_port() -> Result<u16, PkiError> {
	if let Ok(raw) = std::env::var("PORT") {
		return raw
			.parse()
			.map_err(|_| PkiError::Config(format!("invalid value for env var PORT: {raw}")));
	}
	env_parse_or("HTTP_PORT", 8080)
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> Result<T, PkiError> {
	match std::env::var(key) {
		Ok(raw) => raw
			.parse()
			.map_err(|_| PkiError::Config(format!("invalid value for env var {key}: {raw}"))),
		Err(_) => Ok(default),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn minimal_config() -> AppConfig {
		// SAFETY-free in tests: sets only the two required vars, scoped to
		// this process; tests that touch env vars run serially enough in
		// practice for a config-loading smoke test.
		unsafe {
			std::env::set_var("AUTH_SECRET", "test-auth-secret");
			std::env::set_var("JWT_SECRET", "test-jwt-secret");
		}
		AppConfig::from_env().expect("required vars are set")
	}

	#[test]
	fn from_env_applies_defaults() {
		let cfg = minimal_config();
		assert_eq!(cfg.provisioning_token_ttl_secs, 300);
		assert_eq!(cfg.cert_cn_format, CnFormat::Legacy);
		assert_eq!(cfg.mqtt_topic_prefix, "statsnapp");
	}

	#[test]
	fn debug_redacts_secrets() {
		let cfg = minimal_config();
		let debug = format!("{cfg:?}");
		assert!(!debug.contains("test-auth-secret"));
		assert!(!debug.contains("test-jwt-secret"));
		assert!(debug.contains("<redacted>"));
	}

	#[test]
	fn cn_format_rejects_unknown_value() {
		assert!("bogus".parse::<CnFormat>().is_err());
	}
}
