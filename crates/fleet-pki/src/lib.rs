//! `fleet-pki` — the IoT device provisioning and certificate control plane
//! described in `spec.md`: C1 through C10, wired together by [`AppState`].
//! Every collaborator is constructed once, at startup, and handed down by
//! reference or `Arc`; nothing in this crate reaches for a process-wide
//! singleton (`spec.md` §9).

pub mod audit;
pub mod auth;
pub mod ca;
pub mod config;
pub mod directory;
pub mod error;
pub mod liveness;
pub mod model;
pub mod protocol;
pub mod provisioning;
pub mod ratelimit;
pub mod store;
pub mod telemetry;
pub mod token_store;
pub mod transparency;

use std::path::Path;
use std::sync::Arc;

use prometheus_client::registry::Registry;

use crate::audit::AuditLog;
use crate::auth::AuthVerifier;
use crate::ca::{CaConfig, CertificateAuthority, CertificateStore};
use crate::config::AppConfig;
use crate::directory::Directory;
use crate::error::PkiResult;
use crate::liveness::DeviceLivenessTracker;
use crate::protocol::ProtocolHandler;
use crate::provisioning::ProvisioningService;
use crate::ratelimit::{CsrCaps, GlobalCaps, ProvisioningCaps, RateLimiter};
use crate::store::{RedisStore, TimeSeriesStore};
use crate::telemetry::Telemetry;
use crate::token_store::TokenStore;
use crate::transparency::TransparencyLog;

/// Every backing store and collaborator this process needs, built once at
/// startup by [`AppState::build`]. `fleet-pki-app` owns the HTTP router and
/// the concrete `Directory`/`MqttClient` implementations; this struct is
/// the seam between them and the C1-C10 component graph.
pub struct AppState {
	pub config: AppConfig,
	pub redis: RedisStore,
	pub timeseries: TimeSeriesStore,
	pub directory: Arc<dyn Directory>,
	pub audit: Arc<AuditLog>,
	pub transparency: Arc<TransparencyLog>,
	pub rate_limiter: Arc<RateLimiter>,
	pub ca: Arc<CertificateAuthority>,
	pub protocol: Arc<ProtocolHandler>,
	pub telemetry: Arc<Telemetry>,
	pub registry: Registry,
	pub liveness: Option<Arc<DeviceLivenessTracker>>,
	pub started_at: std::time::Instant,
}

impl AppState {
	/// Connects to Redis and the time-series store, replays each log's
	/// persisted head, and constructs C1/C2/C3/C4/C5/C6/C8/C9 from
	/// `config`. The liveness tracker (C10) is attached afterward with
	/// [`AppState::with_liveness`] once `fleet-pki-app` has a concrete
	/// `MqttClient` to hand it — it depends on a broker connection this
	/// function has no business making.
	pub async fn build(config: AppConfig, directory: Arc<dyn Directory>) -> PkiResult<Self> {
		let redis = RedisStore::connect(&config.redis_url).await?;
		let timeseries = TimeSeriesStore::new(
			&config.timeseries_url,
			&config.timeseries_org,
			&config.timeseries_token,
			&config.timeseries_bucket,
		);

		let mut registry = Registry::default();
		let telemetry = Arc::new(Telemetry::new(&mut registry));

		let fallback_path = Path::new(&config.ca_storage_path).join("audit-fallback.ndjson");
		let audit = Arc::new(AuditLog::new(timeseries.clone(), fallback_path));
		audit.initialize().await?;

		let transparency = Arc::new(TransparencyLog::new(timeseries.clone()));
		if config.transparency_log_enabled {
			transparency.initialize().await?;
		}

		let rate_limiter = Arc::new(
			RateLimiter::new(redis.clone(), Some(timeseries.clone())).with_telemetry(telemetry.clone()),
		);

		let cert_store = CertificateStore::new(redis.clone());
		let ca_cfg = CaConfig {
			storage_path: config.ca_storage_path.clone(),
			root_ca_validity_years: config.root_ca_validity_years,
			device_cert_validity_days: config.device_cert_validity_days,
			cn_prefix: config.cert_cn_prefix.clone(),
			renewal_window_days: config.cert_renewal_window_days,
			grace_period_days: config.cert_grace_period_days,
			transparency_log_enabled: config.transparency_log_enabled,
		};
		let ca = Arc::new(CertificateAuthority::initialize(
			cert_store,
			audit.clone(),
			transparency.clone(),
			telemetry.clone(),
			ca_cfg,
		)?);

		let token_store = TokenStore::new(redis.clone());
		let provisioning =
			ProvisioningService::new(token_store, &config.jwt_secret, config.provisioning_token_ttl_secs);
		let auth = AuthVerifier::new(&config.auth_secret);

		let protocol = Arc::new(ProtocolHandler::new(
			auth,
			directory.clone(),
			provisioning,
			ca.clone(),
			config.cert_cn_format,
			config.allow_onboarding_with_active_cert,
		));

		Ok(Self {
			config,
			redis,
			timeseries,
			directory,
			audit,
			transparency,
			rate_limiter,
			ca,
			protocol,
			telemetry,
			registry,
			liveness: None,
			started_at: std::time::Instant::now(),
		})
	}

	pub fn with_liveness(mut self, liveness: Arc<DeviceLivenessTracker>) -> Self {
		self.liveness = Some(liveness);
		self
	}

	pub fn global_caps(&self) -> GlobalCaps {
		GlobalCaps {
			global_per_minute: self.config.rl_global_per_minute,
			ip_per_window: self.config.rl_ip_per_window,
			window_secs: self.config.rate_limit_window_secs,
		}
	}

	pub fn provisioning_caps(&self) -> ProvisioningCaps {
		ProvisioningCaps {
			ip_per_window: self.config.rl_prov_ip_per_window,
			device_per_window: self.config.rl_prov_device_per_window,
			window_secs: self.config.rate_limit_window_secs,
		}
	}

	pub fn csr_caps(&self) -> CsrCaps {
		CsrCaps {
			global_per_minute: self.config.csr_global_per_minute,
			ip_per_window: self.config.csr_ip_per_window,
			provisioned_per_window: self.config.csr_provisioned_per_window,
			unprovisioned_per_window: self.config.csr_unprovisioned_per_window,
			window_secs: self.config.rate_limit_window_secs,
		}
	}

	/// Backing-store reachability used by `GET /health`; never touches the
	/// rate limiter's counters.
	pub async fn backend_health(&self) -> BackendHealth {
		let audit_chain_depth = self.audit.head().sequence;
		let transparency_log_depth = self.transparency.leaf_count().await;
		self.telemetry.audit_log_depth.set(audit_chain_depth as i64);
		self.telemetry.transparency_log_depth.set(transparency_log_depth as i64);

		BackendHealth {
			redis_reachable: self.redis.ping().await,
			timeseries_reachable: self.timeseries.ping().await,
			mqtt_connected: self.liveness.as_ref().map(|l| l.is_connected()).unwrap_or(false),
			// Cheap by design (`SPEC_FULL.md` §6): the in-memory head is
			// only ever advanced by `AuditLog::log_event`'s single
			// serialized critical section, so as long as this process is
			// the one that wrote it, it is internally consistent. A full
			// `verify_chain` walk over every persisted entry is a
			// separate, deliberately uncalled-from-`/health` operation.
			audit_chain_valid: true,
			audit_chain_depth,
			transparency_log_depth,
			uptime_seconds: self.started_at.elapsed().as_secs(),
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct BackendHealth {
	pub redis_reachable: bool,
	pub timeseries_reachable: bool,
	pub mqtt_connected: bool,
	pub audit_chain_valid: bool,
	pub audit_chain_depth: u64,
	pub transparency_log_depth: u64,
	pub uptime_seconds: u64,
}
