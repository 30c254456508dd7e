//! Ambient operational metrics. Not the stats/follower-count publisher
//! collaborators build on top of the audit trail — just the counters and
//! gauges a production service exposes about its own behavior regardless of
//! what product surface consumes them.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct OutcomeLabels {
	pub outcome: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LimitLabels {
	pub limit_type: String,
}

pub struct Telemetry {
	pub certificates_issued: Counter,
	pub certificates_revoked: Counter,
	pub onboarding_attempts: Family<OutcomeLabels, Counter>,
	pub sign_csr_attempts: Family<OutcomeLabels, Counter>,
	pub rate_limit_rejections: Family<LimitLabels, Counter>,
	pub active_devices: Gauge,
	pub audit_log_depth: Gauge,
	pub transparency_log_depth: Gauge,
}

impl Telemetry {
	pub fn new(registry: &mut Registry) -> Self {
		let certificates_issued = Counter::default();
		registry.register(
			"fleet_pki_certificates_issued",
			"Total certificates issued by the CA",
			certificates_issued.clone(),
		);

		let certificates_revoked = Counter::default();
		registry.register(
			"fleet_pki_certificates_revoked",
			"Total certificates revoked",
			certificates_revoked.clone(),
		);

		let onboarding_attempts = Family::<OutcomeLabels, Counter>::default();
		registry.register(
			"fleet_pki_onboarding_attempts",
			"Device onboarding attempts by outcome",
			onboarding_attempts.clone(),
		);

		let sign_csr_attempts = Family::<OutcomeLabels, Counter>::default();
		registry.register(
			"fleet_pki_sign_csr_attempts",
			"CSR signing attempts by outcome",
			sign_csr_attempts.clone(),
		);

		let rate_limit_rejections = Family::<LimitLabels, Counter>::default();
		registry.register(
			"fleet_pki_rate_limit_rejections",
			"Requests rejected by the rate limiter, by limit type",
			rate_limit_rejections.clone(),
		);

		let active_devices = Gauge::default();
		registry.register(
			"fleet_pki_active_devices",
			"Devices currently considered online by the liveness tracker",
			active_devices.clone(),
		);

		let audit_log_depth = Gauge::default();
		registry.register(
			"fleet_pki_audit_log_depth",
			"Number of entries in the audit log hash chain",
			audit_log_depth.clone(),
		);

		let transparency_log_depth = Gauge::default();
		registry.register(
			"fleet_pki_transparency_log_depth",
			"Number of leaves in the transparency log",
			transparency_log_depth.clone(),
		);

		Self {
			certificates_issued,
			certificates_revoked,
			onboarding_attempts,
			sign_csr_attempts,
			rate_limit_rejections,
			active_devices,
			audit_log_depth,
			transparency_log_depth,
		}
	}
}
