//! C4 — Rate Limiter: three composable middlewares (Global, Provisioning,
//! CSR), each a sequence of independent counter checks against Redis. Any
//! check whose post-increment value exceeds its cap rejects the request
//! with a retry hint equal to that counter's current TTL, per `spec.md`
//! §4.4. A backing-store outage fails the whole middleware **open**
//! (forwards the request, logs a warning) — the same `FailureMode::FailOpen`
//! idiom the teacher's `remoteratelimit.rs` applies to its own remote
//! rate-limit service.

use chrono::Utc;
use influxdb2::models::DataPoint;

use std::sync::Arc;

use crate::error::PkiError;
use crate::store::RedisStore;
use crate::store::TimeSeriesStore;
use crate::telemetry::{LimitLabels, Telemetry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitType {
	Global,
	Ip,
	ProvIp,
	ProvDevice,
	CsrGlobal,
	CsrIp,
	CsrProvisioned,
	CsrUnprovisioned,
}

impl LimitType {
	fn as_str(self) -> &'static str {
		match self {
			LimitType::Global => "global",
			LimitType::Ip => "ip",
			LimitType::ProvIp => "prov_ip",
			LimitType::ProvDevice => "prov_device",
			LimitType::CsrGlobal => "csr_global",
			LimitType::CsrIp => "csr_ip",
			LimitType::CsrProvisioned => "csr_provisioned",
			LimitType::CsrUnprovisioned => "csr_unprovisioned",
		}
	}
}

#[derive(Debug, Clone, Copy)]
pub struct Cap {
	pub limit: u64,
	pub window_secs: u64,
}

struct Counter {
	limit_type: LimitType,
	key: String,
	cap: Cap,
}

/// One middleware pass: every counter is checked in order; the first one
/// over its cap rejects the whole request.
pub struct RateLimiter {
	redis: RedisStore,
	timeseries: Option<TimeSeriesStore>,
	telemetry: Option<Arc<Telemetry>>,
}

impl RateLimiter {
	pub fn new(redis: RedisStore, timeseries: Option<TimeSeriesStore>) -> Self {
		Self {
			redis,
			timeseries,
			telemetry: None,
		}
	}

	pub fn with_telemetry(mut self, telemetry: Arc<Telemetry>) -> Self {
		self.telemetry = Some(telemetry);
		self
	}

	async fn check_all(&self, endpoint: &str, counters: Vec<Counter>) -> Result<(), PkiError> {
		for counter in counters {
			match self.redis.incr_with_ttl(&counter.key, counter.cap.window_secs).await {
				Ok(incr) => {
					if incr.count > counter.cap.limit {
						self
							.publish_event(endpoint, counter.limit_type, incr.count, counter.cap.limit)
							.await;
						if let Some(telemetry) = &self.telemetry {
							telemetry
								.rate_limit_rejections
								.get_or_create(&LimitLabels {
									limit_type: counter.limit_type.as_str().to_string(),
								})
								.inc();
						}
						return Err(PkiError::RateLimitExceeded {
							limit_type: counter.limit_type.as_str().to_string(),
							retry_after_secs: incr.ttl_secs,
							limit: counter.cap.limit,
							window_secs: counter.cap.window_secs,
						});
					}
				},
				Err(err) => {
					// Fail open: an unreachable counter store must never
					// itself become the reason a device can't provision.
					tracing::warn!(
						error = %err,
						limit_type = counter.limit_type.as_str(),
						"rate limit counter store unavailable, allowing request",
					);
					return Ok(());
				},
			}
		}
		Ok(())
	}

	async fn publish_event(&self, endpoint: &str, limit_type: LimitType, count: u64, limit: u64) {
		let Some(timeseries) = &self.timeseries else {
			return;
		};
		let point = DataPoint::builder("rate_limit_events")
			.tag("limit_type", limit_type.as_str())
			.tag("endpoint", endpoint)
			.field("count", count as i64)
			.field("limit", limit as i64)
			.field("remaining", 0i64)
			.timestamp(Utc::now().timestamp_nanos_opt().unwrap_or_default())
			.build();
		if let Ok(point) = point {
			if let Err(err) = timeseries.write(point).await {
				tracing::debug!(error = %err, "failed to publish rate_limit_events point");
			}
		}
	}

	/// `rl:global:{minute}`, `rl:ip:{ip}`. `GET /health` is exempt and must
	/// not call this at all.
	pub async fn check_global(&self, caps: &GlobalCaps, ip: &str) -> Result<(), PkiError> {
		let minute = current_minute();
		self
			.check_all(
				"global",
				vec![
					Counter {
						limit_type: LimitType::Global,
						key: format!("rl:global:{minute}"),
						cap: Cap {
							limit: caps.global_per_minute,
							window_secs: 60,
						},
					},
					Counter {
						limit_type: LimitType::Ip,
						key: format!("rl:ip:{ip}"),
						cap: Cap {
							limit: caps.ip_per_window,
							window_secs: caps.window_secs,
						},
					},
				],
			)
			.await
	}

	/// `rl:prov:ip:{ip}`, and `rl:prov:device:{d}` only when the request
	/// body carries a device id.
	pub async fn check_provisioning(
		&self,
		caps: &ProvisioningCaps,
		ip: &str,
		device_id: Option<&str>,
	) -> Result<(), PkiError> {
		let mut counters = vec![Counter {
			limit_type: LimitType::ProvIp,
			key: format!("rl:prov:ip:{ip}"),
			cap: Cap {
				limit: caps.ip_per_window,
				window_secs: caps.window_secs,
			},
		}];
		if let Some(device_id) = device_id {
			counters.push(Counter {
				limit_type: LimitType::ProvDevice,
				key: format!("rl:prov:device:{device_id}"),
				cap: Cap {
					limit: caps.device_per_window,
					window_secs: caps.window_secs,
				},
			});
		}
		self.check_all("onboarding", counters).await
	}

	/// `csr:global:{minute}`, `csr:ip:{ip}`, then `csr:provisioned:{d}` if a
	/// device is already known or `csr:unprovisioned:{ip}` otherwise.
	pub async fn check_csr(&self, caps: &CsrCaps, ip: &str, device_id: Option<&str>) -> Result<(), PkiError> {
		let minute = current_minute();
		let mut counters = vec![
			Counter {
				limit_type: LimitType::CsrGlobal,
				key: format!("csr:global:{minute}"),
				cap: Cap {
					limit: caps.global_per_minute,
					window_secs: 60,
				},
			},
			Counter {
				limit_type: LimitType::CsrIp,
				key: format!("csr:ip:{ip}"),
				cap: Cap {
					limit: caps.ip_per_window,
					window_secs: caps.window_secs,
				},
			},
		];
		counters.push(match device_id {
			Some(device_id) => Counter {
				limit_type: LimitType::CsrProvisioned,
				key: format!("csr:provisioned:{device_id}"),
				cap: Cap {
					limit: caps.provisioned_per_window,
					window_secs: caps.window_secs,
				},
			},
			None => Counter {
				limit_type: LimitType::CsrUnprovisioned,
				key: format!("csr:unprovisioned:{ip}"),
				cap: Cap {
					limit: caps.unprovisioned_per_window,
					window_secs: caps.window_secs,
				},
			},
		});
		self.check_all("sign-csr", counters).await
	}
}

#[derive(Debug, Clone, Copy)]
pub struct GlobalCaps {
	pub global_per_minute: u64,
	pub ip_per_window: u64,
	pub window_secs: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct ProvisioningCaps {
	pub ip_per_window: u64,
	pub device_per_window: u64,
	pub window_secs: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct CsrCaps {
	pub global_per_minute: u64,
	pub ip_per_window: u64,
	pub provisioned_per_window: u64,
	pub unprovisioned_per_window: u64,
	pub window_secs: u64,
}

fn current_minute() -> i64 {
	Utc::now().timestamp() / 60
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn limit_type_labels_are_stable() {
		assert_eq!(LimitType::CsrIp.as_str(), "csr_ip");
		assert_eq!(LimitType::ProvDevice.as_str(), "prov_device");
	}

	#[tokio::test]
	#[ignore = "requires a live Redis instance; set FLEET_PKI_TEST_REDIS_URL to enable"]
	async fn sixth_request_in_window_is_rejected() {
		let redis = RedisStore::connect(
			&std::env::var("FLEET_PKI_TEST_REDIS_URL").expect("FLEET_PKI_TEST_REDIS_URL"),
		)
		.await
		.expect("connect to test redis");
		let limiter = RateLimiter::new(redis, None);
		let caps = CsrCaps {
			global_per_minute: 1000,
			ip_per_window: 5,
			provisioned_per_window: 1000,
			unprovisioned_per_window: 1000,
			window_secs: 900,
		};
		for _ in 0..5 {
			limiter.check_csr(&caps, "203.0.113.9", None).await.expect("under cap");
		}
		let sixth = limiter.check_csr(&caps, "203.0.113.9", None).await;
		assert!(matches!(sixth, Err(PkiError::RateLimitExceeded { .. })));
	}
}
