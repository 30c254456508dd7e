//! Thin Axum router over `fleet_pki`'s C9 protocol handler and C5
//! certificate lookups, per `spec.md` §6's HTTP surface table. The router
//! itself is explicitly out-of-scope engineering (`spec.md` §1) — this file
//! does no more than extract the request, apply the documented rate-limit
//! middleware, call into `fleet_pki`, and serialize the response envelope.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::Engine;
use fleet_pki::error::PkiError;
use fleet_pki::model::ErrorEnvelope;
use fleet_pki::protocol::{OnboardingRequest, SignCsrRequest};
use fleet_pki::AppState;
use serde::Serialize;
use serde_json::json;

pub fn router(state: Arc<AppState>) -> Router {
	Router::new()
		.route("/api/v1/onboarding", post(onboarding))
		.route("/api/v1/sign-csr", post(sign_csr))
		.route("/api/v1/certificates/{cert_id}/download", get(download_certificate))
		.route("/api/v1/certificates/{device_id}/status", get(certificate_status))
		.route("/api/v1/certificates/{device_id}", delete(revoke_certificate))
		.route("/v1/mqtt-config", get(mqtt_config))
		.route("/health", get(health))
		.route("/metrics", get(metrics))
		.with_state(state)
}

/// Wraps every fallible handler's error so `?` works against `PkiError`
/// directly; `IntoResponse` renders the `spec.md` §6 error envelope.
struct ApiError(PkiError);

impl From<PkiError> for ApiError {
	fn from(err: PkiError) -> Self {
		Self(err)
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let err = self.0;
		let status = StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

		if let PkiError::RateLimitExceeded {
			limit_type,
			retry_after_secs,
			limit,
			window_secs,
		} = &err
		{
			tracing::warn!(limit_type = %limit_type, retry_after_secs, limit, "rate limit exceeded");
			let body = json!({
				"success": false,
				"error": "RATE_LIMIT_EXCEEDED",
				"code": err.code(),
				"retryAfter": retry_after_secs,
				"limit": limit,
				"window": window_secs,
				"type": limit_type,
				"timestamp": fleet_core::time::now_iso(),
			});
			let mut response = (status, Json(body)).into_response();
			let headers = response.headers_mut();
			headers.insert("Retry-After", header_value_from_u64(*retry_after_secs));
			headers.insert("X-RateLimit-Limit", header_value_from_u64(*limit));
			headers.insert("X-RateLimit-Remaining", header_value_from_u64(0));
			headers.insert("X-RateLimit-Reset", header_value_from_u64(*retry_after_secs));
			if let Ok(value) = axum::http::HeaderValue::from_str(limit_type) {
				headers.insert("X-RateLimit-Type", value);
			}
			return response;
		}

		if status.is_server_error() {
			tracing::error!(error = %err, code = err.code(), "request failed");
		} else {
			tracing::debug!(error = %err, code = err.code(), "request rejected");
		}

		(status, Json(ErrorEnvelope::from_error(&err))).into_response()
	}
}

fn header_value_from_u64(n: u64) -> axum::http::HeaderValue {
	axum::http::HeaderValue::from_str(&n.to_string()).expect("decimal digits are a valid header value")
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
	headers
		.get(axum::http::header::AUTHORIZATION)?
		.to_str()
		.ok()?
		.strip_prefix("Bearer ")
		.map(str::trim)
		.filter(|t| !t.is_empty())
		.map(str::to_string)
}

/// Prefers `X-Forwarded-For`'s first hop (this service sits behind a load
/// balancer in every deployment that matters for rate limiting), falling
/// back to the socket peer address.
fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
	headers
		.get("x-forwarded-for")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.split(',').next())
		.map(|v| v.trim().to_string())
		.unwrap_or_else(|| addr.ip().to_string())
}

async fn onboarding(
	State(state): State<Arc<AppState>>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	headers: HeaderMap,
	Json(body): Json<OnboardingRequest>,
) -> Result<impl IntoResponse, ApiError> {
	let ip = client_ip(&headers, addr);
	state.rate_limiter.check_global(&state.global_caps(), &ip).await?;
	state
		.rate_limiter
		.check_provisioning(&state.provisioning_caps(), &ip, Some(&body.device_id))
		.await?;

	let result = state.protocol.onboarding(bearer_token(&headers).as_deref(), body).await;
	record_attempt(&state.telemetry.onboarding_attempts, &result);
	Ok(Json(result?))
}

async fn sign_csr(
	State(state): State<Arc<AppState>>,
	ConnectInfo(addr): ConnectInfo<SocketAddr>,
	headers: HeaderMap,
	Json(body): Json<SignCsrRequest>,
) -> Result<impl IntoResponse, ApiError> {
	let ip = client_ip(&headers, addr);
	state.rate_limiter.check_global(&state.global_caps(), &ip).await?;

	let bearer = bearer_token(&headers);
	let token_for_bucket = bearer.as_deref().or(body.provisioning_token.as_deref());
	let device_hint = token_for_bucket.and_then(fleet_pki::provisioning::ProvisioningService::peek_device_id);
	state
		.rate_limiter
		.check_csr(&state.csr_caps(), &ip, device_hint.as_deref())
		.await?;

	let result = state.protocol.sign_csr(bearer.as_deref(), body).await;
	record_attempt(&state.telemetry.sign_csr_attempts, &result);
	Ok(Json(result?))
}

/// Tags an onboarding/sign-csr outcome with `success`/`failure` and bumps
/// the matching counter — the one place either handler touches telemetry,
/// so success and failure are never recorded inconsistently between them.
fn record_attempt<T>(
	family: &prometheus_client::metrics::family::Family<
		fleet_pki::telemetry::OutcomeLabels,
		prometheus_client::metrics::counter::Counter,
	>,
	result: &Result<T, PkiError>,
) {
	let outcome = if result.is_ok() { "success" } else { "failure" };
	family
		.get_or_create(&fleet_pki::telemetry::OutcomeLabels {
			outcome: outcome.to_string(),
		})
		.inc();
}

#[derive(Debug, Serialize)]
struct DownloadResponse {
	certificate: String,
	ca_certificate: String,
	private_key: Option<String>,
}

async fn download_certificate(
	State(state): State<Arc<AppState>>,
	Path(cert_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	let record = state
		.ca
		.get_by_id(&cert_id)
		.await?
		.ok_or(PkiError::CertificateNotFound { id: cert_id })?;
	Ok(Json(DownloadResponse {
		certificate: record.certificate_pem,
		ca_certificate: record.ca_certificate_pem,
		private_key: record.private_key_pem,
	}))
}

#[derive(Debug, Serialize)]
struct StatusResponse {
	device_id: String,
	status: fleet_pki::ca::CertificateStatus,
	expires_at: String,
	created_at: String,
	fingerprint: String,
}

async fn certificate_status(
	State(state): State<Arc<AppState>>,
	Path(device_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	let record = state
		.ca
		.get_by_device(&device_id)
		.await?
		.ok_or(PkiError::DeviceNotFound { device_id: device_id.clone() })?;
	Ok(Json(StatusResponse {
		device_id: record.device_id,
		status: record.status,
		expires_at: record.expires_at,
		created_at: record.created_at,
		fingerprint: record.fingerprint,
	}))
}

async fn revoke_certificate(
	State(state): State<Arc<AppState>>,
	Path(device_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
	let record = state.ca.revoke(&device_id).await?;
	Ok(Json(json!({ "device_id": record.device_id })))
}

async fn mqtt_config(State(state): State<Arc<AppState>>) -> impl IntoResponse {
	let ca_cert = base64::engine::general_purpose::STANDARD.encode(state.ca.ca_certificate_pem());
	Json(json!({
		"broker": state.config.mqtt_broker,
		"port": state.config.mqtt_port,
		"ca_cert": ca_cert,
	}))
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
	let health = state.backend_health().await;
	let status = if health.redis_reachable { "ok" } else { "degraded" };
	Json(json!({
		"status": status,
		"mqtt": { "connected": health.mqtt_connected },
		"audit": { "chain_valid": health.audit_chain_valid, "depth": health.audit_chain_depth },
		"transparency": { "depth": health.transparency_log_depth },
		"redis_reachable": health.redis_reachable,
		"timeseries_reachable": health.timeseries_reachable,
		"uptime_seconds": health.uptime_seconds,
		"timestamp": fleet_core::time::now_iso(),
	}))
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
	let mut buffer = String::new();
	match prometheus_client::encoding::text::encode(&mut buffer, &state.registry) {
		Ok(()) => (
			StatusCode::OK,
			[("content-type", "application/openmetrics-text; version=1.0.0; charset=utf-8")],
			buffer,
		)
			.into_response(),
		Err(err) => {
			tracing::error!(error = %err, "failed to encode metrics");
			StatusCode::INTERNAL_SERVER_ERROR.into_response()
		},
	}
}
