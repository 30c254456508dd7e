//! C8 — Provisioning Service: issues, validates, and revokes the short-lived
//! provisioning tokens described in `spec.md` §3/§4.6. Tokens are HMAC-SHA256
//! signed with `{device_id, user_id, type: "provisioning", iat, exp}`
//! claims; liveness is mirrored in the Token Store (C1) so a consumed or
//! restarted token reads back as invalid even if its JWT signature and
//! expiry still check out.

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::error::{PkiError, PkiResult};
use crate::token_store::TokenStore;

const TOKEN_TYPE: &str = "provisioning";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ProvisioningClaims {
	device_id: String,
	user_id: String,
	#[serde(rename = "type")]
	token_type: String,
	iat: i64,
	exp: i64,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
	pub token: String,
	pub expires_in_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ValidatedToken {
	pub device_id: String,
	pub user_id: String,
}

pub struct ProvisioningService {
	store: TokenStore,
	encoding_key: EncodingKey,
	decoding_key: DecodingKey,
	validation: Validation,
	ttl_secs: u64,
}

impl ProvisioningService {
	pub fn new(store: TokenStore, jwt_secret: &str, ttl_secs: u64) -> Self {
		let mut validation = Validation::new(Algorithm::HS256);
		validation.validate_exp = true;
		validation.required_spec_claims.clear();
		Self {
			store,
			encoding_key: EncodingKey::from_secret(jwt_secret.as_bytes()),
			decoding_key: DecodingKey::from_secret(jwt_secret.as_bytes()),
			validation,
			ttl_secs,
		}
	}

	/// `spec.md` §4.6: if a live token already exists for `device_id` and
	/// hasn't expired, returns it unchanged instead of minting a new one —
	/// the idempotency the protocol handler's onboarding endpoint relies on
	/// (`spec.md` §4.7, the 200-idempotent path this spec mandates over the
	/// legacy 409).
	pub async fn issue_token(&self, device_id: &str, user_id: &str) -> PkiResult<IssuedToken> {
		if let Some(existing) = self.store.get_token_by_device(device_id).await? {
			if let Some(record) = self.store.get_device_by_token(&existing).await? {
				let remaining_ms = record.expires_at_ms - now_ms();
				if remaining_ms > 0 {
					return Ok(IssuedToken {
						token: existing,
						expires_in_secs: (remaining_ms / 1000).max(0) as u64,
					});
				}
			}
		}

		let now = Utc::now().timestamp();
		let exp = now + self.ttl_secs as i64;
		let claims = ProvisioningClaims {
			device_id: device_id.to_string(),
			user_id: user_id.to_string(),
			token_type: TOKEN_TYPE.to_string(),
			iat: now,
			exp,
		};
		let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
			.map_err(|e| PkiError::Internal(anyhow::anyhow!("signing provisioning token: {e}")))?;

		self
			.store
			.set(&token, device_id, user_id, exp * 1000, self.ttl_secs)
			.await?;

		Ok(IssuedToken {
			token,
			expires_in_secs: self.ttl_secs,
		})
	}

	/// `spec.md` §4.6: signature/expiry check first, then `type`, then the
	/// token-store lookup. A JWT that still verifies but is absent from the
	/// store is "consumed or restarted" and reported as `TokenNotFound`.
	pub async fn validate_token(&self, token: &str) -> PkiResult<ValidatedToken> {
		let decoded = decode::<ProvisioningClaims>(token, &self.decoding_key, &self.validation).map_err(
			|err| match err.kind() {
				jsonwebtoken::errors::ErrorKind::ExpiredSignature => PkiError::TokenExpired,
				jsonwebtoken::errors::ErrorKind::InvalidSignature => PkiError::TokenInvalidSignature,
				_ => PkiError::TokenInvalidFormat,
			},
		)?;
		let claims = decoded.claims;

		if claims.token_type != TOKEN_TYPE {
			return Err(PkiError::TokenInvalidType);
		}

		match self.store.get_device_by_token(token).await? {
			Some(record) => {
				if record.device_id != claims.device_id {
					return Err(PkiError::TokenDeviceMismatch);
				}
				Ok(ValidatedToken {
					device_id: record.device_id,
					user_id: record.user_id,
				})
			},
			None => Err(PkiError::TokenNotFound),
		}
	}

	/// Idempotent: deletes both token-store keys regardless of whether the
	/// token is still present.
	pub async fn revoke_token(&self, token: &str) -> PkiResult<()> {
		self.store.delete_token(token).await
	}

	pub async fn has_active_token(&self, device_id: &str) -> PkiResult<bool> {
		self.store.has_active_token(device_id).await
	}

	/// Reads the `device_id` claim without verifying the token's
	/// signature — used only by the CSR rate limiter to pick between its
	/// `csr:provisioned:{d}` and `csr:unprovisioned:{ip}` buckets before
	/// the token is actually validated (`spec.md` §4.4). Never use this
	/// result for authorization.
	pub fn peek_device_id(token: &str) -> Option<String> {
		let mut validation = Validation::new(Algorithm::HS256);
		validation.insecure_disable_signature_validation();
		validation.validate_exp = false;
		validation.required_spec_claims.clear();
		decode::<ProvisioningClaims>(token, &DecodingKey::from_secret(&[]), &validation)
			.ok()
			.map(|data| data.claims.device_id)
	}
}

fn now_ms() -> i64 {
	fleet_core::time::now_ms()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	#[ignore = "requires a live Redis instance; set FLEET_PKI_TEST_REDIS_URL to enable"]
	async fn reissuing_for_a_live_device_returns_the_same_token() {
		let url = std::env::var("FLEET_PKI_TEST_REDIS_URL").expect("FLEET_PKI_TEST_REDIS_URL");
		let redis = crate::store::RedisStore::connect(&url).await.expect("connect");
		let store = TokenStore::new(redis);
		let service = ProvisioningService::new(store, "jwt-secret", 300);

		let first = service.issue_token("d-1", "u-1").await.expect("issue");
		let second = service.issue_token("d-1", "u-1").await.expect("reissue");
		assert_eq!(first.token, second.token);
	}

	#[test]
	fn expired_claims_are_rejected_before_store_lookup() {
		let validation = {
			let mut v = Validation::new(Algorithm::HS256);
			v.validate_exp = true;
			v.required_spec_claims.clear();
			v
		};
		let key = EncodingKey::from_secret(b"secret");
		let decoding_key = DecodingKey::from_secret(b"secret");
		let now = Utc::now().timestamp();
		let claims = ProvisioningClaims {
			device_id: "d-1".into(),
			user_id: "u-1".into(),
			token_type: TOKEN_TYPE.into(),
			iat: now - 600,
			exp: now - 300,
		};
		let token = encode(&Header::new(Algorithm::HS256), &claims, &key).unwrap();
		let result = decode::<ProvisioningClaims>(&token, &decoding_key, &validation);
		assert!(matches!(
			result.unwrap_err().kind(),
			jsonwebtoken::errors::ErrorKind::ExpiredSignature
		));
	}
}
