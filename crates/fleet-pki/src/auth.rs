//! C6 — Auth Verifier: decodes the externally-issued bearer session token
//! and extracts a user identifier. The signing/claims idiom is adapted from
//! the teacher's `http/jwt.rs` (`Jwk`/`Validation` pair, a dedicated error
//! enum per failure mode) with HS256 over a shared secret instead of
//! JWKS/RS256, because `spec.md` §3 specifies a shared-secret-signed token,
//! not a JWKS-discoverable one.

use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;

use crate::error::PkiError;

/// `{sub|userId|id|user_id, email?, iat, exp}` — the four documented
/// spellings of the subject claim are tried in order since `spec.md` §3
/// does not pick one.
#[derive(Debug, Clone, Deserialize)]
struct RawClaims {
	sub: Option<String>,
	#[serde(rename = "userId")]
	user_id_camel: Option<String>,
	id: Option<String>,
	user_id: Option<String>,
	email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VerifiedUser {
	pub user_id: String,
	pub email: Option<String>,
}

pub struct AuthVerifier {
	decoding_key: DecodingKey,
	validation: Validation,
}

impl AuthVerifier {
	pub fn new(shared_secret: &str) -> Self {
		let mut validation = Validation::new(Algorithm::HS256);
		validation.validate_exp = true;
		// The external issuer is not this system, so no audience/issuer is
		// enforced here beyond signature and expiry.
		validation.required_spec_claims.clear();
		Self {
			decoding_key: DecodingKey::from_secret(shared_secret.as_bytes()),
			validation,
		}
	}

	/// `spec.md` §4.7 stage 1: missing/empty bearer → `AuthTokenMissing`;
	/// anything else that fails to verify → `AuthTokenInvalid`.
	pub fn verify(&self, bearer_token: Option<&str>) -> Result<VerifiedUser, PkiError> {
		let token = bearer_token
			.map(str::trim)
			.filter(|t| !t.is_empty())
			.ok_or(PkiError::AuthTokenMissing)?;

		let decoded = decode::<RawClaims>(token, &self.decoding_key, &self.validation)
			.map_err(|_| PkiError::AuthTokenInvalid)?;
		let claims = decoded.claims;

		let user_id = claims
			.sub
			.or(claims.user_id_camel)
			.or(claims.id)
			.or(claims.user_id)
			.ok_or(PkiError::AuthTokenInvalid)?;

		Ok(VerifiedUser {
			user_id,
			email: claims.email,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use jsonwebtoken::{EncodingKey, Header, encode};
	use serde_json::json;

	fn sign(secret: &str, claims: serde_json::Value) -> String {
		encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(secret.as_bytes()))
			.expect("encode test token")
	}

	#[test]
	fn missing_token_is_auth_token_missing() {
		let verifier = AuthVerifier::new("secret");
		assert!(matches!(verifier.verify(None), Err(PkiError::AuthTokenMissing)));
		assert!(matches!(verifier.verify(Some("  ")), Err(PkiError::AuthTokenMissing)));
	}

	#[test]
	fn wrong_secret_is_auth_token_invalid() {
		let now = chrono::Utc::now().timestamp();
		let token = sign("right-secret", json!({"sub": "u1", "iat": now, "exp": now + 3600}));
		let verifier = AuthVerifier::new("wrong-secret");
		assert!(matches!(verifier.verify(Some(&token)), Err(PkiError::AuthTokenInvalid)));
	}

	#[test]
	fn expired_token_is_auth_token_invalid() {
		let now = chrono::Utc::now().timestamp();
		let token = sign("secret", json!({"sub": "u1", "iat": now - 7200, "exp": now - 3600}));
		let verifier = AuthVerifier::new("secret");
		assert!(matches!(verifier.verify(Some(&token)), Err(PkiError::AuthTokenInvalid)));
	}

	#[test]
	fn accepts_any_of_the_four_subject_claim_spellings() {
		let now = chrono::Utc::now().timestamp();
		let verifier = AuthVerifier::new("secret");
		for claims in [
			json!({"sub": "u1", "iat": now, "exp": now + 3600}),
			json!({"userId": "u1", "iat": now, "exp": now + 3600}),
			json!({"id": "u1", "iat": now, "exp": now + 3600}),
			json!({"user_id": "u1", "iat": now, "exp": now + 3600}),
		] {
			let token = sign("secret", claims);
			let verified = verifier.verify(Some(&token)).expect("valid token");
			assert_eq!(verified.user_id, "u1");
		}
	}

	#[test]
	fn email_claim_is_optional() {
		let now = chrono::Utc::now().timestamp();
		let verifier = AuthVerifier::new("secret");
		let token = sign(
			"secret",
			json!({"sub": "u1", "email": "d@example.com", "iat": now, "exp": now + 3600}),
		);
		let verified = verifier.verify(Some(&token)).expect("valid token");
		assert_eq!(verified.email.as_deref(), Some("d@example.com"));
	}
}
