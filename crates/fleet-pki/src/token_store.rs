//! C1 — Token Store: durable keyed storage for provisioning tokens, with
//! TTL and bidirectional token↔device lookup.
//!
//! Two Redis keys are written per token so both lookup directions ("is this
//! token still live" and "does this device already have a live token") are
//! native `GET`s instead of a scan, and both expire together because they
//! share one TTL.

use serde::{Deserialize, Serialize};

use crate::error::PkiError;
use crate::store::RedisStore;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
	pub device_id: String,
	pub user_id: String,
	pub expires_at_ms: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct TokenStoreStats {
	pub backend_reachable: bool,
}

pub struct TokenStore {
	redis: RedisStore,
}

fn token_key(token: &str) -> String {
	format!("token:{token}")
}

fn device_key(device_id: &str) -> String {
	format!("device:{device_id}")
}

impl TokenStore {
	pub fn new(redis: RedisStore) -> Self {
		Self { redis }
	}

	/// Writes both `token:{t}` and `device:{d}` with the same TTL.
	pub async fn set(
		&self,
		token: &str,
		device_id: &str,
		user_id: &str,
		expires_at_ms: i64,
		ttl_secs: u64,
	) -> Result<(), PkiError> {
		let record = TokenRecord {
			device_id: device_id.to_string(),
			user_id: user_id.to_string(),
			expires_at_ms,
		};
		let payload =
			serde_json::to_string(&record).map_err(|e| PkiError::DatabaseUnavailable(e.to_string()))?;
		self.redis.set_ex(&token_key(token), &payload, ttl_secs).await?;
		self.redis.set_ex(&device_key(device_id), token, ttl_secs).await?;
		Ok(())
	}

	pub async fn get_device_by_token(&self, token: &str) -> Result<Option<TokenRecord>, PkiError> {
		match self.redis.get(&token_key(token)).await? {
			Some(raw) => {
				let record = serde_json::from_str(&raw)
					.map_err(|e| PkiError::DatabaseUnavailable(e.to_string()))?;
				Ok(Some(record))
			},
			None => Ok(None),
		}
	}

	pub async fn get_token_by_device(&self, device_id: &str) -> Result<Option<String>, PkiError> {
		self.redis.get(&device_key(device_id)).await
	}

	pub async fn has_active_token(&self, device_id: &str) -> Result<bool, PkiError> {
		self.redis.exists(&device_key(device_id)).await
	}

	/// Idempotent: deletes both keys for `token`, looking up its device
	/// first so the reverse key is also removed. A token that doesn't
	/// exist is not an error.
	pub async fn delete_token(&self, token: &str) -> Result<(), PkiError> {
		if let Some(record) = self.get_device_by_token(token).await? {
			self.redis
				.del(&[&token_key(token), &device_key(&record.device_id)])
				.await?;
		} else {
			self.redis.del(&[&token_key(token)]).await?;
		}
		Ok(())
	}

	/// Idempotent: deletes both keys for `device_id`, looking up its token
	/// first so the forward key is also removed.
	pub async fn delete_token_by_device(&self, device_id: &str) -> Result<(), PkiError> {
		if let Some(token) = self.get_token_by_device(device_id).await? {
			self.redis
				.del(&[&token_key(&token), &device_key(device_id)])
				.await?;
		} else {
			self.redis.del(&[&device_key(device_id)]).await?;
		}
		Ok(())
	}

	pub async fn stats(&self) -> TokenStoreStats {
		TokenStoreStats {
			backend_reachable: self.redis.ping().await,
		}
	}
}
