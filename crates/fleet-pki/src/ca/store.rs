//! Certificate record persistence. Device certificate rows are small,
//! looked up by a handful of keys (device id, certificate id, fingerprint),
//! and don't need relational querying — Redis, already in the dependency
//! stack for C1/C4, is a natural fit and keeps the CA from introducing a
//! second database.

use crate::ca::model::{CertificateRecord, CertificateStatus};
use crate::error::PkiError;
use crate::store::RedisStore;

fn by_id_key(id: &str) -> String {
	format!("cert:id:{id}")
}

fn by_device_key(device_id: &str) -> String {
	format!("cert:device:{device_id}")
}

fn by_fingerprint_key(fingerprint: &str) -> String {
	format!("cert:fingerprint:{fingerprint}")
}

fn by_order_key(order_id: &str) -> String {
	format!("cert:order:{order_id}")
}

fn by_batch_key(batch_id: &str) -> String {
	format!("cert:batch:{batch_id}")
}

pub struct CertificateStore {
	redis: RedisStore,
}

impl CertificateStore {
	pub fn new(redis: RedisStore) -> Self {
		Self { redis }
	}

	pub async fn put(&self, record: &CertificateRecord) -> Result<(), PkiError> {
		let payload = serde_json::to_string(record)
			.map_err(|e| PkiError::DatabaseUnavailable(e.to_string()))?;
		// No TTL: certificate records are durable until explicitly revoked
		// or replaced; `set_ex` with a long TTL would risk silent data loss.
		self.redis.set_ex(&by_id_key(&record.id), &payload, u32::MAX as u64).await?;
		self.redis
			.set_ex(&by_device_key(&record.device_id), &record.id, u32::MAX as u64)
			.await?;
		self.redis
			.set_ex(&by_fingerprint_key(&record.fingerprint), &record.id, u32::MAX as u64)
			.await?;
		if let Some(order_id) = &record.order_id {
			self.redis.sadd(&by_order_key(order_id), &record.id).await?;
		}
		if let Some(batch_id) = &record.batch_id {
			self.redis.sadd(&by_batch_key(batch_id), &record.id).await?;
		}
		Ok(())
	}

	pub async fn list_by_order(&self, order_id: &str) -> Result<Vec<CertificateRecord>, PkiError> {
		let ids = self.redis.smembers(&by_order_key(order_id)).await?;
		self.resolve_ids(ids).await
	}

	pub async fn list_by_batch(&self, batch_id: &str) -> Result<Vec<CertificateRecord>, PkiError> {
		let ids = self.redis.smembers(&by_batch_key(batch_id)).await?;
		self.resolve_ids(ids).await
	}

	async fn resolve_ids(&self, ids: Vec<String>) -> Result<Vec<CertificateRecord>, PkiError> {
		let mut records = Vec::with_capacity(ids.len());
		for id in ids {
			if let Some(record) = self.get_by_id(&id).await? {
				records.push(record);
			}
		}
		Ok(records)
	}

	pub async fn get_by_id(&self, id: &str) -> Result<Option<CertificateRecord>, PkiError> {
		match self.redis.get(&by_id_key(id)).await? {
			Some(raw) => Ok(Some(
				serde_json::from_str(&raw).map_err(|e| PkiError::DatabaseUnavailable(e.to_string()))?,
			)),
			None => Ok(None),
		}
	}

	pub async fn get_by_device(&self, device_id: &str) -> Result<Option<CertificateRecord>, PkiError> {
		match self.redis.get(&by_device_key(device_id)).await? {
			Some(id) => self.get_by_id(&id).await,
			None => Ok(None),
		}
	}

	pub async fn find_by_device_or_cert_id(
		&self,
		device_id_or_cert_id: &str,
	) -> Result<Option<CertificateRecord>, PkiError> {
		if let Some(record) = self.get_by_id(device_id_or_cert_id).await? {
			return Ok(Some(record));
		}
		self.get_by_device(device_id_or_cert_id).await
	}

	pub async fn update_status(
		&self,
		mut record: CertificateRecord,
		status: CertificateStatus,
		revoked_at: Option<String>,
	) -> Result<CertificateRecord, PkiError> {
		record.status = status;
		record.revoked_at = revoked_at;
		self.put(&record).await?;
		Ok(record)
	}
}
