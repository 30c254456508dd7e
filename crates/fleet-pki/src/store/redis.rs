//! Pooled Redis client shared by the token store and the rate limiter.
//!
//! `ConnectionManager` auto-reconnects and is safe to clone cheaply per
//! request, so there is no connection-checkout step the way a bounded pool
//! would need — a single multiplexed connection handles concurrent callers.

use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};

use crate::error::PkiError;

/// `INCR key; if result == 1, EXPIRE key ttl; TTL key` as one atomic script,
/// so a burst of concurrent incrementers on a fresh key can't race between
/// the increment and the TTL-set.
const INCR_WITH_TTL: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('EXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('TTL', KEYS[1])
return {count, ttl}
"#;

#[derive(Clone)]
pub struct RedisStore {
	conn: ConnectionManager,
}

/// Result of an atomic increment-with-ttl: the post-increment count and the
/// key's remaining time-to-live in seconds.
#[derive(Debug, Clone, Copy)]
pub struct IncrResult {
	pub count: u64,
	pub ttl_secs: u64,
}

impl RedisStore {
	pub async fn connect(url: &str) -> Result<Self, PkiError> {
		let client = redis::Client::open(url)?;
		let conn = ConnectionManager::new(client).await?;
		Ok(Self { conn })
	}

	pub async fn incr_with_ttl(&self, key: &str, ttl_secs: u64) -> Result<IncrResult, PkiError> {
		let mut conn = self.conn.clone();
		let (count, ttl): (i64, i64) = Script::new(INCR_WITH_TTL)
			.key(key)
			.arg(ttl_secs)
			.invoke_async(&mut conn)
			.await?;
		Ok(IncrResult {
			count: count.max(0) as u64,
			ttl_secs: ttl.max(0) as u64,
		})
	}

	pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), PkiError> {
		let mut conn = self.conn.clone();
		let _: () = conn.set_ex(key, value, ttl_secs).await?;
		Ok(())
	}

	pub async fn get(&self, key: &str) -> Result<Option<String>, PkiError> {
		let mut conn = self.conn.clone();
		let value: Option<String> = conn.get(key).await?;
		Ok(value)
	}

	pub async fn del(&self, keys: &[&str]) -> Result<(), PkiError> {
		let mut conn = self.conn.clone();
		let _: () = conn.del(keys).await?;
		Ok(())
	}

	pub async fn sadd(&self, key: &str, member: &str) -> Result<(), PkiError> {
		let mut conn = self.conn.clone();
		let _: () = conn.sadd(key, member).await?;
		Ok(())
	}

	pub async fn smembers(&self, key: &str) -> Result<Vec<String>, PkiError> {
		let mut conn = self.conn.clone();
		let members: Vec<String> = conn.smembers(key).await?;
		Ok(members)
	}

	pub async fn exists(&self, key: &str) -> Result<bool, PkiError> {
		let mut conn = self.conn.clone();
		let exists: bool = conn.exists(key).await?;
		Ok(exists)
	}

	pub async fn ttl(&self, key: &str) -> Result<i64, PkiError> {
		let mut conn = self.conn.clone();
		let ttl: i64 = conn.ttl(key).await?;
		Ok(ttl)
	}

	/// Connection-manager health; reports true when a trivial round trip
	/// succeeds, used by `stats()` and `/health`.
	pub async fn ping(&self) -> bool {
		let mut conn = self.conn.clone();
		redis::cmd("PING")
			.query_async::<String>(&mut conn)
			.await
			.is_ok()
	}
}
