//! C7 — User/Device Directory Client: read-only lookups into an external
//! directory, consulted to confirm a user exists and that a device belongs
//! to that user. `spec.md` §1 Non-goals: this system does not manage user
//! accounts itself. The trait boundary mirrors the `IoTClientTrait` seam
//! the corpus draws around its own external-system dependency
//! (`aws-iot-core/src/iot_client.rs`) — `fleet-pki` depends only on this
//! trait; `fleet-pki-app` supplies the concrete HTTP implementation.

use async_trait::async_trait;

use crate::error::PkiError;

/// Implementors must map a transport-level connection failure to
/// `PkiError::DatabaseUnavailable` so callers can short-circuit to 503
/// instead of misreporting it as "not found" — `spec.md` §7.
#[async_trait]
pub trait Directory: Send + Sync {
	async fn user_exists(&self, user_id: &str) -> Result<bool, PkiError>;

	/// `true` iff `device_id` is registered to `user_id` in the directory.
	/// A device the directory has never seen is not associated with
	/// anyone, so this returns `false` rather than an error.
	async fn device_belongs_to_user(&self, device_id: &str, user_id: &str) -> Result<bool, PkiError>;
}

/// An in-memory directory for tests and for running the control plane
/// without a real directory service wired up.
pub struct StaticDirectory {
	users: std::collections::HashSet<String>,
	device_owners: std::collections::HashMap<String, String>,
}

impl StaticDirectory {
	pub fn new() -> Self {
		Self {
			users: std::collections::HashSet::new(),
			device_owners: std::collections::HashMap::new(),
		}
	}

	pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
		self.users.insert(user_id.into());
		self
	}

	pub fn with_device(mut self, device_id: impl Into<String>, user_id: impl Into<String>) -> Self {
		let device_id = device_id.into();
		let user_id = user_id.into();
		self.users.insert(user_id.clone());
		self.device_owners.insert(device_id, user_id);
		self
	}
}

impl Default for StaticDirectory {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl Directory for StaticDirectory {
	async fn user_exists(&self, user_id: &str) -> Result<bool, PkiError> {
		Ok(self.users.contains(user_id))
	}

	async fn device_belongs_to_user(&self, device_id: &str, user_id: &str) -> Result<bool, PkiError> {
		Ok(self.device_owners.get(device_id).map(|owner| owner == user_id).unwrap_or(false))
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn unknown_user_does_not_exist() {
		let dir = StaticDirectory::new().with_user("u1");
		assert!(dir.user_exists("u1").await.unwrap());
		assert!(!dir.user_exists("u2").await.unwrap());
	}

	#[tokio::test]
	async fn device_association_requires_exact_owner_match() {
		let dir = StaticDirectory::new().with_device("d-1", "u1");
		assert!(dir.device_belongs_to_user("d-1", "u1").await.unwrap());
		assert!(!dir.device_belongs_to_user("d-1", "u2").await.unwrap());
		assert!(!dir.device_belongs_to_user("d-unknown", "u1").await.unwrap());
	}
}
