//! HTTP-backed `Directory`: the concrete implementation of
//! `fleet_pki::directory::Directory` against the external user/device
//! directory service, per `spec.md` §1 ("this system does not manage user
//! accounts itself"). `reqwest::Client` usage is grounded on the download
//! client `aws-iot-core/src/ota_manager.rs::OTAManager` builds for its own
//! out-of-process HTTP calls (timeout builder, status-code check before
//! decoding the body).

use std::time::Duration;

use async_trait::async_trait;
use fleet_pki::error::PkiError;
use serde::Deserialize;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HttpDirectory {
	client: reqwest::Client,
	base_url: String,
}

impl HttpDirectory {
	pub fn new(base_url: impl Into<String>) -> Self {
		let client = reqwest::Client::builder()
			.timeout(REQUEST_TIMEOUT)
			.build()
			.expect("failed to build directory http client");
		Self {
			client,
			base_url: base_url.into(),
		}
	}
}

#[derive(Debug, Deserialize)]
struct UserLookup {
	exists: bool,
}

#[derive(Debug, Deserialize)]
struct DeviceLookup {
	associated: bool,
}

#[async_trait]
impl fleet_pki::directory::Directory for HttpDirectory {
	async fn user_exists(&self, user_id: &str) -> Result<bool, PkiError> {
		let url = format!("{}/users/{user_id}", self.base_url);
		let response = self
			.client
			.get(&url)
			.send()
			.await
			.map_err(|e| PkiError::DatabaseUnavailable(format!("directory request failed: {e}")))?;

		if response.status() == reqwest::StatusCode::NOT_FOUND {
			return Ok(false);
		}
		if !response.status().is_success() {
			return Err(PkiError::DatabaseUnavailable(format!(
				"directory returned {}",
				response.status()
			)));
		}
		let body: UserLookup = response
			.json()
			.await
			.map_err(|e| PkiError::DatabaseUnavailable(format!("malformed directory response: {e}")))?;
		Ok(body.exists)
	}

	async fn device_belongs_to_user(&self, device_id: &str, user_id: &str) -> Result<bool, PkiError> {
		let url = format!("{}/users/{user_id}/devices/{device_id}", self.base_url);
		let response = self
			.client
			.get(&url)
			.send()
			.await
			.map_err(|e| PkiError::DatabaseUnavailable(format!("directory request failed: {e}")))?;

		if response.status() == reqwest::StatusCode::NOT_FOUND {
			return Ok(false);
		}
		if !response.status().is_success() {
			return Err(PkiError::DatabaseUnavailable(format!(
				"directory returned {}",
				response.status()
			)));
		}
		let body: DeviceLookup = response
			.json()
			.await
			.map_err(|e| PkiError::DatabaseUnavailable(format!("malformed directory response: {e}")))?;
		Ok(body.associated)
	}
}
