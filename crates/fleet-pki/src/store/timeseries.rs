//! Time-series persistence for the audit log, transparency log, and
//! rate-limit events, backed by InfluxDB v2. `TimeSeriesStore` is the only
//! thing C2/C3/C4 know how to talk to; they never construct an
//! `influxdb2::Client` directly.

use futures::stream;
use influxdb2::models::DataPoint;
use influxdb2::Client;

use crate::error::PkiError;

#[derive(Clone)]
pub struct TimeSeriesStore {
	client: Client,
	bucket: String,
}

impl TimeSeriesStore {
	pub fn new(url: &str, org: &str, token: &str, bucket: &str) -> Self {
		Self {
			client: Client::new(url, org, token),
			bucket: bucket.to_string(),
		}
	}

	pub async fn write(&self, point: DataPoint) -> Result<(), PkiError> {
		self.client
			.write(&self.bucket, stream::iter(vec![point]))
			.await
			.map_err(|err| PkiError::TimeSeriesUnavailable(err.to_string()))
	}

	pub async fn write_all(&self, points: Vec<DataPoint>) -> Result<(), PkiError> {
		if points.is_empty() {
			return Ok(());
		}
		self.client
			.write(&self.bucket, stream::iter(points))
			.await
			.map_err(|err| PkiError::TimeSeriesUnavailable(err.to_string()))
	}

	/// Runs a Flux query and decodes each record as `T`, used by
	/// `initialize()` on C2/C3 to rebuild in-memory state from what's
	/// already persisted.
	pub async fn query<T>(&self, flux: &str) -> Result<Vec<T>, PkiError>
	where
		T: influxdb2::FromDataPoint,
	{
		self.client
			.query::<T>(Some(flux.to_string()))
			.await
			.map_err(|err| PkiError::TimeSeriesUnavailable(err.to_string()))
	}

	pub async fn ping(&self) -> bool {
		self.client.ready().await.unwrap_or(false)
	}

	/// The bucket every `write`/`write_all` call targets; callers that
	/// build their own Flux `from(bucket: ...)` queries (C2/C3's
	/// `initialize`/`verify_chain`) must read against this same bucket.
	pub fn bucket(&self) -> &str {
		&self.bucket
	}
}
