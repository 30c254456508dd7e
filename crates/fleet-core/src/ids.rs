//! Random identifiers and digests used throughout the control plane: hex
//! serial numbers, SHA-256 fingerprints/hashes, and canonical-JSON hashing
//! for the hash-chained audit log.

use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A 128-bit random serial number, rendered as lowercase hex (no leading `0x`).
pub fn random_serial_hex() -> String {
	let mut bytes = [0u8; 16];
	rand::thread_rng().fill_bytes(&mut bytes);
	hex::encode(bytes)
}

/// SHA-256 over arbitrary bytes, rendered as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(data);
	hex::encode(hasher.finalize())
}

/// SHA-256 over the concatenation of several byte slices, without an
/// intermediate allocation of the joined buffer.
pub fn sha256_hex_parts(parts: &[&[u8]]) -> String {
	let mut hasher = Sha256::new();
	for part in parts {
		hasher.update(part);
	}
	hex::encode(hasher.finalize())
}

/// Re-serializes a `serde_json::Value` with lexicographically sorted object
/// keys at every level, so that two logically-equal values always produce
/// byte-identical JSON. This is what the audit log and transparency log hash
/// over, so entries hash the same way no matter which field order the
/// caller built the struct with.
pub fn canonical_json(value: &Value) -> String {
	fn sort(value: &Value) -> Value {
		match value {
			Value::Object(map) => {
				let mut sorted: Vec<(String, Value)> =
					map.iter().map(|(k, v)| (k.clone(), sort(v))).collect();
				sorted.sort_by(|a, b| a.0.cmp(&b.0));
				Value::Object(sorted.into_iter().collect())
			},
			Value::Array(items) => Value::Array(items.iter().map(sort).collect()),
			other => other.clone(),
		}
	}
	serde_json::to_string(&sort(value)).expect("canonical json values always serialize")
}

/// SHA-256 of the canonical-JSON form of `value`.
pub fn canonical_json_sha256_hex(value: &Value) -> String {
	sha256_hex(canonical_json(value).as_bytes())
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn canonical_json_ignores_field_order() {
		let a = json!({"b": 1, "a": 2, "c": {"y": 1, "x": 2}});
		let b = json!({"a": 2, "c": {"x": 2, "y": 1}, "b": 1});
		assert_eq!(canonical_json(&a), canonical_json(&b));
	}

	#[test]
	fn random_serial_is_32_hex_chars() {
		let serial = random_serial_hex();
		assert_eq!(serial.len(), 32);
		assert!(serial.chars().all(|c| c.is_ascii_hexdigit()));
		assert_ne!(serial, random_serial_hex());
	}

	#[test]
	fn sha256_hex_parts_matches_concatenated_input() {
		let whole = sha256_hex(b"foobar");
		let parts = sha256_hex_parts(&[b"foo", b"bar"]);
		assert_eq!(whole, parts);
	}
}
