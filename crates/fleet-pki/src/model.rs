//! Types shared across components: the structured Common Name format and
//! the JSON response envelope every HTTP-facing operation returns through.

use serde::Serialize;

/// Builds the Common Name for a certificate. Legacy format is
/// `{PREFIX}-{deviceId}`; structured format additionally carries the order
/// and batch tags so certificates minted for the same shipment can be bulk
/// revoked later.
pub fn format_cn(prefix: &str, device_id: &str, order_batch: Option<(&str, &str)>) -> String {
	match order_batch {
		Some((order, batch)) => format!("{prefix}-{order}-{batch}-{device_id}"),
		None => format!("{prefix}-{device_id}"),
	}
}

/// The set of CNs a CSR for `device_id` is allowed to present, given the
/// optional order/batch tags supplied at onboarding. Always includes the
/// legacy form regardless of the configured default format, since a CSR
/// validator must accept either shape per the structured-CN invariant.
pub fn expected_cns(
	prefix: &str,
	device_id: &str,
	order_id: Option<&str>,
	batch_id: Option<&str>,
) -> Vec<String> {
	let mut cns = vec![format_cn(prefix, device_id, None)];
	if let (Some(order), Some(batch)) = (order_id, batch_id) {
		cns.push(format_cn(prefix, device_id, Some((order, batch))));
	}
	cns
}

/// The envelope every HTTP response in this system carries. Collaborator
/// routers serialize this directly; the core never serializes a bare value.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorEnvelope {
	pub success: bool,
	pub error: String,
	pub code: String,
	pub timestamp: String,
}

impl ErrorEnvelope {
	pub fn from_error(err: &crate::error::PkiError) -> Self {
		Self {
			success: false,
			error: err.to_string(),
			code: err.code().to_string(),
			timestamp: fleet_core::time::now_iso(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn legacy_cn_has_no_order_batch() {
		assert_eq!(format_cn("PROOF", "d-1", None), "PROOF-d-1");
	}

	#[test]
	fn structured_cn_includes_order_and_batch() {
		assert_eq!(
			format_cn("PROOF", "d-2", Some(("ORD7890", "B03"))),
			"PROOF-ORD7890-B03-d-2"
		);
	}

	#[test]
	fn expected_cns_always_includes_legacy_form() {
		let cns = expected_cns("PROOF", "d-2", Some("ORD7890"), Some("B03"));
		assert_eq!(cns, vec!["PROOF-d-2", "PROOF-ORD7890-B03-d-2"]);
	}

	#[test]
	fn expected_cns_without_order_batch_is_legacy_only() {
		let cns = expected_cns("PROOF", "d-1", None, None);
		assert_eq!(cns, vec!["PROOF-d-1"]);
	}
}
