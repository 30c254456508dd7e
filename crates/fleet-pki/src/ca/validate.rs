//! Runtime certificate validation, called at every device authentication —
//! not just at issuance — using `x509_parser` for zero-copy inspection
//! instead of re-parsing through `openssl`.

use chrono::Utc;
use x509_parser::extensions::ParsedExtension;
use x509_parser::prelude::*;

#[derive(Debug, Clone, Default)]
pub struct KeyUsageValidation {
	pub valid: bool,
	pub has_digital_signature: bool,
	pub has_client_auth: bool,
	pub has_prohibited_key_cert_sign: bool,
	pub errors: Vec<String>,
}

/// Rejects a certificate missing `digitalSignature`, missing `clientAuth`,
/// carrying `keyCertSign` (a CA bit on a leaf certificate), or wholly
/// missing either the KU or EKU extension (a legacy certificate minted
/// before this policy existed).
pub fn validate_key_usage_and_eku(cert_pem: &[u8]) -> KeyUsageValidation {
	let (_, pem) = match x509_parser::pem::parse_x509_pem(cert_pem) {
		Ok(parsed) => parsed,
		Err(e) => {
			return KeyUsageValidation {
				errors: vec![format!("certificate PEM did not parse: {e}")],
				..Default::default()
			}
		},
	};
	let cert = match pem.parse_x509() {
		Ok(cert) => cert,
		Err(e) => {
			return KeyUsageValidation {
				errors: vec![format!("certificate DER did not parse: {e}")],
				..Default::default()
			}
		},
	};

	let mut result = KeyUsageValidation::default();
	let mut saw_ku = false;
	let mut saw_eku = false;

	for ext in cert.extensions() {
		match ext.parsed_extension() {
			ParsedExtension::KeyUsage(ku) => {
				saw_ku = true;
				result.has_digital_signature = ku.digital_signature();
				result.has_prohibited_key_cert_sign = ku.key_cert_sign();
			},
			ParsedExtension::ExtendedKeyUsage(eku) => {
				saw_eku = true;
				result.has_client_auth = eku.client_auth;
			},
			_ => {},
		}
	}

	if !saw_ku || !saw_eku {
		result.errors.push("certificate is missing KU or EKU extension (legacy)".into());
	}
	if !result.has_digital_signature {
		result.errors.push("certificate is missing digitalSignature key usage".into());
	}
	if !result.has_client_auth {
		result.errors.push("certificate is missing clientAuth extended key usage".into());
	}
	if result.has_prohibited_key_cert_sign {
		result.errors.push("certificate carries prohibited keyCertSign key usage".into());
	}

	result.valid = saw_ku && saw_eku && result.has_digital_signature && result.has_client_auth
		&& !result.has_prohibited_key_cert_sign;
	result
}

#[derive(Debug, Clone, Default)]
pub struct ChainValidation {
	pub valid: bool,
	pub chain_length: usize,
	pub errors: Vec<String>,
	pub chain_subjects: Vec<String>,
}

/// Validates a leaf + intermediates + root chain: validity window, CA bit
/// on every non-leaf, each signature verifying against its issuer, the
/// root being self-signed, `pathLenConstraint` not exceeded, and the leaf
/// itself not carrying the CA bit.
pub fn validate_chain(leaf_der: &[u8], intermediates_der: &[Vec<u8>], root_der: &[u8]) -> ChainValidation {
	let mut result = ChainValidation::default();
	let now = Utc::now().timestamp();

	let mut chain: Vec<Vec<u8>> = vec![leaf_der.to_vec()];
	chain.extend(intermediates_der.iter().cloned());
	chain.push(root_der.to_vec());
	result.chain_length = chain.len();

	let parsed: Vec<X509Certificate> = match chain
		.iter()
		.map(|der| X509Certificate::from_der(der).map(|(_, cert)| cert))
		.collect::<Result<Vec<_>, _>>()
	{
		Ok(certs) => certs,
		Err(e) => {
			result.errors.push(format!("chain certificate failed to parse: {e}"));
			return result;
		},
	};

	for cert in &parsed {
		result.chain_subjects.push(cert.subject().to_string());
		if cert.validity().not_before.timestamp() > now || cert.validity().not_after.timestamp() < now {
			result
				.errors
				.push(format!("certificate {} is outside its validity window", cert.subject()));
		}
	}

	for (i, cert) in parsed.iter().enumerate() {
		let is_leaf = i == 0;
		let is_ca = cert
			.basic_constraints()
			.ok()
			.flatten()
			.map(|bc| bc.value.ca)
			.unwrap_or(false);
		if is_leaf && is_ca {
			result.errors.push("leaf certificate must not carry the CA bit".into());
		}
		if !is_leaf && !is_ca {
			result
				.errors
				.push(format!("non-leaf certificate {} is missing basicConstraints.cA", cert.subject()));
		}
		if let Some(bc) = cert.basic_constraints().ok().flatten() {
			if let (Some(path_len), false) = (bc.value.path_len_constraint, is_leaf) {
				let remaining_chain = parsed.len() - i - 1;
				if remaining_chain as u32 > path_len {
					result.errors.push(format!(
						"pathLenConstraint exceeded at {}",
						cert.subject()
					));
				}
			}
		}
	}

	for i in 0..parsed.len() {
		let subject_cert = &parsed[i];
		let issuer_cert = if i + 1 < parsed.len() { &parsed[i + 1] } else { subject_cert };
		let issuer_key = issuer_cert.public_key();
		let verifies = subject_cert.verify_signature(Some(issuer_key)).is_ok();
		if !verifies {
			result
				.errors
				.push(format!("signature verification failed for {}", subject_cert.subject()));
		}
	}

	if let Some(root) = parsed.last() {
		if root.subject() != root.issuer() {
			result.errors.push("root certificate is not self-issued".into());
		}
	}

	result.valid = result.errors.is_empty();
	result
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::ca::csr::{self, IssuanceParams};
	use openssl::asn1::Asn1Time;
	use openssl::bn::{BigNum, MsbOption};
	use openssl::hash::MessageDigest;
	use openssl::pkey::PKey;
	use openssl::rsa::Rsa;
	use openssl::x509::{X509NameBuilder, X509};

	fn build_test_root() -> (X509, PKey<openssl::pkey::Private>) {
		let rsa = Rsa::generate(2048).unwrap();
		let key = PKey::from_rsa(rsa).unwrap();
		let mut name = X509NameBuilder::new().unwrap();
		name.append_entry_by_text("CN", "Test Root CA").unwrap();
		let name = name.build();
		let mut builder = X509::builder().unwrap();
		builder.set_subject_name(&name).unwrap();
		builder.set_issuer_name(&name).unwrap();
		builder.set_pubkey(&key).unwrap();
		builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
		builder.set_not_after(&Asn1Time::days_from_now(3650).unwrap()).unwrap();
		let mut serial = BigNum::new().unwrap();
		serial.rand(128, MsbOption::MAYBE_ZERO, false).unwrap();
		builder.set_serial_number(&serial.to_asn1_integer().unwrap()).unwrap();
		builder
			.append_extension(
				openssl::x509::extension::BasicConstraints::new().critical().ca().build().unwrap(),
			)
			.unwrap();
		builder.sign(&key, MessageDigest::sha256()).unwrap();
		(builder.build(), key)
	}

	#[test]
	fn freshly_issued_certificate_passes_key_usage_validation() {
		let (ca_cert, ca_key) = build_test_root();
		let (csr, _device_key) = csr::generate_test_csr("PROOF-d-1", 2048);
		let signed = csr::sign(
			&csr,
			IssuanceParams {
				cn: "PROOF-d-1".to_string(),
				validity_days: 90,
				root_cert: &ca_cert,
				root_key: &ca_key,
			},
		)
		.unwrap();

		let validation = validate_key_usage_and_eku(&signed.certificate_pem);
		assert!(validation.valid, "errors: {:?}", validation.errors);
		assert!(validation.has_digital_signature);
		assert!(validation.has_client_auth);
		assert!(!validation.has_prohibited_key_cert_sign);
	}

	#[test]
	fn root_ca_certificate_fails_leaf_key_usage_validation() {
		let (ca_cert, _ca_key) = build_test_root();
		let pem = ca_cert.to_pem().unwrap();
		let validation = validate_key_usage_and_eku(&pem);
		assert!(!validation.valid);
	}
}
