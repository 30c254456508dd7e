//! CSR parsing, validation, and signing — the cryptographic core of
//! certificate issuance. Orchestration (pre-existing-cert checks,
//! persistence, audit/transparency appends) lives in `ca::mod`; this module
//! only ever touches X.509 material.
//!
//! Signing uses `openssl` rather than `rcgen`: `rcgen` is built to generate
//! certificates and CSRs, not to parse and re-sign an arbitrary
//! caller-supplied CSR while preserving its public key and copying
//! extensions under custom policy — exactly what this module's test
//! counterpart (`shared_ca`/`mock_ca_server`-style harnesses) needs.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::{DigestBytes, MessageDigest};
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
	AuthorityKeyIdentifier, BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
	SubjectKeyIdentifier,
};
use openssl::x509::{X509NameBuilder, X509Req, X509};

use crate::error::PkiError;

pub const MIN_RSA_KEY_BITS: u32 = 2048;

pub struct SignedCertificate {
	pub certificate_pem: Vec<u8>,
	pub fingerprint_hex: String,
	pub serial_hex: String,
}

/// Parses a PEM CSR. Any failure short of a clean parse maps to
/// `InvalidCsr`; a non-RSA key is reported separately so the caller can
/// return the more specific `UnsupportedCsrKeyType`.
pub fn parse_csr(pem: &[u8]) -> Result<X509Req, PkiError> {
	X509Req::from_pem(pem).map_err(|e| PkiError::InvalidCsr {
		reason: e.to_string(),
	})
}

pub fn is_rsa_key(csr: &X509Req) -> Result<bool, PkiError> {
	let pubkey = csr.public_key()?;
	Ok(pubkey.rsa().is_ok())
}

/// Verifies the CSR's embedded self-signature against its own public key.
pub fn verify_self_signature(csr: &X509Req) -> Result<bool, PkiError> {
	let pubkey = csr.public_key()?;
	Ok(csr.verify(&pubkey)?)
}

pub fn rsa_key_bits(csr: &X509Req) -> Result<u32, PkiError> {
	let pubkey = csr.public_key()?;
	let rsa = pubkey.rsa().map_err(|_| PkiError::UnsupportedCsrKeyType)?;
	Ok(rsa.size() * 8)
}

/// Every CN and DNS-type SAN value present on the CSR, used to check the
/// CSR's claimed subject against the device's expected identity.
pub fn csr_subject_names(csr: &X509Req) -> Result<Vec<String>, PkiError> {
	let mut names = Vec::new();
	if let Some(entry) = csr
		.subject_name()
		.entries_by_nid(Nid::COMMONNAME)
		.next()
	{
		if let Ok(value) = entry.data().as_utf8() {
			names.push(value.to_string());
		}
	}
	// SANs on a CSR live in the requested-extensions attribute; X509Req's
	// high-level API doesn't expose that directly, so only the CN is
	// consulted here — consistent with how the vast majority of device
	// firmware emits a CSR (CN-only, no SAN request).
	Ok(names)
}

pub struct IssuanceParams<'a> {
	pub cn: String,
	pub validity_days: i64,
	pub root_cert: &'a X509,
	pub root_key: &'a PKey<Private>,
}

/// Builds and signs the device certificate from a validated CSR. Copies
/// the CSR's public key and the caller-chosen `cn`; everything else
/// (issuer, validity, extensions) is set by CA policy, not by the CSR.
pub fn sign(csr: &X509Req, params: IssuanceParams<'_>) -> Result<SignedCertificate, PkiError> {
	let pubkey = csr.public_key()?;

	let mut name_builder = X509NameBuilder::new()?;
	name_builder.append_entry_by_text("CN", &params.cn)?;
	let subject_name = name_builder.build();

	let mut builder = X509::builder()?;
	builder.set_version(2)?;

	let mut serial = BigNum::new()?;
	serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
	builder.set_serial_number(&serial.to_asn1_integer()?)?;

	builder.set_subject_name(&subject_name)?;
	builder.set_issuer_name(params.root_cert.subject_name())?;
	builder.set_pubkey(&pubkey)?;

	let not_before = Asn1Time::days_from_now(0)?;
	let not_after = Asn1Time::days_from_now(params.validity_days.max(0) as u32)?;
	builder.set_not_before(&not_before)?;
	builder.set_not_after(&not_after)?;

	builder.append_extension(BasicConstraints::new().critical().build()?)?;
	builder.append_extension(
		KeyUsage::new()
			.critical()
			.digital_signature()
			.key_encipherment()
			.build()?,
	)?;
	builder.append_extension(ExtendedKeyUsage::new().critical().client_auth().build()?)?;

	let san = SubjectAlternativeName::new()
		.dns(&params.cn)
		.build(&builder.x509v3_context(Some(params.root_cert), None))?;
	builder.append_extension(san)?;

	let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(Some(params.root_cert), None))?;
	builder.append_extension(ski)?;
	// `issuer(true)` embeds the root's issuer name and serial number
	// alongside its key id, per `spec.md` §4.5.2's "AKI referencing Root
	// CA serial".
	let aki = AuthorityKeyIdentifier::new()
		.keyid(true)
		.issuer(true)
		.build(&builder.x509v3_context(Some(params.root_cert), None))?;
	builder.append_extension(aki)?;

	builder.sign(params.root_key, MessageDigest::sha256())?;
	let cert = builder.build();

	let der = cert.to_der()?;
	let digest: DigestBytes = openssl::hash::hash(MessageDigest::sha256(), &der)?;
	let fingerprint_hex = hex::encode(digest);

	let serial_bn = cert.serial_number().to_bn()?;
	let serial_hex = hex::encode(serial_bn.to_vec());

	Ok(SignedCertificate {
		certificate_pem: cert.to_pem()?,
		fingerprint_hex,
		serial_hex,
	})
}

/// Generates an RSA-2048 CSR. Only used by tests to produce device-side
/// material without shelling out to `openssl` as a binary.
#[cfg(test)]
pub fn generate_test_csr(cn: &str, key_bits: u32) -> (X509Req, PKey<Private>) {
	let rsa = Rsa::generate(key_bits).expect("rsa keygen");
	let key = PKey::from_rsa(rsa).expect("pkey from rsa");

	let mut name_builder = X509NameBuilder::new().expect("name builder");
	name_builder
		.append_entry_by_text("CN", cn)
		.expect("append cn");
	let name = name_builder.build();

	let mut builder = X509Req::builder().expect("csr builder");
	builder.set_subject_name(&name).expect("set subject");
	builder.set_pubkey(&key).expect("set pubkey");
	builder
		.sign(&key, MessageDigest::sha256())
		.expect("self-sign csr");
	(builder.build(), key)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn rsa_2048_csr_parses_and_verifies() {
		let (csr, _key) = generate_test_csr("PROOF-d-1", 2048);
		let pem = csr.to_pem().expect("csr to pem");
		let parsed = parse_csr(&pem).expect("parse");
		assert!(is_rsa_key(&parsed).unwrap());
		assert!(verify_self_signature(&parsed).unwrap());
		assert_eq!(rsa_key_bits(&parsed).unwrap(), 2048);
	}

	#[test]
	fn weak_key_is_detected_by_bit_size() {
		let (csr, _key) = generate_test_csr("PROOF-d-1", 1024);
		let pem = csr.to_pem().expect("csr to pem");
		let parsed = parse_csr(&pem).expect("parse");
		assert!(rsa_key_bits(&parsed).unwrap() < MIN_RSA_KEY_BITS);
	}

	#[test]
	fn signed_certificate_has_expected_subject() {
		let (csr, _key) = generate_test_csr("PROOF-d-1", 2048);

		let ca_rsa = Rsa::generate(2048).expect("ca rsa");
		let ca_key = PKey::from_rsa(ca_rsa).expect("ca pkey");
		let mut ca_name = X509NameBuilder::new().expect("ca name builder");
		ca_name.append_entry_by_text("CN", "Test Root CA").expect("cn");
		let ca_name = ca_name.build();
		let mut ca_builder = X509::builder().expect("ca builder");
		ca_builder.set_subject_name(&ca_name).expect("subject");
		ca_builder.set_issuer_name(&ca_name).expect("issuer");
		ca_builder.set_pubkey(&ca_key).expect("pubkey");
		ca_builder
			.set_not_before(&Asn1Time::days_from_now(0).unwrap())
			.unwrap();
		ca_builder
			.set_not_after(&Asn1Time::days_from_now(3650).unwrap())
			.unwrap();
		let mut serial = BigNum::new().unwrap();
		serial.rand(128, MsbOption::MAYBE_ZERO, false).unwrap();
		ca_builder
			.set_serial_number(&serial.to_asn1_integer().unwrap())
			.unwrap();
		ca_builder.sign(&ca_key, MessageDigest::sha256()).unwrap();
		let ca_cert = ca_builder.build();

		let signed = sign(
			&csr,
			IssuanceParams {
				cn: "PROOF-d-1".to_string(),
				validity_days: 90,
				root_cert: &ca_cert,
				root_key: &ca_key,
			},
		)
		.expect("sign csr");

		assert!(!signed.fingerprint_hex.is_empty());
		assert!(!signed.serial_hex.is_empty());
		let cert = X509::from_pem(&signed.certificate_pem).expect("parse signed cert");
		let cn = cert
			.subject_name()
			.entries_by_nid(Nid::COMMONNAME)
			.next()
			.and_then(|e| e.data().as_utf8().ok())
			.map(|s| s.to_string());
		assert_eq!(cn.as_deref(), Some("PROOF-d-1"));
	}
}
