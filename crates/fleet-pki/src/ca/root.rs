//! Root CA lifecycle: load from disk if present, otherwise generate a
//! fresh self-signed root and persist it with restrictive file modes.
//!
//! Grounded directly on the self-signed test CA the teacher builds for its
//! own integration tests (RSA-2048, critical `basicConstraints`, SHA-256
//! self-signature) — the only difference here is that this root is durable
//! across restarts instead of being regenerated per test process.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
	AuthorityKeyIdentifier, BasicConstraints, KeyUsage, SubjectKeyIdentifier,
};
use openssl::x509::{X509NameBuilder, X509};

use crate::error::PkiError;

pub struct RootCa {
	pub cert: X509,
	pub key: PKey<Private>,
	pub serial_hex: String,
}

impl RootCa {
	/// Loads the root CA from `storage_dir` if both files exist, otherwise
	/// generates and persists a new one. `validity_years` only applies to
	/// the generate path.
	pub fn initialize(storage_dir: &Path, validity_years: i64) -> Result<Self, PkiError> {
		let cert_path = storage_dir.join("root-ca.crt");
		let key_path = storage_dir.join("root-ca.key");

		if cert_path.exists() && key_path.exists() {
			return Self::load(&cert_path, &key_path);
		}

		let generated = Self::generate(validity_years)?;
		generated.persist(storage_dir, &cert_path, &key_path)?;
		Ok(generated)
	}

	fn load(cert_path: &Path, key_path: &Path) -> Result<Self, PkiError> {
		let cert_pem = fs::read(cert_path)
			.map_err(|e| PkiError::Internal(anyhow::anyhow!("reading root cert: {e}")))?;
		let key_pem = fs::read(key_path)
			.map_err(|e| PkiError::Internal(anyhow::anyhow!("reading root key: {e}")))?;
		let cert = X509::from_pem(&cert_pem)?;
		let key = PKey::private_key_from_pem(&key_pem)?;
		let serial_hex = serial_hex(&cert)?;
		Ok(Self {
			cert,
			key,
			serial_hex,
		})
	}

	fn generate(validity_years: i64) -> Result<Self, PkiError> {
		let rsa = Rsa::generate(2048)?;
		let key = PKey::from_rsa(rsa)?;

		let mut name_builder = X509NameBuilder::new()?;
		name_builder.append_entry_by_text("C", "US")?;
		name_builder.append_entry_by_text("O", "Fleet PKI")?;
		name_builder.append_entry_by_text("OU", "Root Certificate Authority")?;
		name_builder.append_entry_by_text("CN", "StatsMQTT Lite Root CA")?;
		let name = name_builder.build();

		let mut builder = X509::builder()?;
		builder.set_version(2)?;

		let mut serial = BigNum::new()?;
		serial.rand(128, MsbOption::MAYBE_ZERO, false)?;
		builder.set_serial_number(&serial.to_asn1_integer()?)?;

		builder.set_subject_name(&name)?;
		builder.set_issuer_name(&name)?;
		builder.set_pubkey(&key)?;

		let not_before = Asn1Time::days_from_now(0)?;
		let not_after = Asn1Time::days_from_now((validity_years * 365) as u32)?;
		builder.set_not_before(&not_before)?;
		builder.set_not_after(&not_after)?;

		builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
		builder.append_extension(
			KeyUsage::new()
				.critical()
				.key_cert_sign()
				.crl_sign()
				.build()?,
		)?;
		let ski = SubjectKeyIdentifier::new().build(&builder.x509v3_context(None, None))?;
		builder.append_extension(ski)?;
		let aki = AuthorityKeyIdentifier::new()
			.keyid(true)
			.build(&builder.x509v3_context(None, None))?;
		builder.append_extension(aki)?;

		builder.sign(&key, MessageDigest::sha256())?;
		let cert = builder.build();
		let serial_hex = serial_hex(&cert)?;

		Ok(Self {
			cert,
			key,
			serial_hex,
		})
	}

	fn persist(&self, storage_dir: &Path, cert_path: &Path, key_path: &Path) -> Result<(), PkiError> {
		fs::create_dir_all(storage_dir)
			.map_err(|e| PkiError::Internal(anyhow::anyhow!("creating CA storage dir: {e}")))?;

		let cert_pem = self.cert.to_pem()?;
		let key_pem = self.key.private_key_to_pem_pkcs8()?;

		write_atomic(cert_path, &cert_pem, 0o644)?;
		write_atomic(key_path, &key_pem, 0o600)?;
		Ok(())
	}
}

fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<(), PkiError> {
	let tmp_path: PathBuf = path.with_extension("tmp");
	fs::write(&tmp_path, contents)
		.map_err(|e| PkiError::Internal(anyhow::anyhow!("writing {}: {e}", tmp_path.display())))?;
	fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))
		.map_err(|e| PkiError::Internal(anyhow::anyhow!("chmod {}: {e}", tmp_path.display())))?;
	fs::rename(&tmp_path, path)
		.map_err(|e| PkiError::Internal(anyhow::anyhow!("renaming into {}: {e}", path.display())))?;
	Ok(())
}

fn serial_hex(cert: &X509) -> Result<String, PkiError> {
	let serial = cert.serial_number();
	let bn = serial.to_bn()?;
	Ok(hex::encode(bn.to_vec()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn generated_root_is_self_signed_with_ca_basic_constraint() {
		let root = RootCa::generate(10).expect("root generation");
		assert!(root.cert.verify(&root.key).unwrap_or(false));
		assert!(!root.serial_hex.is_empty());
	}

	#[test]
	fn generated_root_has_expected_subject_cn() {
		let root = RootCa::generate(10).expect("root generation");
		let cn = root
			.cert
			.subject_name()
			.entries_by_nid(openssl::nid::Nid::COMMONNAME)
			.next()
			.and_then(|e| e.data().as_utf8().ok())
			.map(|s| s.to_string());
		assert_eq!(cn.as_deref(), Some("StatsMQTT Lite Root CA"));
	}

	#[test]
	fn initialize_loads_previously_persisted_root() {
		let dir = tempfile::tempdir().expect("tempdir");
		let first = RootCa::initialize(dir.path(), 10).expect("initial generation");
		let second = RootCa::initialize(dir.path(), 10).expect("reload");
		assert_eq!(first.serial_hex, second.serial_hex);
	}
}
