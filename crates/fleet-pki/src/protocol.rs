//! C9 — Provisioning Protocol Handler: orchestrates the two-stage
//! onboarding → sign-csr flow end-to-end, per `spec.md` §4.7. This is the
//! only module that sequences C4 (called by the collaborator router before
//! reaching here), C6, C7, C5, and C8 together; each of those stays
//! ignorant of the others.

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::auth::AuthVerifier;
use crate::ca::CertificateAuthority;
use crate::config::CnFormat;
use crate::directory::Directory;
use crate::error::{PkiError, PkiResult};
use crate::provisioning::ProvisioningService;

#[derive(Debug, Clone, Deserialize)]
pub struct OnboardingRequest {
	pub device_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OnboardingResponse {
	pub provisioning_token: String,
	pub expires_in: u64,
	pub device_id: String,
}

/// The CSR plus the two optional structured-CN tags. `spec.md`'s HTTP
/// surface table documents only `{csr}`; `order_id`/`batch_id` are an
/// additive field a structured-CN deployment may send so the issued
/// certificate can later be bulk-revoked by shipment (`spec.md` §3).
#[derive(Debug, Clone, Deserialize)]
pub struct SignCsrRequest {
	pub csr: String,
	pub provisioning_token: Option<String>,
	#[serde(default)]
	pub order_id: Option<String>,
	#[serde(default)]
	pub batch_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SignCsrResponse {
	pub success: bool,
	pub device_id: String,
	pub certificate: String,
	pub ca_certificate: String,
	pub expires_at: String,
	pub serial_number: String,
	#[serde(rename = "certificateId")]
	pub certificate_id: String,
	#[serde(rename = "downloadUrl")]
	pub download_url: String,
}

pub struct ProtocolHandler {
	auth: AuthVerifier,
	directory: std::sync::Arc<dyn Directory>,
	provisioning: ProvisioningService,
	ca: std::sync::Arc<CertificateAuthority>,
	cn_format: CnFormat,
	allow_onboarding_with_active_cert: bool,
}

impl ProtocolHandler {
	pub fn new(
		auth: AuthVerifier,
		directory: std::sync::Arc<dyn Directory>,
		provisioning: ProvisioningService,
		ca: std::sync::Arc<CertificateAuthority>,
		cn_format: CnFormat,
		allow_onboarding_with_active_cert: bool,
	) -> Self {
		Self {
			auth,
			directory,
			provisioning,
			ca,
			cn_format,
			allow_onboarding_with_active_cert,
		}
	}

	/// `spec.md` §4.7 stage 1.
	pub async fn onboarding(
		&self,
		bearer_token: Option<&str>,
		request: OnboardingRequest,
	) -> PkiResult<OnboardingResponse> {
		let user = self.auth.verify(bearer_token)?;

		if !self.directory.user_exists(&user.user_id).await? {
			return Err(PkiError::UserNotFound);
		}

		if request.device_id.trim().is_empty() {
			return Err(PkiError::DeviceIdRequired);
		}

		if !self.allow_onboarding_with_active_cert
			&& self.ca.find_active_certificate(&request.device_id).await?.is_some()
		{
			return Err(PkiError::DeviceHasActiveCertificate);
		}

		let issued = self
			.provisioning
			.issue_token(&request.device_id, &user.user_id)
			.await?;

		Ok(OnboardingResponse {
			provisioning_token: issued.token,
			expires_in: issued.expires_in_secs,
			device_id: request.device_id,
		})
	}

	/// `spec.md` §4.7 stage 2. `bearer_token` takes precedence over a token
	/// carried in the request body.
	pub async fn sign_csr(
		&self,
		bearer_token: Option<&str>,
		request: SignCsrRequest,
	) -> PkiResult<SignCsrResponse> {
		let token = bearer_token
			.map(str::to_string)
			.or_else(|| request.provisioning_token.clone())
			.filter(|t| !t.trim().is_empty())
			.ok_or(PkiError::TokenMissing)?;

		let validated = self.provisioning.validate_token(&token).await?;

		if !self.directory.user_exists(&validated.user_id).await? {
			return Err(PkiError::UserNotFound);
		}
		if !self
			.directory
			.device_belongs_to_user(&validated.device_id, &validated.user_id)
			.await?
		{
			return Err(PkiError::DeviceNotAssociated);
		}

		let csr_pem = decode_csr(&request.csr)?;

		// Structured CNs are only honored when the deployment is actually
		// configured for them — a structured-mode client's order/batch
		// tags are ignored under the legacy default rather than silently
		// producing a CN the CA would then reject.
		let (order_id, batch_id) = match self.cn_format {
			CnFormat::Structured => (request.order_id.as_deref(), request.batch_id.as_deref()),
			CnFormat::Legacy => (None, None),
		};

		let outcome = self
			.ca
			.sign_csr(
				&csr_pem,
				&validated.device_id,
				&validated.user_id,
				order_id,
				batch_id,
				self.allow_onboarding_with_active_cert,
			)
			.await?;

		// Only on full success is the token revoked, making it single-use.
		self.provisioning.revoke_token(&token).await?;

		Ok(SignCsrResponse {
			success: true,
			device_id: validated.device_id,
			certificate: outcome.certificate_pem,
			ca_certificate: outcome.ca_certificate_pem,
			expires_at: outcome.expires_at,
			serial_number: outcome.serial_number,
			certificate_id: outcome.certificate_id.clone(),
			download_url: format!("/api/v1/certificates/{}/download", outcome.certificate_id),
		})
	}
}

/// Accepts a raw PEM or a base64-wrapped PEM, normalizing `\r\n`/`\r` to
/// `\n` either way, per `spec.md` §4.7.
fn decode_csr(raw: &str) -> PkiResult<Vec<u8>> {
	let normalized = raw.replace("\r\n", "\n").replace('\r', "\n");
	let trimmed = normalized.trim();

	if trimmed.contains("-----BEGIN CERTIFICATE REQUEST-----") {
		return Ok(normalized.into_bytes());
	}

	let decoded = base64::engine::general_purpose::STANDARD
		.decode(trimmed)
		.map_err(|_| PkiError::InvalidCsr {
			reason: "csr is neither a PEM block nor valid base64".into(),
		})?;
	let as_text = String::from_utf8_lossy(&decoded).replace("\r\n", "\n").replace('\r', "\n");
	if !as_text.contains("-----BEGIN CERTIFICATE REQUEST-----") {
		return Err(PkiError::InvalidCsr {
			reason: "decoded csr does not contain a PEM certificate request block".into(),
		});
	}
	Ok(as_text.into_bytes())
}

#[cfg(test)]
mod tests {
	use super::*;

	const SAMPLE_PEM: &str = "-----BEGIN CERTIFICATE REQUEST-----\nMIIBXzCB\n-----END CERTIFICATE REQUEST-----\n";

	#[test]
	fn decode_csr_passes_raw_pem_through_normalized() {
		let raw_with_crlf = SAMPLE_PEM.replace('\n', "\r\n");
		let decoded = decode_csr(&raw_with_crlf).expect("raw pem decodes");
		assert_eq!(String::from_utf8(decoded).unwrap(), SAMPLE_PEM);
	}

	#[test]
	fn decode_csr_accepts_base64_wrapped_pem() {
		let encoded = base64::engine::general_purpose::STANDARD.encode(SAMPLE_PEM);
		let decoded = decode_csr(&encoded).expect("base64 pem decodes");
		assert_eq!(String::from_utf8(decoded).unwrap(), SAMPLE_PEM);
	}

	#[test]
	fn decode_csr_rejects_garbage() {
		assert!(decode_csr("not a csr at all, not even base64 !!!").is_err());
	}
}
