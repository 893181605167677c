use anyhow::{Context, Result};
use itertools::Itertools;
use pem::Pem;
use rcgen::{Certificate, CertificateParams, PKCS_ECDSA_P256_SHA256};
use ring::digest;
use xmpp_parsers::hashes::Algo;

use crate::{
  content::{FingerprintProvider, LocalFingerprint},
  source::MediaType,
};

/// A self-signed ECDSA P-256 certificate for the DTLS-SRTP handshake, shared by every content.
#[derive(Clone)]
pub struct DtlsCertificate {
  der: Vec<u8>,
  private_key_der: Vec<u8>,
  digest: Vec<u8>,
  fingerprint: String,
}

impl std::fmt::Debug for DtlsCertificate {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DtlsCertificate")
      .field("fingerprint", &self.fingerprint)
      .finish()
  }
}

impl DtlsCertificate {
  pub fn generate() -> Result<Self> {
    let mut params = CertificateParams::new(vec!["meet-recorder".to_owned()]);
    params.alg = &PKCS_ECDSA_P256_SHA256;
    let certificate =
      Certificate::from_params(params).context("failed to generate DTLS certificate")?;
    let der = certificate
      .serialize_der()
      .context("failed to serialize DTLS certificate")?;
    let digest = digest::digest(&digest::SHA256, &der).as_ref().to_vec();
    Ok(Self {
      private_key_der: certificate.serialize_private_key_der(),
      der,
      fingerprint: colon_separated_hex(&digest),
      digest,
    })
  }

  pub fn der(&self) -> &[u8] {
    &self.der
  }

  pub fn private_key_der(&self) -> &[u8] {
    &self.private_key_der
  }

  /// Certificate followed by its PKCS#8 private key, PEM-encoded, for the DTLS layer.
  pub fn pem(&self) -> String {
    pem::encode_many(&[
      Pem::new("CERTIFICATE", self.der.clone()),
      Pem::new("PRIVATE KEY", self.private_key_der.clone()),
    ])
  }

  /// SHA-256 of the DER certificate as colon-separated upper-case hex.
  pub fn fingerprint(&self) -> &str {
    &self.fingerprint
  }
}

impl FingerprintProvider for DtlsCertificate {
  fn local_fingerprint(&self, _media_type: MediaType) -> LocalFingerprint {
    LocalFingerprint {
      hash: Algo::Sha_256,
      value: self.digest.clone(),
    }
  }
}

fn colon_separated_hex(bytes: &[u8]) -> String {
  bytes.iter().map(|byte| format!("{:02X}", byte)).join(":")
}
