// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// The parts of a Sigstore bundle needed to verify a blob signature offline.
/// Unknown fields (tlogEntries, timestampVerificationData) are ignored.
#[derive(Deserialize, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SignatureBundle {
    #[serde(default)]
    pub media_type: Option<String>,
    pub verification_material: VerificationMaterial,
    pub message_signature: MessageSignature,
}

/// Bundles v0.3 carry a single `certificate`, older ones an `x509CertificateChain`.
#[derive(Deserialize, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct VerificationMaterial {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<CertificateData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x509_certificate_chain: Option<CertificateChain>,
}

impl VerificationMaterial {
    /// Base64 DER of the leaf (signing) certificate.
    pub(crate) fn leaf_certificate(&self) -> Option<&str> {
        match (&self.certificate, &self.x509_certificate_chain) {
            (Some(cert), _) => Some(cert.raw_bytes.as_str()),
            (None, Some(chain)) => chain.certificates.first().map(|c| c.raw_bytes.as_str()),
            (None, None) => None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CertificateChain {
    pub certificates: Vec<CertificateData>,
}

#[derive(Deserialize, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CertificateData {
    pub raw_bytes: String, // Base64 encoded DER certificate
}

#[derive(Deserialize, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MessageSignature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_digest: Option<MessageDigest>,
    pub signature: String, // Base64 encoded ASN.1 signature
}

#[derive(Deserialize, Serialize, Debug)]
#[serde(rename_all = "camelCase")]
pub(crate) struct MessageDigest {
    pub algorithm: String, // e.g. SHA2_256
    pub digest: String,    // Base64 encoded
}
