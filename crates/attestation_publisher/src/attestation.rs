// SPDX-License-Identifier: Apache-2.0

use anyhow::{Context, Result, bail};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use sha2::{Digest, Sha256};
use sigstore::crypto::{CosignVerificationKey, Signature};
use tracing::debug;
use x509_parser::der_parser::der::parse_der_utf8string;
use x509_parser::{parse_x509_certificate, prelude::GeneralName};

use crate::identity::IdentityPattern;
use crate::models::bundle::SignatureBundle;

/// Fulcio extension holding the OIDC issuer as a DER UTF8String.
const OID_FULCIO_ISSUER_V2: &str = "1.3.6.1.4.1.57264.1.8";
/// Deprecated Fulcio extension holding the OIDC issuer as raw bytes.
const OID_FULCIO_ISSUER_V1: &str = "1.3.6.1.4.1.57264.1.1";

// TODO: chain the leaf certificate to the Fulcio roots and check the Rekor inclusion proof
/// Verifies a Sigstore bundle over `payload`:
/// message digest, signature against the certificate key, then signer identity.
/// Returns the certificate identity that matched.
pub(crate) fn verify_bundle(
    bundle_json_text: &str,
    payload: &[u8],
    identity: &IdentityPattern,
) -> Result<String> {
    let bundle: SignatureBundle =
        serde_json::from_str(bundle_json_text).context("Failed to parse bundle JSON")?;

    let cert_base64 = bundle
        .verification_material
        .leaf_certificate()
        .context("Bundle contains no signing certificate")?;
    let cert_der_bytes = STANDARD
        .decode(cert_base64)
        .context("Failed to decode certificate rawBytes")?;

    if let Some(message_digest) = &bundle.message_signature.message_digest {
        if message_digest.algorithm != "SHA2_256" {
            bail!(
                "Unsupported message digest algorithm '{}'",
                message_digest.algorithm
            );
        }
        let expected = STANDARD
            .decode(&message_digest.digest)
            .context("Failed to decode messageDigest.digest")?;
        if expected.as_slice() != Sha256::digest(payload).as_slice() {
            bail!("Message digest in bundle does not match the signed content");
        }
        debug!("message digest matches payload");
    }

    let signature = STANDARD
        .decode(&bundle.message_signature.signature)
        .context("Failed to decode messageSignature.signature")?;
    verify_signature_with_certificate(&cert_der_bytes, &signature, payload)
        .context("Signature verification failed")?;
    debug!("cryptographic signature verified");

    let matched = inspect_certificate_identity_from_der(&cert_der_bytes, identity)
        .context("Certificate identity verification failed")?;
    debug!(identity = %matched, "certificate identity verified");

    Ok(matched)
}

/// Verifies `signature` over `payload` with the public key of a DER certificate.
fn verify_signature_with_certificate(
    cert_der_bytes: &[u8],
    signature: &[u8],
    payload: &[u8],
) -> Result<()> {
    let (_, cert) = parse_x509_certificate(cert_der_bytes)
        .map_err(|e| anyhow::anyhow!("Failed to parse X.509 certificate from DER: {}", e))?;
    let public_key_pem = pem::encode(&pem::Pem::new(
        "PUBLIC KEY",
        cert.public_key().raw.to_vec(),
    ));
    let key = CosignVerificationKey::try_from_pem(public_key_pem.as_bytes())
        .context("Unsupported certificate public key")?;
    key.verify_signature(Signature::Raw(signature), payload)?;
    Ok(())
}

/// Checks the Fulcio issuer extension and the SAN entries of a DER certificate.
fn inspect_certificate_identity_from_der(
    cert_der_bytes: &[u8],
    expected: &IdentityPattern,
) -> Result<String> {
    let (_, cert) = parse_x509_certificate(cert_der_bytes)
        .map_err(|e| anyhow::anyhow!("Failed to parse X.509 certificate from DER: {}", e))?;

    let mut issuer_v1 = None;
    let mut issuer_v2 = None;
    for extension in cert.extensions() {
        match extension.oid.to_id_string().as_str() {
            OID_FULCIO_ISSUER_V2 => {
                issuer_v2 = parse_der_utf8string(extension.value)
                    .ok()
                    .and_then(|(_, obj)| obj.as_str().ok().map(str::to_string));
            }
            OID_FULCIO_ISSUER_V1 => {
                issuer_v1 = std::str::from_utf8(extension.value).ok().map(str::to_string);
            }
            _ => {}
        }
    }
    let issuer = issuer_v2
        .or(issuer_v1)
        .context("Certificate carries no OIDC issuer extension")?;
    if !expected.matches_issuer(&issuer) {
        bail!(
            "Certificate issuer '{}' does not match expected issuer '{}'",
            issuer,
            expected.issuer()
        );
    }

    let mut seen = Vec::new();
    if let Ok(Some(san)) = cert.subject_alternative_name() {
        for name in &san.value.general_names {
            let value = match name {
                GeneralName::URI(uri) => *uri,
                GeneralName::RFC822Name(email) => *email,
                _ => continue,
            };
            if expected.matches_identity(value) {
                return Ok(value.to_string());
            }
            seen.push(value.to_string());
        }
    }
    bail!(
        "No certificate identity matches '{}' (found: {:?})",
        expected.identity_regexp(),
        seen
    )
}
