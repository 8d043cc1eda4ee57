// SPDX-License-Identifier: Apache-2.0

use std::str::FromStr;

use async_trait::async_trait;
use sigstore::cosign::signature_layers::{CertificateSubject, SignatureLayer};
use sigstore::cosign::verification_constraint::{VerificationConstraint, VerificationConstraintVec};
use sigstore::cosign::{ClientBuilder, CosignCapabilities, verify_constraints};
use sigstore::registry::{Auth, ClientConfig, ClientProtocol, OciReference};
use sigstore::trust::sigstore::SigstoreTrustRoot;
use tracing::{debug, info};

use crate::errors::PipelineError;
use crate::identity::IdentityPattern;
use crate::models::reference::ImageReference;
use crate::registry::{Protocol, RegistryAuth};

/// Checks that an image was signed by the expected identity.
#[async_trait]
pub(crate) trait ImageVerifier: Send + Sync {
    async fn verify_image(
        &self,
        image: &ImageReference,
        identity: &IdentityPattern,
    ) -> Result<(), PipelineError>;
}

/// True if a cosign certificate (issuer, subject) belongs to `identity`.
pub(crate) fn certificate_matches(
    identity: &IdentityPattern,
    issuer: Option<&str>,
    subject: &CertificateSubject,
) -> bool {
    let subject = match subject {
        CertificateSubject::Email(email) => email.as_str(),
        CertificateSubject::Uri(uri) => uri.as_str(),
    };
    issuer.is_some_and(|issuer| identity.matches(issuer, subject))
}

/// Constraint satisfied by signature layers whose Fulcio certificate matches
/// an [`IdentityPattern`].
#[derive(Debug)]
struct IdentityConstraint {
    identity: IdentityPattern,
}

impl VerificationConstraint for IdentityConstraint {
    fn verify(&self, signature_layer: &SignatureLayer) -> sigstore::errors::Result<bool> {
        Ok(signature_layer
            .certificate_signature
            .as_ref()
            .is_some_and(|cert| {
                certificate_matches(&self.identity, cert.issuer.as_deref(), &cert.subject)
            }))
    }
}

/// Keyless cosign verification against the public-good Sigstore instance.
pub(crate) struct CosignImageVerifier {
    trust_root: SigstoreTrustRoot,
    protocol: Protocol,
    auth: RegistryAuth,
}

impl CosignImageVerifier {
    pub(crate) async fn new(protocol: Protocol, auth: RegistryAuth) -> Result<Self, PipelineError> {
        info!("downloading Sigstore trust root");
        let trust_root = SigstoreTrustRoot::new(None).await.map_err(|e| {
            PipelineError::SignatureInvalid(format!("cannot fetch Sigstore trust root: {}", e))
        })?;
        Ok(CosignImageVerifier {
            trust_root,
            protocol,
            auth,
        })
    }

    fn cosign_auth(&self) -> Auth {
        match &self.auth {
            RegistryAuth::Anonymous => Auth::Anonymous,
            RegistryAuth::Basic { username, password } => {
                Auth::Basic(username.clone(), password.clone())
            }
        }
    }
}

#[async_trait]
impl ImageVerifier for CosignImageVerifier {
    async fn verify_image(
        &self,
        image: &ImageReference,
        identity: &IdentityPattern,
    ) -> Result<(), PipelineError> {
        let invalid = |stage: &str, e: &dyn std::fmt::Display| {
            PipelineError::SignatureInvalid(format!("{} for {}: {}", stage, image, e))
        };
        let pinned = image.require_digest()?;

        let oci_config = ClientConfig {
            protocol: match self.protocol {
                Protocol::Http => ClientProtocol::Http,
                Protocol::Https => ClientProtocol::Https,
            },
            ..Default::default()
        };
        // A client per call keeps architecture instances independent; the trust root is shared read-only.
        let mut client = ClientBuilder::default()
            .with_oci_client_config(oci_config)
            .with_trust_repository(&self.trust_root)
            .map_err(|e| invalid("cannot load trust root", &e))?
            .build()
            .map_err(|e| invalid("cannot build cosign client", &e))?;

        let reference = OciReference::from_str(&image.to_string())
            .map_err(|e| invalid("cannot parse reference", &e))?;
        let auth = self.cosign_auth();

        debug!(%image, "triangulating signature image");
        let (signature_image, source_digest) = client
            .triangulate(&reference, &auth)
            .await
            .map_err(|e| invalid("cannot locate signature", &e))?;
        if source_digest != pinned.to_string() {
            return Err(PipelineError::SignatureInvalid(format!(
                "registry resolved {} to {}, expected {}",
                image, source_digest, pinned
            )));
        }

        let layers = client
            .trusted_signature_layers(&auth, &source_digest, &signature_image)
            .await
            .map_err(|e| invalid("no trusted signature", &e))?;
        debug!(count = layers.len(), "trusted signature layers");

        let constraints: VerificationConstraintVec = vec![Box::new(IdentityConstraint {
            identity: identity.clone(),
        })];
        verify_constraints(&layers, constraints.iter()).map_err(|_| {
            PipelineError::SignatureInvalid(format!(
                "{} is not signed by issuer '{}' with an identity matching '{}'",
                image,
                identity.issuer(),
                identity.identity_regexp()
            ))
        })?;

        info!(%image, "image signature verified");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::GITHUB_ACTIONS_ISSUER;

    fn pattern() -> IdentityPattern {
        IdentityPattern::github_workflow(
            "kubewarden",
            "policy-server",
            ".github/workflows/release.yml",
            "refs/tags/v1.20.0",
        )
        .unwrap()
    }

    #[test]
    fn certificate_must_match_issuer_and_subject() {
        let subject = CertificateSubject::Uri(
            "https://github.com/kubewarden/policy-server/.github/workflows/release.yml@refs/tags/v1.20.0"
                .to_string(),
        );
        assert!(certificate_matches(&pattern(), Some(GITHUB_ACTIONS_ISSUER), &subject));
        assert!(!certificate_matches(&pattern(), None, &subject));
        assert!(!certificate_matches(
            &pattern(),
            Some("https://accounts.google.com"),
            &subject
        ));

        let email = CertificateSubject::Email("someone@example.com".to_string());
        assert!(!certificate_matches(&pattern(), Some(GITHUB_ACTIONS_ISSUER), &email));
    }
}
