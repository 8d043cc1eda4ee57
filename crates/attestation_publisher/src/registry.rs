// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::PipelineError;
use crate::models::oci::{
    Digest, MEDIA_TYPE_DOCKER_LIST, MEDIA_TYPE_DOCKER_MANIFEST, MEDIA_TYPE_OCI_INDEX,
    MEDIA_TYPE_OCI_MANIFEST, ManifestDocument,
};
use crate::models::reference::ImageReference;

/// Read-only, content-addressed access to one repository of a registry.
#[async_trait]
pub(crate) trait RegistryClient: Send + Sync {
    /// Fetches the manifest or index stored at `digest`.
    async fn fetch_manifest(&self, digest: &Digest) -> Result<ManifestDocument, PipelineError>;

    /// Fetches the raw bytes of the blob stored at `digest`.
    async fn fetch_blob(&self, digest: &Digest) -> Result<Vec<u8>, PipelineError>;
}

#[async_trait]
impl<T: RegistryClient + ?Sized> RegistryClient for Arc<T> {
    async fn fetch_manifest(&self, digest: &Digest) -> Result<ManifestDocument, PipelineError> {
        (**self).fetch_manifest(digest).await
    }

    async fn fetch_blob(&self, digest: &Digest) -> Result<Vec<u8>, PipelineError> {
        (**self).fetch_blob(digest).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Protocol {
    Http,
    Https,
}

impl Protocol {
    fn scheme(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) enum RegistryAuth {
    Anonymous,
    Basic { username: String, password: String },
}

/// Client for the OCI distribution API.
///
/// Bearer tokens obtained from a `WWW-Authenticate` challenge are cached per
/// instance. Cloning yields a client with an empty cache, so clones handed to
/// different architectures never share state.
pub(crate) struct HttpRegistryClient {
    http: reqwest::Client,
    base_url: String,
    repository: String,
    auth: RegistryAuth,
    token: Mutex<Option<String>>,
}

impl Clone for HttpRegistryClient {
    fn clone(&self) -> Self {
        HttpRegistryClient {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            repository: self.repository.clone(),
            auth: self.auth.clone(),
            token: Mutex::new(None),
        }
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

impl HttpRegistryClient {
    pub(crate) fn new(
        reference: &ImageReference,
        protocol: Protocol,
        auth: RegistryAuth,
    ) -> Result<Self, PipelineError> {
        let http = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(HttpRegistryClient {
            http,
            base_url: format!("{}://{}", protocol.scheme(), reference.api_host()),
            repository: reference.repository.clone(),
            auth,
            token: Mutex::new(None),
        })
    }

    async fn send(&self, url: &str, accept: &str) -> Result<reqwest::Response, PipelineError> {
        let mut request = self.http.get(url).header(ACCEPT, accept);
        let token = self.token.lock().await.clone();
        request = match (token, &self.auth) {
            (Some(token), _) => request.bearer_auth(token),
            (None, RegistryAuth::Basic { username, password }) => {
                request.basic_auth(username, Some(password))
            }
            (None, RegistryAuth::Anonymous) => request,
        };
        request
            .send()
            .await
            .map_err(|e| PipelineError::Transfer(format!("GET {} failed: {}", url, e)))
    }

    /// GET with a single retry after answering a bearer challenge.
    async fn get(&self, url: &str, accept: &str) -> Result<reqwest::Response, PipelineError> {
        let response = self.send(url, accept).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }
        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| {
                PipelineError::Transfer(format!("GET {}: unauthorized without a challenge", url))
            })?
            .to_string();
        let token = self.fetch_token(&challenge).await?;
        *self.token.lock().await = Some(token);
        self.send(url, accept).await
    }

    async fn fetch_token(&self, challenge: &str) -> Result<String, PipelineError> {
        let params = parse_bearer_challenge(challenge).ok_or_else(|| {
            PipelineError::Transfer(format!("unsupported authentication challenge '{}'", challenge))
        })?;
        let realm = params
            .get("realm")
            .ok_or_else(|| PipelineError::Transfer("bearer challenge without realm".to_string()))?;
        let scope = params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{}:pull", self.repository));
        debug!(realm = %realm, scope = %scope, "requesting registry token");

        let mut query = vec![("scope", scope)];
        if let Some(service) = params.get("service") {
            query.push(("service", service.clone()));
        }
        let mut request = self.http.get(realm.as_str()).query(&query);
        if let RegistryAuth::Basic { username, password } = &self.auth {
            request = request.basic_auth(username, Some(password));
        }
        let response = request.send().await?.error_for_status()?;
        let body: TokenResponse = response.json().await?;
        body.token
            .or(body.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| PipelineError::Transfer("token endpoint returned no token".to_string()))
    }

    async fn fetch_verified(
        &self,
        kind: &str,
        digest: &Digest,
        accept: &str,
    ) -> Result<Vec<u8>, PipelineError> {
        let url = format!("{}/v2/{}/{}s/{}", self.base_url, self.repository, kind, digest);
        let response = self.get(&url, accept).await?;
        match response.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND => {
                return Err(PipelineError::NotFound(format!(
                    "{} {} in {}",
                    kind, digest, self.repository
                )));
            }
            status => {
                return Err(PipelineError::Transfer(format!(
                    "GET {}: HTTP status {}",
                    url, status
                )));
            }
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| PipelineError::Transfer(format!("reading {}: {}", url, e)))?
            .to_vec();
        digest.verify(&bytes)?;
        debug!(%digest, size = bytes.len(), "fetched {}", kind);
        Ok(bytes)
    }
}

#[async_trait]
impl RegistryClient for HttpRegistryClient {
    async fn fetch_manifest(&self, digest: &Digest) -> Result<ManifestDocument, PipelineError> {
        let accept = [
            MEDIA_TYPE_OCI_INDEX,
            MEDIA_TYPE_DOCKER_LIST,
            MEDIA_TYPE_OCI_MANIFEST,
            MEDIA_TYPE_DOCKER_MANIFEST,
        ]
        .join(", ");
        let bytes = self.fetch_verified("manifest", digest, &accept).await?;
        serde_json::from_slice(&bytes).map_err(|e| {
            PipelineError::Transfer(format!("manifest {} is not valid JSON: {}", digest, e))
        })
    }

    async fn fetch_blob(&self, digest: &Digest) -> Result<Vec<u8>, PipelineError> {
        self.fetch_verified("blob", digest, "*/*").await
    }
}

/// Parses `Bearer realm="…",service="…",scope="…"`. Commas inside quotes are kept.
fn parse_bearer_challenge(challenge: &str) -> Option<HashMap<String, String>> {
    let (scheme, rest) = challenge.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut params = HashMap::new();
    let mut chars = rest.chars().peekable();
    loop {
        while chars.peek().is_some_and(|c| *c == ',' || c.is_whitespace()) {
            chars.next();
        }
        let key: String = chars.by_ref().take_while(|c| *c != '=').collect();
        if key.is_empty() {
            break;
        }
        let mut value = String::new();
        if chars.peek() == Some(&'"') {
            chars.next();
            for c in chars.by_ref() {
                if c == '"' {
                    break;
                }
                value.push(c);
            }
        } else {
            while let Some(c) = chars.next_if(|c| *c != ',') {
                value.push(c);
            }
        }
        params.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }
    Some(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const REPOSITORY: &str = "kubewarden/policy-server";

    fn client_for(server: &MockServer, auth: RegistryAuth) -> HttpRegistryClient {
        let host = server.uri().trim_start_matches("http://").to_string();
        let reference: ImageReference = format!("{}/{}", host, REPOSITORY).parse().unwrap();
        HttpRegistryClient::new(&reference, Protocol::Http, auth).unwrap()
    }

    fn index_bytes() -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_INDEX,
            "manifests": []
        }))
        .unwrap()
    }

    #[test]
    fn parses_bearer_challenge_with_quoted_commas() {
        let params = parse_bearer_challenge(
            r#"Bearer realm="https://ghcr.io/token",service="ghcr.io",scope="repository:a/b:pull,push""#,
        )
        .unwrap();
        assert_eq!(params["realm"], "https://ghcr.io/token");
        assert_eq!(params["service"], "ghcr.io");
        assert_eq!(params["scope"], "repository:a/b:pull,push");
        assert!(parse_bearer_challenge(r#"Basic realm="registry""#).is_none());
    }

    #[tokio::test]
    async fn fetches_and_verifies_manifest() {
        let server = MockServer::start().await;
        let body = index_bytes();
        let digest = Digest::sha256_of(&body);
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/manifests/{}", REPOSITORY, digest)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, RegistryAuth::Anonymous);
        let manifest = client.fetch_manifest(&digest).await.unwrap();
        assert_eq!(manifest.schema_version, 2);
        assert!(manifest.manifests.is_empty());
    }

    #[tokio::test]
    async fn rejects_manifest_not_matching_digest() {
        let server = MockServer::start().await;
        let digest = Digest::sha256_of(b"something else");
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/manifests/{}", REPOSITORY, digest)))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(index_bytes()))
            .mount(&server)
            .await;

        let client = client_for(&server, RegistryAuth::Anonymous);
        let err = client.fetch_manifest(&digest).await.unwrap_err();
        assert!(matches!(err, PipelineError::Transfer(_)), "{err}");
    }

    #[tokio::test]
    async fn missing_blob_is_not_found_and_server_error_is_transfer() {
        let server = MockServer::start().await;
        let missing = Digest::sha256_of(b"missing");
        let broken = Digest::sha256_of(b"broken");
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/blobs/{}", REPOSITORY, missing)))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("/v2/{}/blobs/{}", REPOSITORY, broken)))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;

        let client = client_for(&server, RegistryAuth::Anonymous);
        assert!(matches!(
            client.fetch_blob(&missing).await,
            Err(PipelineError::NotFound(_))
        ));
        assert!(matches!(
            client.fetch_blob(&broken).await,
            Err(PipelineError::Transfer(_))
        ));
    }

    #[tokio::test]
    async fn answers_bearer_challenge_once() {
        let server = MockServer::start().await;
        let blob = b"{\"_type\":\"https://in-toto.io/Statement/v0.1\"}".to_vec();
        let digest = Digest::sha256_of(&blob);
        let blob_path = format!("/v2/{}/blobs/{}", REPOSITORY, digest);

        Mock::given(method("GET"))
            .and(path(blob_path.clone()))
            .and(header("authorization", "Bearer s3cr3t"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(blob.clone()))
            .with_priority(1)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path(blob_path))
            .respond_with(ResponseTemplate::new(401).insert_header(
                "www-authenticate",
                format!(
                    r#"Bearer realm="{}/token",service="test-registry""#,
                    server.uri()
                )
                .as_str(),
            ))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/token"))
            .and(query_param("service", "test-registry"))
            .and(query_param("scope", format!("repository:{}:pull", REPOSITORY)))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "s3cr3t"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server, RegistryAuth::Anonymous);
        assert_eq!(client.fetch_blob(&digest).await.unwrap(), blob);
        // token is cached for the second request
        assert_eq!(client.fetch_blob(&digest).await.unwrap(), blob);
    }

    #[tokio::test]
    async fn clones_do_not_share_tokens() {
        let server = MockServer::start().await;
        let client = client_for(&server, RegistryAuth::Anonymous);
        *client.token.lock().await = Some("cached".to_string());
        let clone = client.clone();
        assert!(clone.token.lock().await.is_none());
    }
}
