//! Image registry protocol client.
//!
//! Probes `HEAD /v2/<repository>/manifests/<reference>` over HTTPS and walks
//! the bearer-token challenge flow when the registry demands it. The client
//! never fails the deployment path outright: every outcome is folded into an
//! `ImageValidationResult`.

use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::types::RegistryCredential;

use super::format::ResolvedReference;
use super::ImageValidationResult;

/// Manifest types accepted on the probe; covers Docker v2 and OCI images
/// plus their index/list forms.
const MANIFEST_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.oci.image.index.v1+json";

static CHALLENGE_FIELD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([a-zA-Z_]+)="([^"]*)""#).expect("static regex"));

/// A parsed `WWW-Authenticate: Bearer` challenge.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// Parse a bearer challenge header value. Returns `None` for non-bearer
/// schemes or challenges without a realm.
pub fn parse_bearer_challenge(header_value: &str) -> Option<BearerChallenge> {
    let rest = header_value
        .trim()
        .strip_prefix("Bearer ")
        .or_else(|| header_value.trim().strip_prefix("bearer "))?;

    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for capture in CHALLENGE_FIELD.captures_iter(rest) {
        let value = capture[2].to_string();
        match &capture[1] {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }

    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

pub struct RegistryClient {
    http: reqwest::Client,
}

impl RegistryClient {
    pub fn new(timeout: Duration) -> crate::error::Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("orbiter-manager/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| crate::error::Error::ConfigError(format!("http client: {e}")))?;
        Ok(Self { http })
    }

    /// Probe the registry for a manifest. Network failures and timeouts are
    /// folded into warning or failure results per `skip_on_timeout`.
    pub async fn check_image_exists(
        &self,
        resolved: &ResolvedReference,
        credential: Option<&RegistryCredential>,
        skip_on_timeout: bool,
    ) -> ImageValidationResult {
        let url = manifest_url(resolved);

        let response = match self.head(&url, None).await {
            Ok(response) => response,
            Err(e) => return network_result(&e, skip_on_timeout),
        };

        if response.status().as_u16() != 401 {
            return classify_response(response.status().as_u16(), resolved);
        }

        // 401: walk the bearer-token flow and retry once.
        let challenge = response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_bearer_challenge);

        let Some(challenge) = challenge else {
            return ImageValidationResult::denied(
                false,
                format!(
                    "registry {} requires authentication",
                    resolved.registry_host
                ),
            );
        };

        let token = match self.fetch_token(&challenge, resolved, credential).await {
            Ok(token) => token,
            Err(TokenError::Network(e)) => return network_result(&e, skip_on_timeout),
            Err(TokenError::Denied(message)) => {
                return ImageValidationResult::denied(false, message)
            }
        };

        match self.head(&url, Some(&token)).await {
            Ok(response) => classify_response(response.status().as_u16(), resolved),
            Err(e) => network_result(&e, skip_on_timeout),
        }
    }

    async fn head(
        &self,
        url: &str,
        bearer: Option<&str>,
    ) -> Result<reqwest::Response, reqwest::Error> {
        let mut request = self
            .http
            .head(url)
            .header(header::ACCEPT, MANIFEST_ACCEPT);
        if let Some(token) = bearer {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        request.send().await
    }

    /// Request a bearer token from the challenge realm, anonymously or with
    /// Basic credentials.
    async fn fetch_token(
        &self,
        challenge: &BearerChallenge,
        resolved: &ResolvedReference,
        credential: Option<&RegistryCredential>,
    ) -> Result<String, TokenError> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{}:pull", resolved.repository));

        let mut query: Vec<(&str, &str)> = vec![("scope", &scope)];
        if let Some(service) = &challenge.service {
            query.push(("service", service));
        }

        let mut request = self.http.get(&challenge.realm).query(&query);
        if let Some(credential) = credential {
            let basic = BASE64.encode(format!(
                "{}:{}",
                credential.username, credential.password
            ));
            request = request.header(header::AUTHORIZATION, format!("Basic {basic}"));
        }

        let response = request.send().await.map_err(TokenError::Network)?;
        let status = response.status().as_u16();
        if status == 401 || status == 403 {
            return Err(TokenError::Denied(format!(
                "token service at {} denied access ({status})",
                challenge.realm
            )));
        }
        if !(200..300).contains(&status) {
            return Err(TokenError::Denied(format!(
                "token service at {} returned {status}",
                challenge.realm
            )));
        }

        let body: TokenResponse = response.json().await.map_err(TokenError::Network)?;
        body.token
            .or(body.access_token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                TokenError::Denied("token service returned no usable token".to_string())
            })
    }
}

enum TokenError {
    Network(reqwest::Error),
    Denied(String),
}

fn manifest_url(resolved: &ResolvedReference) -> String {
    // Local registries speak plain HTTP, everything else is HTTPS.
    let scheme = if resolved.registry_host.starts_with("localhost")
        || resolved.registry_host.starts_with("127.0.0.1")
    {
        "http"
    } else {
        "https"
    };
    format!(
        "{scheme}://{}/v2/{}/manifests/{}",
        resolved.registry_host, resolved.repository, resolved.reference
    )
}

fn classify_response(status: u16, resolved: &ResolvedReference) -> ImageValidationResult {
    match status {
        200..=299 => ImageValidationResult::ok(),
        404 => ImageValidationResult::missing(format!(
            "image {}/{} not found in registry",
            resolved.repository, resolved.reference
        )),
        401 => ImageValidationResult::denied(
            false,
            format!("authentication failed for {}", resolved.repository),
        ),
        403 => ImageValidationResult::denied(
            true,
            format!("access to {} denied", resolved.repository),
        ),
        429 => {
            ImageValidationResult::unreachable("registry rate limited the manifest probe".to_string())
        }
        status => {
            warn!(status, repository = %resolved.repository, "unexpected registry response");
            ImageValidationResult::unreachable(format!("registry returned {status}"))
        }
    }
}

fn network_result(error: &reqwest::Error, skip_on_timeout: bool) -> ImageValidationResult {
    debug!(error = %error, "registry unreachable");
    if skip_on_timeout {
        ImageValidationResult::deferred("will verify during actual pull".to_string())
    } else {
        ImageValidationResult::unreachable("registry unreachable".to_string())
    }
}
