//! Container image reference parsing and validation.
//!
//! Accepts `[registry/][namespace/]repository[:tag][@algo:hex]` and rejects
//! anything the registry itself would reject, so bad references fail before
//! a workload is ever rendered.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};

/// A parsed image reference. `registry` is `None` for DockerHub-implied
/// references like `nginx` or `library/nginx`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: Option<String>,
    pub repository: String,
    pub tag: Option<String>,
    pub digest: Option<String>,
}

/// A reference resolved against registry defaults, ready for the
/// `/v2/<repository>/manifests/<reference>` protocol.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResolvedReference {
    pub registry_host: String,
    pub repository: String,
    /// Tag or `algo:hex` digest; `latest` when the input carried neither.
    pub reference: String,
}

/// DockerHub hostname actually serving the v2 protocol.
const DOCKERHUB_REGISTRY: &str = "registry-1.docker.io";

static REPOSITORY_COMPONENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]([a-z0-9._-]*[a-z0-9])?$").expect("static regex"));

static TAG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9._-]{0,127}$").expect("static regex"));

static DIGEST: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9]+:[0-9a-f]{32,}$").expect("static regex"));

static REGISTRY_HOST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(localhost|(\d{1,3}\.){3}\d{1,3}|[a-z0-9]([a-z0-9-]*[a-z0-9])?(\.[a-z0-9]([a-z0-9-]*[a-z0-9])?)+)(:\d+)?$",
    )
    .expect("static regex")
});

/// Validate an image reference and break it into its parts.
pub fn validate_image_format(image: &str) -> Result<ImageReference> {
    if image.is_empty() {
        return Err(Error::InvalidInput("image reference is empty".to_string()));
    }
    if image != image.trim() {
        return Err(Error::InvalidInput(format!(
            "image reference {image:?} has leading or trailing whitespace"
        )));
    }

    // Split off the digest first: everything after '@' is algo:hex.
    let (name_and_tag, digest) = match image.split_once('@') {
        Some((head, digest)) => {
            if !DIGEST.is_match(digest) {
                return Err(Error::InvalidInput(format!(
                    "image digest {digest:?} must be algo:hex with at least 32 hex characters"
                )));
            }
            (head, Some(digest.to_string()))
        }
        None => (image, None),
    };

    // A ':' after the last '/' separates the tag.
    let (name, tag) = match name_and_tag.rfind(':') {
        Some(idx) if idx > name_and_tag.rfind('/').unwrap_or(0) => {
            let (name, tag) = name_and_tag.split_at(idx);
            let tag = &tag[1..];
            if tag.is_empty() {
                return Err(Error::InvalidInput(format!(
                    "image reference {image:?} has an empty tag"
                )));
            }
            if !TAG.is_match(tag) {
                return Err(Error::InvalidInput(format!("invalid image tag {tag:?}")));
            }
            (name, Some(tag.to_string()))
        }
        _ => (name_and_tag, None),
    };

    if name.is_empty() {
        return Err(Error::InvalidInput(format!(
            "image reference {image:?} has no repository"
        )));
    }

    let mut components: Vec<&str> = name.split('/').collect();

    // The first component is a registry when it can only be a hostname:
    // it contains a dot or a port, or is "localhost".
    let registry = if components.len() > 1 {
        let first = components[0];
        if first.contains('.') || first.contains(':') || first == "localhost" {
            if !REGISTRY_HOST.is_match(first) {
                return Err(Error::InvalidInput(format!(
                    "invalid registry host {first:?}"
                )));
            }
            components.remove(0);
            Some(first.to_string())
        } else {
            None
        }
    } else {
        None
    };

    for component in &components {
        if !REPOSITORY_COMPONENT.is_match(component) {
            return Err(Error::InvalidInput(format!(
                "invalid repository component {component:?}: components must be lowercase and start/end alphanumeric"
            )));
        }
    }

    Ok(ImageReference {
        registry,
        repository: components.join("/"),
        tag,
        digest,
    })
}

/// Resolve a reference against DockerHub defaults: `docker.io` aliases map
/// to the real v2 host and bare names gain the `library/` namespace.
pub fn resolve(image: &str) -> Result<ResolvedReference> {
    let parsed = validate_image_format(image)?;

    let (registry_host, repository) = match parsed.registry.as_deref() {
        None | Some("docker.io") | Some("index.docker.io") => {
            let repository = if parsed.repository.contains('/') {
                parsed.repository.clone()
            } else {
                format!("library/{}", parsed.repository)
            };
            (DOCKERHUB_REGISTRY.to_string(), repository)
        }
        Some(host) => (host.to_string(), parsed.repository.clone()),
    };

    let reference = parsed
        .digest
        .or(parsed.tag)
        .unwrap_or_else(|| "latest".to_string());

    Ok(ResolvedReference {
        registry_host,
        repository,
        reference,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_references() {
        let digest = format!("x@sha256:{}", "a".repeat(64));
        for image in [
            "nginx",
            "nginx:1.25",
            "library/nginx",
            "gcr.io/p/i:tag",
            digest.as_str(),
            "localhost:5000/app",
            "10.0.0.1:5000/team/app:v2",
            "quay.io/org/app@sha256:0123456789abcdef0123456789abcdef",
        ] {
            assert!(validate_image_format(image).is_ok(), "{image}");
        }
    }

    #[test]
    fn rejects_malformed_references() {
        for image in [
            "",
            " nginx",
            "nginx ",
            "Nginx",
            "nginx:",
            "x@sha256:abc",
            "x@sha256:XYZ0123456789abcdef0123456789abcdef",
            "a$b",
            "registry..io/app",
            "team//app",
            "-app",
        ] {
            assert!(validate_image_format(image).is_err(), "{image:?}");
        }
    }

    #[test]
    fn tags_may_carry_uppercase_but_repositories_may_not() {
        assert!(validate_image_format("nginx:V1.25_RC").is_ok());
        assert!(validate_image_format("NGINX:v1").is_err());
        assert!(validate_image_format(&format!("nginx:{}", "t".repeat(128))).is_ok());
        assert!(validate_image_format(&format!("nginx:{}", "t".repeat(129))).is_err());
    }

    #[test]
    fn parses_the_parts() {
        let parsed = validate_image_format("gcr.io/p/i:tag").unwrap();
        assert_eq!(parsed.registry.as_deref(), Some("gcr.io"));
        assert_eq!(parsed.repository, "p/i");
        assert_eq!(parsed.tag.as_deref(), Some("tag"));
        assert!(parsed.digest.is_none());

        // A single-component name is never a registry.
        let parsed = validate_image_format("team/app").unwrap();
        assert!(parsed.registry.is_none());
        assert_eq!(parsed.repository, "team/app");
    }

    #[test]
    fn resolves_dockerhub_aliases_and_bare_names() {
        let resolved = resolve("nginx").unwrap();
        assert_eq!(resolved.registry_host, DOCKERHUB_REGISTRY);
        assert_eq!(resolved.repository, "library/nginx");
        assert_eq!(resolved.reference, "latest");

        let resolved = resolve("docker.io/team/app:v1").unwrap();
        assert_eq!(resolved.registry_host, DOCKERHUB_REGISTRY);
        assert_eq!(resolved.repository, "team/app");
        assert_eq!(resolved.reference, "v1");

        let resolved = resolve("index.docker.io/nginx:1.25").unwrap();
        assert_eq!(resolved.repository, "library/nginx");
    }

    #[test]
    fn digests_win_over_tags_when_resolving() {
        let hex = "f".repeat(64);
        let resolved = resolve(&format!("quay.io/org/app:v1@sha256:{hex}")).unwrap();
        assert_eq!(resolved.registry_host, "quay.io");
        assert_eq!(resolved.reference, format!("sha256:{hex}"));
    }
}
