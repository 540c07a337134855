//! Identity keys for results
//!
//! A [`ProjectKey`] names the source project a result was produced from, a
//! [`TargetKey`] names the logical deployment target inside that project.
//! Together they answer "which deployment, from which source, against which
//! target" and are the primary filter predicate of the result store.

use crate::error::ResultStoreError;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Normalized identity of a source repository.
///
/// Serialized as a plain string of the form `git:<host>/<path>` or
/// `oci:<host>/<path>`. Two URLs pointing at the same repository (different
/// scheme, user, `.git` suffix or host casing) produce the same key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct RepoKey(String);

impl RepoKey {
    /// Parses a git URL (`https://`, `ssh://`, `git://`, `file://` or scp-like
    /// `git@host:org/repo.git`) into a repo key.
    pub fn parse_git_url(url: &str) -> Result<Self, ResultStoreError> {
        let (host, path) = split_url(url)?;
        Ok(Self(format!("git:{}/{}", host, path)))
    }

    /// Parses an OCI URL (`oci://registry/org/repo`) into a repo key.
    pub fn parse_oci_url(url: &str) -> Result<Self, ResultStoreError> {
        let rest = url
            .trim()
            .strip_prefix("oci://")
            .ok_or_else(|| ResultStoreError::InvalidUrl(format!("{}: missing oci:// scheme", url)))?;
        let (host, path) = split_host_path(url, rest)?;
        Ok(Self(format!("oci:{}/{}", host, path)))
    }

    /// Returns the key as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn split_url(url: &str) -> Result<(String, String), ResultStoreError> {
    let trimmed = url.trim();
    if let Some((_scheme, rest)) = trimmed.split_once("://") {
        return split_host_path(url, rest);
    }

    // scp-like syntax: [user@]host:path
    let (host_part, path) = trimmed
        .split_once(':')
        .ok_or_else(|| ResultStoreError::InvalidUrl(format!("{}: not a valid git url", url)))?;
    let host = host_part.rsplit('@').next().unwrap_or(host_part);
    normalize(url, host, path)
}

fn split_host_path(url: &str, rest: &str) -> Result<(String, String), ResultStoreError> {
    let (authority, path) = rest.split_once('/').unwrap_or((rest, ""));
    let host = authority.rsplit('@').next().unwrap_or(authority);
    normalize(url, host, path)
}

fn normalize(url: &str, host: &str, path: &str) -> Result<(String, String), ResultStoreError> {
    let path = path.trim_matches('/');
    let path = path.strip_suffix(".git").unwrap_or(path);
    if host.is_empty() || path.is_empty() {
        return Err(ResultStoreError::InvalidUrl(format!(
            "{}: url needs both a host and a path",
            url
        )));
    }
    Ok((host.to_lowercase(), path.to_string()))
}

/// Identity of a source project: repository plus sub-directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProjectKey {
    /// Repository the project lives in
    pub repo_key: RepoKey,

    /// Sub-directory inside the repository (empty for the root)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub sub_dir: String,
}

impl ProjectKey {
    pub fn new(repo_key: RepoKey, sub_dir: impl Into<String>) -> Self {
        Self {
            repo_key,
            sub_dir: sub_dir.into().trim_matches('/').to_string(),
        }
    }
}

/// Identity of a logical deployment target within a project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TargetKey {
    /// Target name (empty when deploying without a named target)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub target_name: String,

    /// Kubeconfig context the target deploys to
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub context: String,

    /// Synthetic identity of the physical cluster, when known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}
