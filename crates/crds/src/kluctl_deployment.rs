//! KluctlDeployment CRD
//!
//! Declares what to deploy (source project and target), how often to
//! reconcile it, and how the controller may change the cluster (dry-run,
//! manual approval, prune, delete on removal).

use crate::conditions::{find_condition, Condition, READY_CONDITION};
use crate::duration::{parse_duration, parse_optional_duration};
use crate::manual_request::{ManualRequestResult, RequestKind};
use crate::references::{LocalObjectReference, SecretKeyReference};
use chrono::{DateTime, Utc};
use kube::CustomResource;
use results::{
    CommandResultSummary, DriftDetectionResultSummary, ProjectKey, RepoKey, TargetKey,
    ValidateResultSummary,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Finalizer keeping the resource until cleanup has run
pub const KLUCTL_DEPLOYMENT_FINALIZER: &str = "finalizers.gitops.kluctl.io";

/// Deploy mode running a full deployment
pub const DEPLOY_MODE_FULL: &str = "full-deploy";

/// Deploy mode only replacing images of already deployed objects
pub const DEPLOY_MODE_POKE_IMAGES: &str = "poke-images";

/// Spec content the controller can never act on
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidSpec {
    /// A duration field does not parse
    #[error("invalid {field}: {message}")]
    Duration { field: &'static str, message: String },

    /// Unknown deploy mode
    #[error("invalid deployMode {0:?}, must be full-deploy or poke-images")]
    DeployMode(String),

    /// Source is missing or ambiguous
    #[error("invalid source: {0}")]
    Source(String),
}

/// Parsed deploy mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployMode {
    FullDeploy,
    PokeImages,
}

impl DeployMode {
    /// Command name recorded in results
    pub fn command(self) -> &'static str {
        match self {
            DeployMode::FullDeploy => "deploy",
            DeployMode::PokeImages => "poke-images",
        }
    }
}

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gitops.kluctl.io",
    version = "v1beta1",
    kind = "KluctlDeployment",
    namespaced,
    status = "KluctlDeploymentStatus",
    shortname = "kd",
    printcolumn = r#"{"name":"Suspend","type":"boolean","jsonPath":".spec.suspend"}"#,
    printcolumn = r#"{"name":"DryRun","type":"boolean","jsonPath":".spec.dryRun"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Drift","type":"string","jsonPath":".status.lastDriftDetectionResultMessage"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct KluctlDeploymentSpec {
    /// Where the project is loaded from
    pub source: ProjectSource,

    /// Credentials for git, OCI and Helm repositories
    #[serde(default)]
    pub credentials: ProjectCredentials,

    /// Reconcile interval (e.g. `5m`)
    pub interval: String,

    /// Interval used after a failed reconcile, defaults to `interval`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<String>,

    /// Forces a deploy this often even without changes; `never` disables it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_interval: Option<String>,

    /// Validation interval, defaults to `interval`; `never` disables it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate_interval: Option<String>,

    /// Upper bound for one pipeline call, defaults to `interval`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,

    /// Stop reconciling while true
    #[serde(default)]
    pub suspend: bool,

    /// Service account to impersonate while deploying
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    /// Kubeconfig of the target cluster; the controller's own cluster when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_config: Option<KubeConfig>,

    /// Target of the project to deploy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,

    /// Overrides the target name recorded in results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_name_override: Option<String>,

    /// Kubeconfig context to use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// Arguments passed to the project
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "results::schema::preserve_unknown_fields")]
    pub args: Option<serde_json::Value>,

    /// Never change the cluster, only simulate
    #[serde(default)]
    pub dry_run: bool,

    #[serde(default)]
    pub no_wait: bool,

    #[serde(default)]
    pub force_apply: bool,

    #[serde(default)]
    pub replace_on_error: bool,

    #[serde(default)]
    pub force_replace_on_error: bool,

    #[serde(default)]
    pub abort_on_error: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_deployment_dirs: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_deployment_dirs: Vec<String>,

    /// `full-deploy` (default) or `poke-images`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_mode: Option<String>,

    /// Validate after each deploy
    #[serde(default = "default_true")]
    pub validate: bool,

    /// Prune orphaned objects after each deploy
    #[serde(default)]
    pub prune: bool,

    /// Delete all deployed objects when this resource is deleted
    #[serde(default)]
    pub delete: bool,

    /// Only deploy after the rendered objects hash was approved
    #[serde(default)]
    pub manual: bool,

    /// Approved rendered objects hash for manual deployments
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_objects_hash: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Project source, exactly one of `git` and `oci`
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<ProjectSourceGit>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oci: Option<ProjectSourceOci>,
}

/// Git repository source
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSourceGit {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none", rename = "ref")]
    pub git_ref: Option<GitRef>,

    /// Sub-directory of the project inside the repository
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

/// Branch, tag or commit to check out
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GitRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
}

/// OCI artifact source
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSourceOci {
    pub url: String,

    #[serde(default, skip_serializing_if = "Option::is_none", rename = "ref")]
    pub oci_ref: Option<OciRef>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
}

/// Tag or digest of an OCI artifact
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OciRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Credentials handed to the pipeline as-is
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCredentials {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub git: Vec<ProjectCredentialsGit>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub oci: Vec<ProjectCredentialsOci>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub helm: Vec<ProjectCredentialsHelm>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCredentialsGit {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    pub secret_ref: LocalObjectReference,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCredentialsOci {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub registry: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub repository: String,
    pub secret_ref: LocalObjectReference,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCredentialsHelm {
    pub host: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    pub secret_ref: LocalObjectReference,
}

/// Kubeconfig stored in a Secret
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubeConfig {
    pub secret_ref: SecretKeyReference,
}

/// Observed state, written only by the controller
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KluctlDeploymentStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_request_result: Option<ManualRequestResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diff_request_result: Option<ManualRequestResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deploy_request_result: Option<ManualRequestResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prune_request_result: Option<ManualRequestResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validate_request_result: Option<ManualRequestResult>,

    #[serde(default)]
    pub observed_generation: i64,

    /// Source revision used by the last successful render
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub observed_commit: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_key: Option<ProjectKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_key: Option<TargetKey>,

    /// Hash of the rendered objects of the last render
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_objects_hash: String,

    /// Hash that was approved for the last manual deploy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_manual_objects_hash: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_prepare_error: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_diff_result: Option<CommandResultSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_deploy_result: Option<CommandResultSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validate_result: Option<ValidateResultSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_drift_detection_result: Option<DriftDetectionResultSummary>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_drift_detection_result_message: String,

    /// Start of the last reconcile that ran the pipeline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<DateTime<Utc>>,

    /// Start of the last validation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_validate_time: Option<DateTime<Utc>>,
}

impl KluctlDeploymentSpec {
    fn duration(field: &'static str, value: &str) -> Result<Duration, InvalidSpec> {
        parse_duration(value).map_err(|e| InvalidSpec::Duration {
            field,
            message: e.to_string(),
        })
    }

    fn optional_duration(field: &'static str, value: &str) -> Result<Option<Duration>, InvalidSpec> {
        parse_optional_duration(value).map_err(|e| InvalidSpec::Duration {
            field,
            message: e.to_string(),
        })
    }

    /// Reconcile interval
    pub fn interval(&self) -> Result<Duration, InvalidSpec> {
        Self::duration("interval", &self.interval)
    }

    /// Retry interval, defaults to the reconcile interval
    pub fn retry_interval(&self) -> Result<Duration, InvalidSpec> {
        match &self.retry_interval {
            Some(v) => Self::duration("retryInterval", v),
            None => self.interval(),
        }
    }

    /// Pipeline timeout, defaults to the reconcile interval
    pub fn timeout(&self) -> Result<Duration, InvalidSpec> {
        match &self.timeout {
            Some(v) => Self::duration("timeout", v),
            None => self.interval(),
        }
    }

    /// Forced deploy interval, `None` when unset or `never`
    pub fn deploy_interval(&self) -> Result<Option<Duration>, InvalidSpec> {
        match &self.deploy_interval {
            Some(v) => Self::optional_duration("deployInterval", v),
            None => Ok(None),
        }
    }

    /// Validate interval, defaults to the reconcile interval, `None` for `never`
    pub fn validate_interval(&self) -> Result<Option<Duration>, InvalidSpec> {
        match &self.validate_interval {
            Some(v) => Self::optional_duration("validateInterval", v),
            None => self.interval().map(Some),
        }
    }

    /// Parsed deploy mode
    pub fn deploy_mode(&self) -> Result<DeployMode, InvalidSpec> {
        match self.deploy_mode.as_deref() {
            None | Some("") | Some(DEPLOY_MODE_FULL) => Ok(DeployMode::FullDeploy),
            Some(DEPLOY_MODE_POKE_IMAGES) => Ok(DeployMode::PokeImages),
            Some(other) => Err(InvalidSpec::DeployMode(other.to_string())),
        }
    }

    /// Identity of the source project
    pub fn project_key(&self) -> Result<ProjectKey, InvalidSpec> {
        match (&self.source.git, &self.source.oci) {
            (Some(git), None) => {
                let repo_key = RepoKey::parse_git_url(&git.url).map_err(|e| InvalidSpec::Source(e.to_string()))?;
                Ok(ProjectKey::new(repo_key, git.path.as_str()))
            }
            (None, Some(oci)) => {
                let repo_key = RepoKey::parse_oci_url(&oci.url).map_err(|e| InvalidSpec::Source(e.to_string()))?;
                Ok(ProjectKey::new(repo_key, oci.path.as_str()))
            }
            (Some(_), Some(_)) => Err(InvalidSpec::Source("only one of git and oci may be set".to_string())),
            (None, None) => Err(InvalidSpec::Source("one of git or oci must be set".to_string())),
        }
    }

    /// Identity of the deployment target, with the cluster id when known
    pub fn target_key(&self, cluster_id: Option<String>) -> TargetKey {
        TargetKey {
            target_name: self
                .target_name_override
                .clone()
                .or_else(|| self.target.clone())
                .unwrap_or_default(),
            context: self.context.clone().unwrap_or_default(),
            cluster_id,
        }
    }

    /// Runs all validations that do not need the cluster
    pub fn validate_spec(&self) -> Result<(), InvalidSpec> {
        self.interval()?;
        self.retry_interval()?;
        self.timeout()?;
        self.deploy_interval()?;
        self.validate_interval()?;
        self.deploy_mode()?;
        self.project_key()?;
        Ok(())
    }
}

impl KluctlDeploymentStatus {
    /// Last handled request of a channel
    pub fn request_result(&self, kind: RequestKind) -> Option<&ManualRequestResult> {
        match kind {
            RequestKind::Reconcile => self.reconcile_request_result.as_ref(),
            RequestKind::Diff => self.diff_request_result.as_ref(),
            RequestKind::Deploy => self.deploy_request_result.as_ref(),
            RequestKind::Prune => self.prune_request_result.as_ref(),
            RequestKind::Validate => self.validate_request_result.as_ref(),
        }
    }

    /// Records the handled request of a channel
    pub fn set_request_result(&mut self, kind: RequestKind, result: ManualRequestResult) {
        let slot = match kind {
            RequestKind::Reconcile => &mut self.reconcile_request_result,
            RequestKind::Diff => &mut self.diff_request_result,
            RequestKind::Deploy => &mut self.deploy_request_result,
            RequestKind::Prune => &mut self.prune_request_result,
            RequestKind::Validate => &mut self.validate_request_result,
        };
        *slot = Some(result);
    }

    /// The `Ready` condition, if set
    pub fn ready_condition(&self) -> Option<&Condition> {
        find_condition(&self.conditions, READY_CONDITION)
    }

    /// Records the latest drift detection summary together with its message
    pub fn set_last_drift_detection_result(&mut self, summary: Option<DriftDetectionResultSummary>, message: String) {
        self.last_drift_detection_result = summary;
        self.last_drift_detection_result_message = message;
    }
}

impl KluctlDeployment {
    /// `namespace/name`
    pub fn key(&self) -> String {
        format!(
            "{}/{}",
            self.metadata.namespace.as_deref().unwrap_or_default(),
            self.metadata.name.as_deref().unwrap_or_default()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(yaml: &str) -> KluctlDeploymentSpec {
        serde_yaml::from_str(yaml).unwrap()
    }

    const MINIMAL: &str = r#"
source:
  git:
    url: https://github.com/kluctl/kluctl-examples.git
    path: simple
interval: 5m
"#;

    #[test]
    fn test_defaults() {
        let s = spec(MINIMAL);
        assert!(s.validate);
        assert!(!s.prune);
        assert!(!s.manual);
        assert_eq!(s.interval().unwrap(), Duration::from_secs(300));
        assert_eq!(s.retry_interval().unwrap(), Duration::from_secs(300));
        assert_eq!(s.timeout().unwrap(), Duration::from_secs(300));
        assert_eq!(s.deploy_interval().unwrap(), None);
        assert_eq!(s.validate_interval().unwrap(), Some(Duration::from_secs(300)));
        assert_eq!(s.deploy_mode().unwrap(), DeployMode::FullDeploy);
        assert!(s.validate_spec().is_ok());
    }

    #[test]
    fn test_intervals_and_never() {
        let mut s = spec(MINIMAL);
        s.retry_interval = Some("30s".into());
        s.deploy_interval = Some("1h".into());
        s.validate_interval = Some("never".into());
        assert_eq!(s.retry_interval().unwrap(), Duration::from_secs(30));
        assert_eq!(s.deploy_interval().unwrap(), Some(Duration::from_secs(3600)));
        assert_eq!(s.validate_interval().unwrap(), None);

        s.timeout = Some("soon".into());
        assert!(matches!(s.timeout(), Err(InvalidSpec::Duration { field: "timeout", .. })));
    }

    #[test]
    fn test_deploy_mode() {
        let mut s = spec(MINIMAL);
        s.deploy_mode = Some("poke-images".into());
        assert_eq!(s.deploy_mode().unwrap(), DeployMode::PokeImages);
        s.deploy_mode = Some("yolo".into());
        assert_eq!(s.deploy_mode(), Err(InvalidSpec::DeployMode("yolo".into())));
        assert!(s.validate_spec().is_err());
    }

    #[test]
    fn test_project_and_target_key() {
        let mut s = spec(MINIMAL);
        let pk = s.project_key().unwrap();
        assert_eq!(pk.repo_key.as_str(), "git:github.com/kluctl/kluctl-examples");
        assert_eq!(pk.sub_dir, "simple");

        s.target = Some("prod".into());
        assert_eq!(s.target_key(None).target_name, "prod");
        s.target_name_override = Some("prod-eu".into());
        s.context = Some("kind-kind".into());
        let tk = s.target_key(Some("uid-1".into()));
        assert_eq!(tk.target_name, "prod-eu");
        assert_eq!(tk.context, "kind-kind");
        assert_eq!(tk.cluster_id.as_deref(), Some("uid-1"));

        s.source.oci = Some(ProjectSourceOci {
            url: "oci://ghcr.io/a/b".into(),
            ..Default::default()
        });
        assert!(matches!(s.project_key(), Err(InvalidSpec::Source(_))));
    }

    #[test]
    fn test_status_request_results() {
        use crate::manual_request::{record_handled, ManualRequest};
        let mut status = KluctlDeploymentStatus::default();
        let r = record_handled(None, ManualRequest::new("t"), Utc::now(), Utc::now(), "rid", None, None);
        status.set_request_result(RequestKind::Prune, r.clone());
        assert_eq!(status.request_result(RequestKind::Prune), Some(&r));
        assert!(status.request_result(RequestKind::Deploy).is_none());
    }
}
