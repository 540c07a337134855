//! Target cluster resolution
//!
//! A deployment either targets the cluster the controller runs in or the
//! cluster described by a kubeconfig stored in a Secret next to it. Every
//! distinct kubeconfig content gets its own accessor.

use crate::error::ControllerError;
use cluster_accessor::{AccessorError, ClusterAccessor, ClusterAccessorManager};
use crds::KluctlDeployment;
use kube::config::{KubeConfigOptions, Kubeconfig};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

/// Accessor key of the cluster the controller runs in
pub const IN_CLUSTER: &str = "in-cluster";

/// Cluster a deployment targets, and as whom
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub accessor: Arc<ClusterAccessor>,
    /// User to impersonate, from `spec.serviceAccountName`
    pub impersonate: Option<String>,
}

/// Service account user the pipeline impersonates, if any
pub fn impersonation_user(namespace: &str, service_account: Option<&str>) -> Option<String> {
    service_account
        .filter(|sa| !sa.is_empty())
        .map(|sa| format!("system:serviceaccount:{}:{}", namespace, sa))
}

/// Part of the accessor key shared by every version of one secret key
pub fn kubeconfig_key_prefix(namespace: &str, secret: &str, key: &str) -> String {
    format!("secret:{}/{}/{}@", namespace, secret, key)
}

/// Accessor key for a kubeconfig read from a secret.
///
/// Includes a content digest so an edited secret yields a new accessor.
pub fn kubeconfig_key(namespace: &str, secret: &str, key: &str, content: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(content));
    format!("{}{}", kubeconfig_key_prefix(namespace, secret, key), &digest[..16])
}

/// Drops accessors of earlier contents of the same secret key
fn evict_stale(accessors: &ClusterAccessorManager, prefix: &str, current: &str) {
    for stale in accessors.keys_with_prefix(prefix) {
        if stale != current {
            info!("Kubeconfig behind {} changed, dropping accessor {}", prefix, stale);
            accessors.remove(&stale);
        }
    }
}

/// Client configuration from kubeconfig YAML, using its current context
pub async fn config_from_kubeconfig(yaml: &str) -> Result<kube::Config, AccessorError> {
    let kubeconfig = Kubeconfig::from_yaml(yaml).map_err(|e| AccessorError::InvalidConfig(e.to_string()))?;
    kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| AccessorError::InvalidConfig(e.to_string()))
}

/// Finds (or registers) the accessor of the deployment's target cluster
pub async fn resolve_target(
    accessors: &ClusterAccessorManager,
    obj: &KluctlDeployment,
) -> Result<ResolvedTarget, ControllerError> {
    let namespace = obj.metadata.namespace.clone().unwrap_or_default();
    let impersonate = impersonation_user(&namespace, obj.spec.service_account_name.as_deref());

    let Some(kube_config) = &obj.spec.kube_config else {
        return Ok(ResolvedTarget {
            accessor: accessors.require(IN_CLUSTER)?,
            impersonate,
        });
    };

    let secret_ref = &kube_config.secret_ref;
    let key = secret_ref.key_or_default();
    let secrets = accessors.require(IN_CLUSTER)?.core_v1_client(None, &[])?.secrets(&namespace);
    let secret = secrets.get(&secret_ref.name).await?;
    let content = secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|b| b.0.clone())
        .ok_or_else(|| {
            AccessorError::InvalidConfig(format!("secret {}/{} has no key {}", namespace, secret_ref.name, key))
        })?;

    let accessor_key = kubeconfig_key(&namespace, &secret_ref.name, key, &content);
    if let Some(accessor) = accessors.get(&accessor_key) {
        return Ok(ResolvedTarget { accessor, impersonate });
    }

    let yaml = String::from_utf8(content)
        .map_err(|e| AccessorError::InvalidConfig(format!("kubeconfig is not UTF-8: {}", e)))?;
    let config = config_from_kubeconfig(&yaml).await?;
    evict_stale(
        accessors,
        &kubeconfig_key_prefix(&namespace, &secret_ref.name, key),
        &accessor_key,
    );
    debug!("Registering cluster accessor {} for {}", accessor_key, obj.key());
    Ok(ResolvedTarget {
        accessor: accessors.add(accessor_key, config),
        impersonate,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: test
clusters:
- name: test
  cluster:
    server: https://10.0.0.1:6443
    insecure-skip-tls-verify: true
contexts:
- name: test
  context:
    cluster: test
    user: test
users:
- name: test
  user:
    token: abc
"#;

    #[test]
    fn test_impersonation_user() {
        assert_eq!(
            impersonation_user("apps", Some("deployer")),
            Some("system:serviceaccount:apps:deployer".to_string())
        );
        assert_eq!(impersonation_user("apps", Some("")), None);
        assert_eq!(impersonation_user("apps", None), None);
    }

    #[test]
    fn test_kubeconfig_key_tracks_content() {
        let a = kubeconfig_key("apps", "kc", "value", b"one");
        assert!(a.starts_with("secret:apps/kc/value@"));
        assert_eq!(a, kubeconfig_key("apps", "kc", "value", b"one"));
        assert_ne!(a, kubeconfig_key("apps", "kc", "value", b"two"));
    }

    #[test]
    fn test_evict_stale_keeps_current_and_other_secrets() {
        let manager = ClusterAccessorManager::default();
        let config = || kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let old = kubeconfig_key("apps", "kc", "value", b"one");
        let new = kubeconfig_key("apps", "kc", "value", b"two");
        let other = kubeconfig_key("apps", "other", "value", b"one");
        manager.add(old.clone(), config());
        manager.add(new.clone(), config());
        manager.add(other.clone(), config());
        manager.add(IN_CLUSTER, config());

        evict_stale(&manager, &kubeconfig_key_prefix("apps", "kc", "value"), &new);
        assert!(manager.get(&old).is_none());
        assert!(manager.get(&new).is_some());
        assert!(manager.get(&other).is_some());
        assert!(manager.get(IN_CLUSTER).is_some());
    }

    #[tokio::test]
    async fn test_config_from_kubeconfig() {
        let config = config_from_kubeconfig(KUBECONFIG).await.unwrap();
        assert_eq!(config.cluster_url.host(), Some("10.0.0.1"));
        assert_eq!(config.cluster_url.port_u16(), Some(6443));

        assert!(matches!(
            config_from_kubeconfig("not: [valid").await,
            Err(AccessorError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_unregistered_in_cluster_accessor() {
        let manager = ClusterAccessorManager::default();
        let obj = crate::test_utils::test_deployment("app", crate::test_utils::test_spec());
        assert!(matches!(
            resolve_target(&manager, &obj).await,
            Err(ControllerError::Accessor(AccessorError::NotFound(_)))
        ));
    }
}
