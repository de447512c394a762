use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject};
use kube::api::ObjectMeta;
use std::collections::BTreeMap;

/// Name of a cluster-scoped object owned by the run in `namespace`
///
/// Runs against different namespaces must not share ClusterRoles or
/// bindings, so the namespace is appended as `<base>:<namespace>`.
pub fn namespaced_name(base: &str, namespace: &str) -> String {
    format!("{base}:{namespace}")
}

/// Bundle containing `ServiceAccount`, `ClusterRole`, and `ClusterRoleBinding`
#[derive(Debug, Clone)]
pub struct RBACBundle {
    /// The `ServiceAccount` the workload runs as
    pub service_account: ServiceAccount,
    /// The `ClusterRole` defining permissions
    pub cluster_role: ClusterRole,
    /// The `ClusterRoleBinding` connecting `ServiceAccount` to `ClusterRole`
    pub cluster_role_binding: ClusterRoleBinding,
}

/// Fluent builder for the run's RBAC objects
///
/// # Example
///
/// ```
/// use conformance_runner::manifests::rbac::RBACBuilder;
///
/// let rbac = RBACBuilder::service_account("sa", "conformance")
///     .with_role("sa")
///     .with_binding("sa-role")
///     .can_everything()
///     .can_get_urls(&["/metrics"])
///     .build();
///
/// assert_eq!(rbac.cluster_role_binding.role_ref.name, "sa:conformance");
/// ```
pub struct RBACBuilder {
    name: String,
    namespace: String,
    role_base: String,
    binding_base: String,
    labels: BTreeMap<String, String>,
    rules: Vec<PolicyRule>,
}

impl RBACBuilder {
    /// Create a new `RBACBuilder` for a `ServiceAccount` in `namespace`
    #[must_use]
    pub fn service_account(name: &str, namespace: &str) -> Self {
        Self {
            name: name.to_string(),
            namespace: namespace.to_string(),
            role_base: name.to_string(),
            binding_base: format!("{name}-role"),
            labels: BTreeMap::new(),
            rules: Vec::new(),
        }
    }

    /// Base name of the `ClusterRole`, before the namespace suffix
    #[must_use]
    pub fn with_role(mut self, base: &str) -> Self {
        self.role_base = base.to_string();
        self
    }

    /// Base name of the `ClusterRoleBinding`, before the namespace suffix
    #[must_use]
    pub fn with_binding(mut self, base: &str) -> Self {
        self.binding_base = base.to_string();
        self
    }

    /// Label every object in the bundle
    #[must_use]
    pub fn label(mut self, key: &str, value: &str) -> Self {
        self.labels.insert(key.to_string(), value.to_string());
        self
    }

    /// Allow every verb on every resource in every API group
    #[must_use]
    pub fn can_everything(mut self) -> Self {
        self.rules.push(PolicyRule {
            api_groups: Some(vec!["*".to_string()]),
            resources: Some(vec!["*".to_string()]),
            verbs: vec!["*".to_string()],
            ..Default::default()
        });
        self
    }

    /// Allow GET on non-resource URLs such as `/metrics`
    #[must_use]
    pub fn can_get_urls(mut self, urls: &[&str]) -> Self {
        self.rules.push(PolicyRule {
            non_resource_urls: Some(urls.iter().map(|u| (*u).to_string()).collect()),
            verbs: vec!["get".to_string()],
            ..Default::default()
        });
        self
    }

    fn meta(&self, name: String, namespace: Option<String>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace,
            labels: (!self.labels.is_empty()).then(|| self.labels.clone()),
            ..Default::default()
        }
    }

    /// Build the `RBACBundle`; the binding references the suffixed role name
    #[must_use]
    pub fn build(self) -> RBACBundle {
        let role_name = namespaced_name(&self.role_base, &self.namespace);
        let binding_name = namespaced_name(&self.binding_base, &self.namespace);

        RBACBundle {
            service_account: ServiceAccount {
                metadata: self.meta(self.name.clone(), Some(self.namespace.clone())),
                ..Default::default()
            },
            cluster_role: ClusterRole {
                metadata: self.meta(role_name.clone(), None),
                rules: Some(self.rules.clone()),
                ..Default::default()
            },
            cluster_role_binding: ClusterRoleBinding {
                metadata: self.meta(binding_name, None),
                subjects: Some(vec![Subject {
                    kind: "ServiceAccount".to_string(),
                    name: self.name.clone(),
                    namespace: Some(self.namespace.clone()),
                    api_group: None,
                }]),
                role_ref: RoleRef {
                    api_group: "rbac.authorization.k8s.io".to_string(),
                    kind: "ClusterRole".to_string(),
                    name: role_name,
                },
            },
        }
    }
}
