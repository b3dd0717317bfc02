use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lists the seccomp profiles a policy admits.
pub const SECCOMP_ALLOWED_PROFILES_ANNOTATION: &str =
    "seccomp.security.alpha.kubernetes.io/allowedProfileNames";

/// Lists the AppArmor profiles a policy admits.
pub const APPARMOR_ALLOWED_PROFILES_ANNOTATION: &str =
    "apparmor.security.beta.kubernetes.io/allowedProfileNames";

/// Describes the security constraints a pod must satisfy to be admitted.
///
/// `PodSecurityPolicy` was removed from the Kubernetes API in v1.25, so it is no longer provided by
/// `k8s-openapi`; the resource is modeled here with the `policy/v1beta1` field names.
#[derive(Clone, Debug, PartialEq, Eq, CustomResource, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "policy",
    version = "v1beta1",
    kind = "PodSecurityPolicy",
    derive = "PartialEq"
)]
#[serde(rename_all = "camelCase")]
pub struct PodSecurityPolicySpec {
    pub privileged: bool,
    pub allow_privilege_escalation: bool,
    pub read_only_root_filesystem: bool,
    pub host_network: bool,
    #[serde(rename = "hostPID")]
    pub host_pid: bool,
    #[serde(rename = "hostIPC")]
    pub host_ipc: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub host_ports: Vec<HostPortRange>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_capabilities: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required_drop_capabilities: Vec<String>,

    pub run_as_user: IdStrategyOptions,
    pub run_as_group: IdStrategyOptions,
    pub fs_group: IdStrategyOptions,
    pub supplemental_groups: IdStrategyOptions,

    #[serde(rename = "seLinux")]
    pub se_linux: SeLinuxStrategyOptions,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_host_paths: Vec<AllowedHostPath>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_proc_mount_types: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_unsafe_sysctls: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forbidden_sysctls: Vec<String>,
}

/// Constrains the user or group ids a pod may use.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct IdStrategyOptions {
    pub rule: IdRule,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ranges: Vec<IdRange>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum IdRule {
    MustRunAs,
    MustRunAsNonRoot,
    RunAsAny,
}

/// An inclusive range of ids.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct IdRange {
    pub min: i64,
    pub max: i64,
}

/// An inclusive range of host ports.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct HostPortRange {
    pub min: i32,
    pub max: i32,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SeLinuxStrategyOptions {
    pub rule: SeLinuxRule,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub se_linux_options: Option<SeLinuxOptions>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum SeLinuxRule {
    MustRunAs,
    RunAsAny,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub struct SeLinuxOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// Permits hostPath volumes under `path_prefix`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllowedHostPath {
    pub path_prefix: String,

    /// When set, every mount of a matching volume must be read-only.
    #[serde(default)]
    pub read_only: bool,
}

// === impl IdStrategyOptions ===

impl IdStrategyOptions {
    pub fn run_as_any() -> Self {
        Self {
            rule: IdRule::RunAsAny,
            ranges: vec![],
        }
    }

    pub fn must_run_as(ranges: impl IntoIterator<Item = IdRange>) -> Self {
        Self {
            rule: IdRule::MustRunAs,
            ranges: ranges.into_iter().collect(),
        }
    }
}
