use serde::{Serialize, Serializer};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

/// Sysctls that Kubernetes considers namespaced and safe to set from any pod.
pub const SAFE_SYSCTLS: [&str; 10] = [
    "kernel.shm_rmid_forced",
    "net.ipv4.ip_local_port_range",
    "net.ipv4.ip_local_reserved_ports",
    "net.ipv4.ip_unprivileged_port_start",
    "net.ipv4.ping_group_range",
    "net.ipv4.tcp_fin_timeout",
    "net.ipv4.tcp_keepalive_intvl",
    "net.ipv4.tcp_keepalive_probes",
    "net.ipv4.tcp_keepalive_time",
    "net.ipv4.tcp_syncookies",
];

pub fn is_safe_sysctl(name: &str) -> bool {
    SAFE_SYSCTLS.contains(&name)
}

/// Identifies the workload a snapshot or finding originates from.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkloadRef {
    pub namespace: String,
    pub kind: String,
    pub name: String,
}

/// An independent axis of security-relevant configuration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dimension {
    Privileged,
    AllowPrivilegeEscalation,
    ReadOnlyRootFilesystem,
    HostNetwork,
    HostPid,
    HostIpc,
    HostPorts,
    Capabilities,
    RunAsUser,
    RunAsGroup,
    FsGroup,
    SupplementalGroups,
    SeLinux,
    Seccomp,
    AppArmor,
    ProcMount,
    Volumes,
    Sysctls,
    Workload,
}

/// A Linux capability name, normalized to upper case without the `CAP_` prefix.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct Capability(String);

/// A seccomp or AppArmor profile.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Profile {
    RuntimeDefault,
    Localhost(String),
    Unconfined,
}

/// An SELinux context.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct SeLinuxLabel {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
}

/// The `/proc` mount type of a container.
///
/// Ordered from most to least restrictive.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ProcMountType {
    #[default]
    Default,
    Unmasked,
}

/// A volume source type, named as in the `volumes` list of a PodSecurityPolicy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum VolumeType {
    AwsElasticBlockStore,
    AzureDisk,
    AzureFile,
    CephFs,
    Cinder,
    ConfigMap,
    Csi,
    DownwardApi,
    EmptyDir,
    Ephemeral,
    Fc,
    FlexVolume,
    Flocker,
    GcePersistentDisk,
    GitRepo,
    Glusterfs,
    HostPath,
    Image,
    Iscsi,
    Nfs,
    PersistentVolumeClaim,
    PhotonPersistentDisk,
    PortworxVolume,
    Projected,
    Quobyte,
    Rbd,
    ScaleIo,
    Secret,
    Storageos,
    VsphereVolume,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ContainerKind {
    Container,
    InitContainer,
}

/// The security-relevant settings of a single container, with pod-level defaults applied.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSecuritySnapshot {
    pub name: String,
    pub kind: ContainerKind,
    pub image: Option<String>,

    pub privileged: bool,

    /// Unset means escalation is allowed.
    pub allow_privilege_escalation: Option<bool>,
    pub read_only_root_filesystem: bool,

    pub added_capabilities: BTreeSet<Capability>,
    pub dropped_capabilities: BTreeSet<Capability>,

    pub run_as_user: Option<i64>,
    pub run_as_group: Option<i64>,
    pub run_as_non_root: Option<bool>,

    pub se_linux: Option<SeLinuxLabel>,
    pub seccomp: Option<Profile>,
    pub app_armor: Option<Profile>,
    pub proc_mount: ProcMountType,

    pub host_ports: BTreeSet<u16>,
}

/// The security-relevant settings of a workload's pod template.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PodLevelSnapshot {
    pub workload: WorkloadRef,
    pub service_account: Option<String>,

    pub host_network: bool,
    pub host_pid: bool,
    pub host_ipc: bool,

    pub fs_group: Option<i64>,

    /// Unset when the pod does not list any supplemental groups.
    pub supplemental_groups: Option<BTreeSet<i64>>,

    pub volumes: BTreeSet<VolumeType>,

    /// Host paths mounted by the pod, mapped to whether every mount of the path is read-only.
    pub host_paths: BTreeMap<String, bool>,

    pub sysctls: BTreeSet<String>,

    pub containers: Vec<ContainerSecuritySnapshot>,
}

// === impl WorkloadRef ===

impl WorkloadRef {
    pub fn new(namespace: impl ToString, kind: impl ToString, name: impl ToString) -> Self {
        Self {
            namespace: namespace.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
        }
    }
}

impl fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.namespace, self.kind, self.name)
    }
}

impl Serialize for WorkloadRef {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

// === impl Dimension ===

impl Dimension {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Privileged => "privileged",
            Self::AllowPrivilegeEscalation => "allowPrivilegeEscalation",
            Self::ReadOnlyRootFilesystem => "readOnlyRootFilesystem",
            Self::HostNetwork => "hostNetwork",
            Self::HostPid => "hostPID",
            Self::HostIpc => "hostIPC",
            Self::HostPorts => "hostPorts",
            Self::Capabilities => "capabilities",
            Self::RunAsUser => "runAsUser",
            Self::RunAsGroup => "runAsGroup",
            Self::FsGroup => "fsGroup",
            Self::SupplementalGroups => "supplementalGroups",
            Self::SeLinux => "seLinux",
            Self::Seccomp => "seccomp",
            Self::AppArmor => "appArmor",
            Self::ProcMount => "procMount",
            Self::Volumes => "volumes",
            Self::Sysctls => "sysctls",
            Self::Workload => "workload",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl Serialize for Dimension {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

// === impl Capability ===

impl Capability {
    pub const ALL: &'static str = "ALL";

    pub fn new(name: &str) -> Self {
        let name = name.trim().to_ascii_uppercase();
        match name.strip_prefix("CAP_") {
            Some(stripped) => Self(stripped.to_string()),
            None => Self(name),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_all(&self) -> bool {
        self.0 == Self::ALL
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for Capability {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

// === impl Profile ===

impl Profile {
    /// Reads a profile from a security context's `type`/`localhostProfile` pair.
    pub fn from_fields(type_: &str, localhost_profile: Option<&str>) -> Option<Self> {
        match type_ {
            "RuntimeDefault" => Some(Self::RuntimeDefault),
            "Unconfined" => Some(Self::Unconfined),
            "Localhost" => Some(Self::Localhost(
                localhost_profile.unwrap_or_default().to_string(),
            )),
            _ => None,
        }
    }

    /// Reads a profile from the legacy annotation syntax (e.g. `runtime/default`,
    /// `localhost/my-profile`).
    pub fn from_annotation(value: &str) -> Option<Self> {
        match value.trim() {
            "runtime/default" | "docker/default" => Some(Self::RuntimeDefault),
            "unconfined" => Some(Self::Unconfined),
            v => v
                .strip_prefix("localhost/")
                .map(|name| Self::Localhost(name.to_string())),
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RuntimeDefault => "runtime/default".fmt(f),
            Self::Localhost(name) => write!(f, "localhost/{}", name),
            Self::Unconfined => "unconfined".fmt(f),
        }
    }
}

impl Serialize for Profile {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

// === impl SeLinuxLabel ===

impl fmt::Display for SeLinuxLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let part = |p: &Option<String>| p.clone().unwrap_or_default();
        write!(
            f,
            "{}:{}:{}:{}",
            part(&self.user),
            part(&self.role),
            part(&self.type_),
            part(&self.level)
        )
    }
}

// === impl ProcMountType ===

impl ProcMountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "Default",
            Self::Unmasked => "Unmasked",
        }
    }
}

// === impl VolumeType ===

impl VolumeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwsElasticBlockStore => "awsElasticBlockStore",
            Self::AzureDisk => "azureDisk",
            Self::AzureFile => "azureFile",
            Self::CephFs => "cephFS",
            Self::Cinder => "cinder",
            Self::ConfigMap => "configMap",
            Self::Csi => "csi",
            Self::DownwardApi => "downwardAPI",
            Self::EmptyDir => "emptyDir",
            Self::Ephemeral => "ephemeral",
            Self::Fc => "fc",
            Self::FlexVolume => "flexVolume",
            Self::Flocker => "flocker",
            Self::GcePersistentDisk => "gcePersistentDisk",
            Self::GitRepo => "gitRepo",
            Self::Glusterfs => "glusterfs",
            Self::HostPath => "hostPath",
            Self::Image => "image",
            Self::Iscsi => "iscsi",
            Self::Nfs => "nfs",
            Self::PersistentVolumeClaim => "persistentVolumeClaim",
            Self::PhotonPersistentDisk => "photonPersistentDisk",
            Self::PortworxVolume => "portworxVolume",
            Self::Projected => "projected",
            Self::Quobyte => "quobyte",
            Self::Rbd => "rbd",
            Self::ScaleIo => "scaleIO",
            Self::Secret => "secret",
            Self::Storageos => "storageos",
            Self::VsphereVolume => "vsphereVolume",
        }
    }

    /// Volume types that expose only pod-scoped or cluster-managed storage.
    pub fn is_restricted(&self) -> bool {
        matches!(
            self,
            Self::ConfigMap
                | Self::Csi
                | Self::DownwardApi
                | Self::EmptyDir
                | Self::Ephemeral
                | Self::PersistentVolumeClaim
                | Self::Projected
                | Self::Secret
        )
    }
}

impl fmt::Display for VolumeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_str().fmt(f)
    }
}

impl Serialize for VolumeType {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}

// === impl ContainerSecuritySnapshot ===

impl ContainerSecuritySnapshot {
    /// Kubernetes allows escalation unless it is explicitly disabled.
    pub fn allows_privilege_escalation(&self) -> bool {
        self.allow_privilege_escalation.unwrap_or(true)
    }

    /// Indicates whether the container is guaranteed not to run as uid 0.
    pub fn runs_as_non_root(&self) -> bool {
        match self.run_as_user {
            Some(uid) => uid != 0,
            None => self.run_as_non_root == Some(true),
        }
    }
}
