//! Classifies a workload's security settings into severity-tagged findings.
//!
//! Rules are evaluated per pod snapshot, independently of any aggregate, so findings do not
//! depend on the order in which workloads are processed.

use crate::{
    error::MalformedSpecError,
    snapshot::{
        is_safe_sysctl, Capability, ContainerSecuritySnapshot, Dimension, PodLevelSnapshot,
        ProcMountType, Profile, VolumeType, WorkloadRef,
    },
};
use serde::{Serialize, Serializer};
use std::{collections::BTreeMap, fmt};

/// Capabilities that effectively grant root on the node.
const CRITICAL_CAPABILITIES: &[&str] = &[
    "ALL",
    "BPF",
    "DAC_READ_SEARCH",
    "MAC_ADMIN",
    "MAC_OVERRIDE",
    "SYS_ADMIN",
    "SYS_BOOT",
    "SYS_MODULE",
    "SYS_PTRACE",
    "SYS_RAWIO",
];

/// Capabilities outside the container runtime's default set that widen the attack surface.
const RISKY_CAPABILITIES: &[&str] = &[
    "CHECKPOINT_RESTORE",
    "CHOWN",
    "DAC_OVERRIDE",
    "FOWNER",
    "IPC_LOCK",
    "LINUX_IMMUTABLE",
    "MKNOD",
    "NET_ADMIN",
    "NET_RAW",
    "PERFMON",
    "SETFCAP",
    "SETGID",
    "SETUID",
    "SYSLOG",
    "SYS_CHROOT",
    "SYS_RESOURCE",
    "SYS_TIME",
];

/// Host paths that expose node credentials, devices, or the container runtime.
const SENSITIVE_HOST_PATHS: &[&str] = &[
    "/",
    "/boot",
    "/dev",
    "/etc",
    "/proc",
    "/root",
    "/run",
    "/sys",
    "/var/lib/containerd",
    "/var/lib/docker",
    "/var/lib/kubelet",
    "/var/run",
];

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// A single classified observation about one workload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    pub dimension: Dimension,
    pub severity: Severity,
    pub message: String,

    #[serde(rename = "sourceWorkload")]
    pub source: WorkloadRef,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

/// A rule match before it is attributed to containers.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Match {
    dimension: Dimension,
    severity: Severity,
    message: String,
}

type PodRule = fn(&PodLevelSnapshot, &mut Vec<Match>);
type ContainerRule = fn(&ContainerSecuritySnapshot, &mut Vec<Match>);

const POD_RULES: &[PodRule] = &[
    host_namespaces,
    group_ids,
    volumes,
    host_paths,
    sysctls,
];

const CONTAINER_RULES: &[ContainerRule] = &[
    privileged,
    privilege_escalation,
    read_only_root_filesystem,
    capabilities,
    user_ids,
    se_linux,
    profiles,
    proc_mount,
    host_ports,
];

/// Evaluates every rule against a pod snapshot.
///
/// A container-level match repeated by several containers of the same pod is reported once,
/// naming each container. A fully-restricted pod yields no findings.
pub fn classify(pod: &PodLevelSnapshot) -> Vec<Finding> {
    let mut findings = Vec::new();

    let mut matches = Vec::new();
    for rule in POD_RULES {
        rule(pod, &mut matches);
    }
    findings.extend(matches.drain(..).map(|m| m.into_finding(&pod.workload, None)));

    let mut by_match = BTreeMap::<Match, Vec<&str>>::new();
    for container in pod.containers.iter() {
        for rule in CONTAINER_RULES {
            rule(container, &mut matches);
        }
        matches.sort();
        matches.dedup();
        for m in matches.drain(..) {
            by_match.entry(m).or_default().push(&container.name);
        }
    }
    findings.extend(by_match.into_iter().map(|(mut m, containers)| {
        if let [container] = containers.as_slice() {
            m.into_finding(&pod.workload, Some(container.to_string()))
        } else {
            m.message = format!("{} (containers: {})", m.message, containers.join(", "));
            m.into_finding(&pod.workload, None)
        }
    }));

    findings
}

// === pod rules ===

fn host_namespaces(pod: &PodLevelSnapshot, matches: &mut Vec<Match>) {
    if pod.host_pid {
        matches.push(Match::new(
            Dimension::HostPid,
            Severity::Critical,
            "shares the host's PID namespace",
        ));
    }
    if pod.host_ipc {
        matches.push(Match::new(
            Dimension::HostIpc,
            Severity::Critical,
            "shares the host's IPC namespace",
        ));
    }
    if pod.host_network {
        matches.push(Match::new(
            Dimension::HostNetwork,
            Severity::Warning,
            "shares the host's network namespace",
        ));
    }
}

fn group_ids(pod: &PodLevelSnapshot, matches: &mut Vec<Match>) {
    if pod.fs_group == Some(0) {
        matches.push(Match::new(
            Dimension::FsGroup,
            Severity::Warning,
            "volumes are owned by the root group (fsGroup 0)",
        ));
    }
    if pod
        .supplemental_groups
        .as_ref()
        .is_some_and(|ids| ids.contains(&0))
    {
        matches.push(Match::new(
            Dimension::SupplementalGroups,
            Severity::Warning,
            "adds the root group (0) as a supplemental group",
        ));
    }
}

fn volumes(pod: &PodLevelSnapshot, matches: &mut Vec<Match>) {
    for volume in pod.volumes.iter().filter(|v| !v.is_restricted()) {
        // hostPath volumes are reported per path.
        if *volume != VolumeType::HostPath {
            matches.push(Match::new(
                Dimension::Volumes,
                Severity::Info,
                format!("uses {} volumes", volume),
            ));
        }
    }
}

fn host_paths(pod: &PodLevelSnapshot, matches: &mut Vec<Match>) {
    for (path, read_only) in pod.host_paths.iter() {
        let access = if *read_only { "read-only" } else { "writable" };
        let severity = if is_sensitive_host_path(path) {
            Severity::Critical
        } else {
            Severity::Warning
        };
        matches.push(Match::new(
            Dimension::Volumes,
            severity,
            format!("mounts host path {} ({})", path, access),
        ));
    }
}

fn sysctls(pod: &PodLevelSnapshot, matches: &mut Vec<Match>) {
    for name in pod.sysctls.iter() {
        if is_safe_sysctl(name) {
            matches.push(Match::new(
                Dimension::Sysctls,
                Severity::Info,
                format!("sets safe sysctl {}", name),
            ));
        } else {
            matches.push(Match::new(
                Dimension::Sysctls,
                Severity::Warning,
                format!("sets unsafe sysctl {}", name),
            ));
        }
    }
}

// === container rules ===

fn privileged(c: &ContainerSecuritySnapshot, matches: &mut Vec<Match>) {
    if c.privileged {
        matches.push(Match::new(
            Dimension::Privileged,
            Severity::Critical,
            "runs privileged",
        ));
    }
}

fn privilege_escalation(c: &ContainerSecuritySnapshot, matches: &mut Vec<Match>) {
    match c.allow_privilege_escalation {
        Some(true) => matches.push(Match::new(
            Dimension::AllowPrivilegeEscalation,
            Severity::Warning,
            "allows privilege escalation",
        )),
        None if !c.privileged => matches.push(Match::new(
            Dimension::AllowPrivilegeEscalation,
            Severity::Info,
            "does not disable privilege escalation",
        )),
        _ => {}
    }
}

fn read_only_root_filesystem(c: &ContainerSecuritySnapshot, matches: &mut Vec<Match>) {
    if !c.read_only_root_filesystem {
        matches.push(Match::new(
            Dimension::ReadOnlyRootFilesystem,
            Severity::Info,
            "has a writable root filesystem",
        ));
    }
}

fn capabilities(c: &ContainerSecuritySnapshot, matches: &mut Vec<Match>) {
    for cap in c.added_capabilities.iter() {
        matches.push(Match::new(
            Dimension::Capabilities,
            capability_severity(cap),
            format!("adds capability {}", cap),
        ));
    }
}

fn user_ids(c: &ContainerSecuritySnapshot, matches: &mut Vec<Match>) {
    match c.run_as_user {
        Some(0) => matches.push(Match::new(
            Dimension::RunAsUser,
            Severity::Warning,
            "runs as root (uid 0)",
        )),
        None if !c.runs_as_non_root() => matches.push(Match::new(
            Dimension::RunAsUser,
            Severity::Info,
            "runs as the image's default user, which may be root",
        )),
        _ => {}
    }
    if c.run_as_group == Some(0) {
        matches.push(Match::new(
            Dimension::RunAsGroup,
            Severity::Info,
            "runs with the root group (gid 0)",
        ));
    }
}

fn se_linux(c: &ContainerSecuritySnapshot, matches: &mut Vec<Match>) {
    if let Some(label) = c.se_linux.as_ref() {
        if label.type_.as_deref() == Some("spc_t") {
            matches.push(Match::new(
                Dimension::SeLinux,
                Severity::Critical,
                "runs as an SELinux super-privileged container (spc_t)",
            ));
        } else {
            matches.push(Match::new(
                Dimension::SeLinux,
                Severity::Info,
                format!("sets SELinux label {}", label),
            ));
        }
    }
}

fn profiles(c: &ContainerSecuritySnapshot, matches: &mut Vec<Match>) {
    if c.seccomp == Some(Profile::Unconfined) {
        matches.push(Match::new(
            Dimension::Seccomp,
            Severity::Warning,
            "runs without a seccomp profile (unconfined)",
        ));
    }
    if c.app_armor == Some(Profile::Unconfined) {
        matches.push(Match::new(
            Dimension::AppArmor,
            Severity::Warning,
            "runs without an AppArmor profile (unconfined)",
        ));
    }
}

fn proc_mount(c: &ContainerSecuritySnapshot, matches: &mut Vec<Match>) {
    if c.proc_mount == ProcMountType::Unmasked {
        matches.push(Match::new(
            Dimension::ProcMount,
            Severity::Critical,
            "mounts /proc unmasked",
        ));
    }
}

fn host_ports(c: &ContainerSecuritySnapshot, matches: &mut Vec<Match>) {
    if !c.host_ports.is_empty() {
        let ports = c
            .host_ports
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>();
        matches.push(Match::new(
            Dimension::HostPorts,
            Severity::Warning,
            format!("binds host ports {}", ports.join(", ")),
        ));
    }
}

fn capability_severity(cap: &Capability) -> Severity {
    if CRITICAL_CAPABILITIES.contains(&cap.as_str()) {
        Severity::Critical
    } else if RISKY_CAPABILITIES.contains(&cap.as_str()) {
        Severity::Warning
    } else {
        Severity::Info
    }
}

fn is_sensitive_host_path(path: &str) -> bool {
    let path = match path.trim_end_matches('/') {
        "" => "/",
        p => p,
    };
    SENSITIVE_HOST_PATHS.iter().any(|sensitive| {
        path == *sensitive
            || (*sensitive != "/"
                && path
                    .strip_prefix(sensitive)
                    .is_some_and(|rest| rest.starts_with('/')))
    })
}

// === impl Match ===

impl Match {
    fn new(dimension: Dimension, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            dimension,
            severity,
            message: message.into(),
        }
    }

    fn into_finding(self, source: &WorkloadRef, container: Option<String>) -> Finding {
        Finding {
            dimension: self.dimension,
            severity: self.severity,
            message: self.message,
            source: source.clone(),
            container,
        }
    }
}

// === impl Finding ===

impl Finding {
    /// Records that a workload was skipped because its spec is malformed.
    pub fn skipped(error: &MalformedSpecError) -> Self {
        Self {
            dimension: Dimension::Workload,
            severity: Severity::Info,
            message: format!("skipped malformed workload: {}", error),
            source: error.workload(),
            container: None,
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.severity, self.source)?;
        if let Some(container) = self.container.as_ref() {
            write!(f, " container {}", container)?;
        }
        write!(f, " {}: {}", self.dimension, self.message)
    }
}

// === impl Severity ===

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str().to_uppercase())
    }
}

impl Serialize for Severity {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(self.as_str())
    }
}
