use crate::{
    lattice::{Agreement, AllOf, AnyOf, IdRange, Intersection, Join, ReadOnlyPaths, Union},
    snapshot::{
        Capability, ContainerSecuritySnapshot, PodLevelSnapshot, ProcMountType, Profile,
        SeLinuxLabel, VolumeType, WorkloadRef,
    },
};
use serde::Serialize;
use std::{collections::BTreeMap, fmt};
use thiserror::Error;
use tracing::trace;

/// The widened security dimensions of every workload observed in a scope.
///
/// The default value is the bottom of every dimension and permits nothing. States are values:
/// folding a snapshot returns a new state and leaves the original untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedPolicyState {
    pub(crate) privileged: AnyOf,
    pub(crate) allow_privilege_escalation: AnyOf,
    pub(crate) read_only_root_filesystem: AllOf,

    pub(crate) host_network: AnyOf,
    pub(crate) host_pid: AnyOf,
    pub(crate) host_ipc: AnyOf,
    pub(crate) host_ports: Union<u16>,

    pub(crate) allowed_capabilities: Union<Capability>,
    pub(crate) required_drop_capabilities: Intersection<Capability>,

    pub(crate) run_as_user: IdRange,
    pub(crate) run_as_group: IdRange,
    pub(crate) run_as_non_root: AllOf,

    /// Unset observations are recorded as `None`.
    pub(crate) fs_group: Union<Option<i64>>,
    pub(crate) supplemental_groups: Union<Option<i64>>,

    pub(crate) se_linux: Agreement<SeLinuxLabel>,
    pub(crate) seccomp: Union<Option<Profile>>,
    pub(crate) app_armor: Union<Option<Profile>>,
    pub(crate) proc_mount: ProcMountType,

    pub(crate) volumes: Union<VolumeType>,
    pub(crate) allowed_host_paths: ReadOnlyPaths,
    pub(crate) sysctls: Union<String>,
}

/// Determines how workloads are partitioned into policies.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum Grouping {
    /// One policy for every observed workload.
    #[default]
    Cluster,

    /// One policy per namespace.
    Namespace,
}

#[derive(Debug, Error)]
#[error("invalid grouping: {0:?}")]
pub struct InvalidGrouping(String);

/// Identifies the set of workloads an aggregate covers.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ScopeKey {
    Cluster,
    Namespace(String),
}

/// Maintains one aggregate per scope.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyAggregator {
    grouping: Grouping,
    states: BTreeMap<ScopeKey, AggregatedPolicyState>,
}

// === impl AggregatedPolicyState ===

impl AggregatedPolicyState {
    /// Returns a new state that additionally permits everything `pod` uses.
    pub fn fold(&self, pod: &PodLevelSnapshot) -> Self {
        self.join(&Self::from(pod))
    }

    /// Indicates whether no workload has been folded into this state.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

impl Join for AggregatedPolicyState {
    fn join(&self, other: &Self) -> Self {
        Self {
            privileged: self.privileged.join(&other.privileged),
            allow_privilege_escalation: self
                .allow_privilege_escalation
                .join(&other.allow_privilege_escalation),
            read_only_root_filesystem: self
                .read_only_root_filesystem
                .join(&other.read_only_root_filesystem),
            host_network: self.host_network.join(&other.host_network),
            host_pid: self.host_pid.join(&other.host_pid),
            host_ipc: self.host_ipc.join(&other.host_ipc),
            host_ports: self.host_ports.join(&other.host_ports),
            allowed_capabilities: self.allowed_capabilities.join(&other.allowed_capabilities),
            required_drop_capabilities: self
                .required_drop_capabilities
                .join(&other.required_drop_capabilities),
            run_as_user: self.run_as_user.join(&other.run_as_user),
            run_as_group: self.run_as_group.join(&other.run_as_group),
            run_as_non_root: self.run_as_non_root.join(&other.run_as_non_root),
            fs_group: self.fs_group.join(&other.fs_group),
            supplemental_groups: self.supplemental_groups.join(&other.supplemental_groups),
            se_linux: self.se_linux.join(&other.se_linux),
            seccomp: self.seccomp.join(&other.seccomp),
            app_armor: self.app_armor.join(&other.app_armor),
            proc_mount: self.proc_mount.join(&other.proc_mount),
            volumes: self.volumes.join(&other.volumes),
            allowed_host_paths: self.allowed_host_paths.join(&other.allowed_host_paths),
            sysctls: self.sysctls.join(&other.sysctls),
        }
    }
}

/// The least state that permits a single container.
impl From<&ContainerSecuritySnapshot> for AggregatedPolicyState {
    fn from(c: &ContainerSecuritySnapshot) -> Self {
        Self {
            privileged: AnyOf(c.privileged),
            allow_privilege_escalation: AnyOf(c.allows_privilege_escalation()),
            read_only_root_filesystem: AllOf(c.read_only_root_filesystem),
            host_ports: c.host_ports.iter().copied().collect(),
            allowed_capabilities: c.added_capabilities.iter().cloned().collect(),
            required_drop_capabilities: c.dropped_capabilities.iter().cloned().collect(),
            run_as_user: IdRange::observe(c.run_as_user),
            run_as_group: IdRange::observe(c.run_as_group),
            run_as_non_root: AllOf(c.runs_as_non_root()),
            se_linux: Agreement::observe(c.se_linux.clone()),
            seccomp: Union::single(c.seccomp.clone()),
            app_armor: Union::single(c.app_armor.clone()),
            proc_mount: c.proc_mount,
            ..Self::default()
        }
    }
}

/// The least state that permits a pod and all of its containers.
impl From<&PodLevelSnapshot> for AggregatedPolicyState {
    fn from(pod: &PodLevelSnapshot) -> Self {
        let supplemental_groups = match pod.supplemental_groups.as_ref() {
            Some(ids) => ids.iter().copied().map(Some).collect(),
            None => Union::single(None),
        };
        let state = Self {
            host_network: AnyOf(pod.host_network),
            host_pid: AnyOf(pod.host_pid),
            host_ipc: AnyOf(pod.host_ipc),
            fs_group: Union::single(pod.fs_group),
            supplemental_groups,
            volumes: pod.volumes.iter().copied().collect(),
            allowed_host_paths: pod
                .host_paths
                .iter()
                .map(|(path, read_only)| (path.clone(), *read_only))
                .collect(),
            sysctls: pod.sysctls.iter().cloned().collect(),
            ..Self::default()
        };
        pod.containers
            .iter()
            .fold(state, |state, c| state.join(&Self::from(c)))
    }
}

// === impl Grouping ===

impl std::str::FromStr for Grouping {
    type Err = InvalidGrouping;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cluster" => Ok(Self::Cluster),
            "namespace" => Ok(Self::Namespace),
            s => Err(InvalidGrouping(s.to_string())),
        }
    }
}

impl fmt::Display for Grouping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cluster => "cluster".fmt(f),
            Self::Namespace => "namespace".fmt(f),
        }
    }
}

// === impl ScopeKey ===

impl ScopeKey {
    /// The name of the policy synthesized for this scope.
    pub fn policy_name(&self) -> String {
        match self {
            Self::Cluster => "pod-security-policy".to_string(),
            Self::Namespace(ns) => format!("pod-security-policy-{}", ns),
        }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cluster => "cluster".fmt(f),
            Self::Namespace(ns) => write!(f, "namespace/{}", ns),
        }
    }
}

// === impl PolicyAggregator ===

impl PolicyAggregator {
    /// Creates an aggregator. With cluster grouping, the cluster scope exists (and denies
    /// everything) before any workload is folded.
    pub fn new(grouping: Grouping) -> Self {
        let mut states = BTreeMap::new();
        if grouping == Grouping::Cluster {
            states.insert(ScopeKey::Cluster, AggregatedPolicyState::default());
        }
        Self { grouping, states }
    }

    pub fn grouping(&self) -> Grouping {
        self.grouping
    }

    pub fn scope_of(&self, workload: &WorkloadRef) -> ScopeKey {
        match self.grouping {
            Grouping::Cluster => ScopeKey::Cluster,
            Grouping::Namespace => ScopeKey::Namespace(workload.namespace.clone()),
        }
    }

    /// Widens the state of the pod's scope to permit the pod.
    pub fn fold(&mut self, pod: &PodLevelSnapshot) {
        let scope = self.scope_of(&pod.workload);
        let state = match self.states.get(&scope) {
            Some(state) => state.fold(pod),
            None => AggregatedPolicyState::default().fold(pod),
        };
        trace!(%scope, workload = %pod.workload, "Folded snapshot");
        self.states.insert(scope, state);
    }

    /// Combines two aggregators built over disjoint (or overlapping) sets of workloads.
    ///
    /// # Panics
    ///
    /// If the aggregators use different groupings, since their scope keys are not comparable.
    pub fn merge(mut self, other: Self) -> Self {
        assert_eq!(self.grouping, other.grouping, "groupings must match");
        for (scope, state) in other.states {
            let merged = match self.states.get(&scope) {
                Some(prior) => prior.join(&state),
                None => state,
            };
            self.states.insert(scope, merged);
        }
        self
    }

    pub fn get(&self, scope: &ScopeKey) -> Option<&AggregatedPolicyState> {
        self.states.get(scope)
    }

    pub fn states(&self) -> impl Iterator<Item = (&ScopeKey, &AggregatedPolicyState)> {
        self.states.iter()
    }
}
