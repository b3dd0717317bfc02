//! Renders an aggregate state as a `PodSecurityPolicy`.

use crate::{
    aggregate::AggregatedPolicyState,
    error::SynthesisError,
    lattice::{Agreement, IdRange, Intersection, Union},
    snapshot::{
        is_safe_sysctl, Capability, Dimension, ProcMountType, Profile, SeLinuxLabel, SAFE_SYSCTLS,
    },
};
use psp_advisor_k8s_api::psp::{
    self, AllowedHostPath, HostPortRange, IdRule, IdStrategyOptions, PodSecurityPolicy,
    PodSecurityPolicySpec, SeLinuxOptions, SeLinuxRule, SeLinuxStrategyOptions,
    APPARMOR_ALLOWED_PROFILES_ANNOTATION, SECCOMP_ALLOWED_PROFILES_ANNOTATION,
};
use std::collections::BTreeMap;
use tracing::debug;

/// Synthesizes the least-privileged policy that admits every workload folded into `state`.
///
/// An empty state yields a policy that admits nothing beyond the defaults of a restricted pod.
pub fn synthesize(
    name: &str,
    state: &AggregatedPolicyState,
) -> Result<PodSecurityPolicy, SynthesisError> {
    let (allowed_capabilities, required_drop_capabilities) = capabilities(
        &state.allowed_capabilities,
        &state.required_drop_capabilities,
    )?;
    let (allowed_unsafe_sysctls, forbidden_sysctls) = sysctls(&state.sysctls);

    let run_as_user = match state.run_as_user {
        IdRange::Any if state.run_as_non_root.0 => IdStrategyOptions {
            rule: IdRule::MustRunAsNonRoot,
            ranges: vec![],
        },
        range => id_range(Dimension::RunAsUser, range)?,
    };

    let spec = PodSecurityPolicySpec {
        privileged: state.privileged.0,
        allow_privilege_escalation: state.allow_privilege_escalation.0,
        read_only_root_filesystem: state.read_only_root_filesystem.0,
        host_network: state.host_network.0,
        host_pid: state.host_pid.0,
        host_ipc: state.host_ipc.0,
        host_ports: host_ports(&state.host_ports),
        allowed_capabilities,
        required_drop_capabilities,
        run_as_user,
        run_as_group: id_range(Dimension::RunAsGroup, state.run_as_group)?,
        fs_group: id_set(Dimension::FsGroup, &state.fs_group)?,
        supplemental_groups: id_set(Dimension::SupplementalGroups, &state.supplemental_groups)?,
        se_linux: se_linux(&state.se_linux),
        volumes: state.volumes.iter().map(|v| v.to_string()).collect(),
        allowed_host_paths: state
            .allowed_host_paths
            .iter()
            .map(|(path, read_only)| {
                if path.is_empty() {
                    return Err(SynthesisError::EmptyHostPath);
                }
                Ok(AllowedHostPath {
                    path_prefix: path.to_string(),
                    read_only,
                })
            })
            .collect::<Result<_, _>>()?,
        allowed_proc_mount_types: match state.proc_mount {
            ProcMountType::Default => vec![ProcMountType::Default.as_str().to_string()],
            ProcMountType::Unmasked => vec![
                ProcMountType::Default.as_str().to_string(),
                ProcMountType::Unmasked.as_str().to_string(),
            ],
        },
        allowed_unsafe_sysctls,
        forbidden_sysctls,
    };

    let mut annotations = BTreeMap::new();
    if let Some(names) = allowed_profile_names(&state.seccomp) {
        annotations.insert(SECCOMP_ALLOWED_PROFILES_ANNOTATION.to_string(), names);
    }
    if let Some(names) = allowed_profile_names(&state.app_armor) {
        annotations.insert(APPARMOR_ALLOWED_PROFILES_ANNOTATION.to_string(), names);
    }

    let mut policy = PodSecurityPolicy::new(name, spec);
    if !annotations.is_empty() {
        policy.metadata.annotations = Some(annotations);
    }
    debug!(%name, "Synthesized policy");
    Ok(policy)
}

fn capabilities(
    allowed: &Union<Capability>,
    required_drop: &Intersection<Capability>,
) -> Result<(Vec<String>, Vec<String>), SynthesisError> {
    let drop = match required_drop {
        // No container was observed, so every capability may be dropped.
        Intersection::Unconstrained => vec![Capability::ALL.to_string()],
        Intersection::Only(caps) => {
            if let Some(cap) = caps.iter().find(|c| allowed.contains(c)) {
                return Err(SynthesisError::CapabilityConflict(cap.clone()));
            }
            caps.iter().map(|c| c.to_string()).collect()
        }
    };

    let allowed = allowed
        .iter()
        .map(|c| {
            if c.is_all() {
                "*".to_string()
            } else {
                c.to_string()
            }
        })
        .collect();

    Ok((allowed, drop))
}

fn id_range(dimension: Dimension, range: IdRange) -> Result<IdStrategyOptions, SynthesisError> {
    match range {
        IdRange::Empty => Ok(IdStrategyOptions::must_run_as([])),
        IdRange::Any => Ok(IdStrategyOptions::run_as_any()),
        IdRange::Range { min, max } => {
            if min > max {
                return Err(SynthesisError::InvertedRange {
                    dimension,
                    min,
                    max,
                });
            }
            if min < 0 {
                return Err(SynthesisError::NegativeId {
                    dimension,
                    value: min,
                });
            }
            Ok(IdStrategyOptions::must_run_as([psp::IdRange { min, max }]))
        }
    }
}

/// Renders a set of observed ids, where `None` records that a workload left the id unset.
fn id_set(
    dimension: Dimension,
    ids: &Union<Option<i64>>,
) -> Result<IdStrategyOptions, SynthesisError> {
    if ids.contains(&None) {
        return Ok(IdStrategyOptions::run_as_any());
    }

    let ids = ids.iter().flatten().copied();
    let mut ranges = Vec::new();
    for (min, max) in coalesce(ids) {
        if min < 0 {
            return Err(SynthesisError::NegativeId {
                dimension,
                value: min,
            });
        }
        ranges.push(psp::IdRange { min, max });
    }
    Ok(IdStrategyOptions::must_run_as(ranges))
}

fn host_ports(ports: &Union<u16>) -> Vec<HostPortRange> {
    coalesce(ports.iter().map(|p| i64::from(*p)))
        .map(|(min, max)| HostPortRange {
            min: min as i32,
            max: max as i32,
        })
        .collect()
}

/// Collapses ascending values into inclusive ranges of consecutive values.
fn coalesce(values: impl IntoIterator<Item = i64>) -> impl Iterator<Item = (i64, i64)> {
    let mut ranges = Vec::<(i64, i64)>::new();
    for value in values {
        match ranges.last_mut() {
            Some((_, max)) if value <= *max + 1 => *max = (*max).max(value),
            _ => ranges.push((value, value)),
        }
    }
    ranges.into_iter()
}

fn se_linux(label: &Agreement<SeLinuxLabel>) -> SeLinuxStrategyOptions {
    match label {
        Agreement::Empty => SeLinuxStrategyOptions {
            rule: SeLinuxRule::MustRunAs,
            se_linux_options: None,
        },
        Agreement::Exact(label) => SeLinuxStrategyOptions {
            rule: SeLinuxRule::MustRunAs,
            se_linux_options: Some(SeLinuxOptions {
                user: label.user.clone(),
                role: label.role.clone(),
                type_: label.type_.clone(),
                level: label.level.clone(),
            }),
        },
        Agreement::Any => SeLinuxStrategyOptions {
            rule: SeLinuxRule::RunAsAny,
            se_linux_options: None,
        },
    }
}

fn sysctls(observed: &Union<String>) -> (Vec<String>, Vec<String>) {
    if observed.is_empty() {
        return (vec![], vec!["*".to_string()]);
    }

    let allowed_unsafe = observed
        .iter()
        .filter(|name| !is_safe_sysctl(name))
        .cloned()
        .collect();
    let forbidden = SAFE_SYSCTLS
        .iter()
        .filter(|name| !observed.contains(&name.to_string()))
        .map(|name| name.to_string())
        .collect();
    (allowed_unsafe, forbidden)
}

/// Returns the value of an `allowedProfileNames` annotation, if the profiles need one.
fn allowed_profile_names(profiles: &Union<Option<Profile>>) -> Option<String> {
    let names = profiles
        .iter()
        .flatten()
        .map(|p| p.to_string())
        .collect::<Vec<_>>();
    if names.is_empty() {
        return None;
    }
    if profiles.contains(&None) {
        return Some("*".to_string());
    }
    Some(names.join(","))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lattice::{AllOf, ReadOnlyPaths};
    use maplit::btreeset;

    #[test]
    fn empty_state_denies_everything() {
        let psp = synthesize("restricted", &AggregatedPolicyState::default()).unwrap();
        assert_eq!(psp.metadata.name.as_deref(), Some("restricted"));
        assert!(psp.metadata.annotations.is_none());

        let spec = psp.spec;
        assert!(!spec.privileged);
        assert!(!spec.allow_privilege_escalation);
        assert!(spec.read_only_root_filesystem);
        assert!(!spec.host_network && !spec.host_pid && !spec.host_ipc);
        assert!(spec.host_ports.is_empty());
        assert!(spec.allowed_capabilities.is_empty());
        assert_eq!(spec.required_drop_capabilities, ["ALL"]);
        assert_eq!(spec.run_as_user, IdStrategyOptions::must_run_as([]));
        assert_eq!(spec.run_as_group, IdStrategyOptions::must_run_as([]));
        assert_eq!(spec.fs_group, IdStrategyOptions::must_run_as([]));
        assert_eq!(spec.se_linux.rule, SeLinuxRule::MustRunAs);
        assert!(spec.volumes.is_empty());
        assert_eq!(spec.allowed_proc_mount_types, ["Default"]);
        assert_eq!(spec.forbidden_sysctls, ["*"]);
    }

    #[test]
    fn coalesces_ranges() {
        assert_eq!(
            coalesce([1, 2, 3, 5, 7, 8]).collect::<Vec<_>>(),
            [(1, 3), (5, 5), (7, 8)]
        );
        assert_eq!(coalesce([]).count(), 0);

        let ports = [80u16, 443, 8080, 8081].into_iter().collect();
        assert_eq!(
            host_ports(&ports),
            [
                HostPortRange { min: 80, max: 80 },
                HostPortRange { min: 443, max: 443 },
                HostPortRange {
                    min: 8080,
                    max: 8081
                },
            ]
        );
    }

    #[test]
    fn unset_group_permits_any() {
        let groups = [Some(1000), Some(1001), Some(3000)].into_iter().collect();
        assert_eq!(
            id_set(Dimension::FsGroup, &groups).unwrap(),
            IdStrategyOptions::must_run_as([
                psp::IdRange {
                    min: 1000,
                    max: 1001
                },
                psp::IdRange {
                    min: 3000,
                    max: 3000
                },
            ])
        );

        let groups = [None, Some(1000)].into_iter().collect();
        assert_eq!(
            id_set(Dimension::FsGroup, &groups).unwrap(),
            IdStrategyOptions::run_as_any()
        );
    }

    #[test]
    fn run_as_non_root_when_every_container_is() {
        let state = AggregatedPolicyState {
            run_as_user: IdRange::Any,
            run_as_non_root: AllOf(true),
            ..Default::default()
        };
        let spec = synthesize("psp", &state).unwrap().spec;
        assert_eq!(spec.run_as_user.rule, IdRule::MustRunAsNonRoot);

        let state = AggregatedPolicyState {
            run_as_non_root: AllOf(false),
            ..state
        };
        let spec = synthesize("psp", &state).unwrap().spec;
        assert_eq!(spec.run_as_user, IdStrategyOptions::run_as_any());
    }

    #[test]
    fn renders_sysctls() {
        let observed = ["kernel.msgmax".to_string(), "net.ipv4.tcp_syncookies".to_string()]
            .into_iter()
            .collect();
        let (allowed, forbidden) = sysctls(&observed);
        assert_eq!(allowed, ["kernel.msgmax"]);
        assert_eq!(forbidden.len(), SAFE_SYSCTLS.len() - 1);
        assert!(!forbidden.contains(&"net.ipv4.tcp_syncookies".to_string()));
    }

    #[test]
    fn renders_profile_annotations() {
        let only_unset = Union::single(None);
        assert_eq!(allowed_profile_names(&only_unset), None);

        let explicit = [
            Some(Profile::RuntimeDefault),
            Some(Profile::Localhost("audit".to_string())),
        ]
        .into_iter()
        .collect();
        assert_eq!(
            allowed_profile_names(&explicit).as_deref(),
            Some("runtime/default,localhost/audit")
        );

        let mixed = [None, Some(Profile::RuntimeDefault)].into_iter().collect();
        assert_eq!(allowed_profile_names(&mixed).as_deref(), Some("*"));

        let state = AggregatedPolicyState {
            seccomp: mixed,
            ..Default::default()
        };
        let psp = synthesize("psp", &state).unwrap();
        let annotations = psp.metadata.annotations.unwrap();
        assert_eq!(annotations[SECCOMP_ALLOWED_PROFILES_ANNOTATION], "*");
        assert!(!annotations.contains_key(APPARMOR_ALLOWED_PROFILES_ANNOTATION));
    }

    #[test]
    fn renders_capabilities() {
        let state = AggregatedPolicyState {
            allowed_capabilities: [Capability::new("ALL"), Capability::new("NET_ADMIN")]
                .into_iter()
                .collect(),
            required_drop_capabilities: Intersection::Only(btreeset! {}),
            ..Default::default()
        };
        let spec = synthesize("psp", &state).unwrap().spec;
        assert_eq!(spec.allowed_capabilities, ["*", "NET_ADMIN"]);
        assert!(spec.required_drop_capabilities.is_empty());
    }

    #[test]
    fn rejects_broken_states() {
        let state = AggregatedPolicyState {
            allowed_capabilities: Union::single(Capability::new("NET_RAW")),
            required_drop_capabilities: Intersection::Only(btreeset! {Capability::new("NET_RAW")}),
            ..Default::default()
        };
        assert_eq!(
            synthesize("psp", &state),
            Err(SynthesisError::CapabilityConflict(Capability::new("NET_RAW")))
        );

        let state = AggregatedPolicyState {
            run_as_group: IdRange::Range { min: 10, max: 1 },
            ..Default::default()
        };
        assert_eq!(
            synthesize("psp", &state),
            Err(SynthesisError::InvertedRange {
                dimension: Dimension::RunAsGroup,
                min: 10,
                max: 1
            })
        );

        let state = AggregatedPolicyState {
            supplemental_groups: Union::single(Some(-1)),
            ..Default::default()
        };
        assert_eq!(
            synthesize("psp", &state),
            Err(SynthesisError::NegativeId {
                dimension: Dimension::SupplementalGroups,
                value: -1
            })
        );

        let state = AggregatedPolicyState {
            allowed_host_paths: [(String::new(), true)].into_iter().collect::<ReadOnlyPaths>(),
            ..Default::default()
        };
        assert_eq!(
            synthesize("psp", &state),
            Err(SynthesisError::EmptyHostPath)
        );
    }
}
