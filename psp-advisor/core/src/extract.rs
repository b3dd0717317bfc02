//! Projects workload specs onto security snapshots.
//!
//! This is the only place that reads Kubernetes API types. Everything downstream operates on the
//! closed snapshot types in [`crate::snapshot`].

use crate::{
    error::MalformedSpecError,
    snapshot::{
        Capability, ContainerKind, ContainerSecuritySnapshot, PodLevelSnapshot, ProcMountType,
        Profile, SeLinuxLabel, VolumeType, WorkloadRef,
    },
};
use psp_advisor_k8s_api::{
    api::core::v1::{AppArmorProfile, SELinuxOptions, SeccompProfile, Volume},
    Container, PodSecurityContext, PodSpec, SecurityContext, Workload,
};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace};

const SECCOMP_POD_ANNOTATION: &str = "seccomp.security.alpha.kubernetes.io/pod";
const SECCOMP_CONTAINER_ANNOTATION_PREFIX: &str = "container.seccomp.security.alpha.kubernetes.io/";
const APPARMOR_CONTAINER_ANNOTATION_PREFIX: &str = "container.apparmor.security.beta.kubernetes.io/";

type Annotations = BTreeMap<String, String>;

/// Projects a workload's pod template onto a [`PodLevelSnapshot`].
pub fn extract(workload: &Workload) -> Result<PodLevelSnapshot, MalformedSpecError> {
    let name = workload
        .name()
        .ok_or_else(|| MalformedSpecError::MissingName {
            namespace: workload.namespace().to_string(),
            kind: workload.kind(),
        })?;
    let reference = WorkloadRef::new(workload.namespace(), workload.kind(), name);

    let template = workload.pod_template();
    let spec = template
        .spec
        .ok_or_else(|| MalformedSpecError::MissingPodSpec {
            workload: reference.clone(),
        })?;
    let annotations = template.metadata.and_then(|m| m.annotations.as_ref());

    extract_pod_spec(reference, annotations, spec)
}

/// Projects a pod spec onto a [`PodLevelSnapshot`].
///
/// Unset fields take their Kubernetes defaults; container security contexts override the pod's.
pub fn extract_pod_spec(
    workload: WorkloadRef,
    annotations: Option<&Annotations>,
    spec: &PodSpec,
) -> Result<PodLevelSnapshot, MalformedSpecError> {
    let pod_sc = spec.security_context.as_ref();
    let ctx = PodContext {
        workload: &workload,
        annotations,
        security_context: pod_sc,
    };

    let fs_group = ctx.non_negative("fsGroup", pod_sc.and_then(|sc| sc.fs_group))?;
    let supplemental_groups = match pod_sc.and_then(|sc| sc.supplemental_groups.as_ref()) {
        Some(ids) if !ids.is_empty() => Some(
            ids.iter()
                .map(|id| ctx.non_negative("supplementalGroups", Some(*id)).map(|_| *id))
                .collect::<Result<BTreeSet<_>, _>>()?,
        ),
        _ => None,
    };
    let sysctls = pod_sc
        .and_then(|sc| sc.sysctls.as_ref())
        .into_iter()
        .flatten()
        .map(|s| s.name.clone())
        .collect();

    let containers = spec
        .containers
        .iter()
        .map(|c| (ContainerKind::Container, c))
        .chain(
            spec.init_containers
                .iter()
                .flatten()
                .map(|c| (ContainerKind::InitContainer, c)),
        )
        .collect::<Vec<_>>();

    let volumes = spec.volumes.iter().flatten().collect::<Vec<_>>();
    let volume_types = volumes.iter().map(|v| volume_type(v)).collect();
    let host_paths = volumes
        .iter()
        .filter_map(|v| {
            let host_path = v.host_path.as_ref()?;
            // A path is read-only only if every mount of its volume is.
            let read_only = containers
                .iter()
                .flat_map(|(_, c)| c.volume_mounts.iter().flatten())
                .filter(|m| m.name == v.name)
                .all(|m| m.read_only == Some(true));
            Some((host_path.path.clone(), read_only))
        })
        .fold(BTreeMap::new(), |mut paths, (path, read_only)| {
            let ro = paths.entry(path).or_insert(true);
            *ro = *ro && read_only;
            paths
        });

    let containers = containers
        .into_iter()
        .enumerate()
        .map(|(index, (kind, container))| ctx.extract_container(index, kind, container))
        .collect::<Result<Vec<_>, _>>()?;

    debug!(%workload, containers = containers.len(), "Extracted snapshot");
    Ok(PodLevelSnapshot {
        service_account: spec.service_account_name.clone(),
        host_network: spec.host_network.unwrap_or(false),
        host_pid: spec.host_pid.unwrap_or(false),
        host_ipc: spec.host_ipc.unwrap_or(false),
        fs_group,
        supplemental_groups,
        volumes: volume_types,
        host_paths,
        sysctls,
        containers,
        workload,
    })
}

/// Pod-level state consulted while extracting each container.
struct PodContext<'p> {
    workload: &'p WorkloadRef,
    annotations: Option<&'p Annotations>,
    security_context: Option<&'p PodSecurityContext>,
}

// === impl PodContext ===

impl PodContext<'_> {
    fn extract_container(
        &self,
        index: usize,
        kind: ContainerKind,
        container: &Container,
    ) -> Result<ContainerSecuritySnapshot, MalformedSpecError> {
        if container.name.is_empty() {
            return Err(MalformedSpecError::MissingContainerName {
                workload: self.workload.clone(),
                index,
            });
        }
        let name = container.name.as_str();
        let sc = container.security_context.as_ref();
        let pod_sc = self.security_context;

        let added_capabilities = sc
            .and_then(|sc| sc.capabilities.as_ref())
            .and_then(|caps| caps.add.as_ref())
            .into_iter()
            .flatten()
            .map(|c| Capability::new(c))
            .collect::<BTreeSet<_>>();
        // A capability that is both added and dropped is treated as added.
        let dropped_capabilities = sc
            .and_then(|sc| sc.capabilities.as_ref())
            .and_then(|caps| caps.drop.as_ref())
            .into_iter()
            .flatten()
            .map(|c| Capability::new(c))
            .filter(|c| !added_capabilities.contains(c))
            .collect();

        let run_as_user = self.non_negative(
            "runAsUser",
            sc.and_then(|sc| sc.run_as_user)
                .or_else(|| pod_sc.and_then(|sc| sc.run_as_user)),
        )?;
        let run_as_group = self.non_negative(
            "runAsGroup",
            sc.and_then(|sc| sc.run_as_group)
                .or_else(|| pod_sc.and_then(|sc| sc.run_as_group)),
        )?;
        let run_as_non_root = sc
            .and_then(|sc| sc.run_as_non_root)
            .or_else(|| pod_sc.and_then(|sc| sc.run_as_non_root));

        let se_linux = sc
            .and_then(|sc| sc.se_linux_options.as_ref())
            .or_else(|| pod_sc.and_then(|sc| sc.se_linux_options.as_ref()))
            .map(SeLinuxLabel::from);

        let host_ports = container
            .ports
            .iter()
            .flatten()
            // A zero host port means the container port is not exposed on the host.
            .filter_map(|p| p.host_port.filter(|port| *port != 0))
            .map(|port| {
                u16::try_from(port)
                    .ok()
                    .ok_or_else(|| MalformedSpecError::InvalidHostPort {
                        workload: self.workload.clone(),
                        container: name.to_string(),
                        port,
                    })
            })
            .collect::<Result<BTreeSet<_>, _>>()?;

        let proc_mount = match sc.and_then(|sc| sc.proc_mount.as_deref()) {
            Some("Unmasked") => ProcMountType::Unmasked,
            _ => ProcMountType::Default,
        };

        let snapshot = ContainerSecuritySnapshot {
            name: name.to_string(),
            kind,
            image: container.image.clone(),
            privileged: sc.and_then(|sc| sc.privileged).unwrap_or(false),
            allow_privilege_escalation: sc.and_then(|sc| sc.allow_privilege_escalation),
            read_only_root_filesystem: sc
                .and_then(|sc| sc.read_only_root_filesystem)
                .unwrap_or(false),
            added_capabilities,
            dropped_capabilities,
            run_as_user,
            run_as_group,
            run_as_non_root,
            se_linux,
            seccomp: self.seccomp_profile(name, sc),
            app_armor: self.app_armor_profile(name, sc),
            proc_mount,
            host_ports,
        };
        trace!(workload = %self.workload, container = ?snapshot, "Extracted container");
        Ok(snapshot)
    }

    fn non_negative(
        &self,
        field: &'static str,
        id: Option<i64>,
    ) -> Result<Option<i64>, MalformedSpecError> {
        match id {
            Some(value) if value < 0 => Err(MalformedSpecError::NegativeId {
                workload: self.workload.clone(),
                field,
                value,
            }),
            id => Ok(id),
        }
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations?.get(key).map(String::as_str)
    }

    /// Security-context fields take precedence over the legacy annotations, and container
    /// settings over pod settings.
    fn seccomp_profile(&self, container: &str, sc: Option<&SecurityContext>) -> Option<Profile> {
        let from_field = |p: &SeccompProfile| {
            Profile::from_fields(&p.type_, p.localhost_profile.as_deref())
        };
        sc.and_then(|sc| sc.seccomp_profile.as_ref())
            .and_then(from_field)
            .or_else(|| {
                self.annotation(&format!("{SECCOMP_CONTAINER_ANNOTATION_PREFIX}{container}"))
                    .and_then(Profile::from_annotation)
            })
            .or_else(|| {
                self.security_context
                    .and_then(|sc| sc.seccomp_profile.as_ref())
                    .and_then(from_field)
            })
            .or_else(|| {
                self.annotation(SECCOMP_POD_ANNOTATION)
                    .and_then(Profile::from_annotation)
            })
    }

    fn app_armor_profile(&self, container: &str, sc: Option<&SecurityContext>) -> Option<Profile> {
        let from_field = |p: &AppArmorProfile| {
            Profile::from_fields(&p.type_, p.localhost_profile.as_deref())
        };
        sc.and_then(|sc| sc.app_armor_profile.as_ref())
            .and_then(from_field)
            .or_else(|| {
                self.annotation(&format!(
                    "{APPARMOR_CONTAINER_ANNOTATION_PREFIX}{container}"
                ))
                .and_then(Profile::from_annotation)
            })
            .or_else(|| {
                self.security_context
                    .and_then(|sc| sc.app_armor_profile.as_ref())
                    .and_then(from_field)
            })
    }
}

impl From<&SELinuxOptions> for SeLinuxLabel {
    fn from(opts: &SELinuxOptions) -> Self {
        Self {
            user: opts.user.clone(),
            role: opts.role.clone(),
            type_: opts.type_.clone(),
            level: opts.level.clone(),
        }
    }
}

/// Determines a volume's source type. Volumes without a source default to `emptyDir`.
fn volume_type(v: &Volume) -> VolumeType {
    if v.host_path.is_some() {
        VolumeType::HostPath
    } else if v.config_map.is_some() {
        VolumeType::ConfigMap
    } else if v.secret.is_some() {
        VolumeType::Secret
    } else if v.empty_dir.is_some() {
        VolumeType::EmptyDir
    } else if v.persistent_volume_claim.is_some() {
        VolumeType::PersistentVolumeClaim
    } else if v.projected.is_some() {
        VolumeType::Projected
    } else if v.downward_api.is_some() {
        VolumeType::DownwardApi
    } else if v.csi.is_some() {
        VolumeType::Csi
    } else if v.ephemeral.is_some() {
        VolumeType::Ephemeral
    } else if v.nfs.is_some() {
        VolumeType::Nfs
    } else if v.iscsi.is_some() {
        VolumeType::Iscsi
    } else if v.rbd.is_some() {
        VolumeType::Rbd
    } else if v.cephfs.is_some() {
        VolumeType::CephFs
    } else if v.glusterfs.is_some() {
        VolumeType::Glusterfs
    } else if v.fc.is_some() {
        VolumeType::Fc
    } else if v.flex_volume.is_some() {
        VolumeType::FlexVolume
    } else if v.flocker.is_some() {
        VolumeType::Flocker
    } else if v.aws_elastic_block_store.is_some() {
        VolumeType::AwsElasticBlockStore
    } else if v.azure_disk.is_some() {
        VolumeType::AzureDisk
    } else if v.azure_file.is_some() {
        VolumeType::AzureFile
    } else if v.gce_persistent_disk.is_some() {
        VolumeType::GcePersistentDisk
    } else if v.git_repo.is_some() {
        VolumeType::GitRepo
    } else if v.cinder.is_some() {
        VolumeType::Cinder
    } else if v.photon_persistent_disk.is_some() {
        VolumeType::PhotonPersistentDisk
    } else if v.portworx_volume.is_some() {
        VolumeType::PortworxVolume
    } else if v.quobyte.is_some() {
        VolumeType::Quobyte
    } else if v.scale_io.is_some() {
        VolumeType::ScaleIo
    } else if v.storageos.is_some() {
        VolumeType::Storageos
    } else if v.vsphere_volume.is_some() {
        VolumeType::VsphereVolume
    } else if v.image.is_some() {
        VolumeType::Image
    } else {
        VolumeType::EmptyDir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::{btreemap, btreeset};
    use serde_json::json;

    fn workload(value: serde_json::Value) -> Workload {
        Workload::from_value(value).unwrap().remove(0)
    }

    fn mk_pod(spec: serde_json::Value) -> Workload {
        workload(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "pod", "namespace": "ns" },
            "spec": spec,
        }))
    }

    #[test]
    fn container_settings_override_pod_settings() {
        let pod = extract(&mk_pod(json!({
            "securityContext": {
                "runAsUser": 1000,
                "runAsGroup": 3000,
                "runAsNonRoot": true,
                "seLinuxOptions": { "level": "s0:c1" }
            },
            "initContainers": [{ "name": "init", "securityContext": { "runAsUser": 0 } }],
            "containers": [{ "name": "app" }]
        })))
        .unwrap();

        assert_eq!(pod.workload, WorkloadRef::new("ns", "Pod", "pod"));
        assert_eq!(pod.containers.len(), 2);
        let app = &pod.containers[0];
        assert_eq!(app.kind, ContainerKind::Container);
        assert_eq!(app.run_as_user, Some(1000));
        assert_eq!(app.run_as_group, Some(3000));
        assert_eq!(app.run_as_non_root, Some(true));
        assert_eq!(
            app.se_linux.as_ref().and_then(|l| l.level.as_deref()),
            Some("s0:c1")
        );

        let init = &pod.containers[1];
        assert_eq!(init.kind, ContainerKind::InitContainer);
        assert_eq!(init.run_as_user, Some(0));
        assert!(!init.runs_as_non_root());
    }

    #[test]
    fn capabilities_are_normalized() {
        let pod = extract(&mk_pod(json!({
            "containers": [{
                "name": "app",
                "securityContext": {
                    "capabilities": {
                        "add": ["cap_net_bind_service", "NET_RAW"],
                        "drop": ["ALL", "NET_RAW"]
                    }
                }
            }]
        })))
        .unwrap();

        let app = &pod.containers[0];
        assert_eq!(
            app.added_capabilities,
            btreeset! {Capability::new("NET_BIND_SERVICE"), Capability::new("NET_RAW")}
        );
        assert_eq!(app.dropped_capabilities, btreeset! {Capability::new("ALL")});
    }

    #[test]
    fn profiles_prefer_fields_over_annotations() {
        let workload = workload(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "shop" },
            "spec": {
                "selector": {},
                "template": {
                    "metadata": {
                        "annotations": {
                            "seccomp.security.alpha.kubernetes.io/pod": "runtime/default",
                            "container.seccomp.security.alpha.kubernetes.io/legacy": "unconfined",
                            "container.apparmor.security.beta.kubernetes.io/legacy": "localhost/deny-write"
                        }
                    },
                    "spec": {
                        "containers": [
                            { "name": "legacy" },
                            { "name": "plain" },
                            {
                                "name": "modern",
                                "securityContext": {
                                    "seccompProfile": { "type": "Localhost", "localhostProfile": "audit.json" },
                                    "appArmorProfile": { "type": "RuntimeDefault" }
                                }
                            }
                        ]
                    }
                }
            }
        }));
        let pod = extract(&workload).unwrap();
        let profiles = pod
            .containers
            .iter()
            .map(|c| (c.name.as_str(), c.seccomp.clone(), c.app_armor.clone()))
            .collect::<Vec<_>>();
        assert_eq!(
            profiles,
            [
                (
                    "legacy",
                    Some(Profile::Unconfined),
                    Some(Profile::Localhost("deny-write".to_string()))
                ),
                ("plain", Some(Profile::RuntimeDefault), None),
                (
                    "modern",
                    Some(Profile::Localhost("audit.json".to_string())),
                    Some(Profile::RuntimeDefault)
                ),
            ]
        );
    }

    #[test]
    fn host_paths_are_read_only_only_if_every_mount_is() {
        let pod = extract(&mk_pod(json!({
            "volumes": [
                { "name": "logs", "hostPath": { "path": "/var/log" } },
                { "name": "certs", "hostPath": { "path": "/etc/ssl" } },
                { "name": "config", "configMap": { "name": "cfg" } },
                { "name": "scratch" }
            ],
            "containers": [
                {
                    "name": "a",
                    "volumeMounts": [
                        { "name": "logs", "mountPath": "/logs", "readOnly": true },
                        { "name": "certs", "mountPath": "/certs", "readOnly": true }
                    ]
                },
                {
                    "name": "b",
                    "volumeMounts": [{ "name": "logs", "mountPath": "/logs" }]
                }
            ]
        })))
        .unwrap();

        assert_eq!(
            pod.host_paths,
            btreemap! {
                "/etc/ssl".to_string() => true,
                "/var/log".to_string() => false,
            }
        );
        assert_eq!(
            pod.volumes,
            btreeset! {VolumeType::ConfigMap, VolumeType::EmptyDir, VolumeType::HostPath}
        );
    }

    #[test]
    fn pod_level_settings() {
        let pod = extract(&mk_pod(json!({
            "hostNetwork": true,
            "hostPID": true,
            "serviceAccountName": "runner",
            "securityContext": {
                "fsGroup": 2000,
                "supplementalGroups": [5, 4],
                "sysctls": [{ "name": "net.ipv4.tcp_syncookies", "value": "1" }]
            },
            "containers": [{
                "name": "app",
                "ports": [{ "containerPort": 80, "hostPort": 8080 }, { "containerPort": 9090 }],
                "securityContext": { "procMount": "Unmasked" }
            }]
        })))
        .unwrap();

        assert!(pod.host_network && pod.host_pid && !pod.host_ipc);
        assert_eq!(pod.service_account.as_deref(), Some("runner"));
        assert_eq!(pod.fs_group, Some(2000));
        assert_eq!(pod.supplemental_groups, Some(btreeset! {4, 5}));
        assert_eq!(pod.sysctls, btreeset! {"net.ipv4.tcp_syncookies".to_string()});
        let app = &pod.containers[0];
        assert_eq!(app.host_ports, btreeset! {8080});
        assert_eq!(app.proc_mount, ProcMountType::Unmasked);
        assert_eq!(app.allow_privilege_escalation, None);
        assert!(app.allows_privilege_escalation());
    }

    #[test]
    fn zero_host_port_is_unset() {
        let pod = extract(&mk_pod(json!({
            "containers": [{
                "name": "app",
                "ports": [
                    { "containerPort": 80, "hostPort": 0 },
                    { "containerPort": 443, "hostPort": 8443 }
                ]
            }]
        })))
        .unwrap();
        assert_eq!(pod.containers[0].host_ports, btreeset! {8443});

        let pod = extract(&mk_pod(json!({
            "containers": [{ "name": "app", "ports": [{ "containerPort": 80, "hostPort": 0 }] }]
        })))
        .unwrap();
        assert!(pod.containers[0].host_ports.is_empty());
    }

    #[test]
    fn malformed_specs() {
        let workload_ref = WorkloadRef::new("ns", "Pod", "pod");

        assert_eq!(
            extract(&mk_pod(json!({ "containers": [{ "name": "" }] }))),
            Err(MalformedSpecError::MissingContainerName {
                workload: workload_ref.clone(),
                index: 0
            })
        );
        assert_eq!(
            extract(&mk_pod(json!({
                "securityContext": { "fsGroup": -1 },
                "containers": [{ "name": "app" }]
            }))),
            Err(MalformedSpecError::NegativeId {
                workload: workload_ref.clone(),
                field: "fsGroup",
                value: -1
            })
        );
        assert_eq!(
            extract(&mk_pod(json!({
                "containers": [{ "name": "app", "ports": [{ "containerPort": 80, "hostPort": 70000 }] }]
            }))),
            Err(MalformedSpecError::InvalidHostPort {
                workload: workload_ref.clone(),
                container: "app".to_string(),
                port: 70000
            })
        );

        assert_eq!(
            extract(&mk_pod(json!({
                "containers": [{ "name": "app", "ports": [{ "containerPort": 80, "hostPort": -1 }] }]
            }))),
            Err(MalformedSpecError::InvalidHostPort {
                workload: workload_ref.clone(),
                container: "app".to_string(),
                port: -1
            })
        );

        let unnamed = workload(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "namespace": "ns" },
            "spec": { "containers": [] }
        }));
        assert_eq!(
            extract(&unnamed),
            Err(MalformedSpecError::MissingName {
                namespace: "ns".to_string(),
                kind: "Pod"
            })
        );

        let no_spec = workload(json!({
            "apiVersion": "apps/v1",
            "kind": "ReplicaSet",
            "metadata": { "name": "rs", "namespace": "ns" },
            "spec": { "selector": {} }
        }));
        assert_eq!(
            extract(&no_spec),
            Err(MalformedSpecError::MissingPodSpec {
                workload: WorkloadRef::new("ns", "ReplicaSet", "rs")
            })
        );
    }
}
