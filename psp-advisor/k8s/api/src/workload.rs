use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
        batch::v1::{CronJob, Job},
        core::v1::{Pod, PodSpec, PodTemplateSpec, ReplicationController},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

/// The namespace assumed for manifests that do not set one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// A workload resource that carries a pod template.
#[derive(Clone, Debug, PartialEq)]
pub enum Workload {
    Pod(Pod),
    Deployment(Deployment),
    DaemonSet(DaemonSet),
    StatefulSet(StatefulSet),
    ReplicaSet(ReplicaSet),
    ReplicationController(ReplicationController),
    Job(Job),
    CronJob(CronJob),
}

/// The pod template of a workload.
#[derive(Copy, Clone, Debug, Default)]
pub struct PodTemplate<'w> {
    pub metadata: Option<&'w ObjectMeta>,
    pub spec: Option<&'w PodSpec>,
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("document has no kind")]
    MissingKind,

    #[error("{kind} list has no items")]
    MissingItems { kind: String },

    #[error("failed to decode {kind}: {source}")]
    Decode {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
}

// === impl Workload ===

impl Workload {
    pub const KINDS: [&'static str; 8] = [
        "Pod",
        "Deployment",
        "DaemonSet",
        "StatefulSet",
        "ReplicaSet",
        "ReplicationController",
        "Job",
        "CronJob",
    ];

    /// Decodes a dynamically-typed manifest document into workloads.
    ///
    /// `List` documents (and typed lists such as `DeploymentList`) are flattened. Documents of
    /// kinds that do not carry a pod template are skipped.
    pub fn from_value(value: Value) -> Result<Vec<Self>, ParseError> {
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or(ParseError::MissingKind)?
            .to_string();

        if kind.ends_with("List") {
            let items = match value {
                Value::Object(mut obj) => obj.remove("items"),
                _ => None,
            };
            let items = match items {
                Some(Value::Array(items)) => items,
                Some(Value::Null) => vec![],
                _ => return Err(ParseError::MissingItems { kind }),
            };
            let mut workloads = Vec::with_capacity(items.len());
            for item in items {
                workloads.extend(Self::from_value(item)?);
            }
            return Ok(workloads);
        }

        let decode = |source| ParseError::Decode {
            kind: kind.clone(),
            source,
        };
        let workload = match kind.as_str() {
            "Pod" => Self::Pod(serde_json::from_value(value).map_err(decode)?),
            "Deployment" => Self::Deployment(serde_json::from_value(value).map_err(decode)?),
            "DaemonSet" => Self::DaemonSet(serde_json::from_value(value).map_err(decode)?),
            "StatefulSet" => Self::StatefulSet(serde_json::from_value(value).map_err(decode)?),
            "ReplicaSet" => Self::ReplicaSet(serde_json::from_value(value).map_err(decode)?),
            "ReplicationController" => {
                Self::ReplicationController(serde_json::from_value(value).map_err(decode)?)
            }
            "Job" => Self::Job(serde_json::from_value(value).map_err(decode)?),
            "CronJob" => Self::CronJob(serde_json::from_value(value).map_err(decode)?),
            _ => {
                debug!(%kind, "Skipping resource without a pod template");
                return Ok(vec![]);
            }
        };
        Ok(vec![workload])
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pod(_) => "Pod",
            Self::Deployment(_) => "Deployment",
            Self::DaemonSet(_) => "DaemonSet",
            Self::StatefulSet(_) => "StatefulSet",
            Self::ReplicaSet(_) => "ReplicaSet",
            Self::ReplicationController(_) => "ReplicationController",
            Self::Job(_) => "Job",
            Self::CronJob(_) => "CronJob",
        }
    }

    pub fn metadata(&self) -> &ObjectMeta {
        match self {
            Self::Pod(w) => &w.metadata,
            Self::Deployment(w) => &w.metadata,
            Self::DaemonSet(w) => &w.metadata,
            Self::StatefulSet(w) => &w.metadata,
            Self::ReplicaSet(w) => &w.metadata,
            Self::ReplicationController(w) => &w.metadata,
            Self::Job(w) => &w.metadata,
            Self::CronJob(w) => &w.metadata,
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.metadata().name.as_deref().filter(|n| !n.is_empty())
    }

    /// The workload's namespace, defaulting to `default` for manifests that omit it.
    pub fn namespace(&self) -> &str {
        self.metadata()
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Indicates whether another workload (e.g. a `Deployment` owning a `ReplicaSet`) controls
    /// this one. Controlled workloads are described by their controller's template.
    ///
    /// Workloads controlled by other kinds of objects, such as custom resources, are not
    /// considered controlled since their controller is never analyzed.
    pub fn is_controlled(&self) -> bool {
        self.metadata()
            .owner_references
            .iter()
            .flatten()
            .any(|owner| {
                owner.controller == Some(true) && Self::KINDS.contains(&owner.kind.as_str())
            })
    }

    pub fn pod_template(&self) -> PodTemplate<'_> {
        match self {
            Self::Pod(pod) => PodTemplate {
                metadata: Some(&pod.metadata),
                spec: pod.spec.as_ref(),
            },
            Self::Deployment(w) => w.spec.as_ref().map(|s| &s.template).into(),
            Self::DaemonSet(w) => w.spec.as_ref().map(|s| &s.template).into(),
            Self::StatefulSet(w) => w.spec.as_ref().map(|s| &s.template).into(),
            Self::ReplicaSet(w) => w.spec.as_ref().and_then(|s| s.template.as_ref()).into(),
            Self::ReplicationController(w) => {
                w.spec.as_ref().and_then(|s| s.template.as_ref()).into()
            }
            Self::Job(w) => w.spec.as_ref().map(|s| &s.template).into(),
            Self::CronJob(w) => w
                .spec
                .as_ref()
                .and_then(|s| s.job_template.spec.as_ref())
                .map(|s| &s.template)
                .into(),
        }
    }
}

macro_rules! impl_from_resource {
    ($($kind:ident),+ $(,)?) => {
        $(
            impl From<$kind> for Workload {
                fn from(w: $kind) -> Self {
                    Self::$kind(w)
                }
            }
        )+
    };
}

impl_from_resource!(
    Pod,
    Deployment,
    DaemonSet,
    StatefulSet,
    ReplicaSet,
    ReplicationController,
    Job,
    CronJob,
);

// === impl PodTemplate ===

impl<'w> From<Option<&'w PodTemplateSpec>> for PodTemplate<'w> {
    fn from(template: Option<&'w PodTemplateSpec>) -> Self {
        match template {
            Some(t) => Self {
                metadata: t.metadata.as_ref(),
                spec: t.spec.as_ref(),
            },
            None => Self::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_deployment_template() {
        let workloads = Workload::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "web", "namespace": "shop" },
            "spec": {
                "selector": { "matchLabels": { "app": "web" } },
                "template": {
                    "metadata": { "annotations": { "a": "b" } },
                    "spec": { "containers": [{ "name": "nginx", "image": "nginx" }] }
                }
            }
        }))
        .unwrap();

        assert_eq!(workloads.len(), 1);
        let deploy = &workloads[0];
        assert_eq!(deploy.kind(), "Deployment");
        assert_eq!(deploy.name(), Some("web"));
        assert_eq!(deploy.namespace(), "shop");
        let template = deploy.pod_template();
        assert_eq!(template.spec.unwrap().containers[0].name, "nginx");
        assert!(template.metadata.unwrap().annotations.is_some());
    }

    #[test]
    fn flattens_lists_and_skips_other_kinds() {
        let workloads = Workload::from_value(json!({
            "apiVersion": "v1",
            "kind": "List",
            "items": [
                { "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "cm" } },
                { "apiVersion": "v1", "kind": "Pod", "metadata": { "name": "p" },
                  "spec": { "containers": [] } },
                { "apiVersion": "batch/v1", "kind": "CronJob", "metadata": { "name": "c" },
                  "spec": { "schedule": "* * * * *", "jobTemplate": { "spec": { "template": {
                      "spec": { "containers": [{ "name": "job" }] } } } } } }
            ]
        }))
        .unwrap();

        let kinds = workloads.iter().map(Workload::kind).collect::<Vec<_>>();
        assert_eq!(kinds, ["Pod", "CronJob"]);
        assert_eq!(workloads[0].namespace(), DEFAULT_NAMESPACE);
        let cron = workloads[1].pod_template();
        assert_eq!(cron.spec.unwrap().containers[0].name, "job");
        assert!(cron.metadata.is_none());
    }

    #[test]
    fn rejects_documents_without_kind() {
        assert!(matches!(
            Workload::from_value(json!({ "metadata": { "name": "x" } })),
            Err(ParseError::MissingKind)
        ));
    }

    #[test]
    fn replica_set_without_template() {
        let rs = Workload::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "ReplicaSet",
            "metadata": {
                "name": "web-5d4f",
                "ownerReferences": [{
                    "apiVersion": "apps/v1",
                    "kind": "Deployment",
                    "name": "web",
                    "uid": "1234",
                    "controller": true
                }]
            },
            "spec": { "selector": {} }
        }))
        .unwrap()
        .remove(0);

        assert!(rs.is_controlled());
        assert!(rs.pod_template().spec.is_none());
    }

    #[test]
    fn custom_resource_owners_do_not_control() {
        let sts = Workload::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": {
                "name": "db",
                "ownerReferences": [{
                    "apiVersion": "example.com/v1",
                    "kind": "Database",
                    "name": "db",
                    "uid": "5678",
                    "controller": true
                }]
            },
            "spec": {
                "selector": {},
                "serviceName": "db",
                "template": { "spec": { "containers": [{ "name": "db" }] } }
            }
        }))
        .unwrap()
        .remove(0);

        assert!(!sts.is_controlled());
    }
}
