//! Loads workloads from a cluster or from manifest files.

use crate::k8s::{
    CronJob, DaemonSet, Deployment, Job, Pod, ReplicaSet, ReplicationController, StatefulSet,
    Workload,
};
use anyhow::{Context, Result};
use k8s_openapi::NamespaceResourceScope;
use kube::{api::ListParams, Api, Client, Resource};
use serde::{de::DeserializeOwned, Deserialize};
use std::{
    fmt::Debug,
    path::{Path, PathBuf},
};
use tracing::{debug, trace, warn};

const MANIFEST_EXTENSIONS: [&str; 3] = ["yaml", "yml", "json"];

/// Lists every workload in the cluster (or in `namespace`), excluding workloads controlled by
/// another listed workload.
pub async fn list_cluster(client: Client, namespace: Option<&str>) -> Result<Vec<Workload>> {
    let (pods, deployments, daemonsets, statefulsets, replicasets, rcs, jobs, cronjobs) =
        tokio::try_join!(
            list::<Pod>(&client, namespace),
            list::<Deployment>(&client, namespace),
            list::<DaemonSet>(&client, namespace),
            list::<StatefulSet>(&client, namespace),
            list::<ReplicaSet>(&client, namespace),
            list::<ReplicationController>(&client, namespace),
            list::<Job>(&client, namespace),
            list::<CronJob>(&client, namespace),
        )?;

    let workloads = pods
        .into_iter()
        .map(Workload::from)
        .chain(deployments.into_iter().map(Workload::from))
        .chain(daemonsets.into_iter().map(Workload::from))
        .chain(statefulsets.into_iter().map(Workload::from))
        .chain(replicasets.into_iter().map(Workload::from))
        .chain(rcs.into_iter().map(Workload::from))
        .chain(jobs.into_iter().map(Workload::from))
        .chain(cronjobs.into_iter().map(Workload::from));
    Ok(uncontrolled(workloads))
}

async fn list<K>(client: &Client, namespace: Option<&str>) -> Result<Vec<K>>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    K: Clone + Debug + DeserializeOwned,
{
    let api = match namespace {
        Some(ns) => Api::<K>::namespaced(client.clone(), ns),
        None => Api::<K>::all(client.clone()),
    };
    let list = api
        .list(&ListParams::default())
        .await
        .with_context(|| format!("failed to list {}", K::kind(&())))?;
    debug!(kind = %K::kind(&()), items = list.items.len(), "Listed");
    Ok(list.items)
}

/// Drops workloads whose pod template is already described by their controller.
pub fn uncontrolled(workloads: impl IntoIterator<Item = Workload>) -> Vec<Workload> {
    workloads
        .into_iter()
        .filter(|w| {
            let controlled = w.is_controlled();
            if controlled {
                trace!(kind = w.kind(), name = ?w.name(), "Skipping controlled workload");
            }
            !controlled
        })
        .collect()
}

/// Retains the workloads in `namespace`, if one is given.
pub fn in_namespace(workloads: Vec<Workload>, namespace: Option<&str>) -> Vec<Workload> {
    match namespace {
        Some(ns) => workloads
            .into_iter()
            .filter(|w| w.namespace() == ns)
            .collect(),
        None => workloads,
    }
}

/// Reads workloads from manifest files. Directories are searched recursively for YAML and JSON
/// files.
///
/// Controlled workloads are kept: manifests are typically authored, so their owners are not
/// expected to be present.
pub fn read_manifests(paths: &[PathBuf]) -> Result<Vec<Workload>> {
    let mut workloads = Vec::new();
    for path in paths {
        for file in manifest_files(path)? {
            let contents = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let parsed = parse_manifests(&contents)
                .with_context(|| format!("failed to parse {}", file.display()))?;
            debug!(file = %file.display(), workloads = parsed.len(), "Read manifest");
            workloads.extend(parsed);
        }
    }
    Ok(workloads)
}

fn manifest_files(path: &Path) -> Result<Vec<PathBuf>> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut entries = std::fs::read_dir(path)
        .with_context(|| format!("failed to read directory {}", path.display()))?
        .map(|entry| entry.map(|e| e.path()))
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("failed to read directory {}", path.display()))?;
    entries.sort();

    let mut files = Vec::new();
    for entry in entries {
        if entry.is_dir() {
            files.extend(manifest_files(&entry)?);
        } else if entry
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| MANIFEST_EXTENSIONS.contains(&ext))
        {
            files.push(entry);
        } else {
            trace!(path = %entry.display(), "Ignoring non-manifest file");
        }
    }
    Ok(files)
}

/// Parses a (possibly multi-document) YAML or JSON manifest.
///
/// Documents that are not workloads, or that cannot be decoded as one, are skipped.
pub fn parse_manifests(contents: &str) -> Result<Vec<Workload>> {
    let mut workloads = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(contents).enumerate() {
        let value = serde_json::Value::deserialize(document)
            .with_context(|| format!("invalid document at index {}", index))?;
        if value.is_null() {
            continue;
        }
        match Workload::from_value(value) {
            Ok(parsed) => workloads.extend(parsed),
            Err(error) => warn!(%error, index, "Skipping undecodable document"),
        }
    }
    Ok(workloads)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn testdata() -> PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR")).join("testdata/workloads")
    }

    #[test]
    fn parses_multi_document_yaml() {
        let workloads = parse_manifests(
            r#"
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: settings
---
apiVersion: v1
kind: Pod
metadata:
  name: debug
spec:
  containers:
  - name: shell
    image: busybox
---
apiVersion: v1
kind: List
items:
- apiVersion: batch/v1
  kind: Job
  metadata:
    name: migrate
    namespace: shop
  spec:
    template:
      spec:
        restartPolicy: Never
        containers:
        - name: migrate
"#,
        )
        .unwrap();

        let names = workloads
            .iter()
            .map(|w| (w.kind(), w.namespace(), w.name().unwrap()))
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            [("Pod", "default", "debug"), ("Job", "shop", "migrate")]
        );
    }

    #[test]
    fn skips_undecodable_documents() {
        let workloads = parse_manifests(
            r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: broken
spec: 42
---
apiVersion: v1
kind: Pod
metadata:
  name: ok
spec:
  containers: []
"#,
        )
        .unwrap();
        assert_eq!(workloads.len(), 1);
        assert_eq!(workloads[0].name(), Some("ok"));
    }

    #[test]
    fn rejects_invalid_yaml() {
        assert!(parse_manifests("kind: [Pod").is_err());
    }

    #[test]
    fn reads_manifest_directories() {
        let workloads = read_manifests(&[testdata()]).unwrap();
        let names = workloads
            .iter()
            .map(|w| format!("{}/{}/{}", w.namespace(), w.kind(), w.name().unwrap()))
            .collect::<Vec<_>>();
        assert_eq!(
            names,
            [
                "shop/Deployment/web",
                "shop/Deployment/legacy",
                "kube-system/DaemonSet/node-agent",
                "batch/CronJob/report",
                "shop/ReplicaSet/web-7d9f8",
                "batch/Pod/cruncher",
            ]
        );

        let missing = read_manifests(&[testdata().join("missing.yaml")]);
        assert!(missing.is_err());
    }

    #[test]
    fn filters_controlled_and_namespaced_workloads() {
        let workloads = read_manifests(&[testdata()]).unwrap();

        let uncontrolled = uncontrolled(workloads.clone());
        assert_eq!(uncontrolled.len(), workloads.len() - 1);
        assert!(uncontrolled.iter().all(|w| w.kind() != "ReplicaSet"));

        let shop = in_namespace(workloads.clone(), Some("shop"));
        assert_eq!(shop.len(), 3);
        assert!(shop.iter().all(|w| w.namespace() == "shop"));
        assert_eq!(in_namespace(workloads.clone(), None), workloads);
    }
}
