#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod psp;
pub mod workload;

pub use self::{
    psp::{PodSecurityPolicy, PodSecurityPolicySpec},
    workload::{ParseError, PodTemplate, Workload},
};
pub use k8s_openapi::{
    api::{
        self,
        apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet},
        batch::v1::{CronJob, Job},
        core::v1::{
            Container, Pod, PodSecurityContext, PodSpec, ReplicationController, SecurityContext,
            Volume,
        },
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};
pub use kube::ResourceExt;
