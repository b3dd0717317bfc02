//! PodSecurityPolicy advisor core
//!
//! The advisor observes the security-relevant configuration of a population of workloads and
//! synthesizes the least-privileged `PodSecurityPolicy` that would admit all of them, along with
//! a report of the risky settings it found.
//!
//! ```text
//! [ Workload ] -> extract -> [ PodLevelSnapshot ] -+-> fold -> [ AggregatedPolicyState ] -> synthesize
//!                                                   \
//!                                                    +-> classify -> [ Finding ] -> report
//! ```
//!
//! Each workload is projected once onto a closed snapshot of security dimensions. Snapshots are
//! folded into one aggregate per scope through per-dimension join operations; because each join
//! is commutative, associative and idempotent, partial aggregates computed over disjoint sets of
//! workloads may be merged in any order to the same result. Findings are computed per snapshot
//! and never depend on the fold.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod aggregate;
mod analysis;
pub mod classify;
mod error;
pub mod extract;
pub mod lattice;
pub mod report;
pub mod snapshot;
pub mod synthesize;


pub use self::{
    aggregate::{AggregatedPolicyState, Grouping, PolicyAggregator, ScopeKey},
    analysis::Analysis,
    classify::{classify, Finding, Severity},
    error::{MalformedSpecError, SynthesisError},
    extract::extract,
    lattice::Join,
    report::{Report, ReportBuilder, Summary},
    snapshot::{
        Capability, ContainerKind, ContainerSecuritySnapshot, Dimension, PodLevelSnapshot,
        ProcMountType, Profile, SeLinuxLabel, VolumeType, WorkloadRef,
    },
    synthesize::synthesize,
};
pub use psp_advisor_k8s_api as k8s;
