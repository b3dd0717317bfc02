use crate::snapshot::{Capability, Dimension, WorkloadRef};
use thiserror::Error;

/// A workload violates a structural precondition and cannot be projected onto a snapshot.
///
/// The offending workload is skipped; the rest of the run continues.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum MalformedSpecError {
    #[error("{namespace}/{kind} has no name")]
    MissingName {
        namespace: String,
        kind: &'static str,
    },

    #[error("{workload} has no pod spec")]
    MissingPodSpec { workload: WorkloadRef },

    #[error("{workload} has an unnamed container at index {index}")]
    MissingContainerName { workload: WorkloadRef, index: usize },

    #[error("{workload}: {field} must not be negative, got {value}")]
    NegativeId {
        workload: WorkloadRef,
        field: &'static str,
        value: i64,
    },

    #[error("{workload}: container {container} declares invalid host port {port}")]
    InvalidHostPort {
        workload: WorkloadRef,
        container: String,
        port: i32,
    },
}

/// An aggregate state violates an invariant that the merge rules are expected to maintain.
///
/// This indicates a defect rather than bad input, so it is never recovered from.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SynthesisError {
    #[error("{dimension} range is inverted: {min} > {max}")]
    InvertedRange {
        dimension: Dimension,
        min: i64,
        max: i64,
    },

    #[error("{dimension} includes negative id {value}")]
    NegativeId { dimension: Dimension, value: i64 },

    #[error("capability {0} is both allowed and required to be dropped")]
    CapabilityConflict(Capability),

    #[error("allowed host path has an empty prefix")]
    EmptyHostPath,
}

// === impl MalformedSpecError ===

impl MalformedSpecError {
    /// The workload the error applies to. Unnamed workloads are reported with a placeholder name.
    pub fn workload(&self) -> WorkloadRef {
        match self {
            Self::MissingName { namespace, kind } => WorkloadRef::new(namespace, kind, "<unnamed>"),
            Self::MissingPodSpec { workload }
            | Self::MissingContainerName { workload, .. }
            | Self::NegativeId { workload, .. }
            | Self::InvalidHostPort { workload, .. } => workload.clone(),
        }
    }
}
