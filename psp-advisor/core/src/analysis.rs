use crate::{
    aggregate::{Grouping, PolicyAggregator},
    classify::{classify, Finding},
    error::SynthesisError,
    extract::extract,
    report::{Report, ReportBuilder},
    synthesize::synthesize,
};
use psp_advisor_k8s_api::{PodSecurityPolicy, Workload};
use tracing::{debug, instrument, warn};

/// Accumulates the aggregates and findings of a set of workloads.
///
/// Analyses over disjoint sets of workloads may be built independently and merged.
#[derive(Clone, Debug)]
pub struct Analysis {
    aggregator: PolicyAggregator,
    findings: Vec<Finding>,
    workloads: usize,
    skipped: usize,
}

// === impl Analysis ===

impl Analysis {
    pub fn new(grouping: Grouping) -> Self {
        Self {
            aggregator: PolicyAggregator::new(grouping),
            findings: Vec::new(),
            workloads: 0,
            skipped: 0,
        }
    }

    pub fn from_workloads<'w>(
        grouping: Grouping,
        workloads: impl IntoIterator<Item = &'w Workload>,
    ) -> Self {
        let mut analysis = Self::new(grouping);
        for workload in workloads {
            analysis.observe(workload);
        }
        analysis
    }

    /// Folds a workload into its scope's aggregate and records its findings.
    ///
    /// Malformed workloads are skipped and reported as an informational finding.
    #[instrument(level = "debug", skip_all, fields(kind = workload.kind()))]
    pub fn observe(&mut self, workload: &Workload) {
        self.workloads += 1;
        match extract(workload) {
            Ok(pod) => {
                self.aggregator.fold(&pod);
                let findings = classify(&pod);
                debug!(workload = %pod.workload, findings = findings.len(), "Observed");
                self.findings.extend(findings);
            }
            Err(error) => {
                warn!(%error, "Skipping malformed workload");
                self.skipped += 1;
                self.findings.push(Finding::skipped(&error));
            }
        }
    }

    pub fn merge(self, other: Self) -> Self {
        let mut findings = self.findings;
        findings.extend(other.findings);
        Self {
            aggregator: self.aggregator.merge(other.aggregator),
            findings,
            workloads: self.workloads + other.workloads,
            skipped: self.skipped + other.skipped,
        }
    }

    pub fn aggregator(&self) -> &PolicyAggregator {
        &self.aggregator
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn workloads(&self) -> usize {
        self.workloads
    }

    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Synthesizes one policy per scope, ordered by scope.
    pub fn policies(&self) -> Result<Vec<PodSecurityPolicy>, SynthesisError> {
        self.aggregator
            .states()
            .map(|(scope, state)| synthesize(&scope.policy_name(), state))
            .collect()
    }

    pub fn report(&self, include_policy: bool) -> Result<Report, SynthesisError> {
        let mut builder = ReportBuilder::default()
            .with_findings(self.findings.iter().cloned())
            .with_workloads(self.workloads)
            .with_skipped(self.skipped);
        if include_policy {
            builder = builder.with_policies(self.policies()?);
        }
        Ok(builder.build())
    }
}
