use crate::{
    classify::{Finding, Severity},
    snapshot::Dimension,
};
use psp_advisor_k8s_api::PodSecurityPolicy;
use serde::Serialize;
use std::{cmp::Reverse, collections::BTreeMap};

/// Counts of findings by severity, and of the workloads they were drawn from.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Summary {
    pub critical: usize,
    pub warning: usize,
    pub info: usize,

    /// Workloads that were analyzed, including skipped ones.
    pub workloads: usize,
    pub skipped: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub summary: Summary,
    pub findings: Vec<Finding>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub policies: Option<Vec<PodSecurityPolicy>>,
}

#[derive(Clone, Debug, Default)]
pub struct ReportBuilder {
    findings: Vec<Finding>,
    workloads: usize,
    skipped: usize,
    policies: Option<Vec<PodSecurityPolicy>>,
}

// === impl Report ===

impl Report {
    /// Groups findings by severity (most severe first) and then by dimension.
    pub fn grouped(&self) -> Vec<(Severity, BTreeMap<Dimension, Vec<&Finding>>)> {
        let mut groups = BTreeMap::<Reverse<Severity>, BTreeMap<_, Vec<_>>>::new();
        for f in self.findings.iter() {
            groups
                .entry(Reverse(f.severity))
                .or_default()
                .entry(f.dimension)
                .or_default()
                .push(f);
        }
        groups
            .into_iter()
            .map(|(Reverse(severity), dims)| (severity, dims))
            .collect()
    }
}

// === impl ReportBuilder ===

impl ReportBuilder {
    pub fn with_findings(mut self, findings: impl IntoIterator<Item = Finding>) -> Self {
        self.findings.extend(findings);
        self
    }

    pub fn with_workloads(mut self, workloads: usize) -> Self {
        self.workloads = workloads;
        self
    }

    pub fn with_skipped(mut self, skipped: usize) -> Self {
        self.skipped = skipped;
        self
    }

    pub fn with_policies(mut self, policies: impl IntoIterator<Item = PodSecurityPolicy>) -> Self {
        self.policies = Some(policies.into_iter().collect());
        self
    }

    pub fn build(self) -> Report {
        let Self {
            mut findings,
            workloads,
            skipped,
            policies,
        } = self;

        findings.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| a.dimension.cmp(&b.dimension))
                .then_with(|| a.source.cmp(&b.source))
                .then_with(|| a.container.cmp(&b.container))
                .then_with(|| a.message.cmp(&b.message))
        });

        let mut summary = Summary {
            workloads,
            skipped,
            ..Summary::default()
        };
        for f in findings.iter() {
            match f.severity {
                Severity::Critical => summary.critical += 1,
                Severity::Warning => summary.warning += 1,
                Severity::Info => summary.info += 1,
            }
        }

        Report {
            summary,
            findings,
            policies,
        }
    }
}
