use crate::{
    core::{Analysis, Grouping},
    k8s::Workload,
    output::OutputFormat,
    source,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::{io::Write, num::NonZeroUsize, path::PathBuf};
use tokio::task::JoinSet;
use tracing::{debug, info};

#[derive(Debug, Parser)]
#[clap(
    name = "kube-psp-advisor",
    about = "Synthesizes least-privileged PodSecurityPolicies from running workloads",
    version
)]
pub struct Args {
    #[clap(long, default_value = "warn", env = "PSP_ADVISOR_LOG")]
    log_level: kubert::LogFilter,

    #[clap(long, default_value = "plain")]
    log_format: kubert::LogFormat,

    #[clap(flatten)]
    client: kubert::ClientArgs,

    /// Only analyze workloads in this namespace.
    #[clap(long, short = 'n')]
    namespace: Option<String>,

    /// Prints a report of risky settings instead of only the synthesized policies.
    #[clap(long)]
    report: bool,

    /// Embeds the synthesized policies in the report.
    #[clap(long, requires = "report")]
    include_policy: bool,

    /// Synthesizes one policy for the whole cluster or one per namespace.
    #[clap(long, default_value = "cluster")]
    grouping: Grouping,

    /// Reads workloads from manifest files (or directories of manifests) instead of a cluster.
    #[clap(long = "manifest", value_name = "PATH")]
    manifests: Vec<PathBuf>,

    #[clap(long, value_enum, default_value = "yaml")]
    output: OutputFormat,

    /// The number of partitions analyzed in parallel.
    #[clap(long, default_value = "4")]
    workers: NonZeroUsize,
}

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            log_format,
            client,
            namespace,
            report,
            include_policy,
            grouping,
            manifests,
            output,
            workers,
        } = self;

        log_format
            .try_init(log_level)
            .expect("must configure logging");

        let workloads = if manifests.is_empty() {
            let client = client
                .try_client()
                .await
                .context("failed to configure Kubernetes client")?;
            source::list_cluster(client, namespace.as_deref()).await?
        } else {
            let workloads = source::read_manifests(&manifests)?;
            source::in_namespace(workloads, namespace.as_deref())
        };
        info!(workloads = workloads.len(), %grouping, "Analyzing workloads");

        let analysis = analyze(grouping, workloads, workers).await?;
        info!(
            workloads = analysis.workloads(),
            skipped = analysis.skipped(),
            findings = analysis.findings().len(),
            "Analyzed workloads"
        );

        let rendered = if report {
            output.render(&analysis.report(include_policy)?)?
        } else {
            output.render_policies(&analysis.policies()?)?
        };
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(rendered.as_bytes())?;
        stdout.flush()?;
        Ok(())
    }
}

/// Partitions workloads across blocking tasks and merges the partial analyses.
pub(crate) async fn analyze(
    grouping: Grouping,
    workloads: Vec<Workload>,
    workers: NonZeroUsize,
) -> Result<Analysis> {
    let chunk_size = workloads.len().div_ceil(workers.get()).max(1);

    let mut tasks = JoinSet::new();
    let mut workloads = workloads.into_iter().peekable();
    while workloads.peek().is_some() {
        let chunk = workloads.by_ref().take(chunk_size).collect::<Vec<_>>();
        debug!(workloads = chunk.len(), "Spawning partition");
        tasks.spawn_blocking(move || Analysis::from_workloads(grouping, &chunk));
    }

    let mut analysis = Analysis::new(grouping);
    while let Some(partial) = tasks.join_next().await {
        analysis = analysis.merge(partial.context("analysis task failed")?);
    }
    Ok(analysis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::parse_manifests;

    const MANIFESTS: &str = include_str!("../testdata/workloads/deployments.yaml");

    #[test]
    fn parses_flags() {
        let args = Args::try_parse_from([
            "kube-psp-advisor",
            "-n",
            "shop",
            "--report",
            "--include-policy",
            "--grouping",
            "namespace",
            "--manifest",
            "a.yaml",
            "--manifest",
            "dir",
            "--output",
            "json",
            "--workers",
            "2",
        ])
        .unwrap();
        assert_eq!(args.namespace.as_deref(), Some("shop"));
        assert!(args.report && args.include_policy);
        assert_eq!(args.grouping, Grouping::Namespace);
        assert_eq!(args.manifests, [PathBuf::from("a.yaml"), PathBuf::from("dir")]);
        assert_eq!(args.output, OutputFormat::Json);
        assert_eq!(args.workers.get(), 2);

        let args = Args::try_parse_from(["kube-psp-advisor"]).unwrap();
        assert_eq!(args.grouping, Grouping::Cluster);
        assert_eq!(args.output, OutputFormat::Yaml);
        assert!(args.manifests.is_empty());

        assert!(Args::try_parse_from(["kube-psp-advisor", "--include-policy"]).is_err());
        assert!(Args::try_parse_from(["kube-psp-advisor", "--grouping", "pod"]).is_err());
        assert!(Args::try_parse_from(["kube-psp-advisor", "--workers", "0"]).is_err());
    }

    #[tokio::test]
    async fn partitioned_analysis_matches_sequential() {
        let workloads = parse_manifests(MANIFESTS).unwrap();
        assert!(workloads.len() > 2);
        let sequential = Analysis::from_workloads(Grouping::Namespace, &workloads);

        for workers in 1..=workloads.len() + 1 {
            let workers = NonZeroUsize::new(workers).unwrap();
            let analysis = analyze(Grouping::Namespace, workloads.clone(), workers)
                .await
                .unwrap();
            assert_eq!(analysis.aggregator(), sequential.aggregator());
            assert_eq!(
                analysis.report(true).unwrap(),
                sequential.report(true).unwrap()
            );
        }
    }

    #[tokio::test]
    async fn empty_cluster_yields_restrictive_policy() {
        let analysis = analyze(Grouping::Cluster, vec![], NonZeroUsize::MIN)
            .await
            .unwrap();
        let policies = analysis.policies().unwrap();
        assert_eq!(policies.len(), 1);
        assert!(!policies[0].spec.privileged);
        assert_eq!(policies[0].spec.required_drop_capabilities, ["ALL"]);
    }
}
