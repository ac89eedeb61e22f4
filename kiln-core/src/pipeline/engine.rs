// kiln-core/src/pipeline/engine.rs
// Schedules missing dependencies in waves on a JoinSet.

use std::collections::HashSet;

use kiln_common::dependency::{ResolvedDependency, ResolvedGraph};
use kiln_common::error::{KilnError, Result};
use kiln_common::pipeline::PipelineState;
use kiln_net::SourceFetcher;
use tokio::task::JoinSet;
use tracing::{debug, error, instrument};

use super::Pipeline;
use crate::runner::CommandRunner;

/// Installs every missing dependency in `graph`. Each wave holds the
/// dependencies whose own missing dependencies are already installed and runs
/// them concurrently. A failure lets the rest of the wave finish, then aborts.
#[instrument(skip_all, fields(planned = graph.missing_dependencies().count()))]
pub(super) async fn install_dependencies<F, R>(
    pipeline: &Pipeline<F, R>,
    graph: &ResolvedGraph,
) -> Result<()>
where
    F: SourceFetcher,
    R: CommandRunner,
{
    let mut remaining: Vec<ResolvedDependency> = graph.missing_dependencies().cloned().collect();
    if remaining.is_empty() {
        return Ok(());
    }
    let planned: HashSet<String> = remaining.iter().map(|d| d.name.clone()).collect();
    let mut installed: HashSet<String> = HashSet::new();
    let mut wave_number = 0;

    while !remaining.is_empty() {
        pipeline.cancel.check(PipelineState::Pending)?;

        let (ready, blocked): (Vec<_>, Vec<_>) = remaining.into_iter().partition(|dep| {
            dep.dependencies
                .iter()
                .all(|d| !planned.contains(d) || installed.contains(d))
        });
        if ready.is_empty() {
            let stuck: Vec<&str> = blocked.iter().map(|d| d.name.as_str()).collect();
            return Err(KilnError::DependencyResolution(format!(
                "no installable dependency among: {}",
                stuck.join(", ")
            )));
        }
        wave_number += 1;
        debug!(
            "Dependency wave {}: {:?}",
            wave_number,
            ready.iter().map(|d| d.name.as_str()).collect::<Vec<_>>()
        );

        let mut set = JoinSet::new();
        for dep in ready {
            let formula = dep.formula.clone().ok_or_else(|| {
                KilnError::DependencyResolution(format!(
                    "dependency '{}' is planned but has no formula",
                    dep.name
                ))
            })?;
            let pipeline = pipeline.clone();
            set.spawn(async move {
                let name = formula.name.clone();
                let result = pipeline.install_dependency(formula).await;
                (name, result)
            });
        }

        let mut first_failure: Option<KilnError> = None;
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((name, Ok(_))) => {
                    debug!("Dependency '{}' installed", name);
                    installed.insert(name);
                }
                Ok((name, Err(err))) => {
                    error!("Dependency '{}' failed: {}", name, err);
                    first_failure.get_or_insert_with(|| {
                        KilnError::DependencyResolution(format!(
                            "dependency '{name}' failed to install: {err}"
                        ))
                    });
                }
                Err(join_err) => {
                    error!("Dependency task panicked or was aborted: {}", join_err);
                    first_failure.get_or_insert_with(|| {
                        KilnError::DependencyResolution(format!(
                            "dependency install task failed: {join_err}"
                        ))
                    });
                }
            }
        }
        if let Some(err) = first_failure {
            return Err(err);
        }
        remaining = blocked;
    }
    Ok(())
}
