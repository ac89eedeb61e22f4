// kiln-core/src/pipeline/worker.rs
// The per-package phases, from fetching to the self-test.

use std::fs;
use std::path::{Path, PathBuf};

use kiln_aio::extract::{extract_archive, extract_archive_async, ArchiveType};
use kiln_aio::fs::{list_files_relative, remove_path_if_exists};
use kiln_common::config::Config;
use kiln_common::dependency::ResolvedGraph;
use kiln_common::error::{KilnError, Result};
use kiln_common::model::artifact::{InstalledArtifact, ReleaseLayout};
use kiln_common::model::formula::{BuildPhase, FormulaRecord, InstallStep, TestInvocation};
use kiln_common::pipeline::{PipelineError, PipelineEvent, PipelineState};
use kiln_net::SourceFetcher;
use tempfile::TempDir;
use tracing::{debug, error, info, instrument, warn};

use super::{at, Pipeline};
use crate::build::{BuildEnvironment, StdBuildArgs, StepContext};
use crate::fetch::{fetch_archive, verify_and_persist};
use crate::install::{link_keg, write_receipt, LinkReport};
use crate::lock::lock_prefix;
use crate::runner::{CommandInvocation, CommandRunner, InvocationKind};

// Everything a phase needs to run a formula's commands.
struct BuildContext<'a> {
    name: &'a str,
    steps: &'a [InstallStep],
    ctx: StepContext,
    std_args: StdBuildArgs,
    env: BuildEnvironment,
}

#[instrument(skip_all, fields(formula = %record.name))]
pub(super) async fn build_package<F, R>(
    pipeline: &Pipeline<F, R>,
    record: &FormulaRecord,
    graph: &ResolvedGraph,
) -> std::result::Result<InstalledArtifact, PipelineError>
where
    F: SourceFetcher,
    R: CommandRunner,
{
    let name = record.name.as_str();
    let config = pipeline.config();
    let keg_path = config.formula_keg_path(name, &record.version);

    pipeline.enter(name, PipelineState::Fetching)?;
    let fetched = fetch_archive(
        pipeline.fetcher.as_ref(),
        record,
        &config.downloads_dir(),
        &pipeline.event_tx,
    )
    .await
    .map_err(at(name, PipelineState::Fetching))?;

    pipeline.enter(name, PipelineState::Verifying)?;
    let verifying = at(name, PipelineState::Verifying);
    let archive = verify_and_persist(fetched, record).await.map_err(&verifying)?;
    let work_dir = create_work_dir(config, record).map_err(&verifying)?;
    let source_dir = work_dir.path().join("source");
    let kind = extract_archive_async(&archive, &source_dir)
        .await
        .map_err(&verifying)?;
    debug!("[{}] Extracted {} archive into {}", name, kind, source_dir.display());
    let layout = ReleaseLayout::detect(&source_dir);

    if let ReleaseLayout::WithEmbeddedData { member } = &layout {
        pipeline.enter(name, PipelineState::Unpacking)?;
        unpack_embedded(&source_dir, member)
            .await
            .map_err(at(name, PipelineState::Unpacking))?;
    }

    let dep_paths = dependency_opt_paths(graph);
    let steps = record.install_steps();
    let build = BuildContext {
        name,
        steps: &steps,
        ctx: StepContext::new(&keg_path, &source_dir, config.make_jobs),
        std_args: StdBuildArgs::new(&keg_path, config.make_jobs).with_prefix_path(&dep_paths),
        env: BuildEnvironment::new(config.kiln_root(), &dep_paths, config.make_jobs)
            .map_err(at(name, PipelineState::Configuring))?,
    };

    for (phase, state) in [
        (BuildPhase::Configure, PipelineState::Configuring),
        (BuildPhase::Build, PipelineState::Building),
    ] {
        pipeline.enter(name, state)?;
        run_phase(pipeline, &build, phase).await.map_err(at(name, state))?;
    }

    pipeline.enter(name, PipelineState::Installing)?;
    let (files, link) = install_keg(pipeline, &build, record, &keg_path, &layout)
        .await
        .map_err(at(name, PipelineState::Installing))?;

    let mut warnings = Vec::new();
    for message in link.warnings {
        pipeline.warn_event(name, message.clone());
        warnings.push(message);
    }

    let mut verification_errors = Vec::new();
    match &record.test {
        Some(test) if !config.skip_test => {
            if let Err(err) = self_test(pipeline, &build, test, work_dir.path()).await {
                pipeline.warn_event(name, format!("self-test failed: {err}"));
                verification_errors.push(err);
            }
        }
        Some(_) => debug!("[{}] Self-test disabled by configuration", name),
        None => {}
    }

    if config.keep_build_dir {
        let kept = work_dir.keep();
        info!("[{}] Kept build directory {}", name, kept.display());
    }

    pipeline.emit_state(name, PipelineState::Installed);
    Ok(InstalledArtifact {
        name: record.name.clone(),
        version: record.version.clone(),
        keg_path,
        opt_path: link.opt_path,
        files,
        layout,
        linked_executables: link.linked_executables,
        caveats: record
            .caveats
            .as_deref()
            .map(|c| build.ctx.render_caveats(c)),
        verification_errors,
        warnings,
    })
}

fn create_work_dir(config: &Config, record: &FormulaRecord) -> Result<TempDir> {
    let tmp_root = config.tmp_dir();
    fs::create_dir_all(&tmp_root)?;
    let dir = tempfile::Builder::new()
        .prefix(&format!("{}-{}-", record.name, record.version))
        .tempdir_in(&tmp_root)?;
    debug!("Working tree for {} at {}", record.name, dir.path().display());
    Ok(dir)
}

// Build and runtime dependency opt paths, deduplicated, build paths first.
fn dependency_opt_paths(graph: &ResolvedGraph) -> Vec<PathBuf> {
    let mut paths = graph.build_dependency_opt_paths.clone();
    for path in &graph.runtime_dependency_opt_paths {
        if !paths.contains(path) {
            paths.push(path.clone());
        }
    }
    paths
}

/// Extracts the embedded data archive into the source root, as-is.
async fn unpack_embedded(source_dir: &Path, member: &str) -> Result<()> {
    let data = source_dir.join(member);
    let target = source_dir.to_path_buf();
    debug!("Unpacking embedded {} into {}", data.display(), target.display());
    tokio::task::spawn_blocking(move || {
        let kind = ArchiveType::detect(&data)?;
        extract_archive(&data, &target, 0, kind)
    })
    .await
    .map_err(|e| KilnError::Unpack(format!("embedded data extraction task failed: {e}")))?
}

async fn run_phase<F, R>(
    pipeline: &Pipeline<F, R>,
    build: &BuildContext<'_>,
    phase: BuildPhase,
) -> Result<()>
where
    F: SourceFetcher,
    R: CommandRunner,
{
    for step in build.steps.iter().filter(|s| s.phase == phase) {
        let command = build.ctx.expand_command(&step.command, &build.std_args);
        let invocation = CommandInvocation::from_command(
            command,
            &build.ctx.source_dir,
            build.env.vars(),
            InvocationKind::Step(phase),
        )?;
        debug!("[{}] {} step: {}", build.name, phase, invocation);
        pipeline.send(PipelineEvent::StepStarted {
            target_id: build.name.to_string(),
            command: invocation.to_string(),
        });

        let output = pipeline.runner.run(&invocation).await?;
        if !output.success() {
            error!(
                "[{}] {} step '{}' exited with {:?}",
                build.name, phase, invocation, output.code
            );
            return Err(KilnError::Build {
                phase,
                code: output.code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
    }
    Ok(())
}

/// Runs the install steps into a fresh keg under the prefix lock, then writes
/// the receipt and links. Any failure removes the keg.
async fn install_keg<F, R>(
    pipeline: &Pipeline<F, R>,
    build: &BuildContext<'_>,
    record: &FormulaRecord,
    keg_path: &Path,
    layout: &ReleaseLayout,
) -> Result<(Vec<PathBuf>, LinkReport)>
where
    F: SourceFetcher,
    R: CommandRunner,
{
    let config = pipeline.config();
    let _prefix_guard = lock_prefix(config.kiln_root()).await;

    remove_path_if_exists(keg_path)?;
    if let Some(parent) = keg_path.parent() {
        fs::create_dir_all(parent)?;
    }

    let result = async {
        run_phase(pipeline, build, BuildPhase::Install).await?;
        let files = if keg_path.is_dir() {
            list_files_relative(keg_path)?
        } else {
            Vec::new()
        };
        if files.is_empty() {
            return Err(KilnError::Install(format!(
                "install steps left {} empty",
                keg_path.display()
            )));
        }
        write_receipt(keg_path, record, layout, &files)?;
        let link = link_keg(config, &record.name, keg_path)?;
        Ok::<_, KilnError>((files, link))
    }
    .await;

    if let Err(err) = &result {
        error!("[{}] Install failed, removing {}: {}", record.name, keg_path.display(), err);
        if let Err(rm_err) = remove_path_if_exists(keg_path) {
            warn!("[{}] Could not remove {}: {}", record.name, keg_path.display(), rm_err);
        }
    }
    result
}

/// Runs the test invocation. Any failure, including failing to start the
/// command, comes back as `Verification`.
async fn self_test<F, R>(
    pipeline: &Pipeline<F, R>,
    build: &BuildContext<'_>,
    test: &TestInvocation,
    cwd: &Path,
) -> Result<()>
where
    F: SourceFetcher,
    R: CommandRunner,
{
    let spawn_failure = |e: KilnError| KilnError::Verification {
        code: None,
        output: e.to_string(),
    };
    let command = test.command.iter().map(|arg| build.ctx.expand(arg)).collect();
    let invocation =
        CommandInvocation::from_command(command, cwd, build.env.vars(), InvocationKind::SelfTest)
            .map_err(spawn_failure)?;
    debug!("[{}] self-test: {}", build.name, invocation);
    pipeline.send(PipelineEvent::StepStarted {
        target_id: build.name.to_string(),
        command: invocation.to_string(),
    });

    let output = pipeline
        .runner
        .run(&invocation)
        .await
        .map_err(spawn_failure)?;
    if output.success() {
        return Ok(());
    }
    let mut combined = output.stdout;
    if !output.stderr.is_empty() {
        if !combined.is_empty() && !combined.ends_with('\n') {
            combined.push('\n');
        }
        combined.push_str(&output.stderr);
    }
    Err(KilnError::Verification {
        code: output.code,
        output: combined,
    })
}
