// Test doubles and fixtures shared by the pipeline integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::future::Future;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use flate2::write::GzEncoder;
use flate2::Compression;
use kiln_aio::checksum::sha256_bytes;
use kiln_aio::fs::list_files_relative;
use kiln_common::config::Config;
use kiln_common::error::{KilnError, Result};
use kiln_common::formulary::Formulary;
use kiln_common::model::formula::{BuildPhase, FormulaRecord, InstallStep, TestInvocation};
use kiln_common::pipeline::{PipelineEvent, PipelineState};
use kiln_core::{
    CancelSignal, CommandInvocation, CommandOutput, CommandRunner, InvocationKind, Pipeline,
    SourceFetcher,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

/// Serves archives from memory and records every requested URL.
#[derive(Clone, Default)]
pub struct StaticFetcher {
    bodies: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl StaticFetcher {
    pub fn serve(&self, url: &str, body: Vec<u8>) {
        self.bodies.lock().unwrap().insert(url.to_string(), body);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl SourceFetcher for StaticFetcher {
    fn fetch(&self, url: &str, dest: &Path) -> impl Future<Output = Result<u64>> + Send {
        async move {
            self.requests.lock().unwrap().push(url.to_string());
            let body = self.bodies.lock().unwrap().get(url).cloned();
            match body {
                Some(bytes) => {
                    tokio::fs::write(dest, &bytes).await?;
                    Ok(bytes.len() as u64)
                }
                None => Err(KilnError::Fetch {
                    url: url.to_string(),
                    reason: "HTTP status 404 Not Found".to_string(),
                }),
            }
        }
    }
}

#[derive(Default)]
struct RunnerState {
    invocations: Vec<CommandInvocation>,
    source_listings: Vec<Vec<PathBuf>>,
    fail_phase: Option<(BuildPhase, CommandOutput)>,
    fail_self_test: Option<CommandOutput>,
    cancel_after: Option<(BuildPhase, CancelSignal)>,
    install_nothing: bool,
}

/// Stands in for CMake. Records every invocation, and on
/// `cmake --install build --prefix <keg>` populates the keg with
/// `bin/<name>` and `share/<name>/README`.
#[derive(Clone, Default)]
pub struct RecordingRunner {
    state: Arc<Mutex<RunnerState>>,
}

impl RecordingRunner {
    pub fn fail_phase(&self, phase: BuildPhase, code: i32, stdout: &str, stderr: &str) {
        self.state.lock().unwrap().fail_phase = Some((
            phase,
            CommandOutput {
                code: Some(code),
                stdout: stdout.to_string(),
                stderr: stderr.to_string(),
            },
        ));
    }

    pub fn fail_self_test(&self, code: i32, stderr: &str) {
        self.state.lock().unwrap().fail_self_test = Some(CommandOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        });
    }

    pub fn cancel_after(&self, phase: BuildPhase, signal: CancelSignal) {
        self.state.lock().unwrap().cancel_after = Some((phase, signal));
    }

    pub fn install_nothing(&self) {
        self.state.lock().unwrap().install_nothing = true;
    }

    pub fn invocations(&self) -> Vec<CommandInvocation> {
        self.state.lock().unwrap().invocations.clone()
    }

    pub fn phases(&self) -> Vec<InvocationKind> {
        self.invocations().iter().map(|i| i.kind).collect()
    }

    /// Source tree contents seen at each configure step.
    pub fn source_listings(&self) -> Vec<Vec<PathBuf>> {
        self.state.lock().unwrap().source_listings.clone()
    }

    fn respond(&self, invocation: &CommandInvocation) -> std::io::Result<CommandOutput> {
        let mut state = self.state.lock().unwrap();
        state.invocations.push(invocation.clone());

        let phase = match invocation.kind {
            InvocationKind::SelfTest => {
                return Ok(state.fail_self_test.clone().unwrap_or_else(ok_output));
            }
            InvocationKind::Step(phase) => phase,
        };

        if let Some((failing, output)) = &state.fail_phase {
            if *failing == phase {
                return Ok(output.clone());
            }
        }
        if let Some((cancel_phase, signal)) = &state.cancel_after {
            if *cancel_phase == phase {
                signal.cancel();
            }
        }

        match phase {
            BuildPhase::Configure => {
                let listing = list_files_relative(&invocation.cwd).unwrap_or_default();
                state.source_listings.push(listing);
            }
            BuildPhase::Install if !state.install_nothing => {
                if let Some(keg) = prefix_arg(&invocation.args) {
                    populate_keg(&keg)?;
                }
            }
            _ => {}
        }
        Ok(ok_output())
    }
}

impl CommandRunner for RecordingRunner {
    fn run(
        &self,
        invocation: &CommandInvocation,
    ) -> impl Future<Output = Result<CommandOutput>> + Send {
        let response = self.respond(invocation).map_err(KilnError::from);
        async move { response }
    }
}

fn ok_output() -> CommandOutput {
    CommandOutput {
        code: Some(0),
        stdout: String::new(),
        stderr: String::new(),
    }
}

fn prefix_arg(args: &[String]) -> Option<PathBuf> {
    args.iter()
        .position(|a| a == "--prefix")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
}

fn populate_keg(keg: &Path) -> std::io::Result<()> {
    let name = keg
        .parent()
        .and_then(|p| p.file_name())
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tool".to_string());
    let bin = keg.join("bin").join(&name);
    fs::create_dir_all(bin.parent().unwrap())?;
    fs::write(&bin, "#!/bin/sh\necho ok\n")?;
    fs::set_permissions(&bin, fs::Permissions::from_mode(0o755))?;
    let share = keg.join("share").join(&name);
    fs::create_dir_all(&share)?;
    fs::write(share.join("README"), "installed by test\n")?;
    Ok(())
}

/// A gzip tarball with every file under a single `root/` directory.
pub fn source_tarball(root: &str, files: &[(&str, &[u8])]) -> Vec<u8> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, format!("{root}/{path}"), *data)
            .unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

/// An uncompressed tar with entries at its top level, as embedded `data.tar` members are.
pub fn plain_tar(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, path, *data).unwrap();
    }
    builder.into_inner().unwrap()
}

pub fn cmake_project(name: &str) -> Vec<u8> {
    let cmake = format!("cmake_minimum_required(VERSION 3.16)\nproject({name})\n");
    source_tarball(
        &format!("{name}-src"),
        &[
            ("CMakeLists.txt", cmake.as_bytes()),
            ("src/main.c", b"int main(void){return 0;}\n".as_slice()),
        ],
    )
}

pub fn url_for(name: &str, version: &str) -> String {
    format!("https://downloads.example.test/{name}/{name}-{version}.tar.gz")
}

pub fn record(name: &str, version: &str, archive: &[u8]) -> FormulaRecord {
    FormulaRecord {
        name: name.to_string(),
        version: version.to_string(),
        desc: Some(format!("{name} for tests")),
        homepage: None,
        url: url_for(name, version),
        sha256: sha256_bytes(archive),
        build_dependencies: vec![],
        runtime_dependencies: vec![],
        install: Some(vec![
            InstallStep::new(
                BuildPhase::Configure,
                &["cmake", "-S", ".", "-B", "build", "{std_cmake_args}"],
            ),
            InstallStep::new(BuildPhase::Build, &["cmake", "--build", "build"]),
            InstallStep::new(
                BuildPhase::Install,
                &["cmake", "--install", "build", "--prefix", "{prefix}"],
            ),
        ]),
        test: Some(TestInvocation {
            command: vec![format!("{{bin}}/{name}"), "--version".to_string()],
        }),
        caveats: None,
    }
}

pub struct Harness {
    pub root: TempDir,
    pub config: Config,
    pub formulary: Arc<Formulary>,
    pub fetcher: StaticFetcher,
    pub runner: RecordingRunner,
}

impl Harness {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        let mut config = Config::with_root(root.path());
        config.make_jobs = 2;
        Self {
            root,
            config,
            formulary: Arc::new(Formulary::new()),
            fetcher: StaticFetcher::default(),
            runner: RecordingRunner::default(),
        }
    }

    /// Publishes `record` and serves `archive` at its URL.
    pub fn publish(&self, record: FormulaRecord, archive: Vec<u8>) -> Arc<FormulaRecord> {
        self.fetcher.serve(&record.url, archive);
        self.formulary.publish(record).unwrap()
    }

    /// Publishes a buildable CMake package with the given dependencies.
    pub fn package(&self, name: &str, build_deps: &[&str], runtime_deps: &[&str]) -> Arc<FormulaRecord> {
        let archive = cmake_project(name);
        let mut r = record(name, "1.0.0", &archive);
        r.build_dependencies = build_deps.iter().map(|s| s.to_string()).collect();
        r.runtime_dependencies = runtime_deps.iter().map(|s| s.to_string()).collect();
        self.publish(r, archive)
    }

    pub fn pipeline(&self) -> Pipeline<StaticFetcher, RecordingRunner> {
        Pipeline::with_parts(
            self.config.clone(),
            Arc::clone(&self.formulary),
            self.fetcher.clone(),
            self.runner.clone(),
        )
    }
}

/// Every event already sent on `rx`.
pub fn drain(rx: &mut broadcast::Receiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// The state changes reported for `target`, in order.
pub fn states_for(events: &[PipelineEvent], target: &str) -> Vec<PipelineState> {
    events
        .iter()
        .filter_map(|e| match e {
            PipelineEvent::StateChanged { target_id, state } if target_id == target => Some(*state),
            _ => None,
        })
        .collect()
}
