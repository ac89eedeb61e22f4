// kiln-core/src/pipeline/mod.rs
// The fetch, verify, build and install pipeline.

mod engine;
mod worker;

use std::path::Path;
use std::sync::Arc;

use kiln_common::config::Config;
use kiln_common::dependency::{DependencyResolver, ResolutionContext, ResolvedGraph};
use kiln_common::error::{KilnError, Result};
use kiln_common::formulary::Formulary;
use kiln_common::keg::KegRegistry;
use kiln_common::model::artifact::InstalledArtifact;
use kiln_common::model::formula::FormulaRecord;
use kiln_common::pipeline::{PipelineError, PipelineEvent, PipelineState};
use kiln_net::{HttpFetcher, SourceFetcher};
use tokio::sync::broadcast;
use tracing::{debug, error, instrument, warn};

use crate::cancel::CancelSignal;
use crate::runner::{CommandRunner, TokioCommandRunner};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Installs formulae under one prefix. Cheap to clone; clones share the
/// fetcher, runner, event channel and cancel signal.
pub struct Pipeline<F = HttpFetcher, R = TokioCommandRunner> {
    config: Arc<Config>,
    formulary: Arc<Formulary>,
    fetcher: Arc<F>,
    runner: Arc<R>,
    event_tx: broadcast::Sender<PipelineEvent>,
    cancel: CancelSignal,
}

impl<F, R> Clone for Pipeline<F, R> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            formulary: Arc::clone(&self.formulary),
            fetcher: Arc::clone(&self.fetcher),
            runner: Arc::clone(&self.runner),
            event_tx: self.event_tx.clone(),
            cancel: self.cancel.clone(),
        }
    }
}

impl Pipeline<HttpFetcher, TokioCommandRunner> {
    /// A pipeline that downloads over HTTPS and runs real build tools.
    pub fn new(config: Config, formulary: Arc<Formulary>) -> Result<Self> {
        Ok(Self::with_parts(
            config,
            formulary,
            HttpFetcher::new()?,
            TokioCommandRunner,
        ))
    }
}

impl<F: SourceFetcher, R: CommandRunner> Pipeline<F, R> {
    pub fn with_parts(config: Config, formulary: Arc<Formulary>, fetcher: F, runner: R) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            config: Arc::new(config),
            formulary,
            fetcher: Arc::new(fetcher),
            runner: Arc::new(runner),
            event_tx,
            cancel: CancelSignal::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn formulary(&self) -> &Formulary {
        &self.formulary
    }

    /// Resolves dependencies, installs whatever is missing, then fetches,
    /// verifies, builds and installs `record`. Nothing is retried.
    #[instrument(skip_all, fields(formula = %record.name, version = %record.version))]
    pub async fn install_package(
        &self,
        record: Arc<FormulaRecord>,
    ) -> std::result::Result<InstalledArtifact, PipelineError> {
        let name = record.name.as_str();
        self.emit_state(name, PipelineState::Pending);

        let outcome = async {
            let pending = at(name, PipelineState::Pending);
            let validation_warnings = record.validate().map_err(&pending)?;
            for warning in &validation_warnings {
                self.warn_event(name, warning.clone());
            }

            let graph = self.resolve(&record).map_err(&pending)?;
            for dep in graph.missing_dependencies() {
                self.send(PipelineEvent::DependencyPlanned {
                    target_id: name.to_string(),
                    dependency: dep.name.clone(),
                });
            }
            engine::install_dependencies(self, &graph)
                .await
                .map_err(&pending)?;

            let mut artifact = worker::build_package(self, &record, &graph).await?;
            artifact.warnings.splice(0..0, validation_warnings);
            Ok::<_, PipelineError>(artifact)
        }
        .await;

        self.finish(name, outcome)
    }

    /// Runs the phases for a dependency whose own dependencies are already in place.
    async fn install_dependency(
        &self,
        record: Arc<FormulaRecord>,
    ) -> std::result::Result<InstalledArtifact, PipelineError> {
        let name = record.name.as_str();
        self.emit_state(name, PipelineState::Pending);
        let outcome = async {
            let graph = self
                .resolve(&record)
                .map_err(at(name, PipelineState::Pending))?;
            worker::build_package(self, &record, &graph).await
        }
        .await;
        self.finish(name, outcome)
    }

    fn resolve(&self, record: &Arc<FormulaRecord>) -> Result<ResolvedGraph> {
        let keg_registry = KegRegistry::new(self.config.as_ref().clone());
        let mut resolver = DependencyResolver::new(ResolutionContext {
            formulary: &self.formulary,
            keg_registry: &keg_registry,
        });
        resolver.resolve(record)
    }

    fn finish(
        &self,
        name: &str,
        outcome: std::result::Result<InstalledArtifact, PipelineError>,
    ) -> std::result::Result<InstalledArtifact, PipelineError> {
        match &outcome {
            Ok(artifact) => {
                self.send(PipelineEvent::JobSuccess {
                    target_id: name.to_string(),
                    version: artifact.version.clone(),
                });
            }
            Err(err) => {
                error!("{}", err);
                self.emit_state(name, PipelineState::Failed);
                self.send(PipelineEvent::job_failed(err));
            }
        }
        outcome
    }

    fn send(&self, event: PipelineEvent) {
        // No subscribers is fine.
        let _ = self.event_tx.send(event);
    }

    fn emit_state(&self, name: &str, state: PipelineState) {
        debug!("[{}] entering {}", name, state);
        self.send(PipelineEvent::StateChanged {
            target_id: name.to_string(),
            state,
        });
    }

    /// Checks for cancellation, then announces `state`.
    fn enter(&self, name: &str, state: PipelineState) -> std::result::Result<(), PipelineError> {
        self.cancel.check(state).map_err(at(name, state))?;
        self.emit_state(name, state);
        Ok(())
    }

    fn warn_event(&self, name: &str, message: String) {
        warn!("[{}] {}", name, message);
        self.send(PipelineEvent::LogWarn {
            target_id: name.to_string(),
            message,
        });
    }
}

/// Installs `record` under `prefix` with the default HTTPS fetcher and
/// process runner. Dependencies come from `<prefix>/Formula`.
pub async fn install_package(
    record: FormulaRecord,
    prefix: &Path,
) -> std::result::Result<InstalledArtifact, PipelineError> {
    let name = record.name.clone();
    let pending = at(&name, PipelineState::Pending);

    let config = Config::with_root(prefix);
    let formulary = Formulary::load(&config).map_err(&pending)?;
    let record = formulary
        .publish(record.normalized().map_err(&pending)?)
        .map_err(&pending)?;
    let pipeline = Pipeline::new(config, Arc::new(formulary)).map_err(&pending)?;
    pipeline.install_package(record).await
}

pub(crate) fn at(name: &str, state: PipelineState) -> impl Fn(KilnError) -> PipelineError + '_ {
    move |source| PipelineError::new(name, state, source)
}
