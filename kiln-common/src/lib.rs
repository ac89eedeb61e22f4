// kiln-common/src/lib.rs
pub mod config;
pub mod dependency;
pub mod error;
pub mod formula_dsl;
pub mod formulary;
pub mod keg;
pub mod model;
pub mod pipeline;

pub use config::Config;
pub use error::{KilnError, Result};
pub use formulary::Formulary;
pub use model::{FormulaRecord, InstalledArtifact};
pub use pipeline::{PipelineError, PipelineEvent, PipelineState};
