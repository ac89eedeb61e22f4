// kiln-common/src/model/mod.rs
pub mod artifact;
pub mod formula;
pub mod history;
pub mod version;

pub use artifact::{InstallReceipt, InstalledArtifact, ReleaseLayout};
pub use formula::{BuildPhase, FormulaId, FormulaRecord, InstallStep, TestInvocation};
pub use history::VersionHistory;
