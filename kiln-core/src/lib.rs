// kiln-core/src/lib.rs
pub mod build;
pub mod cancel;
pub mod fetch;
pub mod install;
pub mod lock;
pub mod pipeline;
pub mod runner;

pub use cancel::CancelSignal;
pub use kiln_net::{HttpFetcher, SourceFetcher};
pub use pipeline::{install_package, Pipeline};
pub use runner::{CommandInvocation, CommandOutput, CommandRunner, InvocationKind, TokioCommandRunner};
