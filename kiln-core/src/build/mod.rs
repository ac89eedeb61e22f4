// kiln-core/src/build/mod.rs
pub mod args;
pub mod env;
pub mod steps;

pub use args::StdBuildArgs;
pub use env::BuildEnvironment;
pub use steps::StepContext;
