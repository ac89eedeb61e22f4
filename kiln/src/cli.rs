// kiln/src/cli.rs
//! Defines the command-line argument structure using clap.
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use kiln_common::config::Config;
use kiln_common::error::Result;
use kiln_core::CancelSignal;

pub mod history;
pub mod info;
pub mod install;
pub mod list;
pub mod status;

use crate::cli::history::History;
use crate::cli::info::Info;
use crate::cli::install::InstallArgs;
use crate::cli::list::List;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None, name = "kiln", bin_name = "kiln")]
#[command(propagate_version = true)]
pub struct CliArgs {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Install prefix, overriding KILN_PREFIX
    #[arg(long, global = true, value_name = "DIR")]
    pub prefix: Option<PathBuf>,

    /// Parallel build jobs, overriding KILN_MAKE_JOBS
    #[arg(long, short = 'j', global = true, value_name = "N")]
    pub jobs: Option<usize>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Install(InstallArgs),
    Info(Info),
    List(List),
    History(History),
}

impl Command {
    pub async fn run(&self, config: Config, cancel: CancelSignal) -> Result<()> {
        match self {
            Self::Install(command) => command.run(config, cancel).await,
            Self::Info(command) => command.run(&config),
            Self::List(command) => command.run(&config),
            Self::History(command) => command.run(&config),
        }
    }
}
