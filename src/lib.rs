use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser, Subcommand};

pub use command::{Backend, Command, Lifecycle};
pub use config::EngineConfig;
pub use demarcator::{Diagnostic, DiagnosticKind, Response, Status};
pub use error::{Error, Result};
pub use outcome::{Outcome, Verdict};
pub use session::{ScriptOutcome, Session};
pub use simulation::{Heuristic, SimulationHeuristic, SimulationRun};
pub use trace::{StateSnapshot, Trace, Value};

pub mod channel;
pub mod command;
pub mod config;
pub mod demarcator;
mod error;
pub mod logger;
pub mod outcome;
pub mod process;
#[cfg(test)]
mod scripted;
mod sequencer;
pub mod session;
pub mod simulation;
pub mod trace;

#[derive(Parser, Debug, Clone)]
#[command(version, about = "Drive the nuXmv console from scripts", long_about = None)]
pub struct RxmvOptions {
    /// YAML engine configuration.
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Seconds to wait for each engine answer (0 for no limit).
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Print results as JSON.
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// More logging; repeat for more.
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Prefix log lines with their source location.
    #[arg(long, default_value_t = false)]
    pub line_numbers: bool,

    #[command(subcommand)]
    pub task: Task,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Task {
    /// Interactive SMT based simulation.
    Simulate {
        model: PathBuf,
        #[arg(long, value_enum, default_value_t = Heuristic::Random)]
        heuristic: Heuristic,
        /// Seed for random choices (system entropy when unset).
        #[arg(long)]
        seed: Option<u64>,
        /// Simulation bound (0 for no bound).
        #[arg(short = 'k', long, default_value_t = 10)]
        steps: usize,
        /// Constraint every chosen state has to satisfy.
        #[arg(short, long, default_value = "TRUE")]
        constraint: String,
    },
    /// Check LTL properties with IC3.
    Ic3 {
        model: PathBuf,
        #[arg(short = 'k', long)]
        bound: Option<u32>,
        #[arg(short, long)]
        property: Option<String>,
    },
    /// Check a property as an invariant with IC3.
    Ic3Invar {
        model: PathBuf,
        #[arg(short = 'k', long)]
        bound: Option<u32>,
        #[arg(short, long)]
        property: Option<String>,
    },
    /// Bounded model checking of LTL properties.
    Bmc {
        model: PathBuf,
        #[arg(short = 'k', long, default_value_t = 10)]
        bound: u32,
        #[arg(short, long)]
        property: Option<String>,
    },
    /// BDD based LTL model checking.
    CheckLtl {
        model: PathBuf,
        #[arg(short, long)]
        property: Option<String>,
    },
    /// Run a file of engine commands, one per line.
    Run { model: PathBuf, script: PathBuf },
    /// Run commands and parse the answer to the last one as a trace.
    Trace {
        model: PathBuf,
        #[arg(required = true)]
        commands: Vec<String>,
    },
}

impl Task {
    pub fn model(&self) -> &PathBuf {
        match self {
            Task::Simulate { model, .. }
            | Task::Ic3 { model, .. }
            | Task::Ic3Invar { model, .. }
            | Task::Bmc { model, .. }
            | Task::CheckLtl { model, .. }
            | Task::Run { model, .. }
            | Task::Trace { model, .. } => model,
        }
    }
}

impl RxmvOptions {
    /// The configuration file, if any, with the command line applied on top.
    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        let mut config = match &self.config {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };
        if let Some(seconds) = self.timeout {
            config.timeout_seconds = (seconds > 0).then_some(seconds);
        }
        Ok(config)
    }
}

/// Reads a command script: one command per line, `#` outside double quotes
/// starts a comment.
pub fn read_script(path: &std::path::Path) -> anyhow::Result<Vec<Command>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script: {}", path.display()))?;
    Ok(parse_script(&content))
}

/// `line` up to its first `#` that is not inside a quoted property.
fn strip_comment(line: &str) -> &str {
    let mut quoted = false;
    for (i, c) in line.char_indices() {
        match c {
            '"' => quoted = !quoted,
            '#' if !quoted => return &line[..i],
            _ => {}
        }
    }
    line
}

pub fn parse_script(content: &str) -> Vec<Command> {
    content
        .lines()
        .map(|line| strip_comment(line).trim())
        .filter(|line| !line.is_empty())
        .filter_map(|line| line.parse().ok())
        .collect()
}
