use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "kagami",
    about = "Operate and diagnose the kagami biometric PAM stack",
    version
)]
pub struct Cli {
    /// Emit structured JSON to stdout instead of human-readable output
    #[arg(long)]
    pub json: bool,

    /// Increase verbosity (may be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the face/fingerprint race for a user from this terminal
    Auth(AuthArgs),
    /// Evaluate both guard stages without capturing anything
    Guards(GuardsArgs),
    /// List users with enrolled face templates
    Identities(IdentitiesArgs),
    /// Check configuration, devices, models, lock file and PAM wiring
    Doctor,
}

#[derive(Debug, Args)]
pub struct AuthArgs {
    /// User to authenticate (defaults to the invoking user)
    #[arg(long)]
    pub user: Option<String>,

    /// Override the configured overall timeout, in seconds
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Args)]
pub struct GuardsArgs {
    /// Seconds to wait for the system lock before the locked stage is evaluated
    #[arg(long, default_value_t = 2)]
    pub lock_timeout_secs: u64,
}

#[derive(Debug, Args)]
pub struct IdentitiesArgs {
    /// Template store to inspect (defaults to config embedding_store_dir)
    #[arg(long)]
    pub store_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Human,
    Json,
}

impl From<bool> for OutputMode {
    fn from(json: bool) -> Self {
        if json {
            OutputMode::Json
        } else {
            OutputMode::Human
        }
    }
}

impl Cli {
    pub fn output_mode(&self) -> OutputMode {
        OutputMode::from(self.json)
    }
}
