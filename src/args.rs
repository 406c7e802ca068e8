//! These structs provide the CLI interface for the reconcile CLI.

use clap::{Parser, Subcommand};
use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::error;
use tracing_subscriber::filter::LevelFilter;

/// reconcile: Merge your card and wallet statements into one ledger, and let an outside tool
/// edit it without ever seeing your amounts.
///
/// Statement parsers write CSV files of a common record shape. `reconcile merge` turns them into
/// one deduplicated ledger. `reconcile run` then masks every amount, hands the masked ledger to
/// the configured transform command (for example an AI assistant that tidies up descriptions),
/// checks that nothing was dropped or altered, and restores the amounts.
///
/// The individual stages are available as `mask`, `check` and `unmask` so that a run that was
/// interrupted can be finished by hand.
#[derive(Debug, Parser, Clone)]
pub struct Args {
    #[clap(flatten)]
    common: Common,

    #[command(subcommand)]
    command: Command,
}

impl Args {
    pub fn new(common: Common, command: Command) -> Self {
        Self { common, command }
    }

    pub fn common(&self) -> &Common {
        &self.common
    }

    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create the data directory and a default configuration file.
    ///
    /// By default the data directory is $HOME/reconcile. Pass --reconcile-home or set
    /// RECONCILE_HOME to put it somewhere else. Running init again leaves an existing
    /// config.json untouched.
    Init,
    /// Merge credit-card and digital-wallet records into one ledger.
    Merge(MergeArgs),
    /// Replace every amount in a document with a token and save the mask map.
    Mask(MaskArgs),
    /// Compare a document with its transformed version and report discrepancies.
    Check(CheckArgs),
    /// Restore the amounts in a transformed document and archive the run.
    Unmask(UnmaskArgs),
    /// Merge, mask, transform, check and unmask in one go.
    Run(RunArgs),
}

/// Arguments common to all subcommands.
#[derive(Debug, Parser, Clone)]
pub struct Common {
    /// The logging verbosity. One of, from least to most verbose:
    /// off, error, warn, info, debug, trace
    ///
    /// This can be overridden by RUST_LOG. See the tracing-subscriber crate for instructions.
    #[arg(long, default_value_t = LevelFilter::INFO)]
    log_level: LevelFilter,

    /// The directory where configuration and run files are held. Defaults to ~/reconcile
    #[arg(long, env = "RECONCILE_HOME", default_value_t = default_reconcile_home())]
    reconcile_home: DisplayPath,
}

impl Common {
    pub fn new(log_level: LevelFilter, reconcile_home: PathBuf) -> Self {
        Self {
            log_level,
            reconcile_home: reconcile_home.into(),
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        self.log_level
    }

    pub fn reconcile_home(&self) -> &DisplayPath {
        &self.reconcile_home
    }
}

/// Input files shared by `merge` and `run`.
#[derive(Debug, Parser, Clone)]
pub struct Inputs {
    /// CSV files of credit-card records. May be given more than once.
    #[arg(long = "credit-card", value_name = "FILE")]
    credit_card: Vec<PathBuf>,

    /// CSV files of digital-wallet records. May be given more than once.
    #[arg(long = "digital", value_name = "FILE")]
    digital: Vec<PathBuf>,
}

impl Inputs {
    pub fn new(credit_card: Vec<PathBuf>, digital: Vec<PathBuf>) -> Self {
        Self {
            credit_card,
            digital,
        }
    }

    pub fn credit_card(&self) -> &[PathBuf] {
        &self.credit_card
    }

    pub fn digital(&self) -> &[PathBuf] {
        &self.digital
    }
}

/// Args for the `reconcile merge` command.
#[derive(Debug, Parser, Clone)]
pub struct MergeArgs {
    #[clap(flatten)]
    inputs: Inputs,

    /// Where to write the ledger. Defaults to stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

impl MergeArgs {
    pub fn new(inputs: Inputs, output: Option<PathBuf>) -> Self {
        Self { inputs, output }
    }

    pub fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }
}

/// Args for the `reconcile mask` command.
#[derive(Debug, Parser, Clone)]
pub struct MaskArgs {
    /// The document to mask.
    #[arg(long)]
    input: PathBuf,

    /// The run id, ASCII letters and digits only. A new one is generated when omitted.
    #[arg(long)]
    run_id: Option<String>,

    /// Where to write the masked document. Defaults to stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

impl MaskArgs {
    pub fn new(input: impl Into<PathBuf>, run_id: Option<String>, output: Option<PathBuf>) -> Self {
        Self {
            input: input.into(),
            run_id,
            output,
        }
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }
}

/// Args for the `reconcile check` command.
#[derive(Debug, Parser, Clone)]
pub struct CheckArgs {
    /// The masked document as it was sent out.
    #[arg(long)]
    pre: PathBuf,

    /// The document as it came back.
    #[arg(long)]
    post: PathBuf,
}

impl CheckArgs {
    pub fn new(pre: impl Into<PathBuf>, post: impl Into<PathBuf>) -> Self {
        Self {
            pre: pre.into(),
            post: post.into(),
        }
    }

    pub fn pre(&self) -> &Path {
        &self.pre
    }

    pub fn post(&self) -> &Path {
        &self.post
    }
}

/// Args for the `reconcile unmask` command.
#[derive(Debug, Parser, Clone)]
pub struct UnmaskArgs {
    /// The run whose mask map restores the amounts.
    #[arg(long)]
    run_id: String,

    /// The transformed document.
    #[arg(long)]
    input: PathBuf,

    /// The masked document to check against. Defaults to the masked checkpoint saved for the run.
    #[arg(long)]
    pre: Option<PathBuf>,

    /// Unmask even if the documents do not reconcile.
    #[arg(long)]
    force: bool,

    /// Where to write the restored document. Defaults to stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

impl UnmaskArgs {
    pub fn new(
        run_id: impl Into<String>,
        input: impl Into<PathBuf>,
        pre: Option<PathBuf>,
        force: bool,
        output: Option<PathBuf>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            input: input.into(),
            pre,
            force,
            output,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn input(&self) -> &Path {
        &self.input
    }

    pub fn pre(&self) -> Option<&Path> {
        self.pre.as_deref()
    }

    pub fn force(&self) -> bool {
        self.force
    }

    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }
}

/// Args for the `reconcile run` command.
#[derive(Debug, Parser, Clone)]
pub struct RunArgs {
    #[clap(flatten)]
    inputs: Inputs,

    /// A text file with instructions for the transform.
    #[arg(long)]
    instructions: Option<PathBuf>,

    /// Seconds to wait for the transform. Defaults to the configured timeout.
    #[arg(long)]
    timeout: Option<u64>,

    /// Unmask even if the documents do not reconcile.
    #[arg(long)]
    force: bool,

    /// Where to write the final ledger. Defaults to stdout.
    #[arg(long)]
    output: Option<PathBuf>,
}

impl RunArgs {
    pub fn new(
        inputs: Inputs,
        instructions: Option<PathBuf>,
        timeout: Option<u64>,
        force: bool,
        output: Option<PathBuf>,
    ) -> Self {
        Self {
            inputs,
            instructions,
            timeout,
            force,
            output,
        }
    }

    pub fn inputs(&self) -> &Inputs {
        &self.inputs
    }

    pub fn instructions(&self) -> Option<&Path> {
        self.instructions.as_deref()
    }

    pub fn timeout(&self) -> Option<u64> {
        self.timeout
    }

    pub fn force(&self) -> bool {
        self.force
    }

    pub fn output(&self) -> Option<&Path> {
        self.output.as_deref()
    }
}

fn default_reconcile_home() -> DisplayPath {
    DisplayPath(match dirs::home_dir() {
        Some(home) => home.join("reconcile"),
        None => {
            error!(
                "There was an error when trying to get your home directory. You can get around \
                this by providing --reconcile-home or RECONCILE_HOME instead of relying on the \
                default reconcile home directory. If you continue using the program right now, \
                you may have problems!",
            );
            PathBuf::from("reconcile")
        }
    })
}

#[derive(Debug, Default, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DisplayPath(PathBuf);

impl From<PathBuf> for DisplayPath {
    fn from(value: PathBuf) -> Self {
        DisplayPath(value)
    }
}

impl Deref for DisplayPath {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<Path> for DisplayPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl Display for DisplayPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_string_lossy())
    }
}

impl FromStr for DisplayPath {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(PathBuf::from(s)))
    }
}

impl DisplayPath {
    pub fn new(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}
