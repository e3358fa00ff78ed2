//! Flag parsing for the `ktl` binary. This module only builds the enumerated
//! `CompileOptions`/`RunOptions` from flags and calls into `ktl_core`; it
//! never implements any engine behavior itself (spec §9).

use clap::{Args, Parser, Subcommand, ValueEnum};
use std::collections::BTreeSet;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ktl")]
#[command(author, version, about = "Multi-cluster Helm stack orchestrator", long_about = None)]
pub struct Cli {
    /// Stack root directory; defaults to the current directory.
    #[arg(long, global = true, default_value = ".")]
    pub stack_root: PathBuf,

    /// Output format for Reporter output.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    pub output: OutputFormat,

    /// Increase log verbosity; repeat for more (-v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Yaml,
}

#[derive(Subcommand)]
pub enum Command {
    /// Compile the stack manifest and print the resulting plan.
    Plan(SelectorArgs),

    /// Apply every selected release, in dependency order.
    Apply(RunArgs),

    /// Delete every selected release, in reverse dependency order.
    Delete(RunArgs),

    /// Render a diff of every selected release against live cluster state.
    Diff(RunArgs),

    /// Run policy verification over every selected release.
    Verify(RunArgs),

    /// Print the final status of a past run.
    Audit {
        /// Run ID to audit; defaults to the most recent run.
        run_id: Option<String>,
    },

    /// Render the dependency graph for the selected releases.
    Graph {
        #[command(flatten)]
        selector: SelectorArgs,

        /// Graph output format.
        #[arg(long, value_enum, default_value_t = GraphFormat::Dot)]
        format: GraphFormat,
    },

    /// Seal or verify a signed plan bundle.
    Bundle {
        #[command(subcommand)]
        action: BundleCommand,
    },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum GraphFormat {
    Dot,
    Mermaid,
    Json,
}

#[derive(Subcommand)]
pub enum BundleCommand {
    /// Seal the compiled plan into a signed `bundle.tgz`.
    Seal {
        #[command(flatten)]
        selector: SelectorArgs,

        /// Where to write the bundle.
        #[arg(long, default_value = "bundle.tgz")]
        out: PathBuf,

        /// Ed25519 signing key file (32 raw bytes); generated ad hoc if omitted.
        #[arg(long)]
        signing_key: Option<PathBuf>,

        /// Include a deterministic archive of every referenced values file.
        #[arg(long)]
        include_inputs: bool,
    },

    /// Verify a bundle's signature and print its metadata.
    Verify {
        /// Path to the bundle to verify.
        bundle: PathBuf,

        /// Trusted Ed25519 public key, hex-encoded; the bundle's own embedded
        /// key is used when omitted (TOFU).
        #[arg(long)]
        trusted_key: Option<String>,
    },
}

#[derive(Args, Clone, Debug, Default)]
pub struct SelectorArgs {
    /// Select releases by name. Repeatable.
    #[arg(long = "release")]
    pub releases: Vec<String>,

    /// Select releases by cluster. Repeatable.
    #[arg(long = "cluster")]
    pub clusters: Vec<String>,

    /// Select releases by tag. Repeatable.
    #[arg(long = "tag")]
    pub tags: Vec<String>,

    /// Exclude releases by tag. Repeatable.
    #[arg(long = "exclude-tag")]
    pub exclude_tags: Vec<String>,

    /// Also include every transitive predecessor of the selected releases.
    #[arg(long)]
    pub include_deps: bool,

    /// Select releases changed between `A..B` (shells out to `git diff`).
    #[arg(long)]
    pub git_range: Option<String>,

    /// Like `--include-deps`, but only for `--git-range` selection.
    #[arg(long)]
    pub git_include_deps: bool,

    /// Deployment profile override.
    #[arg(long)]
    pub profile: Option<String>,
}

impl SelectorArgs {
    pub fn to_compile_options(&self) -> ktl_core::CompileOptions {
        ktl_core::CompileOptions {
            select_releases: self.releases.iter().cloned().collect::<BTreeSet<_>>(),
            include_deps: self.include_deps,
            select_clusters: self.clusters.iter().cloned().collect::<BTreeSet<_>>(),
            select_tags: self.tags.iter().cloned().collect::<BTreeSet<_>>(),
            exclude_tags: self.exclude_tags.iter().cloned().collect::<BTreeSet<_>>(),
            git_range: self.git_range.clone(),
            git_include_deps: self.git_include_deps,
            paths_changed: Vec::new(),
            profile: self.profile.clone(),
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub selector: SelectorArgs,

    /// Maximum concurrent releases in flight.
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,

    /// Keep scheduling independent work after a failure instead of cancelling
    /// the rest of the run.
    #[arg(long)]
    pub continue_on_error: bool,

    /// Maximum attempts per release before giving up.
    #[arg(long, default_value_t = 1)]
    pub max_attempts: u32,

    /// Per-attempt timeout, in seconds.
    #[arg(long, default_value_t = 300)]
    pub node_timeout_secs: u64,

    /// Resume a previous run instead of starting a new one.
    #[arg(long)]
    pub resume: Option<String>,

    /// Skip the confirmation prompt before a destructive run (`delete`).
    #[arg(long)]
    pub yes: bool,

    /// Named ruleset for `verify` to check rendered objects against.
    #[arg(long, default_value = "default")]
    pub ruleset: String,

    /// Minimum verify finding severity that blocks a node.
    #[arg(long, value_enum, default_value_t = FailOn::Error)]
    pub fail_on: FailOn,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum FailOn {
    Info,
    Warn,
    Error,
}

impl FailOn {
    pub fn to_severity(self) -> ktl_core::collaborators::Severity {
        match self {
            FailOn::Info => ktl_core::collaborators::Severity::Info,
            FailOn::Warn => ktl_core::collaborators::Severity::Warn,
            FailOn::Error => ktl_core::collaborators::Severity::Error,
        }
    }
}
