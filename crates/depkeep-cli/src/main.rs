mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{Context, EXIT_FAILURE, EXIT_INTEGRITY_ERROR, EXIT_MANIFEST_ERROR};
use depkeep_core::PipelineConfig;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "depkeep",
    version,
    about = "Hash-pinned dependency drift reports, safe upgrades, and offline bundles"
)]
struct Cli {
    /// Path to the pinned dependency manifest.
    #[arg(long, global = true, default_value = "depkeep.toml")]
    manifest: PathBuf,

    /// Pipeline config file (TOML). Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Registry URL, or a path to an index snapshot directory.
    #[arg(long, global = true)]
    registry: Option<String>,

    /// Advisory feed export (JSON).
    #[arg(long, global = true)]
    advisories: Option<PathBuf>,

    /// Signature index export (JSON).
    #[arg(long, global = true)]
    signatures: Option<PathBuf>,

    /// Policy deny list (JSON) consulted by preflight.
    #[arg(long, global = true)]
    policy: Option<PathBuf>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Report how far each pinned dependency is behind the registry.
    Drift,
    /// Rank conflict-free upgrades and write them as a plan.
    Plan {
        /// Where to write the plan.
        #[arg(long, default_value = "depkeep-plan.json")]
        out: PathBuf,
    },
    /// Apply a plan through validation, verification, and commit.
    Upgrade {
        /// Plan written by `depkeep plan`.
        #[arg(default_value = "depkeep-plan.json")]
        plan: PathBuf,
        /// Commit after each verified step instead of all at once.
        #[arg(long, default_value_t = false)]
        incremental: bool,
        /// Give up after this many seconds, checked between steps.
        #[arg(long)]
        deadline: Option<u64>,
    },
    /// Check hash completeness, signatures, and policy for the manifest.
    Preflight,
    /// Build an offline wheelhouse bundle from the pinned artifacts.
    Bundle {
        /// Output archive path.
        out: PathBuf,
        /// Local artifact cache reused across bundles.
        #[arg(long, default_value = ".depkeep/cache")]
        cache: PathBuf,
    },
    /// Re-hash every artifact in a bundle against its index.
    VerifyBundle {
        /// Bundle archive to verify.
        bundle: PathBuf,
    },
    /// Maintain a local artifact mirror.
    Mirror {
        #[command(subcommand)]
        action: MirrorAction,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

#[derive(Debug, Subcommand)]
enum MirrorAction {
    /// Fetch missing pinned artifacts and prune old versions.
    Sync {
        /// Mirror directory.
        dir: PathBuf,
    },
    /// Re-hash mirrored artifacts against the manifest.
    Verify {
        /// Mirror directory.
        dir: PathBuf,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("DEPKEEP_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let config = match cli.config.as_deref().map(PipelineConfig::load).transpose() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_FAILURE);
        }
    };

    let ctx = Context {
        manifest: cli.manifest,
        registry: cli.registry,
        config,
        advisories: cli.advisories,
        signatures: cli.signatures,
        policy: cli.policy,
        json: cli.json,
    };

    let result = match cli.command {
        Commands::Drift => commands::drift::run(&ctx),
        Commands::Plan { out } => commands::plan::run(&ctx, &out),
        Commands::Upgrade {
            plan,
            incremental,
            deadline,
        } => commands::upgrade::run(&ctx, &plan, incremental, deadline),
        Commands::Preflight => commands::preflight::run(&ctx),
        Commands::Bundle { out, cache } => commands::bundle::run(&ctx, &out, &cache),
        Commands::VerifyBundle { bundle } => commands::verify_bundle::run(&bundle, ctx.json),
        Commands::Mirror { action } => match action {
            MirrorAction::Sync { dir } => commands::mirror::sync(&ctx, &dir),
            MirrorAction::Verify { dir } => commands::mirror::verify(&ctx, &dir),
        },
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("manifest error:") {
                EXIT_MANIFEST_ERROR
            } else if msg.starts_with("integrity error:")
                || msg.starts_with("store error:")
                || msg.starts_with("store lock:")
            {
                EXIT_INTEGRITY_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}
