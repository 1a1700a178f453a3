mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::rebase::RebaseArgs;
use commands::EXIT_INVALID_ARGS;
use std::path::PathBuf;
use std::process::ExitCode;
use strata_core::{Platform, DEFAULT_PLATFORM_API};

#[derive(Debug, Parser)]
#[command(
    name = "strata",
    version,
    about = "Rebase buildpack app images and resolve buildpack orders"
)]
struct Cli {
    /// Platform API version to follow for capabilities and exit codes.
    #[arg(long, env = "CNB_PLATFORM_API", default_value = DEFAULT_PLATFORM_API, global = true)]
    platform_api: String,

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
    /// Put an app image on top of a new run image.
    Rebase {
        /// Image to rebase, followed by any additional names to save it as.
        images: Vec<String>,
        /// Run image to rebase onto (default: chosen from the app's stack metadata).
        #[arg(long, env = "CNB_RUN_IMAGE")]
        run_image: Option<String>,
        /// Read and write images in the local image store instead of a registry.
        #[arg(long, env = "CNB_USE_DAEMON", default_value_t = false)]
        daemon: bool,
        /// User id to run as.
        #[arg(long, env = "CNB_USER_ID")]
        uid: Option<u32>,
        /// Group id to run as.
        #[arg(long, env = "CNB_GROUP_ID")]
        gid: Option<u32>,
        /// Local image store directory used with --daemon.
        #[arg(long, default_value = "~/.local/share/strata/images")]
        store: String,
        /// Write a TOML report of the rebase to this path.
        #[arg(long)]
        report: Option<PathBuf>,
        /// Registry host to reach over plain HTTP (repeatable).
        #[arg(long = "insecure-registry")]
        insecure_registry: Vec<String>,
    },
    /// Flatten a platform order into the groups detection would try.
    Order {
        /// Path to the platform order.toml.
        order: PathBuf,
        /// Directory holding <id>/<version>/buildpack.toml descriptors.
        #[arg(long, env = "CNB_BUILDPACKS_DIR", default_value = "/cnb/buildpacks")]
        buildpacks: PathBuf,
    },
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
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
            tracing_subscriber::EnvFilter::try_from_env("STRATA_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    let platform = match Platform::for_api(&cli.platform_api) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::from(EXIT_INVALID_ARGS);
        }
    };
    tracing::debug!("platform API {}", platform.api());
    let json_output = cli.json;

    let result = match cli.command {
        Commands::Rebase {
            images,
            run_image,
            daemon,
            uid,
            gid,
            store,
            report,
            insecure_registry,
        } => commands::rebase::run(
            &platform,
            &RebaseArgs {
                images,
                run_image,
                daemon,
                uid,
                gid,
                store: expand_tilde(&store),
                report,
                insecure_registries: insecure_registry,
            },
            json_output,
        ),
        Commands::Order { order, buildpacks } => {
            commands::order::run(&platform, &order, &buildpacks, json_output)
        }
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("error: {}", err.message);
            ExitCode::from(err.code)
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
