use clap::Parser;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use strata_registry::Store;
use tracing::info;

#[derive(Parser)]
#[command(name = "strata-registry", about = "Minimal OCI distribution registry")]
struct Cli {
    /// Port to listen on.
    #[arg(long, default_value_t = 5000)]
    port: u16,

    /// Directory to store blobs and manifests.
    #[arg(long, default_value = "./strata-registry-data")]
    data_dir: PathBuf,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    fs::create_dir_all(&cli.data_dir).expect("failed to create data directory");

    let addr = format!("0.0.0.0:{}", cli.port);
    info!("starting strata-registry on {addr}");
    info!("data directory: {}", cli.data_dir.display());

    let store = Arc::new(Store::new(cli.data_dir));
    strata_registry::run_server(&store, &addr);
}
