use clap::Parser;
use exn::ResultExt;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use trawl::downloader::Unavailable;
use trawl::error::{ErrorKind, Result};
use trawl::node::Node;
use trawl::spider::Species;
use trawl::submit::CrawlRequest;
use trawl_config::{Config, Mode};

/// Distributed crawler node.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Configuration file (TOML, YAML or JSON).
    #[arg(short, long, env = "TRAWL_CONFIG")]
    config: Option<PathBuf>,
    /// Override the configured run mode.
    #[arg(short, long)]
    mode: Option<Mode>,
    /// JSON crawl request for a master to queue on startup.
    #[arg(short, long)]
    request: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("trawl: {err:?}");
            return ExitCode::FAILURE;
        },
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log.level)))
        .init();
    if let Some(mode) = cli.mode {
        config.run.mode = mode;
    }

    match run(config, cli.request.as_deref()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = ?err, "trawl failed");
            ExitCode::FAILURE
        },
    }
}

async fn run(config: Config, request: Option<&Path>) -> Result<()> {
    let mut node = Node::new(config, Species::new(), Arc::new(Unavailable));
    if let Some(path) = request {
        let raw = tokio::fs::read(path).await.or_raise(|| ErrorKind::Io)?;
        let request: CrawlRequest = serde_json::from_slice(&raw).or_raise(|| ErrorKind::Config)?;
        node = node.with_request(request);
    }

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupted, shutting down");
            }
            token.cancel();
        }
    });
    node.run(token).await
}
