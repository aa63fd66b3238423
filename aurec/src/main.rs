#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use aurec::{AuditSettings, Supervisor};

#[derive(Parser, Debug)]
#[command(name = "aurec")]
#[command(about = "AUREC - audit collector daemon")]
#[command(version)]
struct Args {
    /// Settings file (TOML); reloaded on SIGHUP.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the audit directory from the settings file.
    #[arg(long)]
    audit_dir: Option<PathBuf>,

    /// Override the node name stamped into records.
    #[arg(long)]
    node_name: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing();

    let mut settings = match &args.config {
        Some(path) => match AuditSettings::from_file(path) {
            Ok(settings) => settings,
            Err(e) => {
                error!(
                    target: "aurec",
                    error = %e,
                    path = %path.display(),
                    "failed to load settings file"
                );
                std::process::exit(1);
            }
        },
        None => AuditSettings::default(),
    };
    if let Some(dir) = args.audit_dir {
        settings.audit_dir = dir;
    }
    if let Some(node) = args.node_name {
        settings.node_name = Some(node);
    }

    info!(
        target: "aurec",
        dir = %settings.audit_dir.display(),
        enabled = settings.enabled,
        "starting AUREC"
    );

    let mut supervisor = Supervisor::new(settings, args.config);
    let handle = match supervisor.start() {
        Ok(Some(handle)) => handle,
        Ok(None) => {
            info!(target: "aurec", "audit collection disabled, nothing to do");
            return;
        }
        Err(e) => {
            error!(target: "aurec", error = %e, "failed to start the audit collector");
            std::process::exit(1);
        }
    };

    // the supervisor keeps the pipe write end open for producers; the
    // collector exits on SIGQUIT or when every writer is gone
    match handle.await {
        Ok(Ok(())) => info!(target: "aurec", "collector exited cleanly"),
        Ok(Err(e)) => {
            error!(target: "aurec", error = %e, "collector failed");
            std::process::exit(1);
        }
        Err(e) => {
            error!(target: "aurec", error = %e, "collector task panicked");
            std::process::exit(1);
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,aurec=debug"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();
}
