use std::path::PathBuf;

use clap::Parser;

#[derive(Parser)]
#[command(name = "nixd", about = "Language server for the nixd expression language", version)]
struct Cli {
    /// JSON configuration file (defaults to .nixd.json in the workspace)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Run as an evaluator worker (spawned by the controller)
    #[arg(long, hide = true)]
    eval_worker: bool,

    /// Run as an option worker (spawned by the controller)
    #[arg(long, hide = true)]
    option_worker: bool,

    /// Workspace version this worker serves
    #[arg(long, hide = true, default_value_t = 0)]
    workspace_version: u64,
}

#[tokio::main]
async fn main() {
    // Logs go to stderr; stdout carries protocol frames only.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("NIXD_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let code = if cli.eval_worker {
        nixd_lsp::run_eval_worker(cli.workspace_version).await
    } else if cli.option_worker {
        nixd_lsp::run_option_worker(cli.workspace_version).await
    } else {
        tracing::info!("nixd {} starting on stdio", env!("CARGO_PKG_VERSION"));
        nixd_lsp::run_server(cli.config).await
    };

    std::process::exit(code);
}
