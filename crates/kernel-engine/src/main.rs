//! kernel-engine CLI entry point.
//!
//! Speaks the kernel channel protocol over stdio (default) or a Unix socket
//! provided by the host, evaluating code with the built-in script evaluator.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kernel_engine::{
    spawn_framed, Dispatcher, EngineConfig, OutputSink, ProcessOutput, ScriptEvaluator,
    StderrOutput,
};
use log::info;

#[derive(Parser, Debug)]
#[command(name = "kernel-engine")]
#[command(about = "Execution engine for notebook code requests")]
struct Cli {
    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Connect to the host over this Unix socket instead of stdio
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Channel namespace shared with the host
    #[arg(long, default_value = kernel_engine::config::DEFAULT_NAMESPACE)]
    namespace: String,

    /// Seconds an early reply stays buffered waiting for its request
    #[arg(long, default_value = "60")]
    reply_ttl_secs: u64,

    /// Maximum number of early replies kept at once
    #[arg(long, default_value = "256")]
    max_buffered_replies: usize,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr, which never carries protocol frames.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let config = EngineConfig {
        namespace: cli.namespace,
        reply_ttl: Duration::from_secs(cli.reply_ttl_secs),
        max_buffered_replies: cli.max_buffered_replies,
    };

    info!("kernel-engine starting...");
    info!("Configuration:");
    info!("  Namespace: {}", config.namespace);
    info!("  Reply TTL: {:?}", config.reply_ttl);
    info!("  Max buffered replies: {}", config.max_buffered_replies);

    let (endpoint, output) = match cli.socket {
        Some(path) => {
            info!("  Transport: socket {}", path.display());
            let output: Arc<dyn OutputSink> = Arc::new(ProcessOutput);
            (connect_socket(&path).await?, output)
        }
        None => {
            info!("  Transport: stdio");
            // stdout carries frames, so console output is echoed on stderr.
            let output: Arc<dyn OutputSink> = Arc::new(StderrOutput);
            (spawn_framed(tokio::io::stdin(), tokio::io::stdout()), output)
        }
    };

    let (sender, receiver) = endpoint.open(&config.namespace);
    let dispatcher = Dispatcher::new(ScriptEvaluator::new(), sender, &config, output);
    dispatcher.run(receiver).await?;

    info!("kernel-engine stopped");
    Ok(())
}

#[cfg(unix)]
async fn connect_socket(path: &std::path::Path) -> anyhow::Result<kernel_engine::Endpoint> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    let (reader, writer) = stream.into_split();
    Ok(spawn_framed(reader, writer))
}

#[cfg(not(unix))]
async fn connect_socket(path: &std::path::Path) -> anyhow::Result<kernel_engine::Endpoint> {
    anyhow::bail!("--socket {} is only supported on Unix", path.display())
}
