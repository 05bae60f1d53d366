use agent_shell::{server, Config, ShellContext};
use anyhow::Result;
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

fn setup_logging(log_level_str: &str) -> Result<()> {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("agent_shell={}", level)));

    // stdout carries the protocol; logs go to stderr.
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    setup_logging(&config.log_level)?;

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting agent-shell");
    tracing::debug!("Loaded configuration: {:?}", config);

    let shell = config
        .default_shell
        .clone()
        .unwrap_or_else(|| if cfg!(windows) { "cmd".to_string() } else { "sh".to_string() });
    if which::which(&shell).is_err() {
        tracing::warn!(shell = %shell, "Configured shell is not in PATH. Spawned commands will fail.");
    }

    // Standalone, there is no editor host; sessions use spawned processes.
    let ctx = Arc::new(ShellContext::new(config, None)?);

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    tokio::select! {
        result = server::serve(ctx.clone(), stdin, stdout) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "Dispatcher stopped with an error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
        }
    }

    ctx.dispose();
    tracing::info!("Server shutdown.");
    Ok(())
}
