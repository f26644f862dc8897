use anyhow::Result;
use static_publish::{commands, config::AppConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup (stderr, so stdout stays machine-readable) ---
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    // --- Parse config + subcommand ---
    let (cfg, command) = AppConfig::from_env_and_args()?;
    tracing::debug!(backend = ?cfg.backend_kind(), state_dir = %cfg.state_dir.display(), "configuration loaded");

    commands::run(cfg, command).await
}
