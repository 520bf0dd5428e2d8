//! backhaul entry point.

mod app;
mod config;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting backhaul");

    let path = match std::env::args_os().nth(1) {
        Some(arg) => arg.into(),
        None => config::config_path(),
    };
    let config = config::Config::load(&path)?;
    tracing::info!(
        path = %path.display(),
        source = %config.upload.source_dir.display(),
        bucket = %config.upload.bucket,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    let summary = rt.block_on(app::run(config))?;

    tracing::info!(
        files = summary.files_uploaded(),
        bytes = summary.bytes_uploaded(),
        "backhaul finished"
    );
    Ok(())
}
