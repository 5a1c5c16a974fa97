//! cloudxfer command-line entry point.

mod app;
mod args;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,cloudxfer=debug")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = args::Args::parse(std::env::args().skip(1))?;
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), ?args, "starting cloudxfer");

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(args))
}
