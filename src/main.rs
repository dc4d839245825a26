use clap::Parser;
use meridian::core::Opts;
use meridian::Platform;
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();

    let filter = opts
        .log_config_file
        .as_ref()
        .and_then(|path| std::fs::read_to_string(path).ok())
        .map(|directives| EnvFilter::new(directives.trim().to_string()))
        .unwrap_or_else(|| {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let platform = match Platform::build(&opts) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };
    platform.start();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(opts.io_threads.max(1))
        .enable_all()
        .build()?;
    runtime.block_on(meridian::client::server::run(platform, opts.port))?;
    Ok(())
}
