use anyhow::Result;
use clap::Parser;
use utils::version;

use fleetd::app::ApplicationBuilder;
use fleetd::config::DaemonArgs;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let daemon_args = DaemonArgs::parse();
    let _guard = utils::logging::init_with_file(daemon_args.log_file.as_deref());

    tracing::info!("Starting fleetd daemon {}", &**version::VERSION);

    let mut app = ApplicationBuilder::new(daemon_args).build()?;

    app.run().await?;
    app.shutdown().await?;

    Ok(())
}
