use std::error::Error;
use std::time::Duration;

use tracing::{error, info};

mod setup_tracing;

/// stdin is read on a blocking thread which cannot be interrupted, the runtime does not wait for
/// it longer than this on exit.
const RUNTIME_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

fn main() -> Result<(), Box<dyn Error>> {
    setup_tracing::register();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let result = runtime.block_on(tumbling_core::run());
    runtime.shutdown_timeout(RUNTIME_SHUTDOWN_TIMEOUT);

    if let Err(e) = result {
        error!("{e:?}");
        return Err(e.into());
    }
    info!("Exiting...");

    Ok(())
}
