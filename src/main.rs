use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, info};

use bluetooth_tui::obex::RejectingPrompt;
use bluetooth_tui::{Conf, Session, log};

#[tokio::main]
async fn main() -> Result<()> {
    log::init_tracing();
    debug!("Tracing initialized");

    let conf = Conf::load();
    debug!("Configuration: {:?}", conf);

    let session = Session::connect(Arc::new(RejectingPrompt)).await?;
    let _listener = session.listen();

    let mut events = session.subscribe();
    let watcher = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            debug!(?event, "Domain event");
        }
    });

    info!("Ready. Press Ctrl-C to exit.");
    tokio::signal::ctrl_c().await?;

    watcher.abort();
    session.shutdown().await?;

    Ok(())
}
