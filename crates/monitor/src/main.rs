mod cli;
mod config;
mod shutdown;

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use watchtower_core::store::MemoryStore;
use watchtower_engine::{Engine, EngineEvent, sse_frame};

use crate::cli::Cli;
use crate::shutdown::{ShutdownSignal, spawn_signal_listener};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let endpoints = config::load_endpoints(&cli.endpoints)?;
    info!(
        endpoints = endpoints.len(),
        file = %cli.endpoints.display(),
        "loaded endpoint definitions"
    );

    let store = Arc::new(MemoryStore::with_endpoints(endpoints));
    let engine = Engine::new(cli.engine_config(), store);

    // Fan probe results into the hub so stream subscribers see them.
    let broadcaster = engine.broadcaster();
    engine
        .set_result_callback(Arc::new(move |payload| broadcaster.send(payload)))
        .await
        .map_err(|err| anyhow::anyhow!("install result callback: {err}"))?;

    let mut events = engine.subscribe();
    engine
        .start()
        .await
        .map_err(|err| anyhow::anyhow!("start engine: {err}"))?;

    println!(
        "watchtower {} workers={}",
        env!("CARGO_PKG_VERSION"),
        cli.workers
    );

    if cli.stream {
        let mut stream = engine
            .subscribe_stream(None)
            .await
            .map_err(|err| anyhow::anyhow!("subscribe to event stream: {err}"))?;
        tokio::spawn(async move {
            while let Some(event) = stream.recv().await {
                print!("{}", sse_frame(&event));
            }
        });
    }

    let mut signals = spawn_signal_listener();

    loop {
        tokio::select! {
            signal = signals.recv() => {
                match signal {
                    Some(ShutdownSignal::Graceful) => {
                        eprintln!(
                            "Stop requested — draining in-flight probes (press CTRL+C again to exit immediately)."
                        );
                        break;
                    }
                    Some(ShutdownSignal::Immediate) | None => {
                        std::process::exit(130);
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(EngineEvent::Started) => info!("engine running"),
                    Ok(EngineEvent::JobSkipped { endpoint_id, reason }) => {
                        warn!(endpoint = %endpoint_id, ?reason, "probe skipped");
                    }
                    Ok(EngineEvent::Warning { message }) => warn!("{message}"),
                    Ok(EngineEvent::Error { message }) => error!("{message}"),
                    Ok(EngineEvent::StopRequested | EngineEvent::Stopped) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    // A second interrupt during the graceful drain exits immediately.
    tokio::select! {
        res = engine.stop() => {
            res.map_err(|err| anyhow::anyhow!("stop engine: {err}"))?;
        }
        _ = signals.recv() => {
            eprintln!("Stop requested again — exiting immediately.");
            std::process::exit(130);
        }
    }

    Ok(())
}
