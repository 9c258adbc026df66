use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use argh::FromArgs;
use eagleeye::{
    capture::CameraWorker,
    codec::Jpeg,
    config::Config,
    detect::{build_detector, DetectionStage},
    hub::{BroadcastHub, HubState},
    server::{self, AppState},
    transform::TransformStore,
};

#[derive(FromArgs)]
/// Multi-camera capture with live detection broadcast over WebSocket
struct Args {
    /// path to the configuration file
    #[argh(option, short = 'c', default = "String::from(\"config.yaml\")")]
    config: String,

    /// listen address, overrides server.bind from the configuration
    #[argh(option, short = 'b')]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = env_logger::Env::default().default_filter_or("info");
    env_logger::init_from_env(env);

    let args: Args = argh::from_env();

    let mut config = match Config::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            log::error!("Failed to load config from '{}': {}", args.config, e);
            std::process::exit(1);
        }
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    log::info!(
        "Loaded configuration with {} sources (upload {})",
        config.sources.len(),
        if config.upload.enabled { "enabled" } else { "disabled" }
    );

    let shutdown_tx = tokio::sync::watch::Sender::new(());

    ctrlc::set_handler({
        let shutdown_tx = shutdown_tx.clone();
        move || {
            log::info!("Received Ctrl+C, shutting down gracefully...");
            shutdown_tx.send(()).ok();
        }
    })?;

    // Frame channels first: every producer needs its sender before the
    // shared state is frozen behind the Arc.
    let mut state = HubState::new();
    let senders: Vec<_> = config
        .sources
        .iter()
        .map(|source| state.add_source(&source.name))
        .collect();
    if config.upload.enabled {
        state.enable_upload(&config.upload.source, config.upload.frame_skip);
        log::info!(
            "Upload endpoint publishes into '{}' (every {} messages)",
            config.upload.source,
            config.upload.frame_skip
        );
    }
    let state = Arc::new(state);

    let store = TransformStore::new(config.calibration_dir.clone());
    let mut workers = Vec::new();
    for (source, sender) in config.sources.iter().zip(senders) {
        log::info!("Starting camera '{}'", source.name);
        let worker = CameraWorker::new(source.clone(), store.clone(), sender);
        match worker.spawn(shutdown_tx.subscribe()) {
            Ok(handle) => workers.push(handle),
            Err(e) => log::error!("Failed to start camera '{}': {}", source.name, e),
        }
    }

    let mut hub = BroadcastHub::new(
        state.clone(),
        &config.hub,
        Box::new(Jpeg::new(config.encoding.jpeg_quality)),
    )?;
    if config.detection.enabled {
        let detector = build_detector(&config.detection.backend)
            .context("failed to create detector backend")?;
        let stage = DetectionStage::new(detector, config.detection.classes.clone());
        hub = hub.with_detection(
            &config.detection.source,
            stage,
            config.detection.effective_mode(),
        )?;
        if let Some(ms) = config.detection.inline_budget_ms {
            hub = hub.with_inline_budget(Duration::from_millis(ms));
        }
    } else {
        log::info!("Detection disabled");
    }

    let hub_task = tokio::spawn(hub.run(shutdown_tx.subscribe()));

    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;
    let app = server::router(AppState::new(
        state.clone(),
        &config.hub,
        shutdown_tx.subscribe(),
    ));
    let server_task = tokio::spawn(server::serve(listener, app, shutdown_tx.subscribe()));

    // the hub returns on shutdown, or early if the pipeline broke
    let failed = match hub_task.await {
        Ok(Ok(())) => false,
        Ok(Err(e)) => {
            log::error!("Broadcast hub failed: {}", e);
            true
        }
        Err(e) => {
            log::error!("Broadcast hub task panicked: {}", e);
            true
        }
    };
    shutdown_tx.send(()).ok();

    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => log::error!("HTTP server error: {}", e),
        Err(e) => log::error!("HTTP server task error: {}", e),
    }

    tokio::task::spawn_blocking(move || {
        for handle in workers {
            if handle.join().is_err() {
                log::error!("Camera worker panicked");
            }
        }
    })
    .await?;

    if failed {
        std::process::exit(1);
    }

    log::info!("All tasks shut down, exiting");
    Ok(())
}
