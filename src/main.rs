use env_logger::Env;
use log::{error, info, warn};
use plate_scanner::camera::{CameraConstraints, FrameSampler};
use plate_scanner::config::ScannerConfig;
use plate_scanner::coordinator::{ChannelObserver, ScanCoordinator};
use plate_scanner::feed::FrameFeed;
use plate_scanner::lookup::HttpLookupClient;
use plate_scanner::recognizer::{OcrParams, TextRecognizer};
use plate_scanner::tesseract::TesseractEngine;
use plate_scanner::types::ScanEvent;
use plate_scanner::websocket::HubSettings;
use plate_scanner::{db, webhook, websocket};
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::sync::Mutex;

const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);

/// Logs every match to the database, then hands events to the hub bridge.
async fn dispatch(
    mut rx: Receiver<ScanEvent>,
    db_conn: Arc<Mutex<Connection>>,
    mut hub_tx: Option<Sender<ScanEvent>>,
) {
    while let Some(event) = rx.recv().await {
        if let ScanEvent::Matched(m) = &event {
            let previous = db::record_match(&*db_conn.lock().await, m);
            info!(
                "Plate {} matched as {} ({} earlier matches)",
                m.candidate.plate, m.kind, previous
            );
        }
        if let Some(tx) = hub_tx.as_mut() {
            if let Err(e) = tx.send(event).await {
                warn!("Hub bridge is gone: {}", e);
                hub_tx = None;
            }
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    info!("Starting plate-scanner");

    let config = match ScannerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return;
        }
    };
    let lookup = match HttpLookupClient::new(
        config.lookup_url.clone(),
        config.service_point,
        config.access_token.clone(),
        LOOKUP_TIMEOUT,
    ) {
        Ok(lookup) => lookup,
        Err(e) => {
            error!("Unable to build lookup client: {}", e);
            return;
        }
    };

    let feed = FrameFeed::new(config.camera_facing);
    let sampler = FrameSampler::new(
        Arc::new(feed.clone()),
        CameraConstraints::fallback_tiers(config.camera_width, config.camera_height),
        config.camera_timeout,
    );
    let recognizer = TextRecognizer::new(
        Arc::new(TesseractEngine::new(&config.tesseract_path)),
        OcrParams::plate(&config.tesseract_lang),
    );
    let (event_tx, event_rx) = channel(8);
    let coordinator = ScanCoordinator::new(
        config.scan_settings(),
        sampler,
        recognizer,
        Arc::new(lookup),
        Arc::new(ChannelObserver::new(event_tx)),
    );
    let db_conn = Arc::new(Mutex::new(db::open(&config.db_path)));

    let hub_tx = match &config.hub_host {
        Some(host) => {
            let (tx, rx) = channel(8);
            let hub = HubSettings {
                host: host.clone(),
                access_token: config.access_token.clone(),
                notify_device: config.notify_device.clone(),
            };
            tokio::spawn(websocket::run(rx, hub, coordinator.clone()));
            Some(tx)
        }
        None => {
            info!("HOST unset; hub notifications disabled");
            None
        }
    };
    tokio::spawn(dispatch(event_rx, db_conn.clone(), hub_tx));

    if config.auto_start {
        let coordinator = coordinator.clone();
        tokio::spawn(async move {
            if let Err(e) = coordinator.start().await {
                error!("Automatic start failed: {}", e);
            }
        });
    }

    let webhook_task = tokio::spawn(webhook::run(
        config.port,
        feed,
        coordinator.clone(),
        db_conn,
    ));
    tokio::select! {
        result = webhook_task => {
            if let Err(e) = result {
                error!("Webhook task failed: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
    }
    coordinator.stop();
    info!("Exiting main");
}
