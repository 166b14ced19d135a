use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{error, info};

use smart_lighting::actuate::ActuationGateway;
use smart_lighting::capture::OpenCvSource;
use smart_lighting::config::Config;
use smart_lighting::detect::PersonDetector;
use smart_lighting::gesture::build_classifier;
use smart_lighting::mode::SharedMode;
use smart_lighting::worker::{CameraWorker, SharedPerception};

const DEFAULT_CONFIG_PATH: &str = "config.json";

fn main() {
    env_logger::init();
    info!("--- Smart Lighting System Starting ---");

    if let Err(e) = run() {
        error!("Fatal: {e:#}");
        exit(1);
    }
    info!("Shutting down");
}

fn run() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let config = Arc::new(Config::load(&config_path)?);
    info!("Configuration loaded, {} cameras", config.cameras.len());

    let gateway = Arc::new(ActuationGateway::new(&config.recognize_url)?);
    let mode = SharedMode::new();
    let stop = Arc::new(AtomicBool::new(false));

    // モデルは全カメラで共有（推論呼び出しはMutexで直列化）
    let detector = Arc::new(Mutex::new(
        PersonDetector::new(&config.models.detector)
            .context("failed to load person detection model")?,
    ));
    let classifier = Arc::new(Mutex::new(
        build_classifier(&config, Arc::clone(&gateway))
            .context("failed to build gesture classifier")?,
    ));

    // Ctrl-C / SIGTERM で停止フラグを立てる
    signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&stop))?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&stop))?;

    let actions = Arc::new(config.gesture_actions.clone());
    let mut handles = Vec::new();
    for camera in &config.cameras {
        info!("Starting camera ID: {}", camera.id);
        let perception = SharedPerception::new(Arc::clone(&detector), Arc::clone(&classifier));
        let source = OpenCvSource::new(&camera.video_url);

        let worker = CameraWorker::new(
            camera.clone(),
            config.working_hours,
            mode.clone(),
            Arc::clone(&actions),
            gateway.clone(),
            Box::new(perception),
            Box::new(source),
            Arc::clone(&stop),
        );
        handles.push(worker.spawn());
    }

    info!("--- System is running ---");
    while !stop.load(Ordering::Relaxed) {
        sleep(Duration::from_millis(200));
    }

    info!("Stop signal received, waiting for workers");
    for handle in handles {
        handle.join();
    }
    Ok(())
}
