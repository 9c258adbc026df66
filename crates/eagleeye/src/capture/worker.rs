use std::thread::JoinHandle;
use std::time::Instant;

use tokio::sync::watch;

use super::Capture;
use crate::channel::FrameSender;
use crate::config::SourceConfig;
use crate::transform::{PerspectiveTransform, TransformStore};

/// Why a camera worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Shutdown was requested
    Shutdown,
    /// The source could not be opened
    OpenFailed,
    /// The source ended or went away mid-stream
    Disconnected,
    /// A read failed mid-stream
    ReadFailed,
}

/// Camera worker - owns one source, aligns its frames and hands them to the
/// hub through a latest-value channel.
///
/// Each worker runs on its own OS thread so a blocked or failing device never
/// affects another source or the hub. A worker that stops is not restarted.
pub struct CameraWorker {
    config: SourceConfig,
    store: TransformStore,
    output: FrameSender,
}

impl CameraWorker {
    pub fn new(config: SourceConfig, store: TransformStore, output: FrameSender) -> Self {
        Self {
            config,
            store,
            output,
        }
    }

    /// Start the worker on a dedicated thread.
    pub fn spawn(self, shutdown: watch::Receiver<()>) -> std::io::Result<JoinHandle<WorkerExit>> {
        std::thread::Builder::new()
            .name(format!("camera-{}", self.config.name))
            .spawn(move || self.run(shutdown))
    }

    /// Run the acquisition loop until shutdown, end of stream or failure.
    pub fn run(self, shutdown: watch::Receiver<()>) -> WorkerExit {
        let name = self.config.name.clone();

        let mut capture = match Capture::open(&self.config) {
            Ok(c) => c,
            Err(e) => {
                log::error!("[camera:{}] {}", name, e);
                return WorkerExit::OpenFailed;
            }
        };

        let transform = if self.config.calibrate {
            self.store.load_or_identity(&name)
        } else {
            PerspectiveTransform::identity()
        };

        log::info!("[camera:{}] capturing", name);

        let mut published: u64 = 0;
        let mut overwritten: u64 = 0;
        let mut last_log = Instant::now();

        let exit = loop {
            // Err means the shutdown sender is gone, which only happens on exit
            if shutdown.has_changed().unwrap_or(true) {
                break WorkerExit::Shutdown;
            }

            let frame = match capture.capture() {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    log::error!("[camera:{}] source disconnected", name);
                    break WorkerExit::Disconnected;
                }
                Err(e) => {
                    log::error!("[camera:{}] {}", name, e);
                    break WorkerExit::ReadFailed;
                }
            };

            if self.output.publish(transform.warp(frame)) {
                overwritten += 1;
            }
            published += 1;

            if last_log.elapsed().as_secs() >= 1 {
                log::debug!(
                    "[camera:{}] {} frames published, {} replaced before pickup",
                    name,
                    published,
                    overwritten
                );
                last_log = Instant::now();
            }
        };

        log::info!("[camera:{}] stopped ({:?})", name, exit);
        exit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::frame_channel;
    use std::time::Duration;

    fn source(yaml: &str) -> SourceConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_open_failure_ends_worker() {
        let (tx, rx) = frame_channel();
        let worker = CameraWorker::new(
            source("name: rgb\nkind: images\npath: /nonexistent/eagleeye\n"),
            TransformStore::default(),
            tx,
        );
        let (_shutdown_tx, shutdown_rx) = watch::channel(());
        assert_eq!(worker.run(shutdown_rx), WorkerExit::OpenFailed);
        assert!(rx.is_closed());
        assert!(rx.take().is_none());
    }

    #[test]
    fn test_end_of_stream_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        image::RgbImage::new(4, 4)
            .save(dir.path().join("only.png"))
            .unwrap();

        let (tx, rx) = frame_channel();
        let config = source(&format!(
            "name: rgb\nkind: images\nfps: 1000\npath: {}\n",
            dir.path().display()
        ));
        let (_shutdown_tx, shutdown_rx) = watch::channel(());
        let exit = CameraWorker::new(config, TransformStore::default(), tx).run(shutdown_rx);

        assert_eq!(exit, WorkerExit::Disconnected);
        let frame = rx.take().unwrap();
        assert_eq!(frame.source, "rgb");
        assert!(rx.is_closed());
    }

    #[test]
    fn test_worker_applies_calibration_and_stops_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let store = TransformStore::new(Some(dir.path().to_path_buf()));
        // shift right by the full width: every output pixel is black
        store
            .save("thermal", [[1.0, 0.0, 8.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]])
            .unwrap();

        let (tx, rx) = frame_channel();
        let config =
            source("name: thermal\nkind: synthetic\nwidth: 8\nheight: 4\nchannels: 1\nfps: 200\n");
        let (shutdown_tx, shutdown_rx) = watch::channel(());
        let handle = CameraWorker::new(config, store, tx).spawn(shutdown_rx).unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let frame = loop {
            if let Some(f) = rx.take() {
                break f;
            }
            assert!(Instant::now() < deadline, "no frame published");
            std::thread::sleep(Duration::from_millis(5));
        };
        assert!(frame.data.iter().all(|&b| b == 0));

        shutdown_tx.send(()).unwrap();
        assert_eq!(handle.join().unwrap(), WorkerExit::Shutdown);
    }
}
