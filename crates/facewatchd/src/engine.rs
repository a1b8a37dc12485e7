use facewatch_core::cascade::CascadeError;
use facewatch_core::pipeline::{Mode, Orchestrator, RetrainError};
use facewatch_core::{AppearanceModel, Config, Datastore, FaceLocator, FrameSource, ImageCodec, RegionVerifier};
use facewatch_hw::{Camera, CameraError};
use facewatch_store::{FsImageCodec, Store, StoreError, StoreEventSink};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};

/// How long the loop tolerates a failing frame source.
#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    /// Capture failures in a row after which the engine gives up.
    max_errors: u32,
    delay: Duration,
}

impl RetryPolicy {
    const CAPTURE: Self = Self {
        max_errors: 50,
        delay: Duration::from_millis(100),
    };
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("cascade error: {0}")]
    Cascade(#[from] CascadeError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("retrain failed: {0}")]
    Retrain(#[from] RetrainError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("engine thread panicked")]
    ThreadPanicked,
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Outcome of a retrain request.
#[derive(Debug, Clone, Copy)]
pub struct RetrainSummary {
    pub identities: usize,
    pub samples: usize,
}

/// Running totals of the recognition loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStatus {
    pub frames: u64,
    pub missing_frames: u64,
    pub faces: u64,
    pub events: u64,
    pub identities: usize,
}

/// Why the engine thread ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineExit {
    /// The stop flag was raised or the frame source ran dry.
    Stopped,
    /// Every handle to the engine was dropped.
    Detached,
    /// The camera could not be started or kept failing.
    CaptureFailed(String),
    /// The thread panicked before reporting.
    Panicked,
}

/// Messages sent from the signal loop to the engine thread.
enum EngineRequest {
    Retrain {
        reply: oneshot::Sender<Result<RetrainSummary, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Rebuild the model from the datastore; takes effect between two frames.
    pub async fn retrain(&self) -> Result<RetrainSummary, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Retrain { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// The running engine thread.
pub struct Engine {
    handle: EngineHandle,
    stop: Arc<AtomicBool>,
    exited: oneshot::Receiver<EngineExit>,
    thread: std::thread::JoinHandle<()>,
}

impl Engine {
    /// Run `body` on the `facewatch-engine` thread and report its exit.
    fn start<F>(body: F) -> Result<Self, EngineError>
    where
        F: FnOnce(mpsc::Receiver<EngineRequest>, &AtomicBool) -> EngineExit + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<EngineRequest>(4);
        let (exit_tx, exited) = oneshot::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);

        let thread = std::thread::Builder::new()
            .name("facewatch-engine".into())
            .spawn(move || {
                let exit = body(rx, &thread_stop);
                tracing::info!(?exit, "engine thread exiting");
                let _ = exit_tx.send(exit);
            })?;

        Ok(Self { handle: EngineHandle { tx }, stop, exited, thread })
    }

    pub fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    /// Resolves once the thread has ended. Await at most once to completion.
    pub async fn exited(&mut self) -> EngineExit {
        (&mut self.exited).await.unwrap_or(EngineExit::Panicked)
    }

    /// Stop after the current frame and wait for the thread to finish.
    pub fn shutdown(self) -> Result<(), EngineError> {
        self.stop.store(true, Ordering::Relaxed);
        self.thread.join().map_err(|_| EngineError::ThreadPanicked)
    }
}

/// Spawn the recognition engine on a dedicated OS thread.
///
/// Opens the camera and the database and loads both cascades before the
/// thread starts, so a missing resource fails fast. The thread trains the
/// model, discards warmup frames, then recognizes until stopped.
pub fn spawn_engine(config: Config) -> Result<Engine, EngineError> {
    let camera = Camera::open(&config.camera_device)?;
    let (width, height) = camera.resolution();
    tracing::info!(
        device = camera.path(),
        width,
        height,
        format = ?camera.pixel_format(),
        "camera opened"
    );

    let store = Store::open(&config.db_path)?;
    let place = store.ensure_place(&config.place)?;
    tracing::info!(db = %config.db_path.display(), place = %place.name, "datastore opened");

    let verifier = RegionVerifier::load(&config.cascade_dir)?
        .with_scan_params(config.pipeline.face_scan, config.pipeline.eye_scan);
    tracing::info!(dir = %config.cascade_dir.display(), "cascades loaded");

    let codec = FsImageCodec::new(&config.data_dir);

    Engine::start(move |mut rx: mpsc::Receiver<EngineRequest>, stop: &AtomicBool| {
        tracing::info!("engine thread started");
        let sink = StoreEventSink::new(&store, &codec, place.id);
        let model = AppearanceModel::new(config.pipeline.lbph);
        let mut orch = Orchestrator::new(verifier, model, &config.pipeline).with_sink(sink);

        match retrain(&mut orch, &store, &codec) {
            Ok(summary) => tracing::info!(
                identities = summary.identities,
                samples = summary.samples,
                "model trained"
            ),
            Err(e) => tracing::warn!(error = %e, "initial training failed; recognizing without a model"),
        }

        let mut stream = match camera.stream() {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to start capture");
                return EngineExit::CaptureFailed(e.to_string());
            }
        };
        if config.warmup_frames > 0 {
            tracing::info!(count = config.warmup_frames, "discarding warmup frames");
            if let Err(e) = stream.warm_up(config.warmup_frames) {
                tracing::warn!(error = %e, "warmup capture failed");
            }
        }

        let (status, exit) = serve(&mut orch, &mut stream, &store, &codec, &mut rx, stop, RetryPolicy::CAPTURE);
        tracing::info!(
            frames = status.frames,
            faces = status.faces,
            events = status.events,
            "recognition loop finished"
        );
        exit
    })
}

fn retrain<L: FaceLocator>(
    orch: &mut Orchestrator<'_, L, AppearanceModel>,
    datastore: &dyn Datastore,
    codec: &dyn ImageCodec,
) -> Result<RetrainSummary, EngineError> {
    orch.retrain(datastore, codec)?;
    let labels = orch.classifier().labels();
    Ok(RetrainSummary {
        identities: labels.len(),
        samples: labels.iter().map(|l| l.sample_count).sum(),
    })
}

/// Recognition loop. Control requests are handled between frames, so a
/// retrain never races a prediction.
fn serve<L: FaceLocator, S: FrameSource + ?Sized>(
    orch: &mut Orchestrator<'_, L, AppearanceModel>,
    source: &mut S,
    datastore: &dyn Datastore,
    codec: &dyn ImageCodec,
    rx: &mut mpsc::Receiver<EngineRequest>,
    stop: &AtomicBool,
    retry: RetryPolicy,
) -> (EngineStatus, EngineExit) {
    let mut status = EngineStatus {
        identities: orch.classifier().labels().len(),
        ..EngineStatus::default()
    };
    let mut capture_errors = 0u32;

    while !stop.load(Ordering::Relaxed) && !source.is_exhausted() {
        loop {
            match rx.try_recv() {
                Ok(EngineRequest::Retrain { reply }) => {
                    let result = retrain(orch, datastore, codec);
                    if let Ok(summary) = &result {
                        status.identities = summary.identities;
                        tracing::info!(identities = summary.identities, samples = summary.samples, "model retrained");
                    }
                    let _ = reply.send(result);
                }
                Ok(EngineRequest::Status { reply }) => {
                    let _ = reply.send(status);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    tracing::info!("engine handle dropped");
                    return (status, EngineExit::Detached);
                }
            }
        }

        match source.next_frame() {
            Ok(Some(frame)) => {
                capture_errors = 0;
                let report = orch.process_frame(Some(&frame), Mode::Recognize);
                status.frames += 1;
                status.faces += report.faces.len() as u64;
                status.events += report.events_recorded() as u64;
            }
            Ok(None) => status.missing_frames += 1,
            Err(e) => {
                capture_errors += 1;
                tracing::warn!(error = %e, capture_errors, "frame capture failed");
                if capture_errors >= retry.max_errors {
                    tracing::error!(capture_errors, "too many consecutive capture failures; stopping");
                    return (status, EngineExit::CaptureFailed(e.to_string()));
                }
                std::thread::sleep(retry.delay);
            }
        }
    }
    (status, EngineExit::Stopped)
}
