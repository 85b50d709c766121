use crate::config::Config;
use crate::manifest::FrameRecord;
use presence_core::{
    AttendanceDecider, CancelHandle, EmbeddingExtractor, EnrollmentError, EnrollmentSession,
    ExtractError, FrameRecognitionPipeline, FrameReport, NotificationSink, Offer, OnnxExtractor,
    PipelineConfig, PipelineError, Roster, RosterEntry, RosterError, RosterStore, SampleFeed,
    StoreError,
};
use presence_store::SqliteRosterStore;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("embedding model: {0}")]
    Extractor(#[from] ExtractError),
    #[error("roster store: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Roster(#[from] RosterError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error("frame {path}: {reason}")]
    Frame { path: String, reason: String },
    #[error("an enrollment is already in progress")]
    EnrollmentBusy,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("enrollment aggregator panicked")]
    AggregatorPanicked,
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from the CLI to the engine workers.
enum EngineRequest {
    Recognize {
        record: FrameRecord,
        reply: oneshot::Sender<Result<FrameReport, EngineError>>,
    },
    Enroll {
        id: u32,
        name: String,
        frames: Vec<FrameRecord>,
        session: EnrollmentSession,
        feed: SampleFeed,
        slot: EnrollmentSlot,
        reply: oneshot::Sender<Result<RosterEntry, EngineError>>,
    },
}

/// State shared by every worker: one pipeline (one extractor, one roster),
/// plus the cancel handle of the enrollment in flight.
struct EngineContext {
    pipeline: FrameRecognitionPipeline,
    config: PipelineConfig,
    enrolling: Mutex<Option<CancelHandle>>,
}

impl EngineContext {
    fn enrolling(&self) -> MutexGuard<'_, Option<CancelHandle>> {
        self.enrolling.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Clone-safe handle to the engine. Workers exit once every handle is dropped.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    ctx: Arc<EngineContext>,
}

impl EngineHandle {
    /// Load a frame, then crop, embed, match and decide every face in it.
    pub async fn recognize(&self, record: FrameRecord) -> Result<FrameReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Recognize {
                record,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Build a centroid from the single-face frames in `frames` and commit it
    /// to the roster under `id`.
    pub async fn enroll(
        &self,
        id: u32,
        name: String,
        frames: Vec<FrameRecord>,
    ) -> Result<RosterEntry, EngineError> {
        self.begin_enrollment(id, name, frames)?.finish().await
    }

    /// Register an enrollment without starting it.
    ///
    /// The session is cancellable from the moment this returns, including
    /// while its request is still queued behind other work.
    pub fn begin_enrollment(
        &self,
        id: u32,
        name: String,
        frames: Vec<FrameRecord>,
    ) -> Result<PendingEnrollment, EngineError> {
        let (session, feed) = EnrollmentSession::new(
            self.ctx.config.enrollment_samples,
            self.ctx.pipeline.embedding_len(),
            self.ctx.config.enrollment_timeout(),
        );
        let cancel = session.cancel_handle();

        let slot = {
            let mut slot = self.ctx.enrolling();
            if slot.is_some() {
                return Err(EngineError::EnrollmentBusy);
            }
            *slot = Some(cancel.clone());
            EnrollmentSlot(self.ctx.clone())
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        Ok(PendingEnrollment {
            tx: self.tx.clone(),
            request: EngineRequest::Enroll {
                id,
                name,
                frames,
                session,
                feed,
                slot,
                reply: reply_tx,
            },
            reply: reply_rx,
            cancel,
        })
    }

    /// Stop the enrollment in progress, if any. Nothing is committed.
    pub fn cancel_enrollment(&self) -> bool {
        match self.ctx.enrolling().as_ref() {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    pub fn roster(&self) -> &Roster {
        self.ctx.pipeline.roster()
    }

    pub fn set_active(&self, active: bool) {
        self.ctx.pipeline.set_active(active);
    }

    pub fn is_active(&self) -> bool {
        self.ctx.pipeline.is_active()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.ctx.config
    }
}

/// An enrollment registered with the engine but not yet handed to a worker.
pub struct PendingEnrollment {
    tx: mpsc::Sender<EngineRequest>,
    request: EngineRequest,
    reply: oneshot::Receiver<Result<RosterEntry, EngineError>>,
    cancel: CancelHandle,
}

impl PendingEnrollment {
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Queue the enrollment and wait for the committed entry.
    pub async fn finish(self) -> Result<RosterEntry, EngineError> {
        self.tx
            .send(self.request)
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        self.reply.await.map_err(|_| EngineError::ChannelClosed)?
    }
}

/// Load the model and roster database, then start the engine.
///
/// Fails fast: nothing is spawned if the model or database is unavailable.
pub fn spawn_engine(
    config: &Config,
    sink: Arc<dyn NotificationSink>,
) -> Result<EngineHandle, EngineError> {
    let model_path = config.model_path_str();
    let extractor = OnnxExtractor::load(&model_path, &config.pipeline)?;
    tracing::info!(path = %model_path, "embedding model loaded");

    let store = SqliteRosterStore::open(&config.db_path)?;
    tracing::info!(path = %config.db_path.display(), "roster database opened");

    start_engine(
        Box::new(extractor),
        Box::new(store),
        config.pipeline.clone(),
        config.workers,
        sink,
    )
}

/// Start `workers` engine threads around an already-loaded extractor and store.
pub fn start_engine(
    extractor: Box<dyn EmbeddingExtractor>,
    store: Box<dyn RosterStore>,
    config: PipelineConfig,
    workers: usize,
    sink: Arc<dyn NotificationSink>,
) -> Result<EngineHandle, EngineError> {
    let roster = Arc::new(Roster::open(store, config.embedding_len)?);
    let decider = AttendanceDecider::new(config.similarity_threshold, sink);
    let pipeline = FrameRecognitionPipeline::new(extractor, roster, decider)?;

    let ctx = Arc::new(EngineContext {
        pipeline,
        config,
        enrolling: Mutex::new(None),
    });

    let workers = workers.max(1);
    let (tx, rx) = mpsc::channel::<EngineRequest>(workers * 2);
    let rx = Arc::new(Mutex::new(rx));

    for n in 0..workers {
        let rx = rx.clone();
        let ctx = ctx.clone();
        std::thread::Builder::new()
            .name(format!("presence-engine-{n}"))
            .spawn(move || worker_loop(n, &ctx, &rx))
            .map_err(EngineError::Spawn)?;
    }
    tracing::info!(workers, "engine started");

    Ok(EngineHandle { tx, ctx })
}

fn worker_loop(n: usize, ctx: &EngineContext, rx: &Mutex<mpsc::Receiver<EngineRequest>>) {
    tracing::debug!(worker = n, "engine worker started");
    loop {
        let req = {
            let mut rx = rx.lock().unwrap_or_else(|p| p.into_inner());
            rx.blocking_recv()
        };
        let Some(req) = req else { break };

        match req {
            EngineRequest::Recognize { record, reply } => {
                let _ = reply.send(run_recognize(ctx, record));
            }
            EngineRequest::Enroll {
                id,
                name,
                frames,
                session,
                feed,
                slot,
                reply,
            } => {
                let result = run_enroll(ctx, id, &name, &frames, session, feed);
                drop(slot);
                let _ = reply.send(result);
            }
        }
    }
    tracing::debug!(worker = n, "engine worker exiting");
}

fn load(record: &FrameRecord) -> Result<presence_core::Frame, EngineError> {
    let path = record.image.display().to_string();
    let frame = record.load_frame().map_err(|e| EngineError::Frame {
        path: path.clone(),
        reason: format!("{e:#}"),
    })?;
    Ok(frame.with_release(move || tracing::trace!(path = %path, "frame released")))
}

fn run_recognize(ctx: &EngineContext, record: FrameRecord) -> Result<FrameReport, EngineError> {
    let frame = load(&record)?;
    Ok(ctx.pipeline.process_frame(frame, record.faces))
}

/// Clears the engine's enrollment slot when the enrollment ends, however it
/// ends, including a request dropped before any worker picked it up.
struct EnrollmentSlot(Arc<EngineContext>);

impl Drop for EnrollmentSlot {
    fn drop(&mut self) {
        *self.0.enrolling() = None;
    }
}

fn run_enroll(
    ctx: &EngineContext,
    id: u32,
    name: &str,
    frames: &[FrameRecord],
    session: EnrollmentSession,
    feed: SampleFeed,
) -> Result<RosterEntry, EngineError> {
    tracing::info!(id, name, samples = session.target(), "enrollment started");
    let aggregator = std::thread::Builder::new()
        .name("presence-enroll".into())
        .spawn(move || session.run())
        .map_err(EngineError::Spawn)?;

    // Recorded frames are replayed with hand-off so none is dropped while the
    // aggregator catches up.
    for record in frames {
        if feed.is_closed() {
            break;
        }
        let frame = match load(record) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::warn!(error = %err, "enrollment frame skipped");
                continue;
            }
        };
        match ctx.pipeline.enrollment_sample(frame, &record.faces) {
            Ok(Some(embedding)) => match feed.hand_off(embedding) {
                Offer::Closed => break,
                offer => tracing::debug!(?offer, collected = feed.collected(), "sample offered"),
            },
            Ok(None) => {}
            Err(err) => tracing::warn!(error = %err, "enrollment face skipped"),
        }
    }
    drop(feed);

    let centroid = aggregator
        .join()
        .map_err(|_| EngineError::AggregatorPanicked)??;
    Ok(ctx.pipeline.roster().commit(id, name, centroid)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use presence_core::{
        AttendanceEvent, BoundingBox, Decision, Embedding, FaceCrop, MemoryRosterStore, Rotation,
    };
    use std::path::PathBuf;
    use std::sync::mpsc as std_mpsc;

    /// Embeds a crop as its mean (R, G, B).
    struct MeanColorExtractor;

    impl EmbeddingExtractor for MeanColorExtractor {
        fn embedding_len(&self) -> usize {
            3
        }

        fn extract(&mut self, crop: &FaceCrop) -> Result<Embedding, ExtractError> {
            let (w, h) = crop.image.dimensions();
            let n = (w * h) as f32;
            let mut sum = [0.0f32; 3];
            for p in crop.image.pixels() {
                for c in 0..3 {
                    sum[c] += p[c] as f32;
                }
            }
            Ok(Embedding::new(sum.iter().map(|s| s / n).collect()))
        }
    }

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            embedding_len: 3,
            enrollment_samples: 3,
            enrollment_timeout_secs: 5,
            ..Default::default()
        }
    }

    fn engine() -> (EngineHandle, std_mpsc::Receiver<AttendanceEvent>) {
        let (tx, rx) = std_mpsc::channel();
        let handle = start_engine(
            Box::new(MeanColorExtractor),
            Box::new(MemoryRosterStore::new()),
            test_config(),
            2,
            Arc::new(Mutex::new(tx)),
        )
        .unwrap();
        (handle, rx)
    }

    /// Write a 20x20 image of one color and describe it as a one-face frame.
    fn write_frame(tag: &str, color: [u8; 3]) -> FrameRecord {
        let path: PathBuf = std::env::temp_dir().join(format!(
            "presence-engine-{}-{tag}.png",
            std::process::id()
        ));
        image::RgbImage::from_pixel(20, 20, image::Rgb(color))
            .save(&path)
            .unwrap();
        FrameRecord {
            image: path,
            rotation: Rotation::Deg0,
            faces: vec![BoundingBox {
                x: 2.0,
                y: 2.0,
                width: 16.0,
                height: 16.0,
                confidence: 0.9,
            }],
        }
    }

    #[tokio::test]
    async fn test_enroll_then_attend() {
        let (engine, events) = engine();
        let frames: Vec<FrameRecord> = (0..3)
            .map(|i| write_frame(&format!("enroll-{i}"), [180, 40, 40]))
            .collect();

        let entry = engine.enroll(7, "Ada".into(), frames.clone()).await.unwrap();
        assert_eq!(entry.id, 7);
        assert!(!entry.attended);
        let expected = [180.0, 40.0, 40.0];
        assert!(entry
            .embedding
            .values()
            .iter()
            .zip(expected)
            .all(|(a, b)| (a - b).abs() < 1e-3));
        assert_eq!(engine.roster().len(), 1);

        let report = engine.recognize(frames[0].clone()).await.unwrap();
        assert!(matches!(report.outcomes[0], Ok(Decision::Marked { id: 7, .. })));
        let report = engine.recognize(frames[1].clone()).await.unwrap();
        assert!(matches!(
            report.outcomes[0],
            Ok(Decision::AlreadyAttended { id: 7, .. })
        ));

        let received: Vec<AttendanceEvent> = events.try_iter().collect();
        assert_eq!(
            received,
            vec![AttendanceEvent {
                id: 7,
                name: "Ada".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_enroll_short_stream_commits_nothing() {
        let (engine, _events) = engine();
        let mut frames = vec![write_frame("short-0", [10, 200, 10])];
        // Two faces: not a usable enrollment sample.
        let mut crowded = write_frame("short-1", [10, 200, 10]);
        crowded.faces.push(crowded.faces[0]);
        frames.push(crowded);

        let err = engine.enroll(1, "Grace".into(), frames).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Enrollment(EnrollmentError::StreamClosed {
                collected: 1,
                target: 3
            })
        ));
        assert!(engine.roster().is_empty());
        assert!(!engine.cancel_enrollment());
    }

    #[tokio::test]
    async fn test_cancel_before_queued_commits_nothing() {
        let (engine, _events) = engine();
        let frames: Vec<FrameRecord> = (0..3)
            .map(|i| write_frame(&format!("queued-{i}"), [90, 90, 90]))
            .collect();

        let pending = engine.begin_enrollment(4, "Edsger".into(), frames).unwrap();
        assert!(matches!(
            engine.begin_enrollment(5, "Barbara".into(), vec![]),
            Err(EngineError::EnrollmentBusy)
        ));
        assert!(engine.cancel_enrollment());

        let err = pending.finish().await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Enrollment(EnrollmentError::Cancelled { collected: 0 })
        ));
        assert!(engine.roster().is_empty());
        assert!(!engine.cancel_enrollment());
    }

    /// MeanColorExtractor that takes a while per face.
    struct SlowExtractor;

    impl EmbeddingExtractor for SlowExtractor {
        fn embedding_len(&self) -> usize {
            3
        }

        fn extract(&mut self, crop: &FaceCrop) -> Result<Embedding, ExtractError> {
            std::thread::sleep(std::time::Duration::from_millis(10));
            MeanColorExtractor.extract(crop)
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_commits_nothing() {
        let (tx, _events) = std_mpsc::channel();
        let engine = start_engine(
            Box::new(SlowExtractor),
            Box::new(MemoryRosterStore::new()),
            PipelineConfig {
                enrollment_samples: 200,
                ..test_config()
            },
            1,
            Arc::new(Mutex::new(tx)),
        )
        .unwrap();
        let frame = write_frame("slow", [60, 120, 180]);
        let frames = vec![frame; 200];

        let pending = engine.begin_enrollment(3, "Ken".into(), frames).unwrap();
        let cancel = pending.cancel_handle();
        let task = tokio::spawn(pending.finish());
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel.cancel();

        match task.await.unwrap() {
            Err(EngineError::Enrollment(EnrollmentError::Cancelled { collected })) => {
                assert!(collected < 200, "{collected}")
            }
            other => panic!("expected cancellation, got {other:?}"),
        }
        assert!(engine.roster().is_empty());
    }

    #[tokio::test]
    async fn test_recognize_missing_image() {
        let (engine, _events) = engine();
        let record = FrameRecord {
            image: PathBuf::from("/nonexistent/frame.png"),
            rotation: Rotation::Deg0,
            faces: vec![],
        };
        let err = engine.recognize(record).await.unwrap_err();
        assert!(matches!(err, EngineError::Frame { .. }));
    }

    #[tokio::test]
    async fn test_inactive_engine_reports_boxes_only() {
        let (engine, events) = engine();
        let frames: Vec<FrameRecord> = (0..3)
            .map(|i| write_frame(&format!("inactive-{i}"), [30, 30, 220]))
            .collect();
        engine.enroll(2, "Linus".into(), frames.clone()).await.unwrap();

        engine.set_active(false);
        let report = engine.recognize(frames[0].clone()).await.unwrap();
        assert_eq!(report.faces.len(), 1);
        assert_eq!(report.resolution, (20, 20));
        assert!(report.outcomes.is_empty());
        assert!(events.try_recv().is_err());
    }
}
