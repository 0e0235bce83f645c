use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use common::id_type;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::PipelineError;
use crate::event::{EventBus, SessionEvent};
use crate::image::{ImageSet, SourcesProcessor};
use crate::manual_lock::ManualLock;
use crate::registration::{Registration, RegistrationParameters};
use crate::slice::SliceId;

id_type!(StageId);

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    Queued,
    Running,
    Applied,
    Failed,
    Cancelled,
}

/// One registration bound to one slice.
#[derive(Debug)]
pub struct RegistrationStage {
    id: StageId,
    name: String,
    manual: bool,
    replay: bool,
    reference_plane: f64,
    preprocess_fixed: SourcesProcessor,
    preprocess_moving: SourcesProcessor,
    registration: Mutex<Box<dyn Registration>>,
    outcome: Mutex<StageOutcome>,
}

impl RegistrationStage {
    /// `reference_plane` is the axis position of the atlas plane the slice
    /// is registered against.
    pub fn new(
        registration: Box<dyn Registration>,
        reference_plane: f64,
        preprocess_fixed: SourcesProcessor,
        preprocess_moving: SourcesProcessor,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: StageId::unique(),
            name: registration.name().to_string(),
            manual: registration.is_manual(),
            replay: false,
            reference_plane,
            preprocess_fixed,
            preprocess_moving,
            registration: Mutex::new(registration),
            outcome: Mutex::new(StageOutcome::Queued),
        })
    }

    /// Stage whose registration already carries its solved state; the
    /// algorithm is not run again.
    pub fn replay(
        registration: Box<dyn Registration>,
        reference_plane: f64,
        preprocess_fixed: SourcesProcessor,
        preprocess_moving: SourcesProcessor,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: StageId::unique(),
            name: registration.name().to_string(),
            manual: registration.is_manual(),
            replay: true,
            reference_plane,
            preprocess_fixed,
            preprocess_moving,
            registration: Mutex::new(registration),
            outcome: Mutex::new(StageOutcome::Queued),
        })
    }

    pub fn id(&self) -> StageId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_manual(&self) -> bool {
        self.manual
    }

    pub fn is_replay(&self) -> bool {
        self.replay
    }

    pub fn outcome(&self) -> StageOutcome {
        *self.outcome.lock()
    }

    /// Failed or cancelled; running the stage again could change the slice.
    pub fn has_ended_unapplied(&self) -> bool {
        matches!(self.outcome(), StageOutcome::Failed | StageOutcome::Cancelled)
    }

    pub fn preprocess_fixed(&self) -> &SourcesProcessor {
        &self.preprocess_fixed
    }

    pub fn preprocess_moving(&self) -> &SourcesProcessor {
        &self.preprocess_moving
    }

    pub fn parameters(&self) -> RegistrationParameters {
        self.registration.lock().parameters()
    }

    pub fn solved_state(&self) -> RegistrationParameters {
        self.registration.lock().solved_state()
    }

    fn set_outcome(&self, outcome: StageOutcome) {
        *self.outcome.lock() = outcome;
    }

    fn fixed_input(&self, reference: &ImageSet) -> ImageSet {
        SourcesProcessor::zero_axis(self.reference_plane)
            .then(self.preprocess_fixed.clone())
            .apply(reference)
    }

    // blocking
    fn solve(&self, fixed: ImageSet, moving: ImageSet, current: &ImageSet) -> Option<ImageSet> {
        let mut registration = self.registration.lock();
        registration.set_fixed_image(fixed);
        registration.set_moving_image(moving);
        if !self.replay && !registration.register() {
            return None;
        }
        Some(registration.transformed_image_moving_to_fixed(current))
    }
}

#[derive(Debug, Clone)]
pub struct AppliedStage {
    pub stage: Arc<RegistrationStage>,
    pub output: ImageSet,
}

/// Everything a slice pipeline borrows from its session.
#[derive(Debug, Clone)]
pub struct PipelineContext {
    pub runtime: Handle,
    pub reference: Arc<ImageSet>,
    pub manual_lock: ManualLock,
    pub events: EventBus,
}

#[derive(Debug)]
struct PipelineState {
    original: ImageSet,
    history: Vec<AppliedStage>,
    queued: Vec<StageId>,
    in_flight: Option<StageId>,
}

impl PipelineState {
    fn current(&self) -> ImageSet {
        self.history
            .last()
            .map_or_else(|| self.original.clone(), |applied| applied.output.clone())
    }

    fn ensure_idle(&self) -> Result<()> {
        match self.in_flight.or_else(|| self.queued.first().copied()) {
            Some(stage) => Err(PipelineError::StagePending { stage }),
            None => Ok(()),
        }
    }
}

#[derive(Debug)]
struct PipelineShared {
    slice_id: SliceId,
    state: Mutex<PipelineState>,
    // queued + in flight
    busy: watch::Sender<usize>,
    generation: AtomicU64,
}

#[derive(Debug)]
struct QueuedStage {
    stage: Arc<RegistrationStage>,
    generation: u64,
}

/// Ordered registration chain of one slice, executed on a dedicated task.
#[derive(Debug)]
pub struct RegistrationPipeline {
    shared: Arc<PipelineShared>,
    tx: UnboundedSender<QueuedStage>,
}

impl RegistrationPipeline {
    pub fn new(slice_id: SliceId, original: ImageSet, ctx: &PipelineContext) -> Self {
        let (busy, _) = watch::channel(0usize);
        let shared = Arc::new(PipelineShared {
            slice_id,
            state: Mutex::new(PipelineState {
                original,
                history: Vec::new(),
                queued: Vec::new(),
                in_flight: None,
            }),
            busy,
            generation: AtomicU64::new(0),
        });

        let (tx, rx) = unbounded_channel::<QueuedStage>();
        ctx.runtime.spawn({
            let ctx = ctx.clone();
            let shared = Arc::clone(&shared);
            async move {
                pipeline_loop(rx, ctx, shared).await;
            }
        });

        Self { shared, tx }
    }

    /// Queues `stage` after every stage already queued; returns immediately.
    pub fn add_stage(&self, stage: Arc<RegistrationStage>) {
        let stage_id = stage.id();
        stage.set_outcome(StageOutcome::Queued);
        self.shared.state.lock().queued.push(stage_id);
        self.shared.busy.send_modify(|count| *count += 1);

        let generation = self.shared.generation.load(Ordering::Acquire);
        debug!(slice = %self.shared.slice_id, stage = %stage_id, "queued `{}`", stage.name());
        if self.tx.send(QueuedStage { stage, generation }).is_err() {
            error!(slice = %self.shared.slice_id, "Pipeline task is gone, stage {stage_id} dropped");
            self.shared.state.lock().queued.retain(|id| *id != stage_id);
            self.shared.busy.send_modify(|count| *count -= 1);
        }
    }

    /// Skips every stage queued so far. A running stage still completes.
    pub fn cancel_pending(&self) -> usize {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        self.shared.state.lock().queued.len()
    }

    pub async fn wait_for_end_of_tasks(&self) {
        let mut busy = self.shared.busy.subscribe();
        if busy.wait_for(|count| *count == 0).await.is_err() {
            warn!(slice = %self.shared.slice_id, "Pipeline closed while waiting for its tasks");
        }
    }

    pub fn has_pending(&self) -> bool {
        *self.shared.busy.borrow() > 0
    }

    pub fn pending_stages(&self) -> Vec<StageId> {
        let state = self.shared.state.lock();
        state.in_flight.iter().chain(state.queued.iter()).copied().collect()
    }

    /// Rolls back the most recently applied stage.
    pub fn remove_last_stage(&self) -> Result<AppliedStage> {
        let mut state = self.shared.state.lock();
        if let Err(err) = state.ensure_idle() {
            error!(slice = %self.shared.slice_id, "Cannot remove a registration: {err}");
            return Err(err);
        }
        state.history.pop().ok_or(PipelineError::NothingToRemove)
    }

    /// Rolls back `stage_id`, which must be the most recently applied stage.
    pub fn remove_stage(&self, stage_id: StageId) -> Result<AppliedStage> {
        let mut state = self.shared.state.lock();
        if let Err(err) = state.ensure_idle() {
            error!(slice = %self.shared.slice_id, "Cannot remove stage {stage_id}: {err}");
            return Err(err);
        }
        match state.history.last() {
            Some(last) if last.stage.id() == stage_id => {}
            _ if state.history.iter().any(|applied| applied.stage.id() == stage_id) => {
                return Err(PipelineError::NotLastStage { stage: stage_id });
            }
            _ => return Err(PipelineError::UnknownStage { stage: stage_id }),
        }
        state.history.pop().ok_or(PipelineError::NothingToRemove)
    }

    /// Re-appends a previously removed stage with its snapshot.
    pub fn restore_stage(&self, applied: AppliedStage) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.ensure_idle()?;
        applied.stage.set_outcome(StageOutcome::Applied);
        state.history.push(applied);
        Ok(())
    }

    /// Swaps the innermost source transform across the original images and
    /// every snapshot.
    pub fn change_source_origin(&self, old: glam::DAffine3, new: glam::DAffine3) -> Result<()> {
        let mut state = self.shared.state.lock();
        state.ensure_idle()?;
        state.original = state.original.with_source_origin(old, new);
        for applied in state.history.iter_mut() {
            applied.output = applied.output.with_source_origin(old, new);
        }
        Ok(())
    }

    pub fn current(&self) -> ImageSet {
        self.shared.state.lock().current()
    }

    pub fn original(&self) -> ImageSet {
        self.shared.state.lock().original.clone()
    }

    pub fn history(&self) -> Vec<AppliedStage> {
        self.shared.state.lock().history.clone()
    }

    pub fn history_len(&self) -> usize {
        self.shared.state.lock().history.len()
    }

    pub fn stages(&self) -> Vec<Arc<RegistrationStage>> {
        self.shared
            .state
            .lock()
            .history
            .iter()
            .map(|applied| Arc::clone(&applied.stage))
            .collect()
    }

    pub fn is_applied(&self, stage_id: StageId) -> bool {
        self.shared
            .state
            .lock()
            .history
            .iter()
            .any(|applied| applied.stage.id() == stage_id)
    }
}

async fn pipeline_loop(
    mut rx: UnboundedReceiver<QueuedStage>,
    ctx: PipelineContext,
    shared: Arc<PipelineShared>,
) {
    while let Some(QueuedStage { stage, generation }) = rx.recv().await {
        if generation != shared.generation.load(Ordering::Acquire) {
            shared.state.lock().queued.retain(|id| *id != stage.id());
            stage.set_outcome(StageOutcome::Cancelled);
            warn!(slice = %shared.slice_id, "Registration `{}` cancelled", stage.name());
            ctx.events.emit(SessionEvent::StageCancelled {
                slice_id: shared.slice_id,
                stage_id: stage.id(),
                name: stage.name().to_string(),
            });
        } else {
            run_stage(&ctx, &shared, stage).await;
        }
        shared.busy.send_modify(|count| *count -= 1);
    }
    debug!(slice = %shared.slice_id, "pipeline task finished");
}

async fn run_stage(ctx: &PipelineContext, shared: &PipelineShared, stage: Arc<RegistrationStage>) {
    let current = {
        let mut state = shared.state.lock();
        state.queued.retain(|id| *id != stage.id());
        state.in_flight = Some(stage.id());
        state.current()
    };
    stage.set_outcome(StageOutcome::Running);

    let fixed = stage.fixed_input(&ctx.reference);
    let moving = stage.preprocess_moving().apply(&current);

    let manual_guard = if stage.is_manual() && !stage.is_replay() {
        debug!(slice = %shared.slice_id, "waiting for the manual lock");
        Some(ctx.manual_lock.acquire().await)
    } else {
        None
    };
    let solved = tokio::task::spawn_blocking({
        let stage = Arc::clone(&stage);
        move || stage.solve(fixed, moving, &current)
    })
    .await;
    if let Some(guard) = manual_guard {
        guard.release();
    }

    let output = match solved {
        Ok(output) => output,
        Err(err) => {
            error!(slice = %shared.slice_id, "Registration `{}` panicked: {err}", stage.name());
            None
        }
    };

    let applied = {
        let mut state = shared.state.lock();
        state.in_flight = None;
        match output {
            Some(output) => {
                state.history.push(AppliedStage {
                    stage: Arc::clone(&stage),
                    output,
                });
                true
            }
            None => false,
        }
    };

    let slice_id = shared.slice_id;
    let stage_id = stage.id();
    let name = stage.name().to_string();
    if applied {
        stage.set_outcome(StageOutcome::Applied);
        info!(slice = %slice_id, "Registration `{name}` applied");
        ctx.events.emit(SessionEvent::StageApplied {
            slice_id,
            stage_id,
            name,
        });
    } else {
        stage.set_outcome(StageOutcome::Failed);
        warn!(slice = %slice_id, "Registration `{name}` failed, slice left unchanged");
        ctx.events.emit(SessionEvent::StageFailed {
            slice_id,
            stage_id,
            name,
        });
    }
}
