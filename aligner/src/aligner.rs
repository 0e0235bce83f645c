use std::sync::Arc;

use common::Shared;
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{error, info, warn};

use crate::axis::{AtlasGeometry, DisplayMode, OverlapMode};
use crate::command::{Command, Result};
use crate::config::{AlignerConfig, AtlasRotation};
use crate::error::{CommandError, ConfigError};
use crate::event::{EventBus, SessionEvent};
use crate::image::{ImageSet, SourcesProcessor};
use crate::manual_lock::ManualLock;
use crate::pipeline::{PipelineContext, RegistrationStage};
use crate::registration::{Registration, RegistrationParameters, RegistrationRegistry};
use crate::session::{self, Direction, PlannedMove, Side, SliceCollection, SliceDisplayMode};
use crate::slice::{RotationAxis, Slice};
use crate::undo_stack::CommandStack;

/// Entry point of the engine: owns the slices, the command history and the
/// background pipelines, and accepts every user intent.
#[derive(Debug)]
pub struct Aligner {
    pub(crate) config: AlignerConfig,
    pub(crate) session: SliceCollection,
    pub(crate) commands: Shared<CommandStack>,
    pub(crate) registry: RegistrationRegistry,
    pub(crate) pipeline_ctx: PipelineContext,
    pub(crate) rotation: RwLock<AtlasRotation>,
    pub(crate) events: EventBus,
}

impl Aligner {
    /// Must be called from within a tokio runtime; slice pipelines are
    /// spawned on it.
    pub fn new(
        config: AlignerConfig,
        registry: RegistrationRegistry,
        reference: ImageSet,
    ) -> std::result::Result<Self, ConfigError> {
        config.atlas.validate()?;
        let runtime = Handle::try_current().map_err(|_| ConfigError::NoRuntime)?;
        let events = EventBus::default();

        Ok(Self {
            session: SliceCollection::new(
                config.atlas,
                config.display_mode,
                config.overlap_mode,
                events.clone(),
            ),
            commands: Shared::new(CommandStack::new(config.undo_limit)),
            registry,
            pipeline_ctx: PipelineContext {
                runtime,
                reference: Arc::new(reference),
                manual_lock: ManualLock::default(),
                events: events.clone(),
            },
            rotation: RwLock::new(config.rotation),
            events,
            config,
        })
    }

    pub fn config(&self) -> &AlignerConfig {
        &self.config
    }

    pub fn geometry(&self) -> &AtlasGeometry {
        &self.config.atlas
    }

    pub fn session(&self) -> &SliceCollection {
        &self.session
    }

    pub fn registry(&self) -> &RegistrationRegistry {
        &self.registry
    }

    pub fn manual_lock(&self) -> &ManualLock {
        &self.pipeline_ctx.manual_lock
    }

    pub fn subscribe(&self) -> UnboundedReceiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn rotation(&self) -> AtlasRotation {
        *self.rotation.read()
    }

    pub fn set_rotation(&self, rotation: AtlasRotation) {
        *self.rotation.write() = rotation;
    }

    pub fn slices(&self) -> Vec<Arc<Slice>> {
        self.session.slices()
    }

    pub fn sorted_slices(&self) -> Vec<Arc<Slice>> {
        self.session.sorted_slices()
    }

    pub fn selected_slices(&self) -> Vec<Arc<Slice>> {
        self.session.selected_slices()
    }

    pub fn current_slice(&self) -> Option<Arc<Slice>> {
        self.session.current_slice()
    }

    pub async fn wait_for_tasks(&self) {
        for slice in self.session.slices() {
            slice.wait_for_end_of_tasks().await;
        }
    }

    // Selection and view intents, not recorded as commands.

    pub fn select_slice(&self, slice: &Arc<Slice>) {
        slice.select();
    }

    pub fn deselect_slice(&self, slice: &Arc<Slice>) {
        slice.deselect();
    }

    pub fn select_all(&self) {
        for slice in self.session.slices() {
            slice.select();
        }
    }

    pub fn deselect_all(&self) {
        for slice in self.session.slices() {
            slice.deselect();
        }
    }

    pub fn set_slice_visible(&self, slice: &Arc<Slice>, visible: bool) {
        slice.set_visible(visible);
    }

    pub fn set_display_mode(&self, mode: DisplayMode) {
        self.session.set_display_mode(mode);
    }

    pub fn next_mode(&self) {
        self.session.next_mode();
    }

    pub fn set_slice_display_mode(&self, mode: SliceDisplayMode) {
        self.session.set_slice_display_mode(mode);
    }

    pub fn set_overlap_mode(&self, mode: OverlapMode) {
        self.session.set_overlap_mode(mode);
    }

    pub fn toggle_overlap(&self) {
        self.session.toggle_overlap();
    }

    pub fn navigate_next(&self) -> Option<Arc<Slice>> {
        self.session.navigate_next()
    }

    pub fn navigate_previous(&self) -> Option<Arc<Slice>> {
        self.session.navigate_previous()
    }

    pub fn navigate_current(&self) -> Option<Arc<Slice>> {
        self.session.navigate_current()
    }

    // Undoable intents.

    pub async fn create_slice(&self, sources: ImageSet, axis_position: f64) -> Result<Arc<Slice>> {
        let slice = Slice::new(sources, axis_position, &self.pipeline_ctx);
        self.execute(Command::create(Arc::clone(&slice))).await?;
        Ok(slice)
    }

    /// Creates one slice per image set, `spacing` apart along the axis.
    pub async fn create_slices(
        &self,
        sources: Vec<ImageSet>,
        first_position: f64,
        spacing: f64,
    ) -> Result<Vec<Arc<Slice>>> {
        let slices: Vec<Arc<Slice>> = sources
            .into_iter()
            .enumerate()
            .map(|(i, images)| {
                Slice::new(
                    images,
                    first_position + i as f64 * spacing,
                    &self.pipeline_ctx,
                )
            })
            .collect();
        self.execute_batch(slices.iter().cloned().map(Command::create).collect())
            .await?;
        Ok(slices)
    }

    pub async fn move_slice(&self, slice: &Arc<Slice>, axis_position: f64) -> Result<()> {
        self.ensure_member(slice)?;
        self.execute(Command::move_slice(Arc::clone(slice), axis_position))
            .await?;
        Ok(())
    }

    pub async fn delete_slice(&self, slice: &Arc<Slice>) -> Result<()> {
        self.ensure_member(slice)?;
        self.execute(Command::delete(Arc::clone(slice))).await?;
        Ok(())
    }

    pub async fn delete_selected(&self) -> Result<usize> {
        let selected = self.require_selection("delete")?;
        let count = selected.len();
        self.execute_batch(selected.into_iter().map(Command::delete).collect())
            .await?;
        Ok(count)
    }

    /// Queues a registration from the registry on every selected slice.
    pub async fn register_selected(
        &self,
        name: &str,
        parameters: &RegistrationParameters,
        preprocess_fixed: SourcesProcessor,
        preprocess_moving: SourcesProcessor,
    ) -> Result<Vec<Arc<RegistrationStage>>> {
        if !self.registry.contains(name) {
            warn!("Unknown registration `{name}`");
            return Err(CommandError::UnknownRegistration(name.to_string()));
        }
        let selected = self.require_selection("registration")?;

        let mut stages = Vec::with_capacity(selected.len());
        let mut commands = Vec::with_capacity(selected.len());
        for slice in selected {
            let registration = self
                .registry
                .create(name, parameters)
                .ok_or_else(|| CommandError::UnknownRegistration(name.to_string()))?;
            let stage = RegistrationStage::new(
                registration,
                slice.axis_position(),
                preprocess_fixed.clone(),
                preprocess_moving.clone(),
            );
            stages.push(Arc::clone(&stage));
            commands.push(Command::register(slice, stage));
        }
        self.execute_batch(commands).await?;
        Ok(stages)
    }

    /// Queues an already built registration on one slice.
    pub async fn register_slice(
        &self,
        slice: &Arc<Slice>,
        registration: Box<dyn Registration>,
        preprocess_fixed: SourcesProcessor,
        preprocess_moving: SourcesProcessor,
    ) -> Result<Arc<RegistrationStage>> {
        self.ensure_member(slice)?;
        let stage = RegistrationStage::new(
            registration,
            slice.axis_position(),
            preprocess_fixed,
            preprocess_moving,
        );
        self.execute(Command::register(Arc::clone(slice), Arc::clone(&stage)))
            .await?;
        Ok(stage)
    }

    pub async fn remove_last_registration(&self) -> Result<usize> {
        let selected = self.require_selection("registration removal")?;
        let count = selected.len();
        self.execute_batch(
            selected
                .into_iter()
                .map(Command::remove_last_registration)
                .collect(),
        )
        .await?;
        Ok(count)
    }

    pub async fn export_regions(&self, target: &str) -> Result<usize> {
        let selected = self.require_selection("export")?;
        let count = selected.len();
        self.execute_batch(
            selected
                .into_iter()
                .map(|slice| Command::export_regions(slice, target))
                .collect(),
        )
        .await?;
        Ok(count)
    }

    pub async fn equal_spacing_selected(&self) -> Result<usize> {
        let selected = self.require_selection("equal spacing")?;
        self.apply_plan(session::equal_spacing(&selected)).await
    }

    pub async fn stretch_selected(&self, side: Side) -> Result<usize> {
        let selected = self.require_selection("stretch")?;
        let step_size = self.geometry().step_size();
        self.apply_plan(session::stretch(&selected, side, step_size))
            .await
    }

    pub async fn shrink_selected(&self, side: Side) -> Result<usize> {
        let selected = self.require_selection("shrink")?;
        let step_size = self.geometry().step_size();
        self.apply_plan(session::shrink(&selected, side, step_size))
            .await
    }

    pub async fn shift_selected(&self, direction: Direction) -> Result<usize> {
        let selected = self.require_selection("shift")?;
        let step_size = self.geometry().step_size();
        self.apply_plan(session::shift(&selected, direction, step_size))
            .await
    }

    /// Rotates the source origin of every selected slice once their
    /// pipelines are idle.
    pub async fn rotate_selected(&self, axis: RotationAxis, angle: f64) -> Result<usize> {
        let selected = self.require_selection("rotation")?;
        for slice in selected.iter() {
            slice.wait_for_end_of_tasks().await;
            slice.rotate_source_origin(axis, angle)?;
        }
        Ok(selected.len())
    }

    pub fn cancel_pending(&self, slice: &Arc<Slice>) -> usize {
        slice.pipeline().cancel_pending()
    }

    pub async fn begin_batch(&self) {
        self.commands.lock().await.begin_batch();
    }

    pub async fn end_batch(&self) {
        self.commands.lock().await.end_batch();
    }

    pub async fn undo_message(&self) -> String {
        self.commands.lock().await.undo_message()
    }

    pub async fn redo_message(&self) -> String {
        self.commands.lock().await.redo_message()
    }

    /// Undoes the last command or batch; `false` when there is nothing to
    /// undo.
    pub async fn undo(&self) -> Result<bool> {
        let mut commands = self.commands.lock().await;
        let Some(run) = commands.take_undo_run()? else {
            info!("No action can be cancelled.");
            return Ok(false);
        };

        for (done, command) in run.iter().enumerate() {
            if let Err(err) = command.undo(&self.session).await {
                error!("Undo of {} failed: {err}", command.kind());
                for command in run[..done].iter().rev() {
                    if let Err(err) = command.apply(&self.session).await {
                        error!("Could not re-apply {}: {err}", command.kind());
                    }
                }
                commands.restore_undo_run(run);
                return Err(err);
            }
        }
        commands.finish_undo(run);
        Ok(true)
    }

    pub async fn redo(&self) -> Result<bool> {
        let mut commands = self.commands.lock().await;
        let Some(run) = commands.take_redo_run()? else {
            info!("No action can be redone.");
            return Ok(false);
        };

        for (done, command) in run.iter().enumerate() {
            if let Err(err) = command.apply(&self.session).await {
                error!("Redo of {} failed: {err}", command.kind());
                for command in run[..done].iter().rev() {
                    if let Err(err) = command.undo(&self.session).await {
                        error!("Could not revert {}: {err}", command.kind());
                    }
                }
                commands.restore_redo_run(run);
                return Err(err);
            }
        }
        commands.finish_redo(run);
        Ok(true)
    }

    pub(crate) async fn execute(&self, command: Command) -> Result<Arc<Command>> {
        let mut commands = self.commands.lock().await;
        self.run_command(&mut commands, command).await
    }

    /// Executes `batch` as a single undo unit, between markers when it holds
    /// more than one command.
    pub(crate) async fn execute_batch(&self, batch: Vec<Command>) -> Result<Vec<Arc<Command>>> {
        let markers = batch.len() > 1;
        self.execute_unit(batch, markers).await
    }

    /// All or nothing: when a command fails, the ones already applied are
    /// reverted and leave the history.
    async fn execute_unit(
        &self,
        batch: Vec<Command>,
        markers: bool,
    ) -> Result<Vec<Arc<Command>>> {
        let mut commands = self.commands.lock().await;
        if markers {
            commands.begin_batch();
        }
        let checkpoint = commands.checkpoint();

        let mut executed = Vec::with_capacity(batch.len());
        let mut failure = None;
        for command in batch {
            match self.run_command(&mut commands, command).await {
                Ok(command) => executed.push(command),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }

        if let Some(err) = &failure {
            if !executed.is_empty() {
                warn!("{err}: reverting {} applied commands", executed.len());
            }
            for command in executed.iter().rev() {
                if let Err(undo_err) = command.undo(&self.session).await {
                    error!("Could not revert {}: {undo_err}", command.kind());
                }
            }
            commands.rollback(checkpoint);
        }

        if markers {
            commands.end_batch();
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(executed),
        }
    }

    async fn run_command(
        &self,
        commands: &mut CommandStack,
        command: Command,
    ) -> Result<Arc<Command>> {
        let command = Arc::new(command);
        command.apply(&self.session).await?;
        commands.push_executed(Arc::clone(&command));
        Ok(command)
    }

    async fn apply_plan(&self, plan: Vec<PlannedMove>) -> Result<usize> {
        let count = plan.len();
        self.execute_unit(
            plan.into_iter()
                .map(|(slice, position)| Command::move_slice(slice, position))
                .collect(),
            true,
        )
        .await?;
        Ok(count)
    }

    fn require_selection(&self, operation: &'static str) -> Result<Vec<Arc<Slice>>> {
        let selected = self.session.selected_slices();
        if selected.is_empty() {
            warn!("No slice selected: {operation} ignored");
            self.events.emit(SessionEvent::Warning {
                title: "No slice selected".to_string(),
                message: format!("Select at least one slice before the {operation}."),
            });
            return Err(CommandError::NoSelection { operation });
        }
        Ok(selected)
    }

    fn ensure_member(&self, slice: &Arc<Slice>) -> Result<()> {
        if self.session.contains(slice) {
            Ok(())
        } else {
            Err(CommandError::UnknownSlice(slice.id()))
        }
    }
}
