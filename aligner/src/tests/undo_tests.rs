use std::sync::Arc;

use glam::DVec3;

use crate::error::CommandError;
use crate::event::SessionEvent;
use crate::image::SourcesProcessor;
use crate::error::PipelineError;
use crate::tests::support::{self, Probe, TestRegistration, FAILING, SHIFT};

#[tokio::test(flavor = "multi_thread")]
async fn undo_is_a_perfect_inverse() -> anyhow::Result<()> {
    let probe = Probe::default();
    let aligner = support::aligner(&probe);
    let a = aligner.create_slice(support::sources(2), 0.0).await?;
    let b = aligner.create_slice(support::sources(1), 1.0).await?;
    aligner.wait_for_tasks().await;
    let before = support::snapshot(&aligner);

    aligner.move_slice(&a, 3.0).await?;
    aligner.select_slice(&a);
    aligner
        .register_selected(
            SHIFT,
            &TestRegistration::offset_parameters(DVec3::X),
            SourcesProcessor::Identity,
            SourcesProcessor::Identity,
        )
        .await?;
    aligner.move_slice(&b, 7.0).await?;
    aligner.delete_slice(&b).await?;
    aligner.wait_for_tasks().await;
    assert_eq!(aligner.slices().len(), 1);
    assert_eq!(a.registration_history().len(), 1);

    for _ in 0..4 {
        assert!(aligner.undo().await?);
    }
    aligner.wait_for_tasks().await;

    assert_eq!(support::snapshot(&aligner), before);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn redo_restores_the_state_before_undo() -> anyhow::Result<()> {
    let probe = Probe::default();
    let aligner = support::aligner(&probe);
    let slice = aligner.create_slice(support::sources(1), 0.5).await?;
    aligner.select_slice(&slice);
    aligner
        .register_selected(
            SHIFT,
            &TestRegistration::offset_parameters(DVec3::Y),
            SourcesProcessor::Identity,
            SourcesProcessor::Identity,
        )
        .await?;
    aligner.move_slice(&slice, 2.0).await?;
    aligner.wait_for_tasks().await;
    let done = support::snapshot(&aligner);

    assert!(aligner.undo().await?);
    assert_eq!(aligner.redo_message().await, "(Move Slice)");
    assert!(aligner.redo().await?);
    assert_eq!(support::snapshot(&aligner), done);

    assert!(aligner.undo().await?);
    assert!(aligner.undo().await?);
    assert!(slice.registration_history().is_empty());
    assert!(aligner.redo().await?);
    assert!(aligner.redo().await?);
    aligner.wait_for_tasks().await;
    assert_eq!(support::snapshot(&aligner), done);

    // the solved snapshot is restored, not recomputed
    assert_eq!(probe.register_calls(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn batch_is_undone_as_one_action() -> anyhow::Result<()> {
    let probe = Probe::default();
    let aligner = support::aligner(&probe);
    for position in [0.0, 1.0, 2.0, 9.0] {
        aligner.create_slice(support::sources(1), position).await?;
    }
    aligner.select_all();

    aligner.equal_spacing_selected().await?;
    assert_eq!(support::positions(&aligner), vec![0.0, 3.0, 6.0, 9.0]);
    assert_eq!(aligner.undo_message().await, "(Move Slice [batch])");

    assert!(aligner.undo().await?);
    assert_eq!(support::positions(&aligner), vec![0.0, 1.0, 2.0, 9.0]);
    assert_eq!(aligner.undo_message().await, "(Create Slice)");

    assert!(aligner.redo().await?);
    assert_eq!(support::positions(&aligner), vec![0.0, 3.0, 6.0, 9.0]);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn explicit_batch_groups_moves() -> anyhow::Result<()> {
    let probe = Probe::default();
    let aligner = support::aligner(&probe);
    let a = aligner.create_slice(support::sources(1), 0.0).await?;
    let b = aligner.create_slice(support::sources(1), 1.0).await?;

    aligner.begin_batch().await;
    aligner.move_slice(&a, 4.0).await?;
    aligner.move_slice(&b, 5.0).await?;
    aligner.end_batch().await;

    assert!(aligner.undo().await?);
    assert_eq!(a.axis_position(), 0.0);
    assert_eq!(b.axis_position(), 1.0);
    Ok(())
}

#[tokio::test]
async fn empty_stacks_report_no_action() -> anyhow::Result<()> {
    let probe = Probe::default();
    let aligner = support::aligner(&probe);
    assert!(!aligner.undo().await?);
    assert!(!aligner.redo().await?);
    assert_eq!(aligner.undo_message().await, "(None)");
    assert_eq!(aligner.redo_message().await, "(None)");
    Ok(())
}

#[tokio::test]
async fn new_command_clears_redo() -> anyhow::Result<()> {
    let probe = Probe::default();
    let aligner = support::aligner(&probe);
    let slice = aligner.create_slice(support::sources(1), 0.0).await?;
    aligner.move_slice(&slice, 1.0).await?;
    assert!(aligner.undo().await?);
    aligner.move_slice(&slice, 2.0).await?;
    assert!(!aligner.redo().await?);
    assert_eq!(slice.axis_position(), 2.0);
    Ok(())
}

#[tokio::test]
async fn missing_selection_is_reported_without_mutation() -> anyhow::Result<()> {
    let probe = Probe::default();
    let aligner = support::aligner(&probe);
    aligner.create_slice(support::sources(1), 0.0).await?;
    let mut events = aligner.subscribe();

    let err = aligner.equal_spacing_selected().await.unwrap_err();
    assert_eq!(
        err,
        CommandError::NoSelection {
            operation: "equal spacing"
        }
    );
    assert!(matches!(
        events.try_recv(),
        Ok(SessionEvent::Warning { .. })
    ));
    assert_eq!(aligner.undo_message().await, "(Create Slice)");
    Ok(())
}

#[tokio::test]
async fn deleted_slice_returns_to_its_place() -> anyhow::Result<()> {
    let probe = Probe::default();
    let aligner = support::aligner(&probe);
    let a = aligner.create_slice(support::sources(1), 0.0).await?;
    let b = aligner.create_slice(support::sources(1), 0.0).await?;
    let c = aligner.create_slice(support::sources(1), 0.0).await?;

    aligner.select_slice(&b);
    assert_eq!(aligner.delete_selected().await?, 1);
    assert_eq!(aligner.slices().len(), 2);

    assert!(aligner.undo().await?);
    let order: Vec<_> = aligner.sorted_slices();
    assert!(Arc::ptr_eq(&order[0], &a));
    assert!(Arc::ptr_eq(&order[1], &b));
    assert!(Arc::ptr_eq(&order[2], &c));
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_registration_is_not_run_again_on_redo() -> anyhow::Result<()> {
    let probe = Probe::default();
    let aligner = support::aligner(&probe);
    let slice = aligner.create_slice(support::sources(1), 0.0).await?;
    aligner.select_slice(&slice);
    aligner
        .register_selected(
            FAILING,
            &Default::default(),
            SourcesProcessor::Identity,
            SourcesProcessor::Identity,
        )
        .await?;
    aligner.wait_for_tasks().await;
    assert_eq!(probe.register_calls(), 1);
    let failed = support::snapshot(&aligner);

    assert!(aligner.undo().await?);
    assert!(aligner.redo().await?);
    aligner.wait_for_tasks().await;

    assert_eq!(probe.register_calls(), 1);
    assert_eq!(support::snapshot(&aligner), failed);
    assert!(!slice.pipeline().has_pending());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_batch_leaves_nothing_behind() -> anyhow::Result<()> {
    let probe = Probe::default();
    let aligner = support::aligner(&probe);
    let a = aligner.create_slice(support::sources(1), 0.0).await?;
    let b = aligner.create_slice(support::sources(1), 1.0).await?;
    aligner.select_slice(&a);
    aligner
        .register_selected(
            SHIFT,
            &TestRegistration::offset_parameters(DVec3::X),
            SourcesProcessor::Identity,
            SourcesProcessor::Identity,
        )
        .await?;
    aligner.move_slice(&b, 2.0).await?;
    assert!(aligner.undo().await?);
    aligner.wait_for_tasks().await;
    let before = support::snapshot(&aligner);

    aligner.select_slice(&b);
    let err = aligner.remove_last_registration().await.unwrap_err();
    assert_eq!(err, CommandError::Pipeline(PipelineError::NothingToRemove));

    assert_eq!(a.registration_history().len(), 1);
    assert_eq!(support::snapshot(&aligner), before);
    assert_eq!(aligner.undo_message().await, "(Register Slice)");
    assert_eq!(aligner.redo_message().await, "(Move Slice)");
    assert!(!aligner.commands.lock().await.is_batch_open());
    Ok(())
}
