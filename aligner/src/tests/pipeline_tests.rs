use std::time::Duration;

use glam::{DAffine3, DVec3};

use crate::axis::DisplayMode;
use crate::error::{CommandError, PipelineError};
use crate::event::SessionEvent;
use crate::image::SourcesProcessor;
use crate::registration::RegistrationParameters;
use crate::tests::support::{self, Probe, TestRegistration, FAILING, MANUAL_SHIFT};

#[tokio::test(flavor = "multi_thread")]
async fn later_stage_observes_earlier_output() -> anyhow::Result<()> {
    let probe = Probe::default();
    let aligner = support::aligner(&probe);
    let slice = aligner.create_slice(support::sources(1), 0.0).await?;

    aligner
        .register_slice(
            &slice,
            Box::new(
                TestRegistration::shift(DVec3::X)
                    .delay(Duration::from_millis(50))
                    .probe(&probe),
            ),
            SourcesProcessor::Identity,
            SourcesProcessor::Identity,
        )
        .await?;
    aligner
        .register_slice(
            &slice,
            Box::new(TestRegistration::shift(DVec3::Y).probe(&probe)),
            SourcesProcessor::Identity,
            SourcesProcessor::Identity,
        )
        .await?;
    aligner.wait_for_tasks().await;

    let history = slice.pipeline().history();
    let seen = probe.moving_inputs();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[1], history[0].output);
    assert_eq!(
        slice.current_images().handles()[0].transform,
        DAffine3::from_translation(DVec3::new(1.0, 1.0, 0.0))
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn manual_stages_never_overlap() -> anyhow::Result<()> {
    let probe = Probe::default();
    let aligner = support::aligner(&probe);
    aligner.create_slice(support::sources(1), 0.0).await?;
    aligner.create_slice(support::sources(1), 1.0).await?;
    aligner.select_all();

    aligner
        .register_selected(
            MANUAL_SHIFT,
            &TestRegistration::offset_parameters(DVec3::Z),
            SourcesProcessor::Identity,
            SourcesProcessor::Identity,
        )
        .await?;
    tokio::time::timeout(Duration::from_secs(10), aligner.wait_for_tasks()).await?;

    for slice in aligner.slices() {
        assert_eq!(slice.registration_history().len(), 1);
    }
    let mut intervals = probe.manual_intervals();
    assert_eq!(intervals.len(), 2);
    intervals.sort_by_key(|(start, _)| *start);
    assert!(intervals[0].1 <= intervals[1].0);
    assert!(!aligner.manual_lock().is_held());
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn pending_manual_stage_cannot_be_removed() -> anyhow::Result<()> {
    let probe = Probe::default();
    let aligner = support::aligner(&probe);
    let slice = aligner.create_slice(support::sources(1), 0.0).await?;

    let (gate, registration) = TestRegistration::shift(DVec3::X).manual().gated();
    let stage = aligner
        .register_slice(
            &slice,
            Box::new(registration),
            SourcesProcessor::Identity,
            SourcesProcessor::Identity,
        )
        .await?;

    assert_eq!(
        slice.pipeline().remove_last_stage().unwrap_err(),
        PipelineError::StagePending { stage: stage.id() }
    );

    gate.open();
    aligner.wait_for_tasks().await;
    assert_eq!(slice.registration_history().len(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_stage_leaves_slice_untouched() -> anyhow::Result<()> {
    let probe = Probe::default();
    let aligner = support::aligner(&probe);
    let slice = aligner.create_slice(support::sources(2), 0.0).await?;
    let before = slice.current_images();
    let mut events = aligner.subscribe();

    aligner.select_slice(&slice);
    let stages = aligner
        .register_selected(
            FAILING,
            &RegistrationParameters::new(),
            SourcesProcessor::Identity,
            SourcesProcessor::Identity,
        )
        .await?;
    aligner.wait_for_tasks().await;

    assert!(slice.registration_history().is_empty());
    assert_eq!(slice.current_images(), before);

    let mut failed = false;
    while let Ok(event) = events.try_recv() {
        if event
            == (SessionEvent::StageFailed {
                slice_id: slice.id(),
                stage_id: stages[0].id(),
                name: FAILING.to_string(),
            })
        {
            failed = true;
        }
    }
    assert!(failed);

    // undoing the failed registration is a no-op on the slice
    assert!(aligner.undo().await?);
    assert_eq!(slice.current_images(), before);
    Ok(())
}

#[tokio::test]
async fn unknown_registration_is_rejected() -> anyhow::Result<()> {
    let probe = Probe::default();
    let aligner = support::aligner(&probe);
    let slice = aligner.create_slice(support::sources(1), 0.0).await?;
    aligner.select_slice(&slice);

    let err = aligner
        .register_selected(
            "elastix",
            &RegistrationParameters::new(),
            SourcesProcessor::Identity,
            SourcesProcessor::Identity,
        )
        .await
        .unwrap_err();
    assert_eq!(err, CommandError::UnknownRegistration("elastix".into()));
    assert_eq!(aligner.undo_message().await, "(Create Slice)");
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn move_while_registering_composes() -> anyhow::Result<()> {
    let probe = Probe::default();
    let aligner = support::aligner(&probe);
    let slice = aligner.create_slice(support::sources(1), 0.0).await?;

    let (gate, registration) = TestRegistration::shift(DVec3::new(0.0, 2.0, 0.0)).gated();
    aligner
        .register_slice(
            &slice,
            Box::new(registration),
            SourcesProcessor::Identity,
            SourcesProcessor::Identity,
        )
        .await?;
    aligner.move_slice(&slice, 5.0).await?;
    gate.open();
    aligner.wait_for_tasks().await;

    assert_eq!(slice.axis_position(), 5.0);
    let placed = slice.placed_images(aligner.geometry(), DisplayMode::Review);
    assert_eq!(
        placed.handles()[0].transform.translation,
        DVec3::new(0.0, 2.0, 5.0)
    );
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn fixed_input_is_the_atlas_plane_at_the_slice() -> anyhow::Result<()> {
    #[derive(Debug)]
    struct FixedProbe(std::sync::Arc<parking_lot::Mutex<Option<crate::image::ImageSet>>>);

    impl crate::registration::Registration for FixedProbe {
        fn name(&self) -> &str {
            "fixed-probe"
        }
        fn set_fixed_image(&mut self, fixed: crate::image::ImageSet) {
            *self.0.lock() = Some(fixed);
        }
        fn set_moving_image(&mut self, _moving: crate::image::ImageSet) {}
        fn register(&mut self) -> bool {
            true
        }
        fn transformed_image_moving_to_fixed(
            &self,
            moving: &crate::image::ImageSet,
        ) -> crate::image::ImageSet {
            moving.clone()
        }
    }

    let probe = Probe::default();
    let aligner = support::aligner(&probe);
    let slice = aligner.create_slice(support::sources(1), 2.5).await?;
    let seen = std::sync::Arc::new(parking_lot::Mutex::new(None));
    aligner
        .register_slice(
            &slice,
            Box::new(FixedProbe(seen.clone())),
            SourcesProcessor::Identity,
            SourcesProcessor::Identity,
        )
        .await?;
    aligner.wait_for_tasks().await;

    let fixed = seen.lock().clone().expect("fixed image was set");
    assert_eq!(
        fixed.handles()[0].transform.translation,
        DVec3::new(0.0, 0.0, -2.5)
    );
    Ok(())
}
