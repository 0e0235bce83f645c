use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use glam::{DAffine3, DVec3};
use parking_lot::Mutex;

use crate::aligner::Aligner;
use crate::config::AlignerConfig;
use crate::image::{ImageSet, SourceId};
use crate::pipeline::StageId;
use crate::registration::{Registration, RegistrationParameters, RegistrationRegistry};
use crate::slice::SliceId;

pub const SHIFT: &str = "shift";
pub const MANUAL_SHIFT: &str = "manual-shift";
pub const FAILING: &str = "failing";

const OFFSET_KEY: &str = "offset";

#[derive(Debug, Default)]
struct ProbeLog {
    moving_inputs: Vec<ImageSet>,
    register_calls: usize,
    manual_intervals: Vec<(Instant, Instant)>,
}

/// Shared record of what test registrations observed.
#[derive(Debug, Clone, Default)]
pub struct Probe {
    log: Arc<Mutex<ProbeLog>>,
}

impl Probe {
    pub fn moving_inputs(&self) -> Vec<ImageSet> {
        self.log.lock().moving_inputs.clone()
    }

    pub fn register_calls(&self) -> usize {
        self.log.lock().register_calls
    }

    pub fn manual_intervals(&self) -> Vec<(Instant, Instant)> {
        self.log.lock().manual_intervals.clone()
    }
}

/// Holds a gated registration inside `register` until opened.
#[derive(Debug)]
pub struct Gate {
    tx: Sender<()>,
}

impl Gate {
    pub fn open(&self) {
        let _ = self.tx.send(());
    }
}

/// Deterministic registration translating the content by a fixed offset.
#[derive(Debug)]
pub struct TestRegistration {
    offset: DVec3,
    manual: bool,
    succeed: bool,
    delay: Duration,
    gate: Option<Receiver<()>>,
    probe: Option<Probe>,
}

impl TestRegistration {
    pub fn shift(offset: DVec3) -> Self {
        Self {
            offset,
            manual: false,
            succeed: true,
            delay: Duration::ZERO,
            gate: None,
            probe: None,
        }
    }

    pub fn failing() -> Self {
        Self {
            succeed: false,
            ..Self::shift(DVec3::ZERO)
        }
    }

    pub fn manual(mut self) -> Self {
        self.manual = true;
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn probe(mut self, probe: &Probe) -> Self {
        self.probe = Some(probe.clone());
        self
    }

    pub fn gated(mut self) -> (Gate, Self) {
        let (tx, rx) = channel();
        self.gate = Some(rx);
        (Gate { tx }, self)
    }

    pub fn offset_parameters(offset: DVec3) -> RegistrationParameters {
        RegistrationParameters::from([(
            OFFSET_KEY.to_string(),
            format!("{},{},{}", offset.x, offset.y, offset.z),
        )])
    }

    fn parse_offset(parameters: &RegistrationParameters) -> Option<DVec3> {
        let values: Vec<f64> = parameters
            .get(OFFSET_KEY)?
            .split(',')
            .map(|value| value.parse().ok())
            .collect::<Option<_>>()?;
        match values.as_slice() {
            [x, y, z] => Some(DVec3::new(*x, *y, *z)),
            _ => None,
        }
    }
}

impl Registration for TestRegistration {
    fn name(&self) -> &str {
        match (self.succeed, self.manual) {
            (false, _) => FAILING,
            (true, true) => MANUAL_SHIFT,
            (true, false) => SHIFT,
        }
    }

    fn is_manual(&self) -> bool {
        self.manual
    }

    fn set_fixed_image(&mut self, _fixed: ImageSet) {}

    fn set_moving_image(&mut self, moving: ImageSet) {
        if let Some(probe) = &self.probe {
            probe.log.lock().moving_inputs.push(moving);
        }
    }

    fn register(&mut self) -> bool {
        let start = Instant::now();
        if let Some(gate) = &self.gate {
            let _ = gate.recv();
        }
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if let Some(probe) = &self.probe {
            let mut log = probe.log.lock();
            log.register_calls += 1;
            if self.manual {
                log.manual_intervals.push((start, Instant::now()));
            }
        }
        self.succeed
    }

    fn transformed_image_moving_to_fixed(&self, moving: &ImageSet) -> ImageSet {
        moving.transformed(DAffine3::from_translation(self.offset))
    }

    fn parameters(&self) -> RegistrationParameters {
        Self::offset_parameters(self.offset)
    }

    fn solved_state(&self) -> RegistrationParameters {
        Self::offset_parameters(self.offset)
    }

    fn restore_solved_state(&mut self, state: &RegistrationParameters) -> anyhow::Result<()> {
        self.offset =
            Self::parse_offset(state).ok_or_else(|| anyhow::anyhow!("invalid offset state"))?;
        Ok(())
    }
}

pub fn registry(probe: &Probe) -> RegistrationRegistry {
    let mut registry = RegistrationRegistry::with_builtins();
    let shift_probe = probe.clone();
    registry.add(SHIFT, move |parameters| {
        let offset = TestRegistration::parse_offset(parameters).unwrap_or(DVec3::ZERO);
        Box::new(TestRegistration::shift(offset).probe(&shift_probe))
    });
    let manual_probe = probe.clone();
    registry.add(MANUAL_SHIFT, move |parameters| {
        let offset = TestRegistration::parse_offset(parameters).unwrap_or(DVec3::ZERO);
        Box::new(
            TestRegistration::shift(offset)
                .manual()
                .delay(Duration::from_millis(40))
                .probe(&manual_probe),
        )
    });
    let failing_probe = probe.clone();
    registry.add(FAILING, move |_| {
        Box::new(TestRegistration::failing().probe(&failing_probe))
    });
    registry
}

pub fn aligner(probe: &Probe) -> Aligner {
    aligner_with(AlignerConfig::default(), registry(probe))
}

pub fn aligner_with(config: AlignerConfig, registry: RegistrationRegistry) -> Aligner {
    Aligner::new(config, registry, ImageSet::from_source(SourceId::unique(), 1))
        .expect("aligner is created inside the test runtime")
}

pub fn sources(channels: usize) -> ImageSet {
    ImageSet::from_source(SourceId::unique(), channels)
}

pub fn temp_state_path(name: &str) -> std::path::PathBuf {
    std::env::temp_dir().join(format!("{}_{name}.json", uuid::Uuid::new_v4()))
}

/// Per slice, in insertion order: identity, position, applied stages and
/// registered content.
pub fn snapshot(aligner: &Aligner) -> Vec<(SliceId, f64, Vec<StageId>, ImageSet)> {
    aligner
        .slices()
        .iter()
        .map(|slice| {
            (
                slice.id(),
                slice.axis_position(),
                slice
                    .registration_history()
                    .iter()
                    .map(|stage| stage.id())
                    .collect(),
                slice.current_images(),
            )
        })
        .collect()
}

pub fn positions(aligner: &Aligner) -> Vec<f64> {
    aligner
        .sorted_slices()
        .iter()
        .map(|slice| slice.axis_position())
        .collect()
}
