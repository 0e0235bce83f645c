use common::id_type;
use glam::{DAffine3, DVec3};
use serde::{Deserialize, Serialize};

id_type!(SourceId);

/// Opaque reference to one channel of a source image, plus the content
/// transform accumulated by registrations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageHandle {
    pub source: SourceId,
    pub channel: usize,
    pub transform: DAffine3,
}

impl ImageHandle {
    pub fn new(source: SourceId, channel: usize) -> Self {
        Self {
            source,
            channel,
            transform: DAffine3::IDENTITY,
        }
    }

    /// Applies `affine` after the current transform.
    pub fn transformed(&self, affine: DAffine3) -> Self {
        Self {
            transform: affine * self.transform,
            ..*self
        }
    }

    pub fn same_image(&self, other: &ImageHandle) -> bool {
        self.source == other.source && self.channel == other.channel
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageSet(Vec<ImageHandle>);

impl ImageSet {
    pub fn new(handles: Vec<ImageHandle>) -> Self {
        Self(handles)
    }

    /// One handle per channel of a single source.
    pub fn from_source(source: SourceId, channel_count: usize) -> Self {
        Self(
            (0..channel_count)
                .map(|channel| ImageHandle::new(source, channel))
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ImageHandle> {
        self.0.iter()
    }

    pub fn handles(&self) -> &[ImageHandle] {
        &self.0
    }

    pub fn transformed(&self, affine: DAffine3) -> Self {
        Self(self.0.iter().map(|handle| handle.transformed(affine)).collect())
    }

    /// Replaces the innermost factor `old` of every content transform by `new`.
    pub fn with_source_origin(&self, old: DAffine3, new: DAffine3) -> Self {
        let swap = old.inverse() * new;
        Self(
            self.0
                .iter()
                .map(|handle| ImageHandle {
                    transform: handle.transform * swap,
                    ..*handle
                })
                .collect(),
        )
    }

    pub fn select(&self, indices: &[usize]) -> Self {
        Self(
            indices
                .iter()
                .filter_map(|&index| self.0.get(index).copied())
                .collect(),
        )
    }
}

impl FromIterator<ImageHandle> for ImageSet {
    fn from_iter<I: IntoIterator<Item = ImageHandle>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a ImageSet {
    type Item = &'a ImageHandle;
    type IntoIter = std::slice::Iter<'a, ImageHandle>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Pure preprocessing applied to an image set before it reaches a
/// registration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub enum SourcesProcessor {
    #[default]
    Identity,
    /// Keeps the handles at the given positions.
    SelectChannels(Vec<usize>),
    Transform(DAffine3),
    /// Applies processors in order.
    Chain(Vec<SourcesProcessor>),
}

impl SourcesProcessor {
    /// Brings the plane at `axis_position` to depth zero.
    pub fn zero_axis(axis_position: f64) -> Self {
        SourcesProcessor::Transform(DAffine3::from_translation(DVec3::new(
            0.0,
            0.0,
            -axis_position,
        )))
    }

    pub fn then(self, next: SourcesProcessor) -> Self {
        match (self, next) {
            (SourcesProcessor::Identity, next) => next,
            (current, SourcesProcessor::Identity) => current,
            (SourcesProcessor::Chain(mut steps), next) => {
                steps.push(next);
                SourcesProcessor::Chain(steps)
            }
            (current, next) => SourcesProcessor::Chain(vec![current, next]),
        }
    }

    pub fn apply(&self, images: &ImageSet) -> ImageSet {
        match self {
            SourcesProcessor::Identity => images.clone(),
            SourcesProcessor::SelectChannels(indices) => images.select(indices),
            SourcesProcessor::Transform(affine) => images.transformed(*affine),
            SourcesProcessor::Chain(steps) => steps
                .iter()
                .fold(images.clone(), |images, step| step.apply(&images)),
        }
    }
}
