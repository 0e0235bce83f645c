use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;

use glam::DAffine3;
use hashbrown::hash_map::Entry;
use hashbrown::HashMap;

use crate::image::ImageSet;

pub type RegistrationParameters = BTreeMap<String, String>;

/// Contract of a pluggable registration algorithm.
///
/// `register` may block (manual algorithms wait for the user); it is always
/// called off the async executor.
pub trait Registration: Send + Debug {
    fn name(&self) -> &str;

    fn is_manual(&self) -> bool {
        false
    }

    fn set_fixed_image(&mut self, fixed: ImageSet);
    fn set_moving_image(&mut self, moving: ImageSet);

    /// Solves the registration, `false` when it did not converge or was
    /// cancelled by the user.
    fn register(&mut self) -> bool;

    /// Maps the slice's current images into the fixed space with the solved
    /// transform.
    fn transformed_image_moving_to_fixed(&self, moving: &ImageSet) -> ImageSet;

    fn parameters(&self) -> RegistrationParameters {
        RegistrationParameters::new()
    }

    /// Everything needed to re-apply the solved transform without running
    /// `register` again.
    fn solved_state(&self) -> RegistrationParameters {
        RegistrationParameters::new()
    }

    fn restore_solved_state(&mut self, _state: &RegistrationParameters) -> anyhow::Result<()> {
        Ok(())
    }
}

pub type RegistrationFactory =
    Arc<dyn Fn(&RegistrationParameters) -> Box<dyn Registration> + Send + Sync>;

/// Named registration factories available to a session.
#[derive(Clone, Default)]
pub struct RegistrationRegistry {
    factories: HashMap<String, RegistrationFactory>,
}

impl RegistrationRegistry {
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.add(AffineRegistration::NAME, |parameters| {
            Box::new(AffineRegistration::from_parameters(parameters))
        });
        registry
    }

    pub fn add<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&RegistrationParameters) -> Box<dyn Registration> + Send + Sync + 'static,
    {
        match self.factories.entry(name.into()) {
            Entry::Occupied(entry) => {
                panic!("Registration `{}` already exists", entry.key());
            }
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(factory));
            }
        }
    }

    pub fn create(
        &self,
        name: &str,
        parameters: &RegistrationParameters,
    ) -> Option<Box<dyn Registration>> {
        self.factories.get(name).map(|factory| factory(parameters))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Debug for RegistrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistrationRegistry")
            .field("names", &self.names())
            .finish()
    }
}

/// Applies a user supplied affine, `register` always succeeds.
#[derive(Debug, Clone)]
pub struct AffineRegistration {
    transform: DAffine3,
}

impl AffineRegistration {
    pub const NAME: &'static str = "affine";
    const MATRIX_KEY: &'static str = "matrix";

    pub fn new(transform: DAffine3) -> Self {
        Self { transform }
    }

    pub fn from_parameters(parameters: &RegistrationParameters) -> Self {
        let transform = parameters
            .get(Self::MATRIX_KEY)
            .and_then(|matrix| parse_affine(matrix).ok())
            .unwrap_or(DAffine3::IDENTITY);
        Self { transform }
    }

    pub fn parameters_for(transform: DAffine3) -> RegistrationParameters {
        RegistrationParameters::from([(Self::MATRIX_KEY.to_string(), format_affine(&transform))])
    }
}

impl Registration for AffineRegistration {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn set_fixed_image(&mut self, _fixed: ImageSet) {}

    fn set_moving_image(&mut self, _moving: ImageSet) {}

    fn register(&mut self) -> bool {
        true
    }

    fn transformed_image_moving_to_fixed(&self, moving: &ImageSet) -> ImageSet {
        moving.transformed(self.transform)
    }

    fn parameters(&self) -> RegistrationParameters {
        Self::parameters_for(self.transform)
    }

    fn solved_state(&self) -> RegistrationParameters {
        Self::parameters_for(self.transform)
    }

    fn restore_solved_state(&mut self, state: &RegistrationParameters) -> anyhow::Result<()> {
        let matrix = state
            .get(Self::MATRIX_KEY)
            .ok_or_else(|| anyhow::anyhow!("missing `{}` entry", Self::MATRIX_KEY))?;
        self.transform = parse_affine(matrix)?;
        Ok(())
    }
}

/// Column-major, comma separated.
pub fn format_affine(affine: &DAffine3) -> String {
    affine
        .to_cols_array()
        .iter()
        .map(f64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub fn parse_affine(text: &str) -> anyhow::Result<DAffine3> {
    let values = text
        .split(',')
        .map(|value| value.trim().parse::<f64>())
        .collect::<Result<Vec<f64>, _>>()?;
    let cols: [f64; 12] = values
        .try_into()
        .map_err(|values: Vec<f64>| anyhow::anyhow!("expected 12 values, got {}", values.len()))?;
    Ok(DAffine3::from_cols_array(&cols))
}
