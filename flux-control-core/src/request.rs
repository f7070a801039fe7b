use serde::{Deserialize, Serialize};

use crate::{Conditioning, ConditioningInput, ControlType, ImageSource, PredictError};

pub const GUIDANCE_SCALE_RANGE: (f64, f64) = (0.0, 5.0);
pub const STEPS_RANGE: (usize, usize) = (1, 50);
pub const STRENGTH_RANGE: (f64, f64) = (0.0, 1.0);

fn default_prompt() -> String {
    "A bohemian-style female travel blogger with sun-kissed skin and messy beach waves".to_string()
}

fn default_guidance_scale() -> f64 {
    3.5
}

fn default_steps() -> usize {
    28
}

fn default_strength() -> f64 {
    0.2
}

fn default_second_control_type() -> ControlType {
    ControlType::None
}

// Define the request/response types.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    #[serde(default = "default_prompt")]
    pub prompt: String,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    #[serde(default = "default_steps")]
    pub steps: usize,
    #[serde(default)]
    pub control_type: ControlType,
    #[serde(default = "default_strength")]
    pub control_strength: f64,
    #[serde(default)]
    pub control_image: String,
    #[serde(default = "default_second_control_type")]
    pub control_type_2: ControlType,
    #[serde(default = "default_strength")]
    pub control_strength_2: f64,
    #[serde(default)]
    pub control_image_2: String,
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        Self {
            prompt: default_prompt(),
            guidance_scale: default_guidance_scale(),
            steps: default_steps(),
            control_type: ControlType::default(),
            control_strength: default_strength(),
            control_image: String::new(),
            control_type_2: default_second_control_type(),
            control_strength_2: default_strength(),
            control_image_2: String::new(),
            seed: None,
        }
    }
}

fn check_range<T: PartialOrd + std::fmt::Display>(
    name: &str,
    value: T,
    (min, max): (T, T),
) -> Result<(), PredictError> {
    // written so that NaN fails the check
    if value >= min && value <= max {
        Ok(())
    } else {
        Err(PredictError::InvalidInput(format!(
            "{name} must be between {min} and {max}, got {value}"
        )))
    }
}

impl GenerationRequest {
    /// Range checks against the declared bounds. Runs before any image decoding.
    pub fn validate(&self) -> Result<(), PredictError> {
        check_range("guidance_scale", self.guidance_scale, GUIDANCE_SCALE_RANGE)?;
        check_range("steps", self.steps, STEPS_RANGE)?;
        check_range("control_strength", self.control_strength, STRENGTH_RANGE)?;
        check_range("control_strength_2", self.control_strength_2, STRENGTH_RANGE)?;
        Ok(())
    }

    /// Splits the flat request fields into the required first conditioning input
    /// and the optional second one.
    ///
    /// The second input only exists when an image was supplied and its control
    /// type is not `none`; this is decided from the request alone, before decoding.
    pub fn conditioning_inputs(
        &self,
    ) -> Result<(ConditioningInput, Option<ConditioningInput>), PredictError> {
        let image = ImageSource::parse(&self.control_image).ok_or_else(|| {
            PredictError::InvalidInput("control_image is required".to_string())
        })?;
        let first = ConditioningInput {
            image,
            control_type: self.control_type,
            strength: self.control_strength,
        };

        let second = match ImageSource::parse(&self.control_image_2) {
            Some(image) if self.control_type_2 != ControlType::None => Some(ConditioningInput {
                image,
                control_type: self.control_type_2,
                strength: self.control_strength_2,
            }),
            _ => None,
        };

        Ok((first, second))
    }

    /// The caller's seed, or a fresh draw from the 16-bit seed space.
    pub fn resolve_seed(&self) -> u64 {
        self.seed.unwrap_or_else(|| u64::from(rand::random::<u16>()))
    }

    /// Validates the request, resolves the seed and decodes the control images.
    pub fn prepare(&self) -> Result<GenerationParams, PredictError> {
        self.validate()?;
        let (first, second) = self.conditioning_inputs()?;
        let seed = self.resolve_seed();
        let conditioning = Conditioning::assemble(&first, second.as_ref())?;
        Ok(GenerationParams {
            prompt: self.prompt.clone(),
            guidance_scale: self.guidance_scale,
            steps: self.steps,
            seed,
            width: conditioning.width,
            height: conditioning.height,
            conditioning,
        })
    }
}

/// Validated input of one generation pass.
#[derive(Debug, Clone)]
pub struct GenerationParams {
    pub prompt: String,
    pub guidance_scale: f64,
    pub steps: usize,
    pub seed: u64,
    pub width: usize,
    pub height: usize,
    pub conditioning: Conditioning,
}
