//! Seam blending settings.
//!
//! They are part of every [`WorkPlan`](crate::WorkPlan), so re-running a
//! plan version always blends the same way.

use crate::{PlanError, Result};
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::fmt;
use std::str::FromStr;

/// Falloff shape mapping `[0, 1]` onto `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kernel {
    /// `3t² − 2t³`
    #[default]
    Smoothstep,
    /// `t`
    Linear,
    /// `(1 − cos πt) / 2`
    Cosine,
}

impl Kernel {
    /// Weight at normalised distance `t`; 0 at or below 0, 1 at or above 1.
    pub fn weight(self, t: f32) -> f32 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Kernel::Smoothstep => t * t * (3.0 - 2.0 * t),
            Kernel::Linear => t,
            Kernel::Cosine => (1.0 - (PI * t).cos()) / 2.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Kernel::Smoothstep => "smoothstep",
            Kernel::Linear => "linear",
            Kernel::Cosine => "cosine",
        }
    }
}

impl fmt::Display for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Kernel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "smoothstep" => Ok(Kernel::Smoothstep),
            "linear" => Ok(Kernel::Linear),
            "cosine" => Ok(Kernel::Cosine),
            other => Err(format!(
                "unknown kernel '{}' (expected smoothstep, linear or cosine)",
                other
            )),
        }
    }
}

/// Blend settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendConfig {
    /// Distance in pixels over which a layer fades in from its edge.
    pub falloff_px: f32,
    pub kernel: Kernel,
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            falloff_px: 16.0,
            kernel: Kernel::Smoothstep,
        }
    }
}

impl BlendConfig {
    /// Weight of a layer at `distance` pixels from its nearest no-data pixel.
    pub fn weight_at(&self, distance: f32) -> f32 {
        self.kernel.weight(distance / self.falloff_px)
    }

    /// Check the falloff against the tile buffer.
    ///
    /// Distances are measured inside the tile grid extended by `buffer_px`.
    /// A falloff wider than the buffer would let adjacent tiles see
    /// different edges and weight their shared border differently.
    pub fn validate(&self, buffer_px: u32) -> Result<()> {
        if !(self.falloff_px.is_finite() && self.falloff_px > 0.0) {
            return Err(PlanError::InvalidBlend(format!(
                "falloff_px must be positive, got {}",
                self.falloff_px
            )));
        }
        if self.falloff_px > buffer_px as f32 {
            return Err(PlanError::InvalidBlend(format!(
                "falloff_px {} exceeds buffer_px {}",
                self.falloff_px, buffer_px
            )));
        }
        Ok(())
    }
}
