//! Render parameters and their canonical form.

use std::fmt::Write as FmtWrite;

use serde::{Deserialize, Serialize};

use super::error::DomainError;
use super::types::ColourScheme;

pub const DEFAULT_WIDTH: u32 = 1920;
pub const DEFAULT_HEIGHT: u32 = 1080;
pub const DEFAULT_MAX_ITERATIONS: u32 = 500;
pub const DEFAULT_POWER: f64 = 2.0;
pub const DEFAULT_C: ComplexParam = ComplexParam {
    real: 0.285,
    imag: 0.01,
};
pub const DEFAULT_SCALE: f64 = 1.0;

pub const MAX_DIMENSION: u32 = 8192;
pub const MAX_ITERATIONS_LIMIT: u32 = 100_000;

/// Version tag baked into the canonical form so a format change never aliases old fingerprints.
const CANONICAL_VERSION: &str = "v1";

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComplexParam {
    pub real: f64,
    pub imag: f64,
}

/// Fully-resolved render parameters. Construct through [`RenderRequestInput::resolve`] so the
/// value is validated before it is fingerprinted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderRequest {
    pub width: u32,
    pub height: u32,
    pub max_iterations: u32,
    pub power: f64,
    pub c: ComplexParam,
    pub scale: f64,
    pub offset_x: f64,
    pub offset_y: f64,
    pub colour_scheme: ColourScheme,
}

impl Default for RenderRequest {
    fn default() -> Self {
        Self {
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            power: DEFAULT_POWER,
            c: DEFAULT_C,
            scale: DEFAULT_SCALE,
            offset_x: 0.0,
            offset_y: 0.0,
            colour_scheme: ColourScheme::default(),
        }
    }
}

impl RenderRequest {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.width == 0 || self.width > MAX_DIMENSION {
            return Err(DomainError::validation(format!(
                "width must be between 1 and {MAX_DIMENSION}"
            )));
        }
        if self.height == 0 || self.height > MAX_DIMENSION {
            return Err(DomainError::validation(format!(
                "height must be between 1 and {MAX_DIMENSION}"
            )));
        }
        if self.max_iterations == 0 || self.max_iterations > MAX_ITERATIONS_LIMIT {
            return Err(DomainError::validation(format!(
                "maxIterations must be between 1 and {MAX_ITERATIONS_LIMIT}"
            )));
        }

        let finite = [
            ("power", self.power),
            ("c.real", self.c.real),
            ("c.imag", self.c.imag),
            ("scale", self.scale),
            ("offsetX", self.offset_x),
            ("offsetY", self.offset_y),
        ];
        if let Some((name, _)) = finite.iter().find(|(_, value)| !value.is_finite()) {
            return Err(DomainError::validation(format!("{name} must be a finite number")));
        }
        if self.scale <= 0.0 {
            return Err(DomainError::validation("scale must be greater than zero"));
        }

        Ok(())
    }

    /// Stable textual form hashed into the fingerprint.
    ///
    /// Field order is fixed and floats are written as the hex of their IEEE-754 bits (with `-0.0`
    /// folded into `0.0`), so field-wise equal requests always produce identical bytes.
    pub fn canonical_form(&self) -> String {
        let mut out = String::with_capacity(256);
        let _ = write!(
            out,
            "{CANONICAL_VERSION}|width={}|height={}|max_iterations={}",
            self.width, self.height, self.max_iterations
        );
        for (name, value) in [
            ("power", self.power),
            ("c_real", self.c.real),
            ("c_imag", self.c.imag),
            ("scale", self.scale),
            ("offset_x", self.offset_x),
            ("offset_y", self.offset_y),
        ] {
            let _ = write!(out, "|{name}={:016x}", canonical_bits(value));
        }
        let _ = write!(out, "|colour_scheme={}", self.colour_scheme.as_str());
        out
    }
}

fn canonical_bits(value: f64) -> u64 {
    if value == 0.0 { 0.0f64.to_bits() } else { value.to_bits() }
}

/// Caller-supplied parameters with every field optional; unset fields take the documented
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RenderRequestInput {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub max_iterations: Option<u32>,
    pub power: Option<f64>,
    pub c_real: Option<f64>,
    pub c_imag: Option<f64>,
    pub scale: Option<f64>,
    pub offset_x: Option<f64>,
    pub offset_y: Option<f64>,
    pub colour_scheme: Option<String>,
}

impl RenderRequestInput {
    /// Apply defaults and validate. Malformed input is rejected before fingerprinting.
    pub fn resolve(&self) -> Result<RenderRequest, DomainError> {
        let defaults = RenderRequest::default();
        let colour_scheme = match self.colour_scheme.as_deref() {
            Some(raw) => raw.parse::<ColourScheme>().map_err(|_| {
                DomainError::validation(format!("unknown colour scheme `{raw}`"))
            })?,
            None => defaults.colour_scheme,
        };

        let request = RenderRequest {
            width: self.width.unwrap_or(defaults.width),
            height: self.height.unwrap_or(defaults.height),
            max_iterations: self.max_iterations.unwrap_or(defaults.max_iterations),
            power: self.power.unwrap_or(defaults.power),
            c: ComplexParam {
                real: self.c_real.unwrap_or(defaults.c.real),
                imag: self.c_imag.unwrap_or(defaults.c.imag),
            },
            scale: self.scale.unwrap_or(defaults.scale),
            offset_x: self.offset_x.unwrap_or(defaults.offset_x),
            offset_y: self.offset_y.unwrap_or(defaults.offset_y),
            colour_scheme,
        };
        request.validate()?;
        Ok(request)
    }
}
