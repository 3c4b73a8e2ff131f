mod colour;
mod encode;
mod engine;

pub use colour::{INTERIOR, Rgba, colour_for, hsl_to_rgba, map_range};
pub use encode::encode_png;
pub use engine::{DEFAULT_MAX_RENDER_TIME, Raster, RenderOutcome, escape_value, render};
