//! Mapping from smoothed iteration counts to RGBA.

use crate::domain::types::ColourScheme;

pub type Rgba = [u8; 4];

pub const INTERIOR: Rgba = [0, 0, 0, 255];

/// Linear interpolation of `value` from `[start1, stop1]` onto `[start2, stop2]`.
pub fn map_range(value: f64, start1: f64, stop1: f64, start2: f64, stop2: f64) -> f64 {
    start2 + (stop2 - start2) * ((value - start1) / (stop1 - start1))
}

/// Colour for smoothed iteration count `mu` out of `max_iterations`.
///
/// `mu >= max_iterations` is interior and always black. Otherwise the palette position is
/// `sqrt(mu / max)`, clamped into `[0, 1]` (smoothing can push `mu` slightly negative).
pub fn colour_for(mu: f64, max_iterations: u32, scheme: ColourScheme) -> Rgba {
    let max = f64::from(max_iterations);
    if mu >= max {
        return INTERIOR;
    }
    let ratio = (mu / max).max(0.0);
    let t = if ratio.is_finite() { ratio.sqrt().min(1.0) } else { 0.0 };

    match scheme {
        ColourScheme::Greyscale => {
            let grey = channel_floor(t * 255.0);
            [grey, grey, grey, 255]
        }
        ColourScheme::Rainbow => hsl_to_rgba(map_range(t, 0.0, 1.0, 0.0, 360.0), 100.0, 50.0),
        ColourScheme::Fire => [
            channel_floor(map_range(t, 0.0, 1.0, 0.0, 255.0)),
            channel_floor(map_range(t, 0.0, 1.0, 0.0, 150.0)),
            0,
            255,
        ],
        ColourScheme::Default => {
            let hue = map_range(t, 0.0, 1.0, 0.0, 360.0);
            let lightness = map_range(t, 0.0, 1.0, 20.0, 70.0);
            hsl_to_rgba(hue, 100.0, lightness)
        }
    }
}

/// HSL (degrees, percent, percent) to opaque RGBA.
pub fn hsl_to_rgba(hue: f64, saturation: f64, lightness: f64) -> Rgba {
    let h = hue / 360.0;
    let s = saturation / 100.0;
    let l = lightness / 100.0;

    let (r, g, b) = if s == 0.0 {
        (l, l, l)
    } else {
        let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
        let p = 2.0 * l - q;
        (
            hue_to_channel(p, q, h + 1.0 / 3.0),
            hue_to_channel(p, q, h),
            hue_to_channel(p, q, h - 1.0 / 3.0),
        )
    };

    [
        channel_round(r * 255.0),
        channel_round(g * 255.0),
        channel_round(b * 255.0),
        255,
    ]
}

fn hue_to_channel(p: f64, q: f64, mut t: f64) -> f64 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

fn channel_floor(value: f64) -> u8 {
    value.floor().clamp(0.0, 255.0) as u8
}

fn channel_round(value: f64) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}
