//! Escape-time renderer for the generalised Julia map `z -> |z|^p * e^(i*p*arg z) + c`.

use std::time::{Duration, Instant};

use crate::domain::request::{ComplexParam, RenderRequest};

use super::colour::{colour_for, map_range};

pub const DEFAULT_MAX_RENDER_TIME: Duration = Duration::from_secs(120);

const ESCAPE_RADIUS_SQUARED: f64 = 4.0;

/// Row-major RGBA8 pixel buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

/// Result of a time-boxed render. Running out of budget is an ordinary outcome, not an error.
#[derive(Debug, Clone, PartialEq)]
pub enum RenderOutcome {
    Complete(Raster),
    TooComplex { elapsed: Duration, rows_done: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Complex {
    real: f64,
    imag: f64,
}

impl Complex {
    fn norm_squared(self) -> f64 {
        self.real * self.real + self.imag * self.imag
    }
}

fn step(z: Complex, c: ComplexParam, power: f64) -> Complex {
    let r = z.norm_squared().sqrt();
    let theta = z.imag.atan2(z.real);
    let radius = r.powf(power);
    Complex {
        real: radius * (power * theta).cos() + c.real,
        imag: radius * (power * theta).sin() + c.imag,
    }
}

/// Smoothed iteration count for the pixel whose orbit starts at `z0`.
pub fn escape_value(z0_real: f64, z0_imag: f64, request: &RenderRequest) -> f64 {
    let mut z = Complex {
        real: z0_real,
        imag: z0_imag,
    };
    let mut n: u32 = 0;
    while n < request.max_iterations {
        z = step(z, request.c, request.power);
        if z.norm_squared() > ESCAPE_RADIUS_SQUARED {
            break;
        }
        n += 1;
    }

    if n >= request.max_iterations {
        return f64::from(request.max_iterations);
    }

    let log_power = request.power.ln();
    let modulus = z.norm_squared().sqrt();
    if log_power > 0.0 && modulus.is_finite() {
        f64::from(n) + 1.0 - modulus.ln().ln() / log_power
    } else {
        // Renormalisation needs power > 1 and a finite orbit; fall back to the raw count.
        f64::from(n)
    }
}

/// Render `request` within `max_time`.
///
/// Yields to the runtime after every scanline and checks the budget before every pixel; on
/// overrun the partial buffer is discarded and [`RenderOutcome::TooComplex`] returned.
pub async fn render(request: &RenderRequest, max_time: Duration) -> RenderOutcome {
    let started = Instant::now();
    let width = request.width;
    let height = request.height;
    let mut pixels = vec![0u8; width as usize * height as usize * 4];

    let real_min = -request.scale + request.offset_x;
    let real_max = request.scale + request.offset_x;
    let imag_min = -request.scale + request.offset_y;
    let imag_max = request.scale + request.offset_y;

    for y in 0..height {
        let imag = map_range(f64::from(y), 0.0, f64::from(height), imag_min, imag_max);
        let row_offset = y as usize * width as usize * 4;

        for x in 0..width {
            let elapsed = started.elapsed();
            if elapsed > max_time {
                return RenderOutcome::TooComplex {
                    elapsed,
                    rows_done: y,
                };
            }

            let real = map_range(f64::from(x), 0.0, f64::from(width), real_min, real_max);
            let mu = escape_value(real, imag, request);
            let colour = colour_for(mu, request.max_iterations, request.colour_scheme);
            let idx = row_offset + x as usize * 4;
            pixels[idx..idx + 4].copy_from_slice(&colour);
        }

        tokio::task::yield_now().await;
    }

    RenderOutcome::Complete(Raster {
        width,
        height,
        pixels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::ColourScheme;

    fn small_request() -> RenderRequest {
        RenderRequest {
            width: 48,
            height: 32,
            max_iterations: 50,
            scale: 1.5,
            ..RenderRequest::default()
        }
    }

    fn expect_raster(outcome: RenderOutcome) -> Raster {
        match outcome {
            RenderOutcome::Complete(raster) => raster,
            other => panic!("expected raster, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn raster_has_requested_dimensions() {
        let raster = expect_raster(render(&small_request(), DEFAULT_MAX_RENDER_TIME).await);
        assert_eq!(raster.width, 48);
        assert_eq!(raster.height, 32);
        assert_eq!(raster.pixels.len(), 48 * 32 * 4);
        assert!(raster.pixels.chunks_exact(4).all(|pixel| pixel[3] == 255));
    }

    #[tokio::test]
    async fn identical_requests_render_identical_bytes() {
        let request = small_request();
        let first = expect_raster(render(&request, DEFAULT_MAX_RENDER_TIME).await);
        let second = expect_raster(render(&request, DEFAULT_MAX_RENDER_TIME).await);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn colour_scheme_changes_the_output() {
        let rainbow = small_request();
        let greyscale = RenderRequest {
            colour_scheme: ColourScheme::Greyscale,
            ..rainbow
        };
        let a = expect_raster(render(&rainbow, DEFAULT_MAX_RENDER_TIME).await);
        let b = expect_raster(render(&greyscale, DEFAULT_MAX_RENDER_TIME).await);
        assert_ne!(a.pixels, b.pixels);
    }

    #[tokio::test]
    async fn exhausted_budget_reports_too_complex() {
        let request = RenderRequest {
            width: 256,
            height: 256,
            max_iterations: 5_000,
            ..RenderRequest::default()
        };
        let outcome = render(&request, Duration::from_nanos(1)).await;
        assert!(matches!(outcome, RenderOutcome::TooComplex { .. }));
    }

    #[test]
    fn origin_is_interior_when_c_is_zero() {
        let request = RenderRequest {
            max_iterations: 200,
            c: ComplexParam {
                real: 0.0,
                imag: 0.0,
            },
            ..RenderRequest::default()
        };
        assert_eq!(escape_value(0.0, 0.0, &request), 200.0);
    }

    #[test]
    fn far_points_escape_immediately() {
        let request = small_request();
        let mu = escape_value(10.0, 10.0, &request);
        assert!(mu < 1.0, "mu = {mu}");
    }

    #[test]
    fn power_one_falls_back_to_raw_count() {
        let request = RenderRequest {
            power: 1.0,
            ..small_request()
        };
        let mu = escape_value(1.9, 0.0, &request);
        assert!(mu.is_finite());
        assert_eq!(mu.fract(), 0.0);
    }
}
