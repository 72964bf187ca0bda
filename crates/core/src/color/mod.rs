//! Pure color and waveform math shared by the compositor, the output sinks and
//! the pattern sandbox.
//!
//! Everything here is a free function over `f64` with no state, so it can be
//! called from any number of evaluation contexts at once. Callers are expected
//! to pre-wrap time values (the engine wraps its clock every seven days) so the
//! trig-based helpers never see huge arguments.

mod noise;

use std::f64::consts::TAU;

use serde::{Deserialize, Serialize};

pub use noise::{fbm_noise_3d, perlin_noise_3d, plasma_sines, plasma_sines_octave};

/// Color space a pattern's output triple is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ColorMode {
    #[default]
    Hsv,
    Rgb,
}

/// Lowest color temperature accepted by [`blackbody_to_rgb`].
pub const MIN_KELVIN: f64 = 1_000.0;
/// Highest color temperature accepted by [`blackbody_to_rgb`].
pub const MAX_KELVIN: f64 = 40_000.0;

/// Approximates the RGB color of a black body at `kelvin`.
///
/// Piecewise log-polynomial fit of the Planckian locus (Tanner Helland's
/// curves). The input is clamped to [`MIN_KELVIN`, `MAX_KELVIN`] and every
/// channel of the result lies in [0, 1].
pub fn blackbody_to_rgb(kelvin: f64) -> [f64; 3] {
    let temp = kelvin.clamp(MIN_KELVIN, MAX_KELVIN) / 100.0;

    let (r, g) = if temp <= 66.0 {
        let xg = temp - 2.0;
        (1.0, (-155.255 - 0.446 * xg + 104.492 * xg.ln()) / 255.0)
    } else {
        let xr = temp - 55.0;
        let xg = temp - 50.0;
        (
            (351.977 + 0.114 * xr - 40.254 * xr.ln()) / 255.0,
            (325.449 + 0.079 * xg - 28.085 * xg.ln()) / 255.0,
        )
    };

    let b = if temp >= 66.0 {
        1.0
    } else if temp <= 19.0 {
        0.0
    } else {
        let xb = temp - 10.0;
        (-254.769 + 0.827 * xb + 115.680 * xb.ln()) / 255.0
    };

    [clamp(r, 0.0, 1.0), clamp(g, 0.0, 1.0), clamp(b, 0.0, 1.0)]
}

/// Tints `rgb` by the black body color at `kelvin`.
pub fn blackbody_correction_rgb(rgb: [f64; 3], kelvin: f64) -> [f64; 3] {
    let bb = blackbody_to_rgb(kelvin);
    [rgb[0] * bb[0], rgb[1] * bb[1], rgb[2] * bb[2]]
}

/// Square wave: 1 while `t mod 1` is below `duty_cycle`, 0 otherwise.
pub fn wave_pulse(t: f64, duty_cycle: f64) -> f64 {
    (duty_cycle - fract(t)).ceil().clamp(0.0, 1.0)
}

/// Triangle wave with period 1: 0 at integers, 1 at `t ≡ 0.5`.
pub fn wave_triangle(t: f64) -> f64 {
    let ramp = (2.0 * t).rem_euclid(2.0);
    1.0 - (ramp - 1.0).abs()
}

/// Raised cosine with period 1, phase-shifted so that `wave_sine(0) == 0.5`.
pub fn wave_sine(t: f64) -> f64 {
    (TAU * (t - 0.25)).cos() / 2.0 + 0.5
}

/// Sine approximation: triangle wave with cubic ease-in/ease-out.
pub fn wave_cubic(t: f64) -> f64 {
    let tri = wave_triangle(t);
    if tri > 0.5 {
        let t2 = 1.0 - tri;
        1.0 - 4.0 * t2 * t2 * t2
    } else {
        4.0 * tri * tri * tri
    }
}

/// Exponential impulse peaking at 1 when `x == 1 / k`.
pub fn impulse_exp(k: f64, x: f64) -> f64 {
    let h = k * x;
    h * (1.0 - h).exp()
}

pub fn clamp(value: f64, min: f64, max: f64) -> f64 {
    value.max(min).min(max)
}

/// Floor-based fractional part, always in [0, 1) for finite input.
pub fn fract(value: f64) -> f64 {
    let f = value - value.floor();
    // `-1e-20 - floor(-1e-20)` rounds up to exactly 1.0
    if f >= 1.0 {
        0.0
    } else {
        f
    }
}

/// Standard HSV to RGB conversion on [0, 1] floats. Hue wraps.
pub fn hsv_to_rgb(h: f64, s: f64, v: f64) -> [f64; 3] {
    if s <= 0.0 {
        return [v, v, v];
    }
    let h6 = fract(h) * 6.0;
    let sector = h6.floor();
    let f = h6 - sector;
    let p = v * (1.0 - s);
    let q = v * (1.0 - s * f);
    let t = v * (1.0 - s * (1.0 - f));
    match sector as u8 % 6 {
        0 => [v, t, p],
        1 => [q, v, p],
        2 => [p, v, t],
        3 => [p, q, v],
        4 => [t, p, v],
        _ => [v, p, q],
    }
}

/// FastLED "rainbow" hue transform at full saturation and value.
///
/// The rainbow map spends more of the hue circle on yellow than the plain
/// spectrum does, which looks more even on WS281x LEDs.
pub fn rainbow_hue_to_rgb8(hue: u8) -> [u8; 3] {
    let offset = hue & 0x1f;
    let offset8 = offset << 3;
    let third = offset8 / 3;

    if hue & 0x80 == 0 {
        if hue & 0x40 == 0 {
            if hue & 0x20 == 0 {
                // red -> orange
                [255 - third, third, 0]
            } else {
                // orange -> yellow
                [171, 85 + third, 0]
            }
        } else if hue & 0x20 == 0 {
            // yellow -> green
            [171 - third * 2, 170 + third, 0]
        } else {
            // green -> aqua
            [0, 255 - third, third]
        }
    } else if hue & 0x40 == 0 {
        if hue & 0x20 == 0 {
            // aqua -> blue
            let two_thirds = third * 2;
            [0, 171 - two_thirds, 85 + two_thirds]
        } else {
            // blue -> purple
            [third, 0, 255 - third]
        }
    } else if hue & 0x20 == 0 {
        // purple -> pink
        [85 + third, 0, 171 - third]
    } else {
        // pink -> red
        [170 + third, 0, 85 - third]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    #[test]
    fn blackbody_is_white_near_daylight() {
        let [r, g, b] = blackbody_to_rgb(6_600.0);
        assert_eq!(r, 1.0);
        assert!(g > 0.95);
        assert!(b > 0.95);
    }

    #[test]
    fn blackbody_clamps_out_of_range_input() {
        assert_eq!(blackbody_to_rgb(10.0), blackbody_to_rgb(MIN_KELVIN));
        assert_eq!(blackbody_to_rgb(1.0e6), blackbody_to_rgb(MAX_KELVIN));
        for kelvin in [0.0, 1_500.0, 2_700.0, 4_000.0, 9_000.0, 25_000.0, 1.0e9] {
            for channel in blackbody_to_rgb(kelvin) {
                assert!((0.0..=1.0).contains(&channel), "{kelvin}: {channel}");
            }
        }
    }

    #[test]
    fn warm_light_has_no_blue() {
        let [r, _, b] = blackbody_to_rgb(1_800.0);
        assert_eq!(r, 1.0);
        assert_eq!(b, 0.0);
    }

    #[test]
    fn pulse_respects_duty_cycle() {
        assert_eq!(wave_pulse(0.1, 0.5), 1.0);
        assert_eq!(wave_pulse(0.6, 0.5), 0.0);
        assert_eq!(wave_pulse(3.2, 0.25), 1.0);
        assert_eq!(wave_pulse(-0.2, 0.5), 0.0);
        assert_eq!(wave_pulse(-0.7, 0.5), 1.0);
    }

    #[test]
    fn triangle_peaks_at_half_period() {
        assert!((wave_triangle(0.0)).abs() < EPS);
        assert!((wave_triangle(0.5) - 1.0).abs() < EPS);
        assert!((wave_triangle(0.25) - 0.5).abs() < EPS);
        assert!((wave_triangle(-0.25) - 0.5).abs() < EPS);
        assert!((wave_triangle(7.5) - 1.0).abs() < EPS);
    }

    #[test]
    fn sine_starts_at_midpoint() {
        assert!((wave_sine(0.0) - 0.5).abs() < EPS);
        assert!((wave_sine(0.25) - 1.0).abs() < EPS);
        assert!((wave_sine(0.75)).abs() < EPS);
        assert!((wave_sine(1.0) - 0.5).abs() < EPS);
    }

    #[test]
    fn cubic_matches_triangle_at_extremes() {
        assert!(wave_cubic(0.0).abs() < EPS);
        assert!((wave_cubic(0.5) - 1.0).abs() < EPS);
        assert!((wave_cubic(0.25) - 0.5).abs() < EPS);
        for i in 0..100 {
            let v = wave_cubic(i as f64 / 37.0);
            assert!((0.0..=1.0).contains(&v));
        }
    }

    #[test]
    fn fract_stays_in_unit_interval() {
        assert_eq!(fract(2.25), 0.25);
        assert_eq!(fract(-0.25), 0.75);
        assert_eq!(fract(-1e-20), 0.0);
    }

    #[test]
    fn impulse_peaks_at_one() {
        assert!((impulse_exp(4.0, 0.25) - 1.0).abs() < EPS);
        assert!(impulse_exp(4.0, 0.5) < 1.0);
    }

    #[test]
    fn hsv_to_rgb_primaries() {
        assert_eq!(hsv_to_rgb(0.0, 1.0, 1.0), [1.0, 0.0, 0.0]);
        let [r, g, b] = hsv_to_rgb(1.0 / 3.0, 1.0, 1.0);
        assert!(r.abs() < EPS && (g - 1.0).abs() < EPS && b.abs() < EPS);
        assert_eq!(hsv_to_rgb(0.4, 0.0, 0.3), [0.3, 0.3, 0.3]);
        assert_eq!(hsv_to_rgb(1.0, 1.0, 1.0), hsv_to_rgb(0.0, 1.0, 1.0));
    }

    #[test]
    fn rainbow_transform_hits_primaries() {
        assert_eq!(rainbow_hue_to_rgb8(0), [255, 0, 0]);
        assert_eq!(rainbow_hue_to_rgb8(96), [0, 255, 0]);
        assert_eq!(rainbow_hue_to_rgb8(160), [0, 0, 255]);
    }
}
