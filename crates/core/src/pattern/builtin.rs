//! The stock pattern library, written in the pattern script dialect.

use std::collections::BTreeMap;

use super::PatternDefinition;

/// Ids of patterns that show a solid, time-independent color.
pub const STATIC_PATTERN_IDS: [u32; 4] = [0, 1, 2, 3];

const BUILTINS: &[(u32, &str, f64, &str)] = &[
    (0, "Static Color", 0.0, "palette(0.0)"),
    (1, "Static White", 0.0, "hsv(0.0, 0.0, 1.0)"),
    (2, "Static Gradient 1D", 0.0, "palette(x)"),
    (3, "Static Gradient Mirrored 1D", 0.0, "palette_mirrored(x)"),
    (
        6,
        "Twinkle Gradient 1D",
        0.2,
        r#"let v = prev_state[2] - dt;
if v <= 0.0 {
    let c = palette(x);
    hsv(c[0], c[1], random())
} else {
    hsv(prev_state[0], prev_state[1], v)
}"#,
    ),
    (
        7,
        "Twinkle White 1D",
        0.2,
        r#"let v = prev_state[2] - dt;
if v <= 0.0 {
    hsv(0.0, 0.0, random())
} else {
    hsv(prev_state[0], prev_state[1], v)
}"#,
    ),
    (100, "Palette Cycle 1D", 0.2, "palette(t + x)"),
    (110, "Palette Cycle Mirrored 1D", 0.2, "palette_mirrored(t + x)"),
    (
        112,
        "Palette Cycle Wipe 1D",
        0.2,
        r#"let c = palette_mirrored(t + x);
let v = if fract(t + x) > 0.5 { 1.0 } else { 0.0 };
hsv(c[0], c[1], v)"#,
    ),
    (
        114,
        "Palette Cycle Wipe From Center 1D",
        0.2,
        r#"let c = palette_mirrored(t + x);
let phase = if x < 0.5 { fract(t + x) } else { fract(t - x) };
let v = if phase < 0.5 { 1.0 } else { 0.0 };
hsv(c[0], c[1], v)"#,
    ),
    (
        120,
        "Palette Cycle Quantized 1D",
        0.2,
        r#"let p = fract(t + x);
palette(p - p % (1.0 / 6.0))"#,
    ),
    (
        130,
        "Palette Cycle Random 1D",
        0.2,
        r#"let p = t + x;
let i = (p - p % 0.2) / 0.2;
palette(i * 0.618034)"#,
    ),
    (
        140,
        "Palette Scan Mirrored 1D",
        0.1,
        "palette_mirrored(wave_triangle(t) + x)",
    ),
    (
        141,
        "Palette Bounce Mirrored 1D",
        0.1,
        "palette_mirrored(wave_sine(t) + x)",
    ),
    (
        150,
        "Palette Waves 1D",
        0.05,
        r#"let h = (x + t) * 0.1 + x + wave_sine(t);
let c = palette(wave_triangle(h));
hsv(c[0], c[1], wave_sine(h + t))"#,
    ),
    (
        160,
        "Palette Ripples 1D",
        0.2,
        r#"let wave1 = wave_sine(t / 4.0 + x);
let wave2 = wave_sine(t / 8.0 - x);
let wave3 = wave_sine(x + wave1 + wave2);
let c = palette(wave3 % 0.15 + t);
hsv(c[0], c[1], wave1 + wave3)"#,
    ),
    (
        161,
        "Palette Ripples (Fast Cycle) 1D",
        0.2,
        r#"let wave1 = wave_sine(t / 4.0 + x);
let wave2 = wave_sine(t / 8.0 - x);
let wave3 = wave_sine(x + wave1 + wave2);
let c = palette(wave3 % 0.8 + t);
hsv(c[0], c[1], wave1 + wave3)"#,
    ),
    (
        170,
        "Palette Plasma 2D",
        0.2,
        r#"let v = plasma_sines(x, y, t, 1.0, 0.5, 0.5, 1.0);
palette(wave_triangle(v))"#,
    ),
    (
        180,
        "Palette Fractal Plasma 2D",
        0.2,
        r#"let v = plasma_sines_octave(x, y, t, 7, 2.0, 0.5);
palette(wave_triangle(v))"#,
    ),
    (
        190,
        "Palette Twinkle 1D",
        0.2,
        r#"let v = prev_state[2] - dt;
if v <= 0.0 {
    let c = palette(t + x);
    hsv(c[0], c[1], random())
} else {
    hsv(prev_state[0], prev_state[1], v)
}"#,
    ),
    (
        200,
        "Palette Perlin Noise 2D",
        0.3,
        "palette(perlin_noise_3d(x, y, t))",
    ),
    (
        210,
        "Palette fBm Noise 2D",
        0.3,
        r#"let v = fbm_noise_3d(x, y, t * 0.5, 7, 2.0, 0.5);
palette(wave_triangle(v * 4.0))"#,
    ),
    (310, "Hue Cycle 1D", 0.2, "hsv(t + x, 1.0, 1.0)"),
    (
        320,
        "Hue Cycle Quantized 1D",
        0.2,
        r#"let hue = fract(t + x);
hsv(hue - hue % 0.1666, 1.0, 1.0)"#,
    ),
    (330, "Hue Scan 1D", 0.1, "hsv(wave_triangle(t) + x, 1.0, 1.0)"),
    (331, "Hue Bounce 1D", 0.1, "hsv(wave_sine(t) + x, 1.0, 1.0)"),
    (
        340,
        "Hue Waves 1D",
        0.2,
        r#"let h = (x + t) * 0.5 + x + wave_sine(t);
hsv(h, 1.0, wave_sine(h + t))"#,
    ),
    (
        350,
        "Hue Ripples 1D",
        0.2,
        r#"let wave1 = wave_sine(t / 4.0 + x);
let wave2 = wave_sine(t / 8.0 - x);
let wave3 = wave_sine(x + wave1 + wave2);
hsv(wave3 % 0.15 + t, 1.0, wave1 + wave3)"#,
    ),
    (
        400,
        "RGB Sines 1D",
        0.2,
        r#"rgb(wave_sine(t + x),
    wave_sine((t + x) * 1.2),
    wave_sine((t + x) * 1.4))"#,
    ),
    (
        410,
        "RGB Cubics 1D",
        0.2,
        r#"rgb(wave_cubic(t + x),
    wave_cubic((t + x) * 1.2),
    wave_cubic((t + x) * 1.4))"#,
    ),
    (
        420,
        "RGB Ripples 1D",
        0.2,
        r#"let v0 = x + wave_sine(t) + wave_sine(x + 0.666 * t);
let v1 = x + wave_sine(t + 0.05) + wave_sine(x + 0.666 * t + 0.05);
let v2 = x + wave_sine(t + 0.1) + wave_sine(x + 0.666 * t + 0.1);
rgb(0.01 / (wave_triangle(v0) + 0.01),
    0.01 / (wave_triangle(v1) + 0.01),
    0.01 / (wave_triangle(v2) + 0.01))"#,
    ),
    (
        430,
        "RGB Plasma (Spectrum Sines) 2D",
        0.2,
        r#"let v = plasma_sines(x, y, t, 1.0, 0.5, 0.5, 1.0);
rgb(wave_sine(v), wave_sine(v + 0.333), wave_sine(v + 0.666))"#,
    ),
    (
        440,
        "RGB Plasma (Fire Sines) 2D",
        0.2,
        r#"let v = plasma_sines(x, y, t, 1.0, 0.5, 0.5, 1.0);
rgb(0.9 - wave_sine(v), wave_sine(v + 0.333) - 0.1, 0.9 - wave_sine(v + 0.666))"#,
    ),
    (
        450,
        "RGB Fractal Plasma (Fire Sines) 2D",
        0.2,
        r#"let v = plasma_sines_octave(x, y, t, 7, 2.0, 0.5);
rgb(1.0 - wave_sine(v), wave_sine(v + 0.333), 1.0 - wave_sine(v + 0.666))"#,
    ),
];

/// Built-in pattern definitions keyed by id.
pub fn default_patterns() -> BTreeMap<u32, PatternDefinition> {
    BUILTINS
        .iter()
        .map(|&(id, name, speed, source)| {
            let definition = PatternDefinition {
                is_default: true,
                is_static: STATIC_PATTERN_IDS.contains(&id),
                default_speed: speed,
                ..PatternDefinition::new(name, source)
            };
            (id, definition)
        })
        .collect()
}
