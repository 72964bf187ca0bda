//! Plasma and gradient-noise fields used as pattern building blocks.

/// Octave counts above this are clamped so a script cannot request an
/// arbitrarily long loop through a helper.
pub const MAX_OCTAVES: u32 = 16;

/// Sum of four sines over x, y, x + y and the radial distance.
///
/// The result is not normalized; fold it into [0, 1] with one of the
/// `wave_*` functions.
pub fn plasma_sines(
    x: f64,
    y: f64,
    t: f64,
    coeff_x: f64,
    coeff_y: f64,
    coeff_x_y: f64,
    coeff_dist_xy: f64,
) -> f64 {
    ((x + t) * coeff_x).sin()
        + ((y + t) * coeff_y).sin()
        + ((x + y + t) * coeff_x_y).sin()
        + (((x * x + y * y).sqrt() + t) * coeff_dist_xy).sin()
}

/// Domain-warped plasma: each octave displaces the point by cos/sin of the
/// previous position, then frequency and amplitude are scaled.
pub fn plasma_sines_octave(
    x: f64,
    y: f64,
    t: f64,
    octaves: u32,
    lacunarity: f64,
    persistence: f64,
) -> f64 {
    let mut vx = x;
    let mut vy = y;
    let mut freq = 1.0;
    let mut amplitude = 1.0;
    for _ in 0..octaves.min(MAX_OCTAVES) {
        let vx1 = vx;
        vx += (vy * freq + t * freq).cos() * amplitude;
        vy += (vx1 * freq + t * freq).sin() * amplitude;
        freq *= lacunarity;
        amplitude *= persistence;
    }
    vx / 2.0
}

const PERMUTATION: [u8; 256] = [
    151, 160, 137, 91, 90, 15, 131, 13, 201, 95, 96, 53, 194, 233, 7, 225, 140, 36, 103, 30, 69,
    142, 8, 99, 37, 240, 21, 10, 23, 190, 6, 148, 247, 120, 234, 75, 0, 26, 197, 62, 94, 252, 219,
    203, 117, 35, 11, 32, 57, 177, 33, 88, 237, 149, 56, 87, 174, 20, 125, 136, 171, 168, 68, 175,
    74, 165, 71, 134, 139, 48, 27, 166, 77, 146, 158, 231, 83, 111, 229, 122, 60, 211, 133, 230,
    220, 105, 92, 41, 55, 46, 245, 40, 244, 102, 143, 54, 65, 25, 63, 161, 1, 216, 80, 73, 209, 76,
    132, 187, 208, 89, 18, 169, 200, 196, 135, 130, 116, 188, 159, 86, 164, 100, 109, 198, 173,
    186, 3, 64, 52, 217, 226, 250, 124, 123, 5, 202, 38, 147, 118, 126, 255, 82, 85, 212, 207, 206,
    59, 227, 47, 16, 58, 17, 182, 189, 28, 42, 223, 183, 170, 213, 119, 248, 152, 2, 44, 154, 163,
    70, 221, 153, 101, 155, 167, 43, 172, 9, 129, 22, 39, 253, 19, 98, 108, 110, 79, 113, 224, 232,
    178, 185, 112, 104, 218, 246, 97, 228, 251, 34, 242, 193, 238, 210, 144, 12, 191, 179, 162,
    241, 81, 51, 145, 235, 249, 14, 239, 107, 49, 192, 214, 31, 181, 199, 106, 157, 184, 84, 204,
    176, 115, 121, 50, 45, 127, 4, 150, 254, 138, 236, 205, 93, 222, 114, 67, 29, 24, 72, 243, 141,
    128, 195, 78, 66, 215, 61, 156, 180,
];

#[inline]
fn perm(i: usize) -> usize {
    PERMUTATION[i & 255] as usize
}

#[inline]
fn fade(t: f64) -> f64 {
    t * t * t * (t * (t * 6.0 - 15.0) + 10.0)
}

#[inline]
fn lerp(t: f64, a: f64, b: f64) -> f64 {
    a + t * (b - a)
}

#[inline]
fn grad(hash: usize, x: f64, y: f64, z: f64) -> f64 {
    let h = hash & 15;
    let u = if h < 8 { x } else { y };
    let v = if h < 4 {
        y
    } else if h == 12 || h == 14 {
        x
    } else {
        z
    };
    (if h & 1 == 0 { u } else { -u }) + (if h & 2 == 0 { v } else { -v })
}

/// Improved Perlin noise, remapped from [-1, 1] to [0, 1].
pub fn perlin_noise_3d(x: f64, y: f64, z: f64) -> f64 {
    let (fx, fy, fz) = (x.floor(), y.floor(), z.floor());
    let xi = (fx as i64 & 255) as usize;
    let yi = (fy as i64 & 255) as usize;
    let zi = (fz as i64 & 255) as usize;
    let (x, y, z) = (x - fx, y - fy, z - fz);
    let (u, v, w) = (fade(x), fade(y), fade(z));

    let a = perm(xi) + yi;
    let aa = perm(a) + zi;
    let ab = perm(a + 1) + zi;
    let b = perm(xi + 1) + yi;
    let ba = perm(b) + zi;
    let bb = perm(b + 1) + zi;

    let value = lerp(
        w,
        lerp(
            v,
            lerp(u, grad(perm(aa), x, y, z), grad(perm(ba), x - 1.0, y, z)),
            lerp(
                u,
                grad(perm(ab), x, y - 1.0, z),
                grad(perm(bb), x - 1.0, y - 1.0, z),
            ),
        ),
        lerp(
            v,
            lerp(
                u,
                grad(perm(aa + 1), x, y, z - 1.0),
                grad(perm(ba + 1), x - 1.0, y, z - 1.0),
            ),
            lerp(
                u,
                grad(perm(ab + 1), x, y - 1.0, z - 1.0),
                grad(perm(bb + 1), x - 1.0, y - 1.0, z - 1.0),
            ),
        ),
    );
    (value + 1.0) / 2.0
}

/// Fractal Brownian motion over [`perlin_noise_3d`], halved.
pub fn fbm_noise_3d(
    x: f64,
    y: f64,
    z: f64,
    octaves: u32,
    lacunarity: f64,
    persistence: f64,
) -> f64 {
    let mut value = 0.0;
    let mut freq = 1.0;
    let mut amplitude = 1.0;
    for _ in 0..octaves.min(MAX_OCTAVES) {
        value += amplitude * perlin_noise_3d(freq * x, freq * y, freq * z);
        freq *= lacunarity;
        amplitude *= persistence;
    }
    value / 2.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plasma_is_zero_at_origin() {
        assert_eq!(plasma_sines(0.0, 0.0, 0.0, 1.0, 0.5, 0.5, 1.0), 0.0);
        let v = plasma_sines(0.3, 0.7, 12.5, 1.0, 0.5, 0.5, 1.0);
        assert!(v.abs() <= 4.0);
    }

    #[test]
    fn octave_plasma_without_octaves_halves_x() {
        assert_eq!(plasma_sines_octave(0.8, 0.1, 3.0, 0, 2.0, 0.5), 0.4);
        let v = plasma_sines_octave(0.2, 0.4, 1.0, 7, 2.0, 0.5);
        assert!(v.is_finite());
    }

    #[test]
    fn perlin_is_half_on_lattice_points() {
        assert!((perlin_noise_3d(0.0, 0.0, 0.0) - 0.5).abs() < 1e-12);
        assert!((perlin_noise_3d(3.0, 7.0, 1.0) - 0.5).abs() < 1e-12);
    }

    #[test]
    fn perlin_stays_near_unit_range() {
        for i in 0..500 {
            let f = i as f64;
            let v = perlin_noise_3d(f * 0.137, f * 0.291 - 20.0, f * 0.053);
            assert!((-0.1..=1.1).contains(&v), "{v}");
        }
    }

    #[test]
    fn fbm_sums_octaves() {
        let single = fbm_noise_3d(0.3, 0.6, 0.9, 1, 2.0, 0.5);
        assert!((single - perlin_noise_3d(0.3, 0.6, 0.9) / 2.0).abs() < 1e-12);
        assert_eq!(fbm_noise_3d(0.3, 0.6, 0.9, 0, 2.0, 0.5), 0.0);
    }

    #[test]
    fn octave_counts_are_capped() {
        let capped = fbm_noise_3d(0.1, 0.2, 0.3, MAX_OCTAVES, 2.0, 0.5);
        let huge = fbm_noise_3d(0.1, 0.2, 0.3, u32::MAX, 2.0, 0.5);
        assert_eq!(capped, huge);
    }
}
