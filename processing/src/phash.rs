//! 64-bit DCT perceptual hash of still images.
//!
//! The image is reduced to 32×32 grayscale, transformed with a 2-D DCT-II,
//! and the 8×8 lowest-frequency coefficients are thresholded against their
//! median.  Visually identical creatives re-encoded by different CDNs end
//! up with the same (or a near) hash.

use image::imageops::FilterType;

const SIZE: usize = 32;
const LOW: usize = 8;

/// Hex-encoded hash, or `None` when `bytes` is not a decodable image
/// (videos included).
pub fn phash(bytes: &[u8]) -> Option<String> {
    let img = image::load_from_memory(bytes).ok()?;
    let gray = img
        .resize_exact(SIZE as u32, SIZE as u32, FilterType::Triangle)
        .to_luma8();

    let mut pixels = [[0f64; SIZE]; SIZE];
    for (x, y, p) in gray.enumerate_pixels() {
        pixels[y as usize][x as usize] = f64::from(p.0[0]);
    }
    let coeffs = dct_2d(&pixels);

    let mut low: Vec<f64> = Vec::with_capacity(LOW * LOW);
    for row in coeffs.iter().take(LOW) {
        low.extend_from_slice(&row[..LOW]);
    }
    let median = median(&low);

    let bits = low
        .iter()
        .fold(0u64, |acc, &c| (acc << 1) | u64::from(c > median));
    Some(format!("{bits:016x}"))
}

/// Hamming distance between two hashes from [`phash`].
pub fn distance(a: &str, b: &str) -> Option<u32> {
    let a = u64::from_str_radix(a, 16).ok()?;
    let b = u64::from_str_radix(b, 16).ok()?;
    Some((a ^ b).count_ones())
}

fn dct_1d(input: &[f64; SIZE]) -> [f64; SIZE] {
    let n = SIZE as f64;
    let mut out = [0f64; SIZE];
    for (k, o) in out.iter_mut().enumerate() {
        *o = input
            .iter()
            .enumerate()
            .map(|(i, &v)| v * (std::f64::consts::PI * (2 * i + 1) as f64 * k as f64 / (2.0 * n)).cos())
            .sum();
    }
    out
}

fn dct_2d(pixels: &[[f64; SIZE]; SIZE]) -> [[f64; SIZE]; SIZE] {
    let mut rows = [[0f64; SIZE]; SIZE];
    for (r, row) in pixels.iter().enumerate() {
        rows[r] = dct_1d(row);
    }
    let mut out = [[0f64; SIZE]; SIZE];
    for c in 0..SIZE {
        let mut col = [0f64; SIZE];
        for r in 0..SIZE {
            col[r] = rows[r][c];
        }
        let transformed = dct_1d(&col);
        for r in 0..SIZE {
            out[r][c] = transformed[r];
        }
    }
    out
}

fn median(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
