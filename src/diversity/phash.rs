//! DCT perceptual hash.
//!
//! The image is reduced to a 32x32 grayscale thumbnail, transformed with a
//! 2-D DCT-II, and the 8x8 block of lowest frequencies is thresholded at its
//! median. The resulting 64 bits describe coarse structure only, so resized
//! or recompressed copies land within a few bits of each other.

use std::fmt;

use image::imageops::FilterType;
use image::DynamicImage;
use serde::{Deserialize, Serialize};

/// Side of the thumbnail fed to the DCT.
const SAMPLE_SIZE: usize = 32;

/// Side of the retained low-frequency block (8x8 = 64 bits).
const HASH_SIZE: usize = 8;

/// A 64-bit perceptual fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub u64);

impl Fingerprint {
    /// Computes the fingerprint of a decoded image.
    pub fn from_image(image: &DynamicImage) -> Self {
        let gray = image
            .resize_exact(SAMPLE_SIZE as u32, SAMPLE_SIZE as u32, FilterType::Lanczos3)
            .to_luma8();

        let mut pixels = [[0f64; SAMPLE_SIZE]; SAMPLE_SIZE];
        for (x, y, p) in gray.enumerate_pixels() {
            pixels[y as usize][x as usize] = f64::from(p.0[0]);
        }

        Self::from_luma(&pixels)
    }

    /// Computes the fingerprint of an already-sampled 32x32 luma grid.
    pub fn from_luma(pixels: &[[f64; SAMPLE_SIZE]; SAMPLE_SIZE]) -> Self {
        let coeffs = dct_2d(pixels);

        let mut low = [0f64; HASH_SIZE * HASH_SIZE];
        for row in 0..HASH_SIZE {
            for col in 0..HASH_SIZE {
                low[row * HASH_SIZE + col] = coeffs[row][col];
            }
        }

        let median = median(&low);
        let bits = low
            .iter()
            .enumerate()
            .fold(0u64, |acc, (i, &c)| if c > median { acc | (1 << i) } else { acc });

        Fingerprint(bits)
    }

    /// Number of differing bits.
    pub fn hamming(&self, other: &Fingerprint) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0.to_be_bytes())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Unnormalised DCT-II over rows then columns.
fn dct_2d(input: &[[f64; SAMPLE_SIZE]; SAMPLE_SIZE]) -> [[f64; SAMPLE_SIZE]; SAMPLE_SIZE] {
    let n = SAMPLE_SIZE as f64;
    let mut cos_table = [[0f64; SAMPLE_SIZE]; SAMPLE_SIZE];
    for (k, row) in cos_table.iter_mut().enumerate() {
        for (i, c) in row.iter_mut().enumerate() {
            *c = (std::f64::consts::PI * k as f64 * (2.0 * i as f64 + 1.0) / (2.0 * n)).cos();
        }
    }

    let mut rows = [[0f64; SAMPLE_SIZE]; SAMPLE_SIZE];
    for y in 0..SAMPLE_SIZE {
        for k in 0..SAMPLE_SIZE {
            rows[y][k] = (0..SAMPLE_SIZE).map(|x| input[y][x] * cos_table[k][x]).sum();
        }
    }

    let mut out = [[0f64; SAMPLE_SIZE]; SAMPLE_SIZE];
    for x in 0..SAMPLE_SIZE {
        for k in 0..SAMPLE_SIZE {
            out[k][x] = (0..SAMPLE_SIZE).map(|y| rows[y][x] * cos_table[k][y]).sum();
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
