//! Foreground extraction for the pixel-counting occupancy fallback.
//!
//! The pipeline mirrors the classic parking-lot recipe: grayscale ->
//! gaussian blur -> inverted adaptive threshold -> median blur -> dilate,
//! then count non-zero pixels per spot crop. Everything operates on plain
//! byte buffers; no image crate is involved.

use crate::frame::GrayImage;
use crate::geometry::Rect;

/// Neighbourhood size for the local-mean adaptive threshold.
pub const ADAPTIVE_BLOCK_SIZE: usize = 25;

/// Constant subtracted from the local mean; pixels this much darker than
/// their neighbourhood count as foreground.
pub const ADAPTIVE_C: i32 = 16;

/// Run the full pipeline on a grayscale frame, producing a binary (0/255)
/// image where non-zero pixels are candidate vehicle texture.
pub fn extract_foreground(gray: &GrayImage) -> GrayImage {
    let blurred = gaussian_blur_3x3(gray);
    let thresholded = adaptive_threshold(&blurred, ADAPTIVE_BLOCK_SIZE, ADAPTIVE_C);
    let despeckled = median_blur_5x5(&thresholded);
    dilate_3x3(&despeckled)
}

/// Separable 3x3 gaussian ([1 2 1] / 4 per axis), edge-replicated.
pub fn gaussian_blur_3x3(img: &GrayImage) -> GrayImage {
    let mut horizontal = GrayImage::new(img.width, img.height);
    for y in 0..img.height {
        for x in 0..img.width {
            let xi = x as isize;
            let yi = y as isize;
            let sum = img.get_clamped(xi - 1, yi) as u32
                + 2 * img.get_clamped(xi, yi) as u32
                + img.get_clamped(xi + 1, yi) as u32;
            horizontal.data[y * img.width + x] = ((sum + 2) / 4) as u8;
        }
    }

    let mut out = GrayImage::new(img.width, img.height);
    for y in 0..img.height {
        for x in 0..img.width {
            let xi = x as isize;
            let yi = y as isize;
            let sum = horizontal.get_clamped(xi, yi - 1) as u32
                + 2 * horizontal.get_clamped(xi, yi) as u32
                + horizontal.get_clamped(xi, yi + 1) as u32;
            out.data[y * img.width + x] = ((sum + 2) / 4) as u8;
        }
    }
    out
}

/// Inverted adaptive threshold against the local mean over a
/// `block_size` x `block_size` window (clamped at the borders): pixels at
/// least `c` darker than their neighbourhood become 255, everything else 0.
pub fn adaptive_threshold(img: &GrayImage, block_size: usize, c: i32) -> GrayImage {
    let w = img.width;
    let h = img.height;
    let half = (block_size / 2) as isize;

    // Summed-area table with a zero row/column of padding
    let mut integral = vec![0u64; (w + 1) * (h + 1)];
    for y in 0..h {
        let mut row_sum = 0u64;
        for x in 0..w {
            row_sum += img.get(x, y) as u64;
            integral[(y + 1) * (w + 1) + (x + 1)] = integral[y * (w + 1) + (x + 1)] + row_sum;
        }
    }
    let window_sum = |x0: usize, y0: usize, x1: usize, y1: usize| -> u64 {
        integral[(y1 + 1) * (w + 1) + (x1 + 1)] + integral[y0 * (w + 1) + x0]
            - integral[y0 * (w + 1) + (x1 + 1)]
            - integral[(y1 + 1) * (w + 1) + x0]
    };

    let mut out = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let x0 = (x as isize - half).max(0) as usize;
            let y0 = (y as isize - half).max(0) as usize;
            let x1 = (x as isize + half).min(w as isize - 1) as usize;
            let y1 = (y as isize + half).min(h as isize - 1) as usize;
            let area = ((x1 - x0 + 1) * (y1 - y0 + 1)) as u64;
            let mean = (window_sum(x0, y0, x1, y1) / area) as i32;

            out.data[y * w + x] = if (img.get(x, y) as i32) <= mean - c {
                255
            } else {
                0
            };
        }
    }
    out
}

/// 5x5 median filter, edge-replicated. Removes salt-and-pepper speckle
/// left by the adaptive threshold.
pub fn median_blur_5x5(img: &GrayImage) -> GrayImage {
    let mut out = GrayImage::new(img.width, img.height);
    let mut window = [0u8; 25];
    for y in 0..img.height {
        for x in 0..img.width {
            let mut i = 0;
            for dy in -2isize..=2 {
                for dx in -2isize..=2 {
                    window[i] = img.get_clamped(x as isize + dx, y as isize + dy);
                    i += 1;
                }
            }
            window.sort_unstable();
            out.data[y * img.width + x] = window[12];
        }
    }
    out
}

/// One iteration of 3x3 dilation (max filter), thickening foreground blobs.
pub fn dilate_3x3(img: &GrayImage) -> GrayImage {
    let mut out = GrayImage::new(img.width, img.height);
    for y in 0..img.height {
        for x in 0..img.width {
            let mut max = 0u8;
            for dy in -1isize..=1 {
                for dx in -1isize..=1 {
                    max = max.max(img.get_clamped(x as isize + dx, y as isize + dy));
                }
            }
            out.data[y * img.width + x] = max;
        }
    }
    out
}

/// Count non-zero pixels inside a crop region, clamped to image bounds.
pub fn count_nonzero(img: &GrayImage, region: &Rect) -> u32 {
    let x0 = region.x1.max(0.) as usize;
    let y0 = region.y1.max(0.) as usize;
    let x1 = (region.x2 as usize).min(img.width);
    let y1 = (region.y2 as usize).min(img.height);

    let mut count = 0;
    for y in y0..y1 {
        for x in x0..x1 {
            if img.get(x, y) != 0 {
                count += 1;
            }
        }
    }
    count
}
