//! Colour heuristics for construction photos.
//!
//! Pixels of a 320x320 thumbnail are converted to HSV on the 8-bit OpenCV
//! scale (hue 0-180, saturation and value 0-255) and counted against fixed
//! ranges. A colour covering more than 2% of the frame yields its tag.

use image::imageops::FilterType;
use image::DynamicImage;

const SAMPLE_SIZE: u32 = 320;
const MIN_COVERAGE: f32 = 0.02;

type HsvRange = ([u8; 3], [u8; 3]);

/// Tag and the inclusive HSV ranges that count towards it, in tag order.
const RULES: [(&str, &[HsvRange]); 5] = [
    ("yellow_trench_protection", &[([20, 80, 80], [35, 255, 255])]),
    ("orange_conduit", &[([10, 80, 80], [19, 255, 255])]),
    ("blue_water_pipe", &[([90, 80, 60], [130, 255, 255])]),
    ("green_sewer_pipe", &[([40, 60, 40], [85, 255, 255])]),
    (
        "red_electrical_marker",
        // red wraps around the hue circle
        &[([0, 80, 60], [8, 255, 255]), ([170, 80, 60], [180, 255, 255])],
    ),
];

/// Tags for every colour that covers enough of the image.
pub fn color_tags(img: &DynamicImage) -> Vec<String> {
    let small = img
        .resize_exact(SAMPLE_SIZE, SAMPLE_SIZE, FilterType::Triangle)
        .to_rgb8();
    let total = (small.width() * small.height()) as f32;

    let mut counts = [0usize; RULES.len()];
    for pixel in small.pixels() {
        let hsv = to_hsv(pixel.0);
        for (count, (_, ranges)) in counts.iter_mut().zip(RULES.iter()) {
            if ranges.iter().any(|range| in_range(hsv, range)) {
                *count += 1;
            }
        }
    }

    RULES
        .iter()
        .zip(counts)
        .filter(|(_, count)| *count as f32 / total > MIN_COVERAGE)
        .map(|((tag, _), _)| tag.to_string())
        .collect()
}

fn in_range(hsv: [u8; 3], (low, high): &HsvRange) -> bool {
    (0..3).all(|c| low[c] <= hsv[c] && hsv[c] <= high[c])
}

/// RGB to 8-bit HSV with hue halved into 0-180.
fn to_hsv([r, g, b]: [u8; 3]) -> [u8; 3] {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let saturation = if max > 0.0 { delta / max * 255.0 } else { 0.0 };
    let mut hue = if delta == 0.0 {
        0.0
    } else if max == r {
        60.0 * (g - b) / delta
    } else if max == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    if hue < 0.0 {
        hue += 360.0;
    }

    [
        (hue / 2.0).round() as u8,
        saturation.round() as u8,
        max.round() as u8,
    ]
}
