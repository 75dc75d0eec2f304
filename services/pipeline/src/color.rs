//! Dominant color classification for detection boxes.

use crate::frame::{Frame, PixelRegion};

/// A named color with the RGB triple it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedColor {
    pub name: String,
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl NamedColor {
    /// Neutral default returned for empty regions.
    pub fn neutral() -> Self {
        Self {
            name: "gray".to_string(),
            r: 128,
            g: 128,
            b: 128,
        }
    }
}

/// Maps a pixel region to a named color.
pub trait ColorClassifier: Send + Sync {
    fn dominant_color(&self, frame: &Frame, region: &PixelRegion) -> NamedColor;
}

const PALETTE: [(&str, [u8; 3]); 12] = [
    ("red", [255, 0, 0]),
    ("green", [0, 255, 0]),
    ("blue", [0, 0, 255]),
    ("yellow", [255, 255, 0]),
    ("cyan", [0, 255, 255]),
    ("magenta", [255, 0, 255]),
    ("white", [255, 255, 255]),
    ("black", [0, 0, 0]),
    ("gray", [128, 128, 128]),
    ("orange", [255, 165, 0]),
    ("purple", [128, 0, 128]),
    ("brown", [165, 42, 42]),
];

/// Averages the region and picks the nearest palette entry by Euclidean
/// distance in RGB space. Ties keep the earlier palette entry.
#[derive(Debug, Clone, Default)]
pub struct PaletteClassifier;

impl PaletteClassifier {
    pub fn new() -> Self {
        Self
    }

    /// Name of the palette color closest to `rgb`.
    pub fn nearest_name(rgb: [u8; 3]) -> &'static str {
        let mut best = ("gray", u32::MAX);

        for (name, color) in PALETTE.iter() {
            let dist: u32 = rgb
                .iter()
                .zip(color.iter())
                .map(|(a, b)| {
                    let d = *a as i32 - *b as i32;
                    (d * d) as u32
                })
                .sum();
            if dist < best.1 {
                best = (name, dist);
            }
        }

        best.0
    }
}

impl ColorClassifier for PaletteClassifier {
    fn dominant_color(&self, frame: &Frame, region: &PixelRegion) -> NamedColor {
        match frame.region_mean(region) {
            Some([r, g, b]) => NamedColor {
                name: Self::nearest_name([r, g, b]).to_string(),
                r,
                g,
                b,
            },
            None => NamedColor::neutral(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_name() {
        assert_eq!(PaletteClassifier::nearest_name([250, 10, 5]), "red");
        assert_eq!(PaletteClassifier::nearest_name([250, 160, 10]), "orange");
        assert_eq!(PaletteClassifier::nearest_name([10, 10, 10]), "black");
        assert_eq!(PaletteClassifier::nearest_name([120, 130, 125]), "gray");
        assert_eq!(PaletteClassifier::nearest_name([160, 40, 45]), "brown");
    }

    #[test]
    fn test_dominant_color_of_region() {
        let frame = Frame::solid(10, 10, [0, 0, 240]);
        let color = PaletteClassifier::new().dominant_color(&frame, &PixelRegion::new(2, 2, 6, 6));

        assert_eq!(color.name, "blue");
        assert_eq!((color.r, color.g, color.b), (0, 0, 240));
    }

    #[test]
    fn test_empty_region_is_neutral() {
        let frame = Frame::solid(10, 10, [255, 255, 255]);
        let color = PaletteClassifier::new().dominant_color(&frame, &PixelRegion::new(5, 5, 5, 9));
        assert_eq!(color, NamedColor::neutral());
    }
}
