//! Detection records.
//!
//! A [`DetectionRecord`] is one object instance found in one frame or image.
//! Records are built once by [`RecordBuilder`] and are read-only afterwards:
//! windowing, staging and loading only borrow them.
//!
//! Field order is the staging file column order and the warehouse table
//! column order. Do not reorder.

use crate::color::ColorClassifier;
use crate::detector::RawDetection;
use crate::frame::{Frame, PixelRegion};
use chrono::{NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Kind of media a record was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Image,
    Video,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Image => "image",
            SourceKind::Video => "video",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vertical band of the 3x3 position grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Row {
    Top,
    Middle,
    Bottom,
}

/// Horizontal band of the 3x3 position grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Left,
    Center,
    Right,
}

/// Coarse 3x3 position label derived from the normalized box center.
///
/// Rendered as `{row}_{column}`, e.g. `top_left` or `middle_center`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PositionRegion {
    pub row: Row,
    pub column: Column,
}

impl PositionRegion {
    /// Classify a normalized center. Bands split at 0.33 and 0.66.
    pub fn from_normalized(center_x_norm: f64, center_y_norm: f64) -> Self {
        let column = if center_x_norm < 0.33 {
            Column::Left
        } else if center_x_norm < 0.66 {
            Column::Center
        } else {
            Column::Right
        };

        let row = if center_y_norm < 0.33 {
            Row::Top
        } else if center_y_norm < 0.66 {
            Row::Middle
        } else {
            Row::Bottom
        };

        Self { row, column }
    }
}

impl fmt::Display for PositionRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let row = match self.row {
            Row::Top => "top",
            Row::Middle => "middle",
            Row::Bottom => "bottom",
        };
        let column = match self.column {
            Column::Left => "left",
            Column::Center => "center",
            Column::Right => "right",
        };
        write!(f, "{}_{}", row, column)
    }
}

impl FromStr for PositionRegion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (row, column) = s
            .split_once('_')
            .ok_or_else(|| format!("invalid position region: {}", s))?;

        let row = match row {
            "top" => Row::Top,
            "middle" => Row::Middle,
            "bottom" => Row::Bottom,
            other => return Err(format!("invalid position row: {}", other)),
        };
        let column = match column {
            "left" => Column::Left,
            "center" => Column::Center,
            "right" => Column::Right,
            other => return Err(format!("invalid position column: {}", other)),
        };

        Ok(Self { row, column })
    }
}

impl TryFrom<String> for PositionRegion {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PositionRegion> for String {
    fn from(region: PositionRegion) -> Self {
        region.to_string()
    }
}

/// Serde helper for the `YYYY-MM-DD HH:MM:SS` ingestion timestamp
pub(crate) mod ingestion_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&s, FORMAT).map_err(serde::de::Error::custom)
    }
}

/// One detected object instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionRecord {
    pub source_type: SourceKind,
    pub source_id: String,
    pub frame_number: u64,
    pub class_id: i32,
    pub class_name: String,
    pub confidence: f64,
    pub x_min: i32,
    pub y_min: i32,
    pub x_max: i32,
    pub y_max: i32,
    pub width: i32,
    pub height: i32,
    pub area_pixels: i64,
    pub frame_width: u32,
    pub frame_height: u32,
    pub bbox_area_ratio: f64,
    pub center_x: f64,
    pub center_y: f64,
    pub center_x_norm: f64,
    pub center_y_norm: f64,
    pub position_region: PositionRegion,
    pub dominant_color_name: String,
    pub dom_r: u8,
    pub dom_g: u8,
    pub dom_b: u8,
    pub timestamp_sec: f64,
    #[serde(with = "ingestion_format")]
    pub ingestion_date: NaiveDateTime,
    pub detection_id: Uuid,
}

/// Where a frame came from
#[derive(Debug, Clone, Copy)]
pub struct FrameContext<'a> {
    pub source_type: SourceKind,
    pub source_id: &'a str,
    pub frame_number: u64,
    pub timestamp_sec: f64,
}

impl<'a> FrameContext<'a> {
    /// Context for a still image: frame 0 at t = 0.
    pub fn image(source_id: &'a str) -> Self {
        Self {
            source_type: SourceKind::Image,
            source_id,
            frame_number: 0,
            timestamp_sec: 0.0,
        }
    }

    pub fn video(source_id: &'a str, frame_number: u64, timestamp_sec: f64) -> Self {
        Self {
            source_type: SourceKind::Video,
            source_id,
            frame_number,
            timestamp_sec,
        }
    }
}

/// Builds detection records from raw detector output.
pub struct RecordBuilder {
    colors: Arc<dyn ColorClassifier>,
    min_confidence: f64,
}

impl RecordBuilder {
    pub fn new(colors: Arc<dyn ColorClassifier>, min_confidence: f64) -> Self {
        Self {
            colors,
            min_confidence,
        }
    }

    /// Build a record, or `None` if the detection is below the confidence threshold.
    pub fn build(
        &self,
        ctx: &FrameContext<'_>,
        frame: &Frame,
        raw: &RawDetection,
    ) -> Option<DetectionRecord> {
        let mut confidence = raw.confidence as f64;
        if !confidence.is_finite() {
            warn!(source_id = %ctx.source_id, class = %raw.class_name, "Dropping detection with non-finite confidence");
            return None;
        }
        if !(0.0..=1.0).contains(&confidence) {
            warn!(
                source_id = %ctx.source_id,
                confidence = confidence,
                "Detector confidence outside [0, 1], clamping"
            );
            confidence = confidence.clamp(0.0, 1.0);
        }
        if confidence < self.min_confidence {
            return None;
        }

        let frame_width = frame.width();
        let frame_height = frame.height();
        let fw = frame_width as f32;
        let fh = frame_height as f32;

        // Normalize inverted boxes, then clamp to the frame
        let (x1, x2) = ordered(raw.x_min, raw.x_max);
        let (y1, y2) = ordered(raw.y_min, raw.y_max);
        let x1 = clamp_coord(x1, fw);
        let x2 = clamp_coord(x2, fw);
        let y1 = clamp_coord(y1, fh);
        let y2 = clamp_coord(y2, fh);

        let width = (x2 - x1) as i32;
        let height = (y2 - y1) as i32;
        let area_pixels = width as i64 * height as i64;
        let frame_area = frame_width as f64 * frame_height as f64;
        let bbox_area_ratio = if frame_area > 0.0 {
            area_pixels as f64 / frame_area
        } else {
            0.0
        };

        let center_x = (x1 as f64 + x2 as f64) / 2.0;
        let center_y = (y1 as f64 + y2 as f64) / 2.0;
        let center_x_norm = normalize(center_x, frame_width);
        let center_y_norm = normalize(center_y, frame_height);

        let region = PixelRegion::new(x1 as u32, y1 as u32, x2 as u32, y2 as u32);
        let color = self.colors.dominant_color(frame, &region);

        // Staging keeps whole seconds only
        let now = Utc::now().naive_utc();
        let ingestion_date = now.with_nanosecond(0).unwrap_or(now);

        Some(DetectionRecord {
            source_type: ctx.source_type,
            source_id: ctx.source_id.to_string(),
            frame_number: ctx.frame_number,
            class_id: raw.class_id,
            class_name: raw.class_name.clone(),
            confidence,
            x_min: x1 as i32,
            y_min: y1 as i32,
            x_max: x2 as i32,
            y_max: y2 as i32,
            width,
            height,
            area_pixels,
            frame_width,
            frame_height,
            bbox_area_ratio,
            center_x,
            center_y,
            center_x_norm,
            center_y_norm,
            position_region: PositionRegion::from_normalized(center_x_norm, center_y_norm),
            dominant_color_name: color.name,
            dom_r: color.r,
            dom_g: color.g,
            dom_b: color.b,
            timestamp_sec: ctx.timestamp_sec,
            ingestion_date,
            detection_id: Uuid::new_v4(),
        })
    }
}

fn ordered(a: f32, b: f32) -> (f32, f32) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

fn clamp_coord(value: f32, max: f32) -> f32 {
    if value.is_finite() {
        value.clamp(0.0, max)
    } else {
        0.0
    }
}

fn normalize(value: f64, extent: u32) -> f64 {
    if extent == 0 {
        0.0
    } else {
        (value / extent as f64).clamp(0.0, 1.0)
    }
}
