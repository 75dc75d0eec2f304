//! Object detector interface and the HTTP inference client.
//!
//! The detection model itself runs outside this service. [`Detector`] is the
//! seam the pipeline depends on; [`InferenceClient`] is the production
//! implementation, which posts JPEG-encoded frames to an inference endpoint.

use crate::frame::Frame;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors that can occur while detecting objects in a single frame
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Failed to decode frame: {0}")]
    Decode(String),

    #[error("Failed to encode frame for inference: {0}")]
    Encode(String),

    #[error("Inference request failed: {0}")]
    Transport(String),

    #[error("Inference service returned status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("Invalid inference response: {0}")]
    InvalidResponse(String),
}

/// One object reported by the detector, in frame pixel coordinates.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub class_id: i32,
    pub class_name: String,
    pub confidence: f32,
    pub x_min: f32,
    pub y_min: f32,
    pub x_max: f32,
    pub y_max: f32,
}

/// Detects objects in a frame.
#[async_trait]
pub trait Detector: Send + Sync {
    async fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>, DetectionError>;
}

/// Detection as returned by the inference endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireDetection {
    pub class_id: i32,
    pub class_name: String,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]` in pixels
    pub bbox: [f32; 4],
}

impl From<WireDetection> for RawDetection {
    fn from(d: WireDetection) -> Self {
        Self {
            class_id: d.class_id,
            class_name: d.class_name,
            confidence: d.confidence,
            x_min: d.bbox[0],
            y_min: d.bbox[1],
            x_max: d.bbox[2],
            y_max: d.bbox[3],
        }
    }
}

/// Inference endpoint response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceResponse {
    #[serde(default)]
    pub detections: Vec<WireDetection>,
}

/// HTTP client for an external inference service.
///
/// Each call posts one `image/jpeg` body and expects an [`InferenceResponse`].
/// The blocking HTTP call runs on the blocking thread pool.
pub struct InferenceClient {
    endpoint: String,
    agent: ureq::Agent,
    jpeg_quality: u8,
}

impl InferenceClient {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration, jpeg_quality: u8) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(request_timeout).build();

        Self {
            endpoint: endpoint.into(),
            agent,
            jpeg_quality,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn post_frame(
        agent: &ureq::Agent,
        endpoint: &str,
        body: &[u8],
    ) -> Result<InferenceResponse, DetectionError> {
        let response = agent
            .post(endpoint)
            .set("Content-Type", "image/jpeg")
            .send_bytes(body);

        match response {
            Ok(response) => response
                .into_json::<InferenceResponse>()
                .map_err(|e| DetectionError::InvalidResponse(e.to_string())),
            Err(ureq::Error::Status(status, response)) => {
                let message = response
                    .into_string()
                    .unwrap_or_else(|_| "<unreadable body>".to_string());
                Err(DetectionError::Status { status, message })
            }
            Err(e) => Err(DetectionError::Transport(e.to_string())),
        }
    }
}

#[async_trait]
impl Detector for InferenceClient {
    #[instrument(skip(self, frame), fields(width = frame.width(), height = frame.height()))]
    async fn detect(&self, frame: &Frame) -> Result<Vec<RawDetection>, DetectionError> {
        let frame = frame.clone();
        let agent = self.agent.clone();
        let endpoint = self.endpoint.clone();
        let quality = self.jpeg_quality;

        let response = tokio::task::spawn_blocking(move || {
            let body = frame
                .to_jpeg(quality)
                .map_err(|e| DetectionError::Encode(e.to_string()))?;
            Self::post_frame(&agent, &endpoint, &body)
        })
        .await
        .map_err(|e| DetectionError::Transport(format!("inference task failed: {}", e)))??;

        debug!(count = response.detections.len(), "Inference completed");

        Ok(response
            .detections
            .into_iter()
            .map(RawDetection::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_inference_response() {
        let json = r#"{
            "detections": [
                {"class_id": 0, "class_name": "person", "confidence": 0.91, "bbox": [10.0, 20.0, 110.0, 220.0]},
                {"class_id": 2, "class_name": "car", "confidence": 0.55, "bbox": [0, 0, 5, 5]}
            ]
        }"#;

        let response: InferenceResponse = serde_json::from_str(json).unwrap();
        let detections: Vec<RawDetection> =
            response.detections.into_iter().map(RawDetection::from).collect();

        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].class_name, "person");
        assert_eq!(detections[0].x_max, 110.0);
        assert_eq!(detections[0].y_max, 220.0);
        assert_eq!(detections[1].class_id, 2);
    }

    #[test]
    fn test_empty_response_has_no_detections() {
        let response: InferenceResponse = serde_json::from_str("{}").unwrap();
        assert!(response.detections.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_detection_failure() {
        let client = InferenceClient::new("http://127.0.0.1:9/detect", Duration::from_millis(200), 80);
        let frame = Frame::solid(4, 4, [0, 0, 0]);

        let err = client.detect(&frame).await.unwrap_err();
        assert!(matches!(err, DetectionError::Transport(_)));
    }
}
