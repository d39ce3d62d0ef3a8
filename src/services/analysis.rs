use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::models::AnalyzedGifticon;

/// Request size cap, checked before upload (pre-decode on the backend too).
pub const MAX_IMAGE_BYTES: usize = 5 * 1024 * 1024;

const SUPPORTED_MIME_TYPES: [&str; 3] = ["image/jpeg", "image/png", "image/webp"];

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("unsupported image format: {0} (JPEG, PNG and WebP only)")]
    UnsupportedFormat(String),
    #[error("image too large: {0} bytes (limit {MAX_IMAGE_BYTES})")]
    TooLarge(usize),
    #[error("analysis backend error: {0}")]
    Backend(String),
    #[error("analysis backend returned no data")]
    EmptyResponse,
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeImageRequest {
    image_base64: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<String>,
}

#[derive(Deserialize)]
struct AnalyzeImageResponse {
    success: bool,
    data: Option<AnalyzedGifticon>,
    error: Option<String>,
    confidence: Option<f64>,
}

#[derive(Deserialize)]
struct HealthResponse {
    success: bool,
}

#[derive(Debug, Clone)]
pub struct AnalysisResult {
    pub gifticon: AnalyzedGifticon,
    pub confidence: Option<f64>,
}

/// Client for the stateless cloud image-analysis endpoint. Input validation
/// errors are raised before anything goes on the wire; no automatic retries
/// at this layer.
pub struct AnalysisClient {
    base_url: String,
    client: reqwest::Client,
}

impl AnalysisClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        AnalysisClient {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }

    pub async fn analyze_image(
        &self,
        bytes: &[u8],
        mime_type: Option<&str>,
    ) -> Result<AnalysisResult, AnalysisError> {
        validate_upload(bytes, mime_type)?;

        let request = AnalyzeImageRequest {
            image_base64: base64::engine::general_purpose::STANDARD.encode(bytes),
            mime_type: mime_type.map(str::to_string),
        };

        let response = self
            .client
            .post(format!("{}/api/analyze", self.base_url))
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        debug!("analysis backend answered {status}");

        // error statuses still carry a structured body
        let body: AnalyzeImageResponse = response.json().await?;
        if !body.success {
            let message = body
                .error
                .unwrap_or_else(|| format!("request failed with status {status}"));
            return Err(AnalysisError::Backend(message));
        }

        let gifticon = body.data.ok_or(AnalysisError::EmptyResponse)?;
        Ok(AnalysisResult {
            gifticon,
            confidence: body.confidence,
        })
    }

    /// `true` iff the backend is reachable and reports healthy; any
    /// transport failure is simply `false`.
    pub async fn check_health(&self) -> bool {
        let response = match self
            .client
            .get(format!("{}/api/health", self.base_url))
            .send()
            .await
        {
            Ok(response) => response,
            Err(_) => return false,
        };
        match response.json::<HealthResponse>().await {
            Ok(body) => body.success,
            Err(_) => false,
        }
    }
}

fn validate_upload(bytes: &[u8], mime_type: Option<&str>) -> Result<(), AnalysisError> {
    if let Some(mime) = mime_type {
        if !SUPPORTED_MIME_TYPES.contains(&mime.to_ascii_lowercase().as_str()) {
            return Err(AnalysisError::UnsupportedFormat(mime.to_string()));
        }
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(AnalysisError::TooLarge(bytes.len()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_mime_types() {
        let err = validate_upload(b"x", Some("image/gif")).unwrap_err();
        assert!(matches!(err, AnalysisError::UnsupportedFormat(_)));
        // absent MIME type is allowed through, the backend sniffs it
        assert!(validate_upload(b"x", None).is_ok());
    }

    #[test]
    fn accepts_the_supported_formats() {
        for mime in ["image/jpeg", "image/png", "image/webp", "IMAGE/PNG"] {
            assert!(validate_upload(b"x", Some(mime)).is_ok(), "{mime}");
        }
    }

    #[test]
    fn rejects_oversized_uploads() {
        let oversized = vec![0u8; MAX_IMAGE_BYTES + 1];
        let err = validate_upload(&oversized, Some("image/jpeg")).unwrap_err();
        assert!(matches!(err, AnalysisError::TooLarge(_)));
        let at_limit = vec![0u8; MAX_IMAGE_BYTES];
        assert!(validate_upload(&at_limit, Some("image/jpeg")).is_ok());
    }

    #[tokio::test]
    async fn validation_fires_before_any_network_io() {
        // unroutable base URL: an error here proves nothing was sent
        let client = AnalysisClient::new("http://invalid.localhost:1");
        let err = client
            .analyze_image(b"x", Some("application/pdf"))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::UnsupportedFormat(_)));
    }

    #[test]
    fn request_uses_the_external_field_names() {
        let request = AnalyzeImageRequest {
            image_base64: "QUJD".to_string(),
            mime_type: Some("image/png".to_string()),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["imageBase64"], "QUJD");
        assert_eq!(json["mimeType"], "image/png");
    }

    #[test]
    fn response_parsing_covers_success_and_error() {
        let success: AnalyzeImageResponse = serde_json::from_str(
            r#"{"success":true,"data":{"brandName":"기프티콘","expiryDate":"2025-12-31",
                "productName":null,"barcodeNumber":null,"category":"ETC","purchaseDate":null},
               "confidence":0.85}"#,
        )
        .unwrap();
        assert!(success.success);
        let data = success.data.unwrap();
        assert_eq!(data.brand_name, "기프티콘");
        assert_eq!(data.amount, 0);
        assert_eq!(success.confidence, Some(0.85));

        let failure: AnalyzeImageResponse = serde_json::from_str(
            r#"{"success":false,"error":"이미지 분석에 실패했습니다.","timestamp":"2025-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert!(!failure.success);
        assert!(failure.error.is_some());
    }
}
