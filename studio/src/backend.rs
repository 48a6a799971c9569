//! Service boundaries: image generation/editing and slide storage.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::slide::{GenerationResult, ImageRef};

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("request aborted")]
    Aborted,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("service rejected request: {0}")]
    Rejected(String),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ServiceError {
    /// Abort-class failures are treated exactly like a user cancellation.
    pub fn is_abort(&self) -> bool {
        matches!(self, ServiceError::Aborted)
    }
}

/// Edit an existing image. Exactly one of the source fields is normally set:
/// remote images go by URL, local ones as a data URL.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_image_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub images: Option<Vec<String>>,
}

/// Generate an image from text alone.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSlideRequest {
    pub project_id: String,
    pub parent_slide_id: Option<String>,
    pub image_url: String,
    pub image_path: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_json_prompt: Option<Value>,
    pub is_original: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_json_prompt: Option<Value>,
}

impl PatchMetadata {
    pub fn is_empty(&self) -> bool {
        self.ai_prompt.is_none() && self.ai_json_prompt.is_none()
    }
}

/// Reference image recorded alongside a kept slide.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceImage {
    #[serde(flatten)]
    pub image: ImageRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveMetadata {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference_images: Vec<ReferenceImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slide_id: Option<String>,
}

/// Keep a slide as a user artifact.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveSlideRequest {
    pub image_url: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_json_prompt: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<SaveMetadata>,
}

#[async_trait::async_trait]
pub trait ImageService: Send + Sync + 'static {
    async fn edit(&self, request: EditRequest) -> Result<GenerationResult, ServiceError>;
    async fn generate(&self, request: GenerateRequest) -> Result<GenerationResult, ServiceError>;
}

#[async_trait::async_trait]
pub trait SlideBackend: Send + Sync + 'static {
    /// Store a slide; returns the server-assigned id.
    async fn create_slide(&self, request: CreateSlideRequest) -> Result<String, ServiceError>;
    async fn patch_slide(
        &self,
        project_id: &str,
        slide_id: &str,
        patch: PatchMetadata,
    ) -> Result<(), ServiceError>;
    /// Keep a slide as a user artifact; returns the saved record's id.
    async fn save_slide(&self, request: SaveSlideRequest) -> Result<String, ServiceError>;
}

/// Wire shape of a generation response.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerationResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(flatten)]
    result: GenerationResult,
}

impl GenerationResponse {
    fn into_result(self) -> Result<GenerationResult, ServiceError> {
        if !self.success || self.result.image_url.is_empty() {
            return Err(ServiceError::Rejected(
                self.error.unwrap_or_else(|| "no image returned".to_string()),
            ));
        }
        Ok(self.result)
    }
}

/// JSON-over-HTTP implementation of both service traits.
pub struct HttpBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.bearer_auth(key),
            None => req,
        }
    }

    async fn send_json(&self, req: reqwest::RequestBuilder) -> Result<Value, ServiceError> {
        let resp = self.authorize(req).send().await?;
        let status = resp.status();
        let body: Value = resp.json().await.unwrap_or(Value::Null);

        if !status.is_success() {
            let err = body["error"]
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| format!("HTTP {status}"));
            return Err(ServiceError::Rejected(err));
        }
        Ok(body)
    }
}

#[async_trait::async_trait]
impl ImageService for HttpBackend {
    async fn edit(&self, request: EditRequest) -> Result<GenerationResult, ServiceError> {
        let body = self
            .send_json(self.client.post(self.url("edit-image")).json(&request))
            .await?;
        serde_json::from_value::<GenerationResponse>(body)?.into_result()
    }

    async fn generate(&self, request: GenerateRequest) -> Result<GenerationResult, ServiceError> {
        let body = self
            .send_json(self.client.post(self.url("generate-image")).json(&request))
            .await?;
        serde_json::from_value::<GenerationResponse>(body)?.into_result()
    }
}

#[async_trait::async_trait]
impl SlideBackend for HttpBackend {
    async fn create_slide(&self, request: CreateSlideRequest) -> Result<String, ServiceError> {
        let path = format!("projects/{}/slides", request.project_id);
        let body = self
            .send_json(self.client.post(self.url(&path)).json(&request))
            .await?;
        body["slide"]["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ServiceError::Rejected("response carried no slide id".to_string()))
    }

    async fn patch_slide(
        &self,
        project_id: &str,
        slide_id: &str,
        patch: PatchMetadata,
    ) -> Result<(), ServiceError> {
        let path = format!("projects/{project_id}/slides/{slide_id}");
        self.send_json(self.client.patch(self.url(&path)).json(&patch))
            .await?;
        Ok(())
    }

    async fn save_slide(&self, request: SaveSlideRequest) -> Result<String, ServiceError> {
        let body = self
            .send_json(self.client.post(self.url("save-image")).json(&request))
            .await?;
        Ok(body["savedId"]
            .as_str()
            .or(body["id"].as_str())
            .unwrap_or_default()
            .to_string())
    }
}
