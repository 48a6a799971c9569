use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blobs::BlobHandle;

pub type SlideId = String;

/// `image_id` used for the parent slide's image when it occupies `[image 1]`.
pub const PARENT_IMAGE_ID: &str = "parent";

/// Key under which a slide's input images are recorded in `ai_json_prompt`.
pub const INPUT_IMAGES_KEY: &str = "_inputImages";

/// An image referenced from a prompt by its `[image N]` token.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    pub blob_url: String,
    #[serde(default)]
    pub base64: String,
    /// 1-based position, matches `[image N]` in the prompt text.
    pub order: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_id: Option<String>,
}

impl ImageRef {
    /// The parent slide's rendered image in the reserved `[image 1]` slot.
    pub fn parent(image_url: &str) -> Self {
        Self {
            blob_url: image_url.to_string(),
            base64: String::new(),
            order: 1,
            image_id: Some(PARENT_IMAGE_ID.to_string()),
        }
    }

    pub fn is_parent(&self) -> bool {
        self.image_id.as_deref() == Some(PARENT_IMAGE_ID)
    }

    pub fn blob_handle(&self) -> Option<BlobHandle> {
        BlobHandle::from_url(&self.blob_url)
    }
}

/// One version in a project's edit history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Slide {
    pub id: SlideId,
    pub image_url: String,
    pub path: String,
    pub prompt: String,
    pub is_original: bool,
    pub is_generating: bool,
    pub is_saved: bool,
    /// Set once `id` is a server-assigned id.
    #[serde(default)]
    pub is_persisted: bool,
    pub timestamp: String,
    pub parent_slide_id: Option<SlideId>,
    #[serde(default)]
    pub edit_images: Vec<ImageRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_json_prompt: Option<Value>,
}

impl Slide {
    /// A root slide for a project.
    pub fn original(
        id: impl Into<SlideId>,
        image_url: impl Into<String>,
        path: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            image_url: image_url.into(),
            path: path.into(),
            prompt: prompt.into(),
            is_original: true,
            is_generating: false,
            is_saved: false,
            is_persisted: false,
            timestamp: now_rfc3339(),
            parent_slide_id: None,
            edit_images: Vec::new(),
            ai_prompt: None,
            ai_json_prompt: None,
        }
    }

    pub(crate) fn provisional(parent_id: &str, prompt: String, edit_images: Vec<ImageRef>) -> Self {
        let ai_json_prompt = (!edit_images.is_empty())
            .then(|| serde_json::json!({ INPUT_IMAGES_KEY: &edit_images }));
        Self {
            id: format!("slide-{}", uuid::Uuid::new_v4()),
            image_url: String::new(),
            path: String::new(),
            prompt,
            is_original: false,
            is_generating: true,
            is_saved: false,
            is_persisted: false,
            timestamp: now_rfc3339(),
            parent_slide_id: Some(parent_id.to_string()),
            edit_images,
            ai_prompt: None,
            ai_json_prompt,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_slide_id.is_none()
    }

    /// Transient handles owned by this slide: its own image while still local,
    /// plus attached edit images. The parent slot belongs to the parent slide.
    pub fn owned_blobs(&self) -> Vec<BlobHandle> {
        BlobHandle::from_url(&self.image_url)
            .into_iter()
            .chain(
                self.edit_images
                    .iter()
                    .filter(|img| !img.is_parent())
                    .filter_map(ImageRef::blob_handle),
            )
            .collect()
    }
}

/// Authoritative outcome of a successful generation request.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationResult {
    #[serde(default)]
    pub image_url: String,
    #[serde(default)]
    pub path: String,
    #[serde(default, alias = "ai_prompt", skip_serializing_if = "Option::is_none")]
    pub ai_prompt: Option<String>,
    #[serde(default, alias = "ai_json_prompt", skip_serializing_if = "Option::is_none")]
    pub ai_json_prompt: Option<Value>,
}

/// Record the input image list inside the structured prompt, keeping any
/// fields the service returned.
pub fn with_input_images(ai_json_prompt: Option<Value>, inputs: &[ImageRef]) -> Option<Value> {
    if inputs.is_empty() {
        return ai_json_prompt;
    }
    let mut object = match ai_json_prompt {
        Some(Value::Object(map)) => map,
        Some(other) => {
            let mut map = serde_json::Map::new();
            map.insert("prompt".to_string(), other);
            map
        }
        None => serde_json::Map::new(),
    };
    object.insert(
        INPUT_IMAGES_KEY.to_string(),
        serde_json::to_value(inputs).unwrap_or(Value::Null),
    );
    Some(Value::Object(object))
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn attachment(order: u32, url: &str) -> ImageRef {
        ImageRef {
            blob_url: url.into(),
            base64: "AA".into(),
            order,
            image_id: Some(format!("img_{order}")),
        }
    }

    #[test]
    fn provisional_slide_is_generating_and_unsaved() {
        let slide = Slide::provisional("root", "make it blue".into(), vec![]);
        assert!(slide.id.starts_with("slide-"));
        assert!(slide.is_generating);
        assert!(!slide.is_saved);
        assert_eq!(slide.parent_slide_id.as_deref(), Some("root"));
        assert!(slide.ai_json_prompt.is_none());
    }

    #[test]
    fn owned_blobs_skip_parent_slot() {
        let slide = Slide::provisional(
            "root",
            "x".into(),
            vec![ImageRef::parent("blob:parent"), attachment(2, "blob:mine"), attachment(3, "https://cdn/a.png")],
        );
        let owned = slide.owned_blobs();
        assert_eq!(owned.len(), 1);
        assert_eq!(owned[0].as_str(), "blob:mine");
    }

    #[test]
    fn serializes_camel_case() {
        let slide = Slide::original("s1", "https://cdn/x.png", "u/x.png", "a cat");
        let value = serde_json::to_value(&slide).unwrap();
        assert_eq!(value["imageUrl"], "https://cdn/x.png");
        assert_eq!(value["isOriginal"], true);
        assert_eq!(value["parentSlideId"], serde_json::Value::Null);
    }

    #[test]
    fn generation_result_accepts_snake_case_fields() {
        let result: GenerationResult = serde_json::from_value(json!({
            "imageUrl": "https://cdn/y.png",
            "path": "u/y.png",
            "ai_prompt": "a blue cat",
            "ai_json_prompt": {"subject": "cat"}
        }))
        .unwrap();
        assert_eq!(result.ai_prompt.as_deref(), Some("a blue cat"));
        assert_eq!(result.ai_json_prompt, Some(json!({"subject": "cat"})));
    }

    #[test]
    fn input_images_merge_into_structured_prompt() {
        let merged = with_input_images(Some(json!({"subject": "cat"})), &[ImageRef::parent("https://p")]).unwrap();
        assert_eq!(merged["subject"], "cat");
        assert_eq!(merged[INPUT_IMAGES_KEY][0]["order"], 1);

        let wrapped = with_input_images(Some(json!("plain")), &[ImageRef::parent("https://p")]).unwrap();
        assert_eq!(wrapped["prompt"], "plain");

        assert_eq!(with_input_images(None, &[]), None);
    }
}
