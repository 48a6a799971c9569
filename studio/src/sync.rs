//! Reconcile optimistic in-memory slides with their durable backend records.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::backend::{
    CreateSlideRequest, PatchMetadata, ReferenceImage, SaveMetadata, SaveSlideRequest,
    ServiceError, SlideBackend,
};
use crate::blobs::BlobRegistry;
use crate::compose::{has_image_token, image_token};
use crate::slide::{ImageRef, SlideId};
use crate::tree::{SharedTree, TreeError};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error("root slide {0} is stored with its project")]
    Root(SlideId),
    #[error("slide {0} is still generating")]
    Generating(SlideId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied,
    /// The slide has no server id yet, or there was nothing to patch.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved(String),
    /// Originals and slides without a rendered image are never kept.
    Skipped,
}

/// Persistence for one project's slides.
#[derive(Clone)]
pub struct PersistenceSync {
    backend: Arc<dyn SlideBackend>,
    tree: SharedTree,
    blobs: Arc<BlobRegistry>,
    project_id: String,
    /// Client ids whose create request is in flight.
    persisting: Arc<Mutex<HashSet<SlideId>>>,
    persisted: Arc<Notify>,
}

impl PersistenceSync {
    pub fn new(
        backend: Arc<dyn SlideBackend>,
        tree: SharedTree,
        blobs: Arc<BlobRegistry>,
        project_id: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            tree,
            blobs,
            project_id: project_id.into(),
            persisting: Arc::new(Mutex::new(HashSet::new())),
            persisted: Arc::new(Notify::new()),
        }
    }

    /// Store a finalized slide and swap its client id for the server id.
    ///
    /// On failure the slide stays in the tree, finalized but unsaved. There is
    /// no retry.
    pub async fn persist(&self, slide_id: &str) -> Result<SlideId, PersistError> {
        // A child waits for its parent's server id so the stored link is never
        // a client id.
        let request = loop {
            let parent_stored = self.persisted.notified();
            match self.prepare_create(slide_id)? {
                Some(request) => break request,
                None => parent_stored.await,
            }
        };

        let created = self.backend.create_slide(request).await;
        let result = self.complete_create(slide_id, created);
        self.persisting.lock().unwrap().remove(slide_id);
        self.persisted.notify_waiters();
        result
    }

    /// Build the create request and mark the slide as persisting. `None` while
    /// the parent's own create request is still in flight.
    fn prepare_create(&self, slide_id: &str) -> Result<Option<CreateSlideRequest>, PersistError> {
        let tree = self.tree.lock().unwrap();
        let slide = tree
            .get(slide_id)
            .ok_or_else(|| TreeError::UnknownSlide(slide_id.to_string()))?;
        if slide.is_root() {
            return Err(PersistError::Root(slide_id.to_string()));
        }
        if slide.is_generating {
            return Err(PersistError::Generating(slide_id.to_string()));
        }

        let mut persisting = self.persisting.lock().unwrap();
        if let Some(parent) = &slide.parent_slide_id
            && persisting.contains(parent)
        {
            tracing::debug!("slide {slide_id} waits for parent {parent} to be stored");
            return Ok(None);
        }
        persisting.insert(slide_id.to_string());

        Ok(Some(CreateSlideRequest {
            project_id: self.project_id.clone(),
            parent_slide_id: slide.parent_slide_id.clone(),
            image_url: slide.image_url.clone(),
            image_path: slide.path.clone(),
            prompt: slide.prompt.clone(),
            ai_prompt: slide.ai_prompt.clone(),
            ai_json_prompt: slide.ai_json_prompt.clone(),
            is_original: false,
        }))
    }

    fn complete_create(
        &self,
        slide_id: &str,
        created: Result<String, ServiceError>,
    ) -> Result<SlideId, PersistError> {
        let server_id = match created {
            Ok(id) => id,
            Err(e) => {
                tracing::warn!("failed to persist slide {slide_id}: {e}");
                if let Some(slide) = self.tree.lock().unwrap().get_mut(slide_id) {
                    slide.is_saved = false;
                }
                return Err(e.into());
            }
        };

        let handed_off = {
            let mut tree = self.tree.lock().unwrap();
            let repointed = tree.replace_id(slide_id, &server_id)?;
            tracing::debug!("slide {slide_id} -> {server_id}, {repointed} children re-pointed");
            match tree.get_mut(&server_id) {
                Some(slide) => {
                    slide.is_saved = true;
                    slide.is_persisted = true;
                    slide.owned_blobs()
                }
                None => Vec::new(),
            }
        };
        self.blobs.release_all(&handed_off);

        tracing::info!("persisted slide {server_id} in project {}", self.project_id);
        Ok(server_id)
    }

    /// Update metadata of an already persisted slide. Slides that still carry
    /// a client id are skipped, not errored.
    pub async fn patch_metadata(
        &self,
        slide_id: &str,
        patch: PatchMetadata,
    ) -> Result<PatchOutcome, PersistError> {
        {
            let tree = self.tree.lock().unwrap();
            let slide = tree
                .get(slide_id)
                .ok_or_else(|| TreeError::UnknownSlide(slide_id.to_string()))?;
            if !slide.is_persisted {
                tracing::debug!("skipping metadata patch for unpersisted slide {slide_id}");
                return Ok(PatchOutcome::Skipped);
            }
        }
        if patch.is_empty() {
            return Ok(PatchOutcome::Skipped);
        }

        self.backend
            .patch_slide(&self.project_id, slide_id, patch.clone())
            .await?;

        if let Some(slide) = self.tree.lock().unwrap().get_mut(slide_id) {
            if patch.ai_prompt.is_some() {
                slide.ai_prompt = patch.ai_prompt;
            }
            if patch.ai_json_prompt.is_some() {
                slide.ai_json_prompt = patch.ai_json_prompt;
            }
        }
        Ok(PatchOutcome::Applied)
    }

    /// Keep a generated slide as a user artifact.
    ///
    /// The stored prompt names every referenced image: the parent becomes
    /// `[image 1]` and edit images follow in order. `latest` fills metadata
    /// the slide itself does not carry.
    pub async fn save_slide(
        &self,
        slide_id: &str,
        latest: Option<PatchMetadata>,
    ) -> Result<SaveOutcome, PersistError> {
        let request = {
            let tree = self.tree.lock().unwrap();
            let slide = tree
                .get(slide_id)
                .ok_or_else(|| TreeError::UnknownSlide(slide_id.to_string()))?;
            if slide.is_original || slide.is_generating || slide.image_url.is_empty() {
                return Ok(SaveOutcome::Skipped);
            }

            let mut prompt = slide.prompt.clone();
            let mut reference_images = Vec::new();

            if let Some(parent) = slide.parent_slide_id.as_deref().and_then(|p| tree.get(p))
                && !parent.image_url.is_empty()
            {
                if !has_image_token(&prompt) {
                    prompt = format!("{}\n\n{prompt}", image_token(1));
                }
                reference_images.push(ReferenceImage {
                    image: ImageRef::parent(&parent.image_url),
                    path: Some(parent.path.clone()),
                });
            }

            for img in slide.edit_images.iter().filter(|img| !img.is_parent()) {
                let order = reference_images.len() as u32 + 1;
                let token = image_token(order);
                if !prompt.contains(&token) {
                    prompt.push('\n');
                    prompt.push_str(&token);
                }
                reference_images.push(ReferenceImage {
                    image: ImageRef {
                        order,
                        ..img.clone()
                    },
                    path: None,
                });
            }

            let latest = latest.unwrap_or_default();
            SaveSlideRequest {
                image_url: slide.image_url.clone(),
                prompt,
                ai_prompt: slide.ai_prompt.clone().or(latest.ai_prompt),
                ai_json_prompt: slide.ai_json_prompt.clone().or(latest.ai_json_prompt),
                metadata: Some(SaveMetadata {
                    reference_images,
                    project_id: Some(self.project_id.clone()),
                    slide_id: Some(slide.id.clone()),
                }),
            }
        };

        let saved_id = self.backend.save_slide(request).await.inspect_err(|e| {
            tracing::warn!("failed to save slide {slide_id}: {e}");
        })?;

        if let Some(slide) = self.tree.lock().unwrap().get_mut(slide_id) {
            slide.is_saved = true;
        }
        Ok(SaveOutcome::Saved(saved_id))
    }
}
