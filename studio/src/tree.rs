use std::sync::{Arc, Mutex};

use crate::slide::{GenerationResult, ImageRef, Slide, SlideId};

/// Tree handle shared between the coordinator, its request tasks and sync.
/// Lock it only for a single mutation or read; never hold it across `.await`.
pub type SharedTree = Arc<Mutex<SlideTree>>;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TreeError {
    #[error("project already has a root slide")]
    RootExists,
    #[error("project has no root slide yet")]
    NoRoot,
    #[error("the root slide cannot be removed")]
    RootRemoval,
    #[error("unknown slide: {0}")]
    UnknownSlide(SlideId),
    #[error("slide id already in use: {0}")]
    DuplicateId(SlideId),
    #[error("index {index} out of bounds for {len} slides")]
    OutOfBounds { index: usize, len: usize },
}

/// Ordered slide arena for one project plus the active-slide pointer.
/// Parent links are ids, resolved by lookup.
#[derive(Clone, Debug, Default)]
pub struct SlideTree {
    slides: Vec<Slide>,
    active: usize,
}

impl SlideTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedTree {
        Arc::new(Mutex::new(self))
    }

    /// Rebuild a tree from slides loaded from the backend, in stored order.
    pub fn from_slides(slides: Vec<Slide>) -> Result<Self, TreeError> {
        let roots = slides.iter().filter(|s| s.is_root()).count();
        match roots {
            0 if !slides.is_empty() => return Err(TreeError::NoRoot),
            n if n > 1 => return Err(TreeError::RootExists),
            _ => {}
        }
        for slide in &slides {
            if let Some(parent) = &slide.parent_slide_id
                && !slides.iter().any(|s| &s.id == parent)
            {
                return Err(TreeError::UnknownSlide(parent.clone()));
            }
        }
        Ok(Self { slides, active: 0 })
    }

    /// Install the project's original slide. Allowed once.
    pub fn create_root(&mut self, mut slide: Slide) -> Result<SlideId, TreeError> {
        if self.root().is_some() {
            return Err(TreeError::RootExists);
        }
        if self.index_of(&slide.id).is_some() {
            return Err(TreeError::DuplicateId(slide.id));
        }
        slide.parent_slide_id = None;
        slide.is_original = true;
        slide.is_generating = false;
        let id = slide.id.clone();
        self.slides.push(slide);
        self.active = self.slides.len() - 1;
        tracing::debug!("root slide {id} created");
        Ok(id)
    }

    /// Append a generating child of `parent_id` and make it active.
    pub fn append_provisional(
        &mut self,
        parent_id: &str,
        prompt: String,
        input_images: Vec<ImageRef>,
    ) -> Result<SlideId, TreeError> {
        if self.root().is_none() {
            return Err(TreeError::NoRoot);
        }
        if self.index_of(parent_id).is_none() {
            return Err(TreeError::UnknownSlide(parent_id.to_string()));
        }
        let slide = Slide::provisional(parent_id, prompt, input_images);
        let id = slide.id.clone();
        self.slides.push(slide);
        self.active = self.slides.len() - 1;
        tracing::debug!("provisional slide {id} appended under {parent_id}");
        Ok(id)
    }

    /// Apply a successful result to the slide with `slide_id`, wherever the
    /// active pointer currently is.
    pub fn finalize(&mut self, slide_id: &str, result: GenerationResult) -> Result<(), TreeError> {
        let slide = self
            .get_mut(slide_id)
            .ok_or_else(|| TreeError::UnknownSlide(slide_id.to_string()))?;
        slide.image_url = result.image_url;
        slide.path = result.path;
        slide.ai_prompt = result.ai_prompt;
        slide.ai_json_prompt = result.ai_json_prompt;
        slide.is_generating = false;
        Ok(())
    }

    /// Remove a non-root slide. The active pointer steps back by one.
    pub fn remove(&mut self, slide_id: &str) -> Result<Slide, TreeError> {
        let idx = self
            .index_of(slide_id)
            .ok_or_else(|| TreeError::UnknownSlide(slide_id.to_string()))?;
        if self.slides[idx].is_root() {
            return Err(TreeError::RootRemoval);
        }
        let removed = self.slides.remove(idx);
        self.active = self
            .active
            .saturating_sub(1)
            .min(self.slides.len().saturating_sub(1));
        tracing::debug!("slide {slide_id} removed, active index {}", self.active);
        Ok(removed)
    }

    pub fn navigate(&mut self, index: usize) -> Result<(), TreeError> {
        if index >= self.slides.len() {
            return Err(TreeError::OutOfBounds {
                index,
                len: self.slides.len(),
            });
        }
        self.active = index;
        Ok(())
    }

    /// Swap a client id for a server id, including every child's parent link.
    /// Returns how many children were re-pointed.
    pub fn replace_id(&mut self, old_id: &str, new_id: &str) -> Result<usize, TreeError> {
        if old_id == new_id {
            return Ok(0);
        }
        if self.index_of(new_id).is_some() {
            return Err(TreeError::DuplicateId(new_id.to_string()));
        }
        let slide = self
            .get_mut(old_id)
            .ok_or_else(|| TreeError::UnknownSlide(old_id.to_string()))?;
        slide.id = new_id.to_string();

        let mut repointed = 0;
        for child in &mut self.slides {
            if child.parent_slide_id.as_deref() == Some(old_id) {
                child.parent_slide_id = Some(new_id.to_string());
                repointed += 1;
            }
        }
        Ok(repointed)
    }

    pub fn root(&self) -> Option<&Slide> {
        self.slides.iter().find(|s| s.is_root())
    }

    pub fn active(&self) -> Option<&Slide> {
        self.slides.get(self.active)
    }

    pub fn active_index(&self) -> usize {
        self.active
    }

    pub fn get(&self, slide_id: &str) -> Option<&Slide> {
        self.slides.iter().find(|s| s.id == slide_id)
    }

    pub fn get_mut(&mut self, slide_id: &str) -> Option<&mut Slide> {
        self.slides.iter_mut().find(|s| s.id == slide_id)
    }

    pub fn index_of(&self, slide_id: &str) -> Option<usize> {
        self.slides.iter().position(|s| s.id == slide_id)
    }

    pub fn slides(&self) -> &[Slide] {
        &self.slides
    }

    pub fn children(&self, slide_id: &str) -> Vec<&Slide> {
        self.slides
            .iter()
            .filter(|s| s.parent_slide_id.as_deref() == Some(slide_id))
            .collect()
    }

    /// Path from the root down to `slide_id`, inclusive.
    pub fn lineage(&self, slide_id: &str) -> Vec<&Slide> {
        let mut path = Vec::new();
        let mut cursor = self.get(slide_id);
        while let Some(slide) = cursor {
            path.push(slide);
            // A malformed parent cycle would otherwise loop forever.
            if path.len() > self.slides.len() {
                break;
            }
            cursor = slide.parent_slide_id.as_deref().and_then(|p| self.get(p));
        }
        path.reverse();
        path
    }

    pub fn generating_count(&self) -> usize {
        self.slides.iter().filter(|s| s.is_generating).count()
    }

    pub fn len(&self) -> usize {
        self.slides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slides.is_empty()
    }
}
