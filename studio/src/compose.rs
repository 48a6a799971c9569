//! Prompt composition: an ordered run list of text and embedded images,
//! projected to a flat `[image N]` token string on demand.

use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::blobs::{BlobHandle, BlobRegistry};
use crate::normalize::{normalize, parse_structured};
use crate::slide::ImageRef;

pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
pub const ALLOWED_IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/gif"];

static IMAGE_TOKEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\[image (\d+)\]").unwrap());

#[derive(Debug, thiserror::Error)]
pub enum ComposeError {
    #[error("unsupported image type: {0}")]
    UnsupportedType(String),
    #[error("image is {size} bytes, limit is {max}")]
    TooLarge { size: usize, max: usize },
    #[error("no image with id {0} in the prompt")]
    UnknownImage(String),
}

/// A local file the user wants to embed in the prompt.
#[derive(Clone, Debug)]
pub struct ImageAttachment {
    pub bytes: Vec<u8>,
    pub mime: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImageRun {
    pub image_id: String,
    pub blob_url: String,
    pub base64: String,
}

#[derive(Clone, Debug, PartialEq)]
pub enum Run {
    Text(String),
    Image(ImageRun),
}

impl Run {
    /// Cursor units: one per char for text, one for an image.
    fn units(&self) -> usize {
        match self {
            Run::Text(s) => s.chars().count(),
            Run::Image(_) => 1,
        }
    }
}

/// Flattened prompt: text with `[image N]` tokens plus the referenced images.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ComposedPrompt {
    pub text: String,
    pub images: Vec<ImageRef>,
}

impl ComposedPrompt {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.images.is_empty()
    }
}

/// A node of a rendered prompt.
#[derive(Clone, Debug, PartialEq)]
pub enum DisplayNode {
    Text(String),
    Image(ImageRef),
    Structured(Value),
}

/// Editable prompt. Owns the transient blobs of its image runs until they are
/// handed off through [`Composer::take_submission`]; anything still held when
/// a run is deleted or the composer is dropped is released.
pub struct Composer {
    runs: Vec<Run>,
    blobs: Arc<BlobRegistry>,
    first_order: u32,
}

impl Composer {
    /// Composer for a fresh prompt: images are numbered from `[image 1]`.
    pub fn new(blobs: Arc<BlobRegistry>) -> Self {
        Self {
            runs: Vec::new(),
            blobs,
            first_order: 1,
        }
    }

    /// Composer for an edit of an existing slide. The parent image takes
    /// `[image 1]`, so attached images start at `[image 2]`.
    pub fn for_edit(blobs: Arc<BlobRegistry>) -> Self {
        Self {
            runs: Vec::new(),
            blobs,
            first_order: 2,
        }
    }

    /// Open an existing run list for editing.
    ///
    /// Live blobs are copied under fresh handles, so the composer never
    /// releases a handle that a slide still owns.
    pub fn from_runs(blobs: Arc<BlobRegistry>, runs: Vec<Run>, edit: bool) -> Self {
        let runs = runs
            .into_iter()
            .map(|run| match run {
                Run::Image(mut img) => {
                    if let Some(copy) =
                        BlobHandle::from_url(&img.blob_url).and_then(|h| blobs.duplicate(&h))
                    {
                        img.blob_url = copy.as_str().to_string();
                    }
                    Run::Image(img)
                }
                text => text,
            })
            .collect();
        let mut composer = if edit {
            Self::for_edit(blobs)
        } else {
            Self::new(blobs)
        };
        composer.runs = runs;
        composer.merge_text();
        composer
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    /// Total cursor units.
    pub fn len(&self) -> usize {
        self.runs.iter().map(Run::units).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    pub fn image_ids(&self) -> Vec<&str> {
        self.runs
            .iter()
            .filter_map(|r| match r {
                Run::Image(img) => Some(img.image_id.as_str()),
                Run::Text(_) => None,
            })
            .collect()
    }

    /// Insert text at `pos`, returning the cursor after it.
    pub fn insert_text(&mut self, pos: usize, text: &str) -> usize {
        let pos = pos.min(self.len());
        if text.is_empty() {
            return pos;
        }
        let idx = self.split_at(pos);
        self.runs.insert(idx, Run::Text(text.to_string()));
        self.merge_text();
        pos + text.chars().count()
    }

    /// Embed an image at `pos`, splitting the text run under the cursor.
    /// Returns the new image id and the cursor after the image.
    pub fn insert_image(
        &mut self,
        pos: usize,
        attachment: ImageAttachment,
    ) -> Result<(String, usize), ComposeError> {
        if !ALLOWED_IMAGE_TYPES.contains(&attachment.mime.as_str()) {
            return Err(ComposeError::UnsupportedType(attachment.mime));
        }
        if attachment.bytes.len() > MAX_IMAGE_BYTES {
            return Err(ComposeError::TooLarge {
                size: attachment.bytes.len(),
                max: MAX_IMAGE_BYTES,
            });
        }

        let handle = self.blobs.register(attachment.bytes, &attachment.mime);
        let base64 = self.blobs.data_url(&handle).unwrap_or_default();
        let image_id = format!("img_{}", uuid::Uuid::new_v4().simple());

        let pos = pos.min(self.len());
        let idx = self.split_at(pos);
        self.runs.insert(
            idx,
            Run::Image(ImageRun {
                image_id: image_id.clone(),
                blob_url: handle.as_str().to_string(),
                base64,
            }),
        );
        self.merge_text();
        tracing::debug!("inserted image {image_id} at {pos}");
        Ok((image_id, pos + 1))
    }

    /// Backspace: delete the unit before `pos`. Returns the new cursor.
    pub fn delete_backward(&mut self, pos: usize) -> usize {
        let pos = pos.min(self.len());
        if pos == 0 {
            return 0;
        }
        self.delete_unit(pos - 1);
        pos - 1
    }

    /// Delete the unit after `pos`. The cursor does not move.
    pub fn delete_forward(&mut self, pos: usize) -> usize {
        if pos < self.len() {
            self.delete_unit(pos);
        }
        pos.min(self.len())
    }

    pub fn remove_image(&mut self, image_id: &str) -> Result<(), ComposeError> {
        let idx = self
            .runs
            .iter()
            .position(|r| matches!(r, Run::Image(img) if img.image_id == image_id))
            .ok_or_else(|| ComposeError::UnknownImage(image_id.to_string()))?;
        self.remove_run(idx);
        self.merge_text();
        Ok(())
    }

    /// Project the run list to token text plus ordered image references.
    /// Numbering comes from the surviving runs every time.
    pub fn extract(&self) -> ComposedPrompt {
        let mut text = String::new();
        let mut images = Vec::new();
        let mut order = self.first_order;
        let mut after_image = false;

        for run in &self.runs {
            match run {
                Run::Text(s) => {
                    if after_image && !s.starts_with(char::is_whitespace) {
                        text.push(' ');
                    }
                    text.push_str(s);
                    after_image = false;
                }
                Run::Image(img) => {
                    if !text.is_empty() && !text.ends_with(char::is_whitespace) {
                        text.push(' ');
                    }
                    text.push_str(&image_token(order));
                    images.push(ImageRef {
                        blob_url: img.blob_url.clone(),
                        base64: img.base64.clone(),
                        order,
                        image_id: Some(img.image_id.clone()),
                    });
                    order += 1;
                    after_image = true;
                }
            }
        }

        ComposedPrompt {
            text: normalize(text.trim()),
            images,
        }
    }

    /// Extract and clear, handing blob ownership of the images to the caller.
    pub fn take_submission(&mut self) -> (ComposedPrompt, Vec<BlobHandle>) {
        let prompt = self.extract();
        let handles = std::mem::take(&mut self.runs)
            .into_iter()
            .filter_map(|r| match r {
                Run::Image(img) => BlobHandle::from_url(&img.blob_url),
                Run::Text(_) => None,
            })
            .collect();
        (prompt, handles)
    }

    /// Drop all content, releasing every image this composer still owns.
    pub fn clear(&mut self) {
        for run in std::mem::take(&mut self.runs) {
            release_run(&self.blobs, &run);
        }
    }

    /// Make `pos` a run boundary and return the index of the run starting there.
    fn split_at(&mut self, pos: usize) -> usize {
        let mut start = 0;
        for idx in 0..self.runs.len() {
            if start == pos {
                return idx;
            }
            let units = self.runs[idx].units();
            if pos < start + units {
                if let Run::Text(s) = &mut self.runs[idx] {
                    let byte = char_to_byte(s, pos - start);
                    let tail = s.split_off(byte);
                    self.runs.insert(idx + 1, Run::Text(tail));
                }
                return idx + 1;
            }
            start += units;
        }
        self.runs.len()
    }

    fn delete_unit(&mut self, unit: usize) {
        let mut start = 0;
        for idx in 0..self.runs.len() {
            let units = self.runs[idx].units();
            if unit < start + units {
                if let Run::Text(s) = &mut self.runs[idx] {
                    let byte = char_to_byte(s, unit - start);
                    s.remove(byte);
                } else {
                    self.remove_run(idx);
                }
                self.merge_text();
                return;
            }
            start += units;
        }
    }

    fn remove_run(&mut self, idx: usize) {
        let run = self.runs.remove(idx);
        if let Run::Image(img) = &run {
            tracing::debug!("removed image {}", img.image_id);
        }
        release_run(&self.blobs, &run);
    }

    /// Join adjacent text runs and drop empty ones.
    fn merge_text(&mut self) {
        let mut merged: Vec<Run> = Vec::with_capacity(self.runs.len());
        for run in std::mem::take(&mut self.runs) {
            match (merged.last_mut(), run) {
                (_, Run::Text(s)) if s.is_empty() => {}
                (Some(Run::Text(prev)), Run::Text(s)) => prev.push_str(&s),
                (_, run) => merged.push(run),
            }
        }
        self.runs = merged;
    }
}

impl Drop for Composer {
    fn drop(&mut self) {
        self.clear();
    }
}

fn release_run(blobs: &BlobRegistry, run: &Run) {
    if let Run::Image(img) = run
        && let Some(handle) = BlobHandle::from_url(&img.blob_url)
    {
        blobs.release(&handle);
    }
}

fn char_to_byte(s: &str, chars: usize) -> usize {
    s.char_indices().nth(chars).map(|(b, _)| b).unwrap_or(s.len())
}

pub fn image_token(order: u32) -> String {
    format!("[image {order}]")
}

/// Whether `text` mentions `[image N]` for any N.
pub fn has_image_token(text: &str) -> bool {
    IMAGE_TOKEN.is_match(text)
}

enum Segment<'a> {
    Text(&'a str),
    Token { order: Option<u32>, raw: &'a str },
}

fn segments(text: &str) -> Vec<Segment<'_>> {
    let mut out = Vec::new();
    let mut last = 0;
    for caps in IMAGE_TOKEN.captures_iter(text) {
        let Some(whole) = caps.get(0) else { continue };
        if whole.start() > last {
            out.push(Segment::Text(&text[last..whole.start()]));
        }
        out.push(Segment::Token {
            order: caps.get(1).and_then(|m| m.as_str().parse().ok()),
            raw: whole.as_str(),
        });
        last = whole.end();
    }
    if last < text.len() {
        out.push(Segment::Text(&text[last..]));
    }
    out
}

fn find_order(images: &[ImageRef], order: Option<u32>) -> Option<&ImageRef> {
    let order = order?;
    images.iter().find(|img| img.order == order)
}

/// Rebuild a display tree from flattened prompt text.
///
/// Tokens resolve to the image with the matching `order`; unmatched tokens
/// stay literal. A text segment that is itself JSON renders as a structured
/// node. A prompt with no text shows its images in order.
pub fn render(text: &str, images: &[ImageRef]) -> Vec<DisplayNode> {
    if text.trim().is_empty() {
        let mut sorted: Vec<ImageRef> = images.to_vec();
        sorted.sort_by_key(|img| img.order);
        return sorted.into_iter().map(DisplayNode::Image).collect();
    }

    let mut nodes: Vec<DisplayNode> = Vec::new();
    for segment in segments(text) {
        match segment {
            Segment::Text(s) => match parse_structured(s) {
                Some(value) => nodes.push(DisplayNode::Structured(value)),
                None => push_display_text(&mut nodes, s),
            },
            Segment::Token { order, raw } => match find_order(images, order) {
                Some(img) => nodes.push(DisplayNode::Image(img.clone())),
                None => push_display_text(&mut nodes, raw),
            },
        }
    }
    nodes
}

fn push_display_text(nodes: &mut Vec<DisplayNode>, s: &str) {
    if let Some(DisplayNode::Text(prev)) = nodes.last_mut() {
        prev.push_str(s);
    } else {
        nodes.push(DisplayNode::Text(s.to_string()));
    }
}

/// Reverse projection of [`Composer::extract`]: rebuild a run list from a
/// flattened prompt so it can be reopened for editing.
pub fn runs_from_prompt(text: &str, images: &[ImageRef]) -> Vec<Run> {
    let mut runs: Vec<Run> = Vec::new();
    for segment in segments(text) {
        match segment {
            Segment::Text(s) => push_run_text(&mut runs, s),
            Segment::Token { order, raw } => match find_order(images, order) {
                Some(img) => runs.push(Run::Image(ImageRun {
                    image_id: img
                        .image_id
                        .clone()
                        .unwrap_or_else(|| format!("image_{}", img.order)),
                    blob_url: img.blob_url.clone(),
                    base64: img.base64.clone(),
                })),
                None => push_run_text(&mut runs, raw),
            },
        }
    }
    runs
}

fn push_run_text(runs: &mut Vec<Run>, s: &str) {
    if let Some(Run::Text(prev)) = runs.last_mut() {
        prev.push_str(s);
    } else if !s.is_empty() {
        runs.push(Run::Text(s.to_string()));
    }
}
