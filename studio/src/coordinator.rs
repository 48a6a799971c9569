//! Generation coordinator: turns a composed prompt into a provisional slide,
//! runs the request in the background and settles the slide when it finishes.
//!
//! Each running request is tracked in a side table keyed by slide id. The
//! table, not the slide, holds the cancellation token, so slides stay plain
//! data and any slide can be cancelled while others keep generating.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::backend::{EditRequest, GenerateRequest, ImageService, ServiceError};
use crate::blobs::{BlobHandle, BlobRegistry, ensure_data_url};
use crate::compose::ComposedPrompt;
use crate::slide::{ImageRef, Slide, SlideId, with_input_images};
use crate::sync::PersistenceSync;
use crate::tree::{SharedTree, TreeError};

/// How many finished generations `state` still reports.
const SETTLED_LIMIT: usize = 256;

/// Mime assumed for attached images that arrive as bare base64.
const FALLBACK_MIME: &str = "image/png";

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("invalid prompt: {0}")]
    Validation(String),
    #[error(transparent)]
    Tree(#[from] TreeError),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    /// Slide appended, source image not yet encoded.
    Pending,
    /// Request issued, waiting for the service.
    Generating,
    Complete,
    Cancelled,
    Failed,
}

/// Progress notifications for a front end.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    Started { slide_id: SlideId },
    Completed { slide_id: SlideId },
    Persisted { client_id: SlideId, server_id: SlideId },
    Cancelled { slide_id: SlideId },
    Failed { slide_id: SlideId, message: String },
}

/// How a generation task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    /// `slide_id` is the server id when the slide was persisted.
    Complete { slide_id: SlideId },
    Cancelled,
    Failed { message: String },
}

pub enum Submission {
    /// The active slide is still generating; nothing was started.
    Busy,
    Started {
        slide_id: SlideId,
        task: JoinHandle<GenerationOutcome>,
    },
}

struct InFlight {
    cancel: CancellationToken,
    state: GenerationState,
}

#[derive(Clone)]
pub struct GenerationCoordinator {
    tree: SharedTree,
    service: Arc<dyn ImageService>,
    blobs: Arc<BlobRegistry>,
    sync: Option<PersistenceSync>,
    model: String,
    inflight: Arc<Mutex<HashMap<SlideId, InFlight>>>,
    settled: Arc<Mutex<VecDeque<(SlideId, GenerationState)>>>,
    events: Option<UnboundedSender<GenerationEvent>>,
}

impl GenerationCoordinator {
    pub fn new(
        tree: SharedTree,
        service: Arc<dyn ImageService>,
        blobs: Arc<BlobRegistry>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            tree,
            service,
            blobs,
            sync: None,
            model: model.into(),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            settled: Arc::new(Mutex::new(VecDeque::new())),
            events: None,
        }
    }

    /// Persist every completed slide through `sync`.
    pub fn with_sync(mut self, sync: PersistenceSync) -> Self {
        self.sync = Some(sync);
        self
    }

    pub fn with_events(mut self, events: UnboundedSender<GenerationEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn tree(&self) -> &SharedTree {
        &self.tree
    }

    /// Start an edit of the active slide.
    ///
    /// `attachments` are the transient handles behind `prompt.images`; the new
    /// slide takes ownership of them. A rejected submission releases them.
    pub fn submit(
        &self,
        prompt: ComposedPrompt,
        attachments: Vec<BlobHandle>,
    ) -> Result<Submission, GenerationError> {
        if prompt.is_empty() {
            self.blobs.release_all(&attachments);
            return Err(GenerationError::Validation(
                "prompt has no text and no images".to_string(),
            ));
        }

        let (slide_id, parent_url, inputs) = match self.open_provisional(&prompt) {
            Ok(Some(opened)) => opened,
            Ok(None) => {
                self.blobs.release_all(&attachments);
                return Ok(Submission::Busy);
            }
            Err(e) => {
                self.blobs.release_all(&attachments);
                return Err(e.into());
            }
        };

        let cancel = CancellationToken::new();
        self.inflight.lock().unwrap().insert(
            slide_id.clone(),
            InFlight {
                cancel: cancel.clone(),
                state: GenerationState::Pending,
            },
        );
        self.emit(GenerationEvent::Started {
            slide_id: slide_id.clone(),
        });

        let this = self.clone();
        let id = slide_id.clone();
        let task = tokio::spawn(async move { this.run_edit(id, cancel, parent_url, prompt, inputs).await });

        Ok(Submission::Started { slide_id, task })
    }

    /// Append a provisional child of the active slide. `None` when the active
    /// slide is still generating.
    fn open_provisional(
        &self,
        prompt: &ComposedPrompt,
    ) -> Result<Option<(SlideId, Option<String>, Vec<ImageRef>)>, TreeError> {
        let mut tree = self.tree.lock().unwrap();
        let parent = tree.active().ok_or(TreeError::NoRoot)?;
        if parent.is_generating {
            tracing::debug!("active slide {} is still generating", parent.id);
            return Ok(None);
        }

        let parent_id = parent.id.clone();
        let parent_url = (!parent.image_url.is_empty()).then(|| parent.image_url.clone());
        let mut inputs = Vec::with_capacity(prompt.images.len() + 1);
        if let Some(url) = &parent_url {
            inputs.push(ImageRef::parent(url));
        }
        inputs.extend(prompt.images.iter().cloned());

        let slide_id = tree.append_provisional(&parent_id, prompt.text.clone(), inputs.clone())?;
        Ok(Some((slide_id, parent_url, inputs)))
    }

    async fn run_edit(
        self,
        slide_id: SlideId,
        cancel: CancellationToken,
        parent_url: Option<String>,
        prompt: ComposedPrompt,
        inputs: Vec<ImageRef>,
    ) -> GenerationOutcome {
        let mut request = EditRequest {
            model: self.model.clone(),
            prompt: prompt.text,
            ..Default::default()
        };
        if let Some(url) = parent_url {
            match BlobHandle::from_url(&url) {
                Some(handle) => match self.blobs.data_url(&handle) {
                    Some(data) => request.source_image_base64 = Some(data),
                    None => {
                        return self.fail(&slide_id, "source image is no longer available".into());
                    }
                },
                None => request.source_image_url = Some(url),
            }
        }
        let images: Vec<String> = prompt
            .images
            .iter()
            .filter_map(|img| {
                if !img.base64.is_empty() {
                    return Some(ensure_data_url(&img.base64, FALLBACK_MIME));
                }
                img.blob_handle()
                    .and_then(|h| self.blobs.data_url(&h))
                    .or_else(|| (!img.blob_url.is_empty()).then(|| img.blob_url.clone()))
            })
            .collect();
        if !images.is_empty() {
            request.images = Some(images);
        }

        if !self.advance(&slide_id, GenerationState::Generating) {
            return GenerationOutcome::Cancelled;
        }

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return GenerationOutcome::Cancelled,
            r = self.service.edit(request) => r,
        };

        match result {
            Ok(mut result) => {
                result.ai_json_prompt = with_input_images(result.ai_json_prompt.take(), &inputs);
                if !self.retire(&slide_id) {
                    return GenerationOutcome::Cancelled;
                }
                if let Err(e) = self.tree.lock().unwrap().finalize(&slide_id, result) {
                    tracing::debug!("slide {slide_id} went away before finalize: {e}");
                    self.settle(&slide_id, GenerationState::Cancelled);
                    return GenerationOutcome::Cancelled;
                }
                tracing::info!("generation for slide {slide_id} complete");
                self.settle(&slide_id, GenerationState::Complete);
                self.emit(GenerationEvent::Completed {
                    slide_id: slide_id.clone(),
                });
                let final_id = self.persist(slide_id).await;
                GenerationOutcome::Complete { slide_id: final_id }
            }
            Err(e) if e.is_abort() => {
                if self.retire(&slide_id) {
                    self.discard(&slide_id);
                    self.settle(&slide_id, GenerationState::Cancelled);
                    self.emit(GenerationEvent::Cancelled { slide_id });
                }
                GenerationOutcome::Cancelled
            }
            Err(e) => self.fail(&slide_id, e.to_string()),
        }
    }

    /// Hand a finalized slide to sync. Returns the id the slide ends up with.
    async fn persist(&self, slide_id: SlideId) -> SlideId {
        let Some(sync) = &self.sync else {
            return slide_id;
        };
        match sync.persist(&slide_id).await {
            Ok(server_id) => {
                if let Some(entry) = self
                    .settled
                    .lock()
                    .unwrap()
                    .iter_mut()
                    .rev()
                    .find(|(id, _)| *id == slide_id)
                {
                    entry.0 = server_id.clone();
                }
                self.emit(GenerationEvent::Persisted {
                    client_id: slide_id,
                    server_id: server_id.clone(),
                });
                server_id
            }
            // The rendered result stays; the slide is left unsaved.
            Err(_) => slide_id,
        }
    }

    fn fail(&self, slide_id: &str, message: String) -> GenerationOutcome {
        if !self.retire(slide_id) {
            return GenerationOutcome::Cancelled;
        }
        tracing::warn!("generation for slide {slide_id} failed: {message}");
        self.discard(slide_id);
        self.settle(slide_id, GenerationState::Failed);
        self.emit(GenerationEvent::Failed {
            slide_id: slide_id.to_string(),
            message: message.clone(),
        });
        GenerationOutcome::Failed { message }
    }

    /// Cancel the generation for `slide_id` and remove its slide.
    /// Returns `false` when nothing was in flight for it.
    pub fn cancel(&self, slide_id: &str) -> bool {
        let Some(entry) = self.inflight.lock().unwrap().remove(slide_id) else {
            return false;
        };
        entry.cancel.cancel();
        self.discard(slide_id);
        self.settle(slide_id, GenerationState::Cancelled);
        tracing::debug!("generation for slide {slide_id} cancelled");
        self.emit(GenerationEvent::Cancelled {
            slide_id: slide_id.to_string(),
        });
        true
    }

    pub fn cancel_active(&self) -> bool {
        let active = self.tree.lock().unwrap().active().map(|s| s.id.clone());
        match active {
            Some(id) => self.cancel(&id),
            None => false,
        }
    }

    /// Generate the root slide of a new project from text alone.
    pub async fn generate_original(
        &self,
        prompt: &str,
        cancel: CancellationToken,
    ) -> Result<SlideId, GenerationError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(GenerationError::Validation("prompt is empty".to_string()));
        }
        if self.tree.lock().unwrap().root().is_some() {
            return Err(TreeError::RootExists.into());
        }

        let request = GenerateRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ServiceError::Aborted.into()),
            r = self.service.generate(request) => r?,
        };

        let mut slide = Slide::original(
            format!("slide-{}", uuid::Uuid::new_v4()),
            result.image_url,
            result.path,
            prompt,
        );
        slide.ai_prompt = result.ai_prompt;
        slide.ai_json_prompt = result.ai_json_prompt;
        let id = self.tree.lock().unwrap().create_root(slide)?;
        tracing::info!("original slide {id} generated");
        Ok(id)
    }

    pub fn navigate(&self, index: usize) -> Result<(), TreeError> {
        self.tree.lock().unwrap().navigate(index)
    }

    /// Current state of the generation that produced `slide_id`, if any.
    pub fn state(&self, slide_id: &str) -> Option<GenerationState> {
        if let Some(entry) = self.inflight.lock().unwrap().get(slide_id) {
            return Some(entry.state);
        }
        self.settled
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| id == slide_id)
            .map(|(_, state)| *state)
    }

    /// Whether any generation is in flight.
    pub fn is_generating(&self) -> bool {
        !self.inflight.lock().unwrap().is_empty()
    }

    pub fn in_flight(&self) -> Vec<SlideId> {
        self.inflight.lock().unwrap().keys().cloned().collect()
    }

    /// Move an in-flight entry forward. `false` when it was cancelled.
    fn advance(&self, slide_id: &str, state: GenerationState) -> bool {
        match self.inflight.lock().unwrap().get_mut(slide_id) {
            Some(entry) => {
                entry.state = state;
                true
            }
            None => false,
        }
    }

    /// Drop the side-table entry. Exactly one of the task and `cancel` wins.
    fn retire(&self, slide_id: &str) -> bool {
        self.inflight.lock().unwrap().remove(slide_id).is_some()
    }

    fn settle(&self, slide_id: &str, state: GenerationState) {
        let mut settled = self.settled.lock().unwrap();
        settled.push_back((slide_id.to_string(), state));
        while settled.len() > SETTLED_LIMIT {
            settled.pop_front();
        }
    }

    /// Remove a slide that will not complete and release what it owned.
    fn discard(&self, slide_id: &str) {
        let removed = self.tree.lock().unwrap().remove(slide_id);
        match removed {
            Ok(slide) => {
                self.blobs.release_all(&slide.owned_blobs());
            }
            Err(e) => tracing::debug!("discarding slide {slide_id}: {e}"),
        }
    }

    fn emit(&self, event: GenerationEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::{mpsc, oneshot};

    use super::*;
    use crate::slide::{GenerationResult, INPUT_IMAGES_KEY};
    use crate::sync::tests::MemoryBackend;
    use crate::tree::SlideTree;

    type Reply = Result<GenerationResult, ServiceError>;

    /// Image service whose responses are released by the test, per prompt.
    /// Prompts without a gate complete immediately.
    #[derive(Default)]
    struct GatedService {
        gates: Mutex<HashMap<String, oneshot::Receiver<Reply>>>,
        requests: Mutex<Vec<EditRequest>>,
    }

    impl GatedService {
        fn gate(&self, prompt: &str) -> oneshot::Sender<Reply> {
            let (tx, rx) = oneshot::channel();
            self.gates.lock().unwrap().insert(prompt.to_string(), rx);
            tx
        }
    }

    fn rendered(prompt: &str) -> GenerationResult {
        GenerationResult {
            image_url: format!("https://cdn/{}.png", prompt.replace(' ', "-")),
            path: format!("u/{}.png", prompt.replace(' ', "-")),
            ai_prompt: Some(format!("{prompt}, detailed")),
            ai_json_prompt: Some(json!({"subject": prompt})),
        }
    }

    #[async_trait::async_trait]
    impl ImageService for GatedService {
        async fn edit(&self, request: EditRequest) -> Reply {
            self.requests.lock().unwrap().push(request.clone());
            let gate = self.gates.lock().unwrap().remove(&request.prompt);
            match gate {
                Some(rx) => rx.await.unwrap_or(Err(ServiceError::Aborted)),
                None => Ok(rendered(&request.prompt)),
            }
        }

        async fn generate(&self, request: GenerateRequest) -> Reply {
            Ok(rendered(&request.prompt))
        }
    }

    fn with_root(root_url: &str) -> SharedTree {
        let mut tree = SlideTree::new();
        tree.create_root(Slide::original("root", root_url, "u/root.png", "a cat"))
            .unwrap();
        tree.shared()
    }

    fn setup(root_url: &str) -> (GenerationCoordinator, Arc<GatedService>, Arc<BlobRegistry>) {
        let service = Arc::new(GatedService::default());
        let blobs = Arc::new(BlobRegistry::new());
        let coordinator =
            GenerationCoordinator::new(with_root(root_url), service.clone(), blobs.clone(), "edit-model");
        (coordinator, service, blobs)
    }

    fn started(submission: Submission) -> (SlideId, JoinHandle<GenerationOutcome>) {
        match submission {
            Submission::Started { slide_id, task } => (slide_id, task),
            Submission::Busy => panic!("expected the submission to start"),
        }
    }

    #[tokio::test]
    async fn edit_completes_and_records_inputs() {
        let (coordinator, service, _) = setup("https://cdn/root.png");
        let (id, task) = started(
            coordinator
                .submit(ComposedPrompt::new("make it blue"), vec![])
                .unwrap(),
        );
        assert!(matches!(
            coordinator.state(&id),
            Some(GenerationState::Pending | GenerationState::Generating)
        ));

        assert_eq!(
            task.await.unwrap(),
            GenerationOutcome::Complete { slide_id: id.clone() }
        );
        assert_eq!(coordinator.state(&id), Some(GenerationState::Complete));
        assert!(!coordinator.is_generating());

        let tree = coordinator.tree().lock().unwrap();
        let slide = tree.get(&id).unwrap();
        assert!(!slide.is_generating);
        assert_eq!(slide.image_url, "https://cdn/make-it-blue.png");
        assert_eq!(slide.parent_slide_id.as_deref(), Some("root"));
        let json = slide.ai_json_prompt.as_ref().unwrap();
        assert_eq!(json["subject"], "make it blue");
        assert_eq!(json[INPUT_IMAGES_KEY][0]["imageId"], "parent");

        let requests = service.requests.lock().unwrap();
        assert_eq!(requests[0].source_image_url.as_deref(), Some("https://cdn/root.png"));
        assert_eq!(requests[0].model, "edit-model");
        assert!(requests[0].images.is_none());
    }

    #[tokio::test]
    async fn empty_prompt_is_rejected_without_a_slide() {
        let (coordinator, service, _) = setup("https://cdn/root.png");
        let err = coordinator
            .submit(ComposedPrompt::new("   "), vec![])
            .err()
            .unwrap();
        assert!(matches!(err, GenerationError::Validation(_)));
        assert_eq!(coordinator.tree().lock().unwrap().len(), 1);
        assert!(service.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn submit_while_active_generates_is_a_no_op() {
        let (coordinator, service, _) = setup("https://cdn/root.png");
        let gate = service.gate("first");
        let (first, task) = started(coordinator.submit(ComposedPrompt::new("first"), vec![]).unwrap());

        let again = coordinator.submit(ComposedPrompt::new("second"), vec![]).unwrap();
        assert!(matches!(again, Submission::Busy));
        assert_eq!(coordinator.tree().lock().unwrap().len(), 2);

        gate.send(Ok(rendered("first"))).unwrap();
        assert_eq!(task.await.unwrap(), GenerationOutcome::Complete { slide_id: first });
    }

    #[tokio::test]
    async fn cancel_removes_slide_and_is_idempotent() {
        let (coordinator, service, _) = setup("https://cdn/root.png");
        let _gate = service.gate("slow");
        let (id, task) = started(coordinator.submit(ComposedPrompt::new("slow"), vec![]).unwrap());
        assert_eq!(coordinator.tree().lock().unwrap().active_index(), 1);

        assert!(coordinator.cancel(&id));
        assert!(!coordinator.cancel(&id));
        assert_eq!(task.await.unwrap(), GenerationOutcome::Cancelled);

        let tree = coordinator.tree().lock().unwrap();
        assert!(tree.get(&id).is_none());
        assert_eq!(tree.active_index(), 0);
        drop(tree);
        assert_eq!(coordinator.state(&id), Some(GenerationState::Cancelled));
        assert!(!coordinator.is_generating());
    }

    #[tokio::test]
    async fn concurrent_generations_cancel_independently() {
        let (coordinator, service, _) = setup("https://cdn/root.png");
        let _gate_a = service.gate("edit a");
        let gate_b = service.gate("edit b");

        let (a, task_a) = started(coordinator.submit(ComposedPrompt::new("edit a"), vec![]).unwrap());
        coordinator.navigate(0).unwrap();
        let (b, task_b) = started(coordinator.submit(ComposedPrompt::new("edit b"), vec![]).unwrap());
        assert_eq!(coordinator.in_flight().len(), 2);

        coordinator.cancel(&a);
        gate_b.send(Ok(rendered("edit b"))).unwrap();

        assert_eq!(task_a.await.unwrap(), GenerationOutcome::Cancelled);
        assert_eq!(
            task_b.await.unwrap(),
            GenerationOutcome::Complete { slide_id: b.clone() }
        );

        let tree = coordinator.tree().lock().unwrap();
        assert!(tree.get(&a).is_none());
        let slide_b = tree.get(&b).unwrap();
        assert!(!slide_b.is_generating);
        assert_eq!(slide_b.image_url, "https://cdn/edit-b.png");
        assert_eq!(tree.generating_count(), 0);
    }

    #[tokio::test]
    async fn failure_removes_slide_and_reports() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (coordinator, service, _) = setup("https://cdn/root.png");
        let coordinator = coordinator.with_events(tx);
        let gate = service.gate("broken");
        let (id, task) = started(coordinator.submit(ComposedPrompt::new("broken"), vec![]).unwrap());

        gate.send(Err(ServiceError::Rejected("quota".into()))).unwrap();
        let outcome = task.await.unwrap();
        assert!(matches!(outcome, GenerationOutcome::Failed { ref message } if message.contains("quota")));
        assert!(coordinator.tree().lock().unwrap().get(&id).is_none());
        assert_eq!(coordinator.state(&id), Some(GenerationState::Failed));

        assert_eq!(rx.recv().await, Some(GenerationEvent::Started { slide_id: id.clone() }));
        assert!(matches!(
            rx.recv().await,
            Some(GenerationEvent::Failed { slide_id, .. }) if slide_id == id
        ));
    }

    #[tokio::test]
    async fn abort_error_is_silent_cancellation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (coordinator, service, _) = setup("https://cdn/root.png");
        let coordinator = coordinator.with_events(tx);
        let gate = service.gate("aborted");
        let (id, task) = started(coordinator.submit(ComposedPrompt::new("aborted"), vec![]).unwrap());

        gate.send(Err(ServiceError::Aborted)).unwrap();
        assert_eq!(task.await.unwrap(), GenerationOutcome::Cancelled);
        assert!(coordinator.tree().lock().unwrap().get(&id).is_none());

        rx.recv().await.unwrap();
        assert_eq!(rx.recv().await, Some(GenerationEvent::Cancelled { slide_id: id }));
    }

    #[tokio::test]
    async fn local_parent_is_sent_as_data_url() {
        let blobs = Arc::new(BlobRegistry::new());
        let handle = blobs.register(vec![0x89, 0x50], "image/png");
        let service = Arc::new(GatedService::default());
        let coordinator =
            GenerationCoordinator::new(with_root(handle.as_str()), service.clone(), blobs.clone(), "m");

        let (_, task) = started(coordinator.submit(ComposedPrompt::new("sharpen"), vec![]).unwrap());
        task.await.unwrap();

        let requests = service.requests.lock().unwrap();
        assert!(requests[0].source_image_url.is_none());
        assert!(
            requests[0]
                .source_image_base64
                .as_deref()
                .unwrap()
                .starts_with("data:image/png;base64,")
        );
        // The parent's blob belongs to the root slide.
        assert!(blobs.contains(&handle));
    }

    #[tokio::test]
    async fn cancelled_slide_releases_attachments_once() {
        let (coordinator, service, blobs) = setup("https://cdn/root.png");
        let handle = blobs.register(vec![1, 2, 3], "image/webp");
        let prompt = ComposedPrompt {
            text: "[image 2] on the table".into(),
            images: vec![ImageRef {
                blob_url: handle.as_str().into(),
                base64: "data:image/webp;base64,AQID".into(),
                order: 2,
                image_id: Some("img_1".into()),
            }],
        };
        let _gate = service.gate("[image 2] on the table");
        let (id, task) = started(coordinator.submit(prompt, vec![handle.clone()]).unwrap());

        coordinator.cancel(&id);
        assert_eq!(task.await.unwrap(), GenerationOutcome::Cancelled);
        assert!(!blobs.contains(&handle));
        assert!(!blobs.release(&handle));
    }

    #[tokio::test]
    async fn completed_slide_is_persisted_with_server_id() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let service = Arc::new(GatedService::default());
        let blobs = Arc::new(BlobRegistry::new());
        let tree = with_root("https://cdn/root.png");
        let backend = Arc::new(MemoryBackend::default());
        let sync = PersistenceSync::new(backend.clone(), tree.clone(), blobs.clone(), "proj-1");
        let coordinator = GenerationCoordinator::new(tree.clone(), service, blobs, "m")
            .with_sync(sync)
            .with_events(tx);

        let (client_id, task) = started(coordinator.submit(ComposedPrompt::new("warmer"), vec![]).unwrap());
        assert_eq!(
            task.await.unwrap(),
            GenerationOutcome::Complete {
                slide_id: "srv-1".into()
            }
        );

        let t = tree.lock().unwrap();
        assert!(t.get(&client_id).is_none());
        assert!(t.get("srv-1").unwrap().is_saved);
        drop(t);
        assert_eq!(coordinator.state("srv-1"), Some(GenerationState::Complete));
        assert_eq!(backend.created.lock().unwrap()[0].prompt, "warmer");

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert_eq!(
            events.last(),
            Some(&GenerationEvent::Persisted {
                client_id,
                server_id: "srv-1".into()
            })
        );
    }

    #[tokio::test]
    async fn tree_rejection_releases_attachments() {
        let blobs = Arc::new(BlobRegistry::new());
        let coordinator = GenerationCoordinator::new(
            SlideTree::new().shared(),
            Arc::new(GatedService::default()),
            blobs.clone(),
            "m",
        );
        let handle = blobs.register(vec![9], "image/png");
        let prompt = ComposedPrompt {
            text: "[image 2]".into(),
            images: vec![ImageRef {
                blob_url: handle.as_str().into(),
                base64: String::new(),
                order: 2,
                image_id: Some("img_1".into()),
            }],
        };
        let err = coordinator.submit(prompt, vec![handle.clone()]).err().unwrap();
        assert!(matches!(err, GenerationError::Tree(TreeError::NoRoot)));
        assert!(!blobs.contains(&handle));
    }

    #[tokio::test]
    async fn bare_base64_attachments_become_data_urls() {
        let (coordinator, service, _) = setup("https://cdn/root.png");
        let prompt = ComposedPrompt {
            text: "[image 2] as a sticker".into(),
            images: vec![ImageRef {
                blob_url: "https://cdn/sticker.png".into(),
                base64: "AQID".into(),
                order: 2,
                image_id: Some("img_s".into()),
            }],
        };
        let (_, task) = started(coordinator.submit(prompt, vec![]).unwrap());
        task.await.unwrap();
        let requests = service.requests.lock().unwrap();
        assert_eq!(
            requests[0].images.as_deref(),
            Some(&["data:image/png;base64,AQID".to_string()][..])
        );
    }

    #[tokio::test]
    async fn settled_states_are_bounded() {
        let (coordinator, _, _) = setup("https://cdn/root.png");
        let mut ids = Vec::new();
        for i in 0..SETTLED_LIMIT + 3 {
            let (id, _task) = started(
                coordinator
                    .submit(ComposedPrompt::new(format!("try {i}")), vec![])
                    .unwrap(),
            );
            assert!(coordinator.cancel(&id));
            ids.push(id);
        }
        assert_eq!(coordinator.settled.lock().unwrap().len(), SETTLED_LIMIT);
        assert_eq!(coordinator.state(&ids[0]), None);
        assert_eq!(
            coordinator.state(ids.last().unwrap()),
            Some(GenerationState::Cancelled)
        );
        assert_eq!(coordinator.tree().lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn generate_original_creates_root_once() {
        let service = Arc::new(GatedService::default());
        let coordinator = GenerationCoordinator::new(
            SlideTree::new().shared(),
            service,
            Arc::new(BlobRegistry::new()),
            "m",
        );

        let id = coordinator
            .generate_original("a lighthouse at dusk", CancellationToken::new())
            .await
            .unwrap();
        {
            let tree = coordinator.tree().lock().unwrap();
            let root = tree.root().unwrap();
            assert_eq!(root.id, id);
            assert!(root.is_original);
            assert_eq!(root.image_url, "https://cdn/a-lighthouse-at-dusk.png");
        }

        let again = coordinator
            .generate_original("another", CancellationToken::new())
            .await;
        assert!(matches!(again, Err(GenerationError::Tree(TreeError::RootExists))));

        let cancelled = CancellationToken::new();
        cancelled.cancel();
        let fresh = GenerationCoordinator::new(
            SlideTree::new().shared(),
            Arc::new(GatedService::default()),
            Arc::new(BlobRegistry::new()),
            "m",
        );
        let err = fresh.generate_original("x", cancelled).await.unwrap_err();
        assert!(matches!(err, GenerationError::Service(ServiceError::Aborted)));
    }
}
