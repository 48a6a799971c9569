pub mod backend;
pub mod blobs;
pub mod compose;
pub mod config;
pub mod coordinator;
pub mod normalize;
pub mod slide;
pub mod sync;
pub mod tree;

// Re-exports
pub use backend::{HttpBackend, ImageService, ServiceError, SlideBackend};
pub use blobs::{BlobHandle, BlobRegistry};
pub use compose::{ComposeError, ComposedPrompt, Composer, DisplayNode, ImageAttachment};
pub use config::{ConfigError, StudioConfig};
pub use coordinator::{
    GenerationCoordinator, GenerationError, GenerationEvent, GenerationOutcome, GenerationState,
    Submission,
};
pub use normalize::normalize;
pub use slide::{GenerationResult, ImageRef, Slide, SlideId};
pub use sync::{PatchOutcome, PersistError, PersistenceSync, SaveOutcome};
pub use tree::{SharedTree, SlideTree, TreeError};
