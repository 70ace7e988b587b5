//! Content repurposing pipeline: processing stages, style retrieval and fan-out generation.

pub mod analysis;
pub mod orchestrator;
pub mod platform;
pub mod processing;
pub mod seo;
pub mod style;
pub mod validate;

pub use orchestrator::{GenerationOrchestrator, GenerationSettings};
pub use platform::PlatformAgent;
pub use processing::{ProcessingSettings, ProcessingStateMachine};
pub use seo::{SeoAnnotator, SeoMetadata, TitleApproach};
pub use style::{StylePatterns, StyleRetriever};
pub use validate::{ConstraintValidator, ValidationResult};
