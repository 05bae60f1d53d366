//! Completion detection for terminals that do not report when a command ends.

pub mod markers;
pub mod prompt;

pub use markers::{CompletionMarkerConfig, CompletionMarkers, MarkerExtraction};
pub use prompt::{CustomPromptPattern, PromptDetector, PromptMatch, PromptPattern};
