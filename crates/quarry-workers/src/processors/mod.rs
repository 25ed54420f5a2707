//! Processors shipped with quarry.

pub mod annotation_metadata;
pub mod convert_json;
pub mod perspective;

pub use annotation_metadata::{AnnotationMetadata, ANNOTATION_METADATA_TYPE};
pub use convert_json::{ConvertJson, CONVERT_JSON_TYPE};
pub use perspective::{Perspective, PerspectiveClient, TextScorer, PERSPECTIVE_TYPE};
