use serde::{Deserialize, Serialize};

/// Anatomical viewing axis of a volume cross-section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Orientation {
    Axial,
    Coronal,
    Sagittal,
}

/// Projection type of a viewport.
///
/// Only orthographic cross-sections are supported; the variant exists so
/// viewport descriptors carry an explicit projection, matching how the
/// descriptors are handed to the rendering engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ViewportType {
    #[default]
    Orthographic,
}
