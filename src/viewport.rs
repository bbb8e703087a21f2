use std::sync::{Arc, Mutex};

use image::ImageBuffer;
use image::Luma;

use crate::enums::{Orientation, ViewportType};
use crate::volume::VoiWindow;

/// A display surface shared between its owner and the rendering engine,
/// standing in for a mounted UI element.
pub type SharedSurface = Arc<Mutex<DisplaySurface>>;

/// Fixed-size 8-bit grayscale framebuffer a viewport renders into.
///
/// Surfaces start out black and keep their last presented frame.
#[derive(Debug)]
pub struct DisplaySurface {
    width: u32,
    height: u32,
    frame: ImageBuffer<Luma<u8>, Vec<u8>>,
}

impl DisplaySurface {
    pub fn new(width: u32, height: u32) -> SharedSurface {
        Arc::new(Mutex::new(Self {
            width,
            height,
            frame: ImageBuffer::new(width, height),
        }))
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub(crate) fn present(&mut self, frame: ImageBuffer<Luma<u8>, Vec<u8>>) {
        self.frame = frame;
    }

    /// Copy of the last presented frame.
    pub fn snapshot(&self) -> ImageBuffer<Luma<u8>, Vec<u8>> {
        self.frame.clone()
    }
}

/// Immutable viewport descriptor handed to the rendering engine.
#[derive(Clone)]
pub struct ViewportInput {
    pub viewport_id: String,
    pub surface: SharedSurface,
    pub viewport_type: ViewportType,
    pub orientation: Orientation,
}

/// A bound viewport: a descriptor plus the mutable display state the
/// interaction tools operate on.
pub(crate) struct Viewport {
    pub(crate) id: String,
    pub(crate) surface: SharedSurface,
    pub(crate) orientation: Orientation,
    pub(crate) volume_id: Option<String>,
    pub(crate) slice_index: usize,
    pub(crate) window: VoiWindow,
}

impl Viewport {
    pub(crate) fn bind(input: ViewportInput) -> Self {
        let ViewportInput {
            viewport_id,
            surface,
            viewport_type: ViewportType::Orthographic,
            orientation,
        } = input;
        Self {
            id: viewport_id,
            surface,
            orientation,
            volume_id: None,
            slice_index: 0,
            window: VoiWindow::full_range(),
        }
    }
}
