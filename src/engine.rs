//! Rendering engine instance.
//!
//! One engine is constructed per bootstrap. It owns the bound viewports and
//! the registry of volumes available for display, and draws a viewport's
//! current cross-section into its surface on demand, using the GPU slice
//! path when the rendering core holds a device and the CPU resampler
//! otherwise.

use std::collections::HashMap;

use image::ImageBuffer;
use thiserror::Error;
use tracing::{debug, info};

use crate::gpu::{GpuSliceRenderer, RenderCore, RenderCoreError};
use crate::viewport::{Viewport, ViewportInput};
use crate::volume::VoiWindow;
use crate::volume_loader::StreamingVolume;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown viewport {0}")]
    UnknownViewport(String),

    #[error("viewport {0} has no associated volume")]
    NoVolumeAssociated(String),

    #[error("a different volume is already registered as {0}")]
    DuplicateVolume(String),

    #[error("rendered frame does not match the surface of viewport {0}")]
    FrameMismatch(String),

    #[error(transparent)]
    Render(#[from] RenderCoreError),
}

pub struct RenderingEngine {
    id: String,
    core: RenderCore,
    viewports: Vec<Viewport>,
    volumes: HashMap<String, StreamingVolume>,
}

impl RenderingEngine {
    pub fn new(id: impl Into<String>, core: RenderCore) -> Self {
        let id = id.into();
        info!(engine_id = %id, gpu = core.has_gpu(), "rendering engine created");
        Self {
            id,
            core,
            viewports: Vec::new(),
            volumes: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Bind viewport descriptors to their display surfaces, replacing any
    /// previously bound set.
    pub fn set_viewports(&mut self, inputs: Vec<ViewportInput>) {
        self.viewports = inputs.into_iter().map(Viewport::bind).collect();
        info!(
            engine_id = %self.id,
            viewports = self.viewports.len(),
            "viewports bound"
        );
    }

    /// Associate a volume with the given viewports.
    ///
    /// The volume is registered under its id on first association; each
    /// viewport's slice index is centered on the volume extent along its
    /// orientation. Every viewport id is validated before any state changes,
    /// so an unknown id fails the whole call without a partial association.
    pub fn set_volumes_for_viewports(
        &mut self,
        volume: &StreamingVolume,
        viewport_ids: &[&str],
    ) -> Result<(), EngineError> {
        let volume_id = volume.id().to_owned();
        if let Some(existing) = self.volumes.get(&volume_id) {
            if !StreamingVolume::ptr_eq(existing, volume) {
                return Err(EngineError::DuplicateVolume(volume_id));
            }
        }

        let mut centers = Vec::with_capacity(viewport_ids.len());
        {
            let guard = volume.read();
            for viewport_id in viewport_ids {
                let orientation = self.viewport(viewport_id)?.orientation;
                centers.push(guard.extent(orientation) / 2);
            }
        }

        self.volumes
            .entry(volume_id.clone())
            .or_insert_with(|| volume.clone());
        for (viewport_id, center) in viewport_ids.iter().zip(centers) {
            let viewport = self.viewport_mut(viewport_id)?;
            viewport.volume_id = Some(volume_id.clone());
            viewport.slice_index = center;
        }
        info!(engine_id = %self.id, volume_id = %volume_id, ?viewport_ids, "volume associated");
        Ok(())
    }

    /// Draw the viewport's current cross-section into its surface.
    pub async fn render(&self, viewport_id: &str) -> Result<(), EngineError> {
        let viewport = self.viewport(viewport_id)?;
        let volume = self.viewport_volume_handle(viewport)?;
        let (width, height) = {
            let surface = viewport
                .surface
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            surface.dimensions()
        };

        let frame = match self.core.gpu() {
            Some(gpu) => {
                // The read guard is only needed for the texture upload; it
                // must not be held across the await while the load task may
                // be blocked on a write of the same lock.
                let renderer = {
                    let guard = volume.read();
                    GpuSliceRenderer::new(gpu, &guard)?
                };
                let pixels = renderer
                    .extract_slice(
                        viewport.slice_index,
                        viewport.orientation,
                        viewport.window,
                        width,
                        height,
                    )
                    .await?;
                ImageBuffer::from_raw(width, height, pixels)
            }
            None => {
                let guard = volume.read();
                guard.render_to(
                    viewport.slice_index,
                    viewport.orientation,
                    viewport.window,
                    width,
                    height,
                )
            }
        }
        .ok_or_else(|| EngineError::FrameMismatch(viewport_id.to_owned()))?;

        viewport
            .surface
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .present(frame);
        debug!(engine_id = %self.id, viewport_id, "frame presented");
        Ok(())
    }

    /// Render every bound viewport.
    pub async fn render_all(&self) -> Result<(), EngineError> {
        for id in self.viewport_ids() {
            self.render(&id).await?;
        }
        Ok(())
    }

    /// Step a viewport's slice index by `delta`, clamped to the volume
    /// extent; returns the new index.
    pub fn offset_slice(&mut self, viewport_id: &str, delta: i64) -> Result<usize, EngineError> {
        let (extent, current) = {
            let viewport = self.viewport(viewport_id)?;
            let volume = self.viewport_volume_handle(viewport)?;
            let extent = volume.read().extent(viewport.orientation);
            (extent, viewport.slice_index)
        };
        let new_index = (current as i64 + delta).clamp(0, extent.saturating_sub(1) as i64) as usize;
        self.viewport_mut(viewport_id)?.slice_index = new_index;
        Ok(new_index)
    }

    /// Replace a viewport's VOI window.
    pub fn set_voi(&mut self, viewport_id: &str, window: VoiWindow) -> Result<(), EngineError> {
        self.viewport_mut(viewport_id)?.window = window;
        Ok(())
    }

    pub fn viewport_count(&self) -> usize {
        self.viewports.len()
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    pub fn viewport_ids(&self) -> Vec<String> {
        self.viewports.iter().map(|v| v.id.clone()).collect()
    }

    /// Id of the volume associated with a viewport, if any.
    pub fn viewport_volume(&self, viewport_id: &str) -> Result<Option<&str>, EngineError> {
        Ok(self.viewport(viewport_id)?.volume_id.as_deref())
    }

    pub fn viewport_slice(&self, viewport_id: &str) -> Result<usize, EngineError> {
        Ok(self.viewport(viewport_id)?.slice_index)
    }

    pub fn viewport_voi(&self, viewport_id: &str) -> Result<VoiWindow, EngineError> {
        Ok(self.viewport(viewport_id)?.window)
    }

    fn viewport(&self, viewport_id: &str) -> Result<&Viewport, EngineError> {
        self.viewports
            .iter()
            .find(|v| v.id == viewport_id)
            .ok_or_else(|| EngineError::UnknownViewport(viewport_id.to_owned()))
    }

    fn viewport_mut(&mut self, viewport_id: &str) -> Result<&mut Viewport, EngineError> {
        self.viewports
            .iter_mut()
            .find(|v| v.id == viewport_id)
            .ok_or_else(|| EngineError::UnknownViewport(viewport_id.to_owned()))
    }

    fn viewport_volume_handle(&self, viewport: &Viewport) -> Result<&StreamingVolume, EngineError> {
        let volume_id = viewport
            .volume_id
            .as_ref()
            .ok_or_else(|| EngineError::NoVolumeAssociated(viewport.id.clone()))?;
        self.volumes
            .get(volume_id)
            .ok_or_else(|| EngineError::NoVolumeAssociated(viewport.id.clone()))
    }
}
