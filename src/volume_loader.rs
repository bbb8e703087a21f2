//! Streaming volume creation from resolved image identifiers.
//!
//! [`VolumeLoader::create_volume`] allocates a pending volume sized from the
//! cached series metadata; [`StreamingVolume::load`] then populates it slice
//! by slice in the background. Viewports may be associated with the volume
//! while loading is still in flight, so the display fills in progressively
//! rather than waiting for an atomic ready transition.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard};

use ndarray::s;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::decoder::{DecodeError, SliceDecoder};
use crate::dicomweb::{DicomWebError, ImageId, ImageSource, MetadataCache};
use crate::volume::Volume;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("series resolved to zero images")]
    EmptySeries,

    #[error("no cached metadata for image {0}")]
    MissingMetadata(ImageId),

    #[error("inconsistent image dimensions across the series")]
    InconsistentDimensions,

    #[error("series metadata declares zero-sized images")]
    ZeroDimension,

    #[error("missing spacing information")]
    MissingSpacing,

    #[error("decoded slice {index} does not match the volume dimensions")]
    ShapeMismatch { index: usize },

    #[error(transparent)]
    Fetch(#[from] DicomWebError),

    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Creates in-memory volumes from image identifiers resolved against an
/// archive.
pub struct VolumeLoader {
    source: Arc<dyn ImageSource>,
    decoder: Arc<dyn SliceDecoder>,
    cache: MetadataCache,
}

impl VolumeLoader {
    pub fn new(
        source: Arc<dyn ImageSource>,
        decoder: Arc<dyn SliceDecoder>,
        cache: MetadataCache,
    ) -> Self {
        Self {
            source,
            decoder,
            cache,
        }
    }

    /// Allocate a pending volume for the given ordered image identifiers.
    ///
    /// The volume is zeroed until [`StreamingVolume::load`] populates it.
    ///
    /// # Errors
    ///
    /// An empty identifier list is rejected with [`VolumeError::EmptySeries`];
    /// missing cache entries, zero-sized or inconsistent slice dimensions,
    /// and absent spacing attributes are rejected before any pixel data is
    /// fetched.
    pub async fn create_volume(
        &self,
        volume_id: &str,
        image_ids: &[ImageId],
    ) -> Result<StreamingVolume, VolumeError> {
        if image_ids.is_empty() {
            return Err(VolumeError::EmptySeries);
        }
        let mut metadata = Vec::with_capacity(image_ids.len());
        for id in image_ids {
            metadata.push(
                self.cache
                    .get(id)
                    .ok_or_else(|| VolumeError::MissingMetadata(id.clone()))?,
            );
        }

        let (rows, columns) = (metadata[0].rows as usize, metadata[0].columns as usize);
        if rows == 0 || columns == 0 {
            return Err(VolumeError::ZeroDimension);
        }
        if metadata
            .iter()
            .any(|m| (m.rows as usize, m.columns as usize) != (rows, columns))
        {
            return Err(VolumeError::InconsistentDimensions);
        }

        let spacing = metadata
            .iter()
            .find_map(|m| {
                let (row, column) = m.pixel_spacing?;
                Some((row, column, m.slice_thickness?))
            })
            .ok_or(VolumeError::MissingSpacing)?;

        let volume = Volume::zeroed(image_ids.len(), rows, columns, spacing);
        info!(
            volume_id,
            slices = image_ids.len(),
            rows,
            columns,
            "allocated pending volume"
        );

        Ok(StreamingVolume {
            inner: Arc::new(StreamingVolumeInner {
                id: volume_id.to_owned(),
                volume: RwLock::new(volume),
                loaded: AtomicUsize::new(0),
                image_ids: image_ids.to_vec(),
                source: self.source.clone(),
                decoder: self.decoder.clone(),
            }),
        })
    }
}

struct StreamingVolumeInner {
    id: String,
    volume: RwLock<Volume>,
    loaded: AtomicUsize,
    image_ids: Vec<ImageId>,
    source: Arc<dyn ImageSource>,
    decoder: Arc<dyn SliceDecoder>,
}

/// Handle to a volume whose pixel data streams in after creation.
///
/// Clones share the same backing volume.
#[derive(Clone)]
pub struct StreamingVolume {
    inner: Arc<StreamingVolumeInner>,
}

impl StreamingVolume {
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Whether two handles share the same backing volume.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }

    /// Number of slices populated so far.
    pub fn loaded(&self) -> usize {
        self.inner.loaded.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.inner.image_ids.len()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded() == self.total()
    }

    /// Read access to the volume in its current (possibly partially loaded)
    /// state.
    pub fn read(&self) -> RwLockReadGuard<'_, Volume> {
        self.inner
            .volume
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Trigger pixel loading.
    ///
    /// Spawns one background task that fetches and decodes each slice in
    /// identifier order. The caller decides whether to join the returned
    /// handle before treating the volume as ready or to let the display
    /// populate progressively.
    pub fn load(&self) -> JoinHandle<Result<(), VolumeError>> {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let (_, rows, columns) = inner
                .volume
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .dim();
            for (index, id) in inner.image_ids.iter().enumerate() {
                let bytes = inner.source.fetch_instance(id).await?;
                let slice = inner.decoder.decode_frame(bytes).await?;
                if slice.dim() != (rows, columns) {
                    return Err(VolumeError::ShapeMismatch { index });
                }
                {
                    let mut volume = inner
                        .volume
                        .write()
                        .unwrap_or_else(|poisoned| poisoned.into_inner());
                    volume.data_mut().slice_mut(s![index, .., ..]).assign(&slice);
                }
                inner.loaded.fetch_add(1, Ordering::SeqCst);
                debug!(volume_id = %inner.id, slice = index, "slice loaded");
            }
            info!(volume_id = %inner.id, slices = inner.image_ids.len(), "volume load complete");
            Ok(())
        })
    }
}
