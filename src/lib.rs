//! # DICOMweb viewer
//!
//! A demonstration client that loads one DICOM series from a remote
//! DICOMweb archive, reconstructs it into an in-memory 3D volume, and
//! renders two synchronized orthographic cross-sections (axial and
//! sagittal) into fixed-size display surfaces.
//!
//! The crate is an orchestration layer: the interesting part is the
//! [`bootstrap`] sequencer, which runs the fixed startup pipeline exactly
//! once per instance:
//!
//! 1. initialize the rendering subsystem ([`gpu::RenderCore`], with a CPU
//!    fallback for headless environments)
//! 2. initialize the interaction tooling ([`tools::ToolRegistry`])
//! 3. configure the bounded decode worker pool ([`decoder`])
//! 4. resolve the series' image identifiers and cache their metadata
//!    ([`dicomweb`], QIDO-RS)
//! 5. construct a rendering engine and create a pending volume from the
//!    identifiers ([`engine`], [`volume_loader`])
//! 6. bind the axial and sagittal viewports, trigger streaming pixel
//!    loading (WADO-RS), and associate the volume with both viewports
//!
//! Pixel loading is deliberately not awaited before the association, so the
//! display populates progressively; the bootstrap outcome carries the load
//! task handle for callers that want to wait for full availability.
//!
//! # Example
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use dicomweb_viewer::bootstrap::{Bootstrap, BootstrapConfig};
//! # use dicomweb_viewer::decoder::DecoderConfig;
//! # use dicomweb_viewer::dicomweb::{DicomWebClient, SeriesLocator};
//! # use dicomweb_viewer::viewport::DisplaySurface;
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let config = BootstrapConfig {
//!     locator: SeriesLocator::new("<study uid>", "<series uid>", "https://example/dicomweb"),
//!     engine_id: "myRenderingEngine".into(),
//!     volume_id: "myVolume".into(),
//!     axial_viewport_id: "CT_AXIAL".into(),
//!     sagittal_viewport_id: "CT_SAGITTAL".into(),
//!     decoder: DecoderConfig { max_workers: 1 },
//! };
//! let axial = DisplaySurface::new(500, 500);
//! let sagittal = DisplaySurface::new(500, 500);
//!
//! let mut bootstrap = Bootstrap::new();
//! let outcome = bootstrap
//!     .run(&config, Arc::new(DicomWebClient::new()?), axial, sagittal)
//!     .await?
//!     .expect("first trigger runs the pipeline");
//!
//! outcome.load.await??;
//! outcome.engine.render_all().await?;
//! # Ok(())
//! # }
//! ```

pub mod bootstrap;
pub mod decoder;
pub mod dicomweb;
pub mod engine;
pub mod enums;
pub mod gpu;
mod interpolator;
pub mod tools;
pub mod viewport;
pub mod volume;
pub mod volume_loader;
