use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use dicomweb_viewer::bootstrap::{Bootstrap, BootstrapConfig};
use dicomweb_viewer::decoder::DecoderConfig;
use dicomweb_viewer::dicomweb::{DicomWebClient, SeriesLocator};
use dicomweb_viewer::viewport::DisplaySurface;

const STUDY_INSTANCE_UID: &str =
    "1.3.6.1.4.1.14519.5.2.1.7009.2403.334240657131972136850343327463";
const SERIES_INSTANCE_UID: &str =
    "1.3.6.1.4.1.14519.5.2.1.7009.2403.226151125820845824875394858561";
const WADO_RS_ROOT: &str = "https://d3t6nz73ql33tx.cloudfront.net/dicomweb";

const ENGINE_ID: &str = "myRenderingEngine";
const VOLUME_ID: &str = "myVolume";
const AXIAL_VIEWPORT_ID: &str = "CT_AXIAL";
const SAGITTAL_VIEWPORT_ID: &str = "CT_SAGITTAL";
const SURFACE_SIZE: u32 = 500;
const MAX_DECODE_WORKERS: usize = 1;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = BootstrapConfig {
        locator: SeriesLocator::new(STUDY_INSTANCE_UID, SERIES_INSTANCE_UID, WADO_RS_ROOT),
        engine_id: ENGINE_ID.into(),
        volume_id: VOLUME_ID.into(),
        axial_viewport_id: AXIAL_VIEWPORT_ID.into(),
        sagittal_viewport_id: SAGITTAL_VIEWPORT_ID.into(),
        decoder: DecoderConfig {
            max_workers: MAX_DECODE_WORKERS,
        },
    };

    let axial_surface = DisplaySurface::new(SURFACE_SIZE, SURFACE_SIZE);
    let sagittal_surface = DisplaySurface::new(SURFACE_SIZE, SURFACE_SIZE);
    let archive = Arc::new(DicomWebClient::new()?);

    let mut bootstrap = Bootstrap::new();
    let outcome = bootstrap
        .run(
            &config,
            archive,
            axial_surface.clone(),
            sagittal_surface.clone(),
        )
        .await?
        .context("bootstrap was already triggered")?;

    outcome
        .load
        .await
        .context("pixel load task panicked")??;
    info!(
        slices = outcome.volume.loaded(),
        "volume fully loaded, rendering viewports"
    );

    outcome.engine.render_all().await?;

    let axial = axial_surface
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .snapshot();
    axial.save("axial.png").context("saving axial view")?;
    let sagittal = sagittal_surface
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .snapshot();
    sagittal.save("sagittal.png").context("saving sagittal view")?;

    info!("wrote axial.png and sagittal.png");
    Ok(())
}
