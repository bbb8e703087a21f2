//! One-shot startup sequencing.
//!
//! [`Bootstrap::run`] executes the fixed initialization pipeline once per
//! instance, in order:
//!
//! 1. re-entry guard
//! 2. rendering subsystem initialization (async)
//! 3. interaction-tooling initialization (async)
//! 4. decoder pool construction (sync)
//! 5. image-identifier resolution and metadata caching (async)
//! 6. rendering engine construction (sync)
//! 7. volume creation from the resolved identifiers (async)
//! 8. viewport binding, axial and sagittal (sync)
//! 9. pixel-load trigger (async, deliberately not awaited)
//! 10. volume-to-viewport association (sync, issued immediately after 9)
//!
//! Every step waits for its predecessor except the overlap of steps 9 and
//! 10: the association is issued while pixel loading is still in flight, so
//! viewports show the volume populating progressively. The returned
//! [`BootstrapOutcome`] carries the load handle for callers that want to
//! join it before treating the display as fully ready.
//!
//! Each `Bootstrap` value runs the pipeline at most once. Re-triggering a
//! completed, running, or failed instance is a no-op returning `Ok(None)`;
//! the lifecycle is observable through [`Bootstrap::state`] and failures
//! carry a typed cause per step instead of surfacing as a stray panic in a
//! background task.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

use crate::decoder::{DecodeError, DecoderConfig, PixelDecoderPool, SliceDecoder};
use crate::dicomweb::{DicomWebError, ImageSource, SeriesLocator, resolve_image_ids};
use crate::engine::{EngineError, RenderingEngine};
use crate::enums::{Orientation, ViewportType};
use crate::gpu::{RenderCore, RenderCoreError};
use crate::tools::{ToolError, ToolRegistry};
use crate::viewport::{SharedSurface, ViewportInput};
use crate::volume_loader::{StreamingVolume, VolumeError, VolumeLoader};

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("rendering subsystem initialization failed: {0}")]
    Rendering(#[from] RenderCoreError),

    #[error("tooling initialization failed: {0}")]
    Tooling(#[from] ToolError),

    #[error("decoder configuration failed: {0}")]
    Decoder(#[from] DecodeError),

    #[error("image identifier resolution failed: {0}")]
    Metadata(#[from] DicomWebError),

    #[error("volume creation failed: {0}")]
    Volume(#[from] VolumeError),

    #[error("viewport association failed: {0}")]
    Association(#[from] EngineError),
}

/// Observable lifecycle of one bootstrap instance. Terminal states never
/// reset; a failed pipeline is not retried through the same instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    NotStarted,
    InProgress,
    Completed,
    Failed,
}

/// Fixed configuration of one bootstrap run.
#[derive(Debug, Clone)]
pub struct BootstrapConfig {
    pub locator: SeriesLocator,
    pub engine_id: String,
    pub volume_id: String,
    pub axial_viewport_id: String,
    pub sagittal_viewport_id: String,
    pub decoder: DecoderConfig,
}

/// Handles produced by a completed bootstrap.
pub struct BootstrapOutcome {
    pub engine: RenderingEngine,
    pub tools: ToolRegistry,
    pub volume: StreamingVolume,
    /// Background pixel-load task, already running when the outcome is
    /// returned. Join it to wait for full pixel availability.
    pub load: JoinHandle<Result<(), VolumeError>>,
}

/// One-shot bootstrap sequencer.
pub struct Bootstrap {
    state: BootstrapState,
}

impl Bootstrap {
    pub fn new() -> Self {
        Self {
            state: BootstrapState::NotStarted,
        }
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// Run the pipeline.
    ///
    /// Call once both display surfaces exist; additional invocations are
    /// guarded no-ops returning `Ok(None)`. On failure the pipeline halts at
    /// the failing step with no partial-state teardown, the state becomes
    /// [`BootstrapState::Failed`], and the typed cause is returned.
    pub async fn run(
        &mut self,
        config: &BootstrapConfig,
        source: Arc<dyn ImageSource>,
        axial_surface: SharedSurface,
        sagittal_surface: SharedSurface,
    ) -> Result<Option<BootstrapOutcome>, BootstrapError> {
        self.guarded(Self::pipeline(
            config,
            source,
            None,
            None,
            axial_surface,
            sagittal_surface,
        ))
        .await
    }

    /// Variant of [`Bootstrap::run`] for embedders that already hold a
    /// rendering core or bring their own decode seam; the pipeline and its
    /// guard behave identically.
    pub async fn run_with(
        &mut self,
        config: &BootstrapConfig,
        source: Arc<dyn ImageSource>,
        core: RenderCore,
        decoder: Arc<dyn SliceDecoder>,
        axial_surface: SharedSurface,
        sagittal_surface: SharedSurface,
    ) -> Result<Option<BootstrapOutcome>, BootstrapError> {
        self.guarded(Self::pipeline(
            config,
            source,
            Some(core),
            Some(decoder),
            axial_surface,
            sagittal_surface,
        ))
        .await
    }

    async fn guarded<F>(&mut self, pipeline: F) -> Result<Option<BootstrapOutcome>, BootstrapError>
    where
        F: Future<Output = Result<BootstrapOutcome, BootstrapError>>,
    {
        if self.state != BootstrapState::NotStarted {
            return Ok(None);
        }
        self.state = BootstrapState::InProgress;

        match pipeline.await {
            Ok(outcome) => {
                self.state = BootstrapState::Completed;
                Ok(Some(outcome))
            }
            Err(error) => {
                self.state = BootstrapState::Failed;
                Err(error)
            }
        }
    }

    async fn pipeline(
        config: &BootstrapConfig,
        source: Arc<dyn ImageSource>,
        core: Option<RenderCore>,
        decoder: Option<Arc<dyn SliceDecoder>>,
        axial_surface: SharedSurface,
        sagittal_surface: SharedSurface,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        let core = match core {
            Some(core) => core,
            None => {
                info!("initializing rendering subsystem");
                RenderCore::init().await?
            }
        };

        info!("initializing interaction tooling");
        let tools = ToolRegistry::init().await?;

        let decoder: Arc<dyn SliceDecoder> = match decoder {
            Some(decoder) => decoder,
            None => {
                info!(workers = config.decoder.max_workers, "configuring decoder");
                Arc::new(PixelDecoderPool::new(config.decoder)?)
            }
        };

        info!(
            study = %config.locator.study_instance_uid,
            series = %config.locator.series_instance_uid,
            "resolving image identifiers"
        );
        let (image_ids, cache) = resolve_image_ids(source.as_ref(), &config.locator).await?;
        info!(count = image_ids.len(), "image identifiers resolved");

        let mut engine = RenderingEngine::new(&config.engine_id, core);

        let loader = VolumeLoader::new(source, decoder, cache);
        let volume = loader.create_volume(&config.volume_id, &image_ids).await?;

        engine.set_viewports(vec![
            ViewportInput {
                viewport_id: config.axial_viewport_id.clone(),
                surface: axial_surface,
                viewport_type: ViewportType::Orthographic,
                orientation: Orientation::Axial,
            },
            ViewportInput {
                viewport_id: config.sagittal_viewport_id.clone(),
                surface: sagittal_surface,
                viewport_type: ViewportType::Orthographic,
                orientation: Orientation::Sagittal,
            },
        ]);

        // Trigger pixel loading and associate immediately; the viewports
        // fill in as slices arrive.
        let load = volume.load();
        engine.set_volumes_for_viewports(
            &volume,
            &[&config.axial_viewport_id, &config.sagittal_viewport_id],
        )?;

        info!(engine_id = %config.engine_id, volume_id = %config.volume_id, "bootstrap complete");
        Ok(BootstrapOutcome {
            engine,
            tools,
            volume,
            load,
        })
    }
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dicomweb::ImageId;
    use crate::viewport::DisplaySurface;
    use async_trait::async_trait;
    use ndarray::Array2;
    use serde_json::{Value, json};
    use std::fmt;
    use std::sync::{Arc, Mutex};
    use tokio::sync::Semaphore;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    fn instance_entry(n: i32) -> Value {
        json!({
            "00080018": { "vr": "UI", "Value": [format!("1.2.{n}")] },
            "00200013": { "vr": "IS", "Value": [n] },
            "00280010": { "vr": "US", "Value": [4] },
            "00280011": { "vr": "US", "Value": [4] },
            "00280030": { "vr": "DS", "Value": ["0.5", "0.5"] },
            "00180050": { "vr": "DS", "Value": [2.5] }
        })
    }

    struct TestArchive {
        entries: Vec<Value>,
        calls: Arc<Mutex<Vec<String>>>,
        // When set, fetches block until permits are added, keeping the
        // load task in flight while the association is observed.
        gate: Option<Arc<Semaphore>>,
    }

    impl TestArchive {
        fn with_instances(count: i32) -> Self {
            Self {
                entries: (1..=count).map(instance_entry).collect(),
                calls: Arc::new(Mutex::new(Vec::new())),
                gate: None,
            }
        }

        fn gated(count: i32, gate: Arc<Semaphore>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::with_instances(count)
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ImageSource for TestArchive {
        async fn query_series(&self, _: &SeriesLocator) -> Result<Vec<Value>, DicomWebError> {
            info!("archive query issued");
            self.calls.lock().unwrap().push("query".into());
            Ok(self.entries.clone())
        }

        async fn fetch_instance(&self, id: &ImageId) -> Result<Vec<u8>, DicomWebError> {
            if let Some(gate) = &self.gate {
                gate.acquire().await.unwrap().forget();
            }
            self.calls.lock().unwrap().push(format!("fetch:{id}"));
            Ok(vec![1])
        }
    }

    // Collects event messages so tests can assert pipeline step order.
    #[derive(Clone)]
    struct EventLog(Arc<Mutex<Vec<String>>>);

    impl<S: tracing::Subscriber> Layer<S> for EventLog {
        fn on_event(&self, event: &tracing::Event<'_>, _: Context<'_, S>) {
            struct Message(Option<String>);

            impl tracing::field::Visit for Message {
                fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn fmt::Debug) {
                    if field.name() == "message" {
                        self.0 = Some(format!("{value:?}"));
                    }
                }
            }

            let mut message = Message(None);
            event.record(&mut message);
            if let Some(text) = message.0 {
                self.0.lock().unwrap().push(text);
            }
        }
    }

    struct FlatDecoder;

    #[async_trait]
    impl SliceDecoder for FlatDecoder {
        async fn decode_frame(&self, bytes: Vec<u8>) -> Result<Array2<u16>, DecodeError> {
            let value = u16::from(*bytes.first().unwrap_or(&0));
            Ok(Array2::from_elem((4, 4), value * 1000))
        }
    }

    fn config() -> BootstrapConfig {
        BootstrapConfig {
            locator: SeriesLocator::new("S1", "SE1", "https://example/dicomweb"),
            engine_id: "myRenderingEngine".into(),
            volume_id: "myVolume".into(),
            axial_viewport_id: "CT_AXIAL".into(),
            sagittal_viewport_id: "CT_SAGITTAL".into(),
            decoder: DecoderConfig::default(),
        }
    }

    async fn run(
        bootstrap: &mut Bootstrap,
        source: Arc<TestArchive>,
    ) -> Result<Option<BootstrapOutcome>, BootstrapError> {
        bootstrap
            .run_with(
                &config(),
                source,
                RenderCore::cpu(),
                Arc::new(FlatDecoder),
                DisplaySurface::new(8, 8),
                DisplaySurface::new(8, 8),
            )
            .await
    }

    #[tokio::test]
    async fn a_valid_series_ends_with_both_viewports_on_one_volume() {
        let source = Arc::new(TestArchive::with_instances(3));
        let mut bootstrap = Bootstrap::new();

        let outcome = run(&mut bootstrap, source.clone())
            .await
            .unwrap()
            .expect("first run executes the pipeline");

        assert_eq!(bootstrap.state(), BootstrapState::Completed);
        assert_eq!(outcome.engine.viewport_count(), 2);
        assert_eq!(outcome.engine.volume_count(), 1);
        assert_eq!(
            outcome.engine.viewport_volume("CT_AXIAL").unwrap(),
            Some("myVolume")
        );
        assert_eq!(
            outcome.engine.viewport_volume("CT_SAGITTAL").unwrap(),
            Some("myVolume")
        );
        assert_eq!(outcome.volume.total(), 3);

        outcome.load.await.unwrap().unwrap();
        assert!(outcome.volume.is_loaded());
        assert_eq!(outcome.volume.read().dim(), (3, 4, 4));
    }

    #[tokio::test]
    async fn metadata_is_resolved_before_any_pixel_fetch() {
        let source = Arc::new(TestArchive::with_instances(3));
        let mut bootstrap = Bootstrap::new();

        let outcome = run(&mut bootstrap, source.clone()).await.unwrap().unwrap();
        outcome.load.await.unwrap().unwrap();

        let calls = source.calls();
        assert_eq!(calls[0], "query");
        assert_eq!(calls.iter().filter(|c| *c == "query").count(), 1);
        assert_eq!(calls.iter().filter(|c| c.starts_with("fetch:")).count(), 3);
    }

    #[tokio::test]
    async fn subsystem_initialization_precedes_the_archive_query() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(EventLog(events.clone())),
        );

        let source = Arc::new(TestArchive::with_instances(2));
        let mut bootstrap = Bootstrap::new();
        let outcome = bootstrap
            .run(
                &config(),
                source,
                DisplaySurface::new(8, 8),
                DisplaySurface::new(8, 8),
            )
            .await
            .unwrap()
            .unwrap();
        // The real decoder cannot parse the stub instance bodies; only the
        // step ordering is under test here.
        let _ = outcome.load.await;

        let events = events.lock().unwrap().clone();
        let position = |needle: &str| {
            events
                .iter()
                .position(|e| e.contains(needle))
                .unwrap_or_else(|| panic!("missing event: {needle}"))
        };
        let query = position("archive query issued");
        assert!(position("initializing rendering subsystem") < query);
        assert!(position("interaction tooling initialized") < query);
        assert!(position("configuring decoder") < query);
        assert!(query < position("image identifiers resolved"));
    }

    #[tokio::test]
    async fn association_is_issued_before_loading_completes() {
        let gate = Arc::new(Semaphore::new(0));
        let source = Arc::new(TestArchive::gated(2, gate.clone()));
        let mut bootstrap = Bootstrap::new();

        let outcome = run(&mut bootstrap, source.clone()).await.unwrap().unwrap();

        // The pipeline has returned with the association in place while
        // every fetch is still blocked on the gate.
        assert_eq!(outcome.volume.loaded(), 0);
        assert_eq!(
            outcome.engine.viewport_volume("CT_AXIAL").unwrap(),
            Some("myVolume")
        );
        assert_eq!(
            outcome.engine.viewport_volume("CT_SAGITTAL").unwrap(),
            Some("myVolume")
        );

        gate.add_permits(2);
        outcome.load.await.unwrap().unwrap();
        assert_eq!(outcome.volume.loaded(), 2);
    }

    #[tokio::test]
    async fn a_second_trigger_is_a_guarded_no_op() {
        let source = Arc::new(TestArchive::with_instances(3));
        let mut bootstrap = Bootstrap::new();

        let outcome = run(&mut bootstrap, source.clone()).await.unwrap().unwrap();
        outcome.load.await.unwrap().unwrap();

        let second = run(&mut bootstrap, source.clone()).await.unwrap();
        assert!(second.is_none());
        assert_eq!(bootstrap.state(), BootstrapState::Completed);

        // No duplicate engine or volume construction: the archive saw
        // exactly one query and the original counts stand.
        assert_eq!(source.calls().iter().filter(|c| *c == "query").count(), 1);
        assert_eq!(outcome.engine.viewport_count(), 2);
        assert_eq!(outcome.engine.volume_count(), 1);
    }

    #[tokio::test]
    async fn an_empty_series_fails_volume_creation() {
        let source = Arc::new(TestArchive::with_instances(0));
        let mut bootstrap = Bootstrap::new();

        let result = run(&mut bootstrap, source.clone()).await;
        assert!(matches!(
            result,
            Err(BootstrapError::Volume(VolumeError::EmptySeries))
        ));
        assert_eq!(bootstrap.state(), BootstrapState::Failed);

        // The empty-series guard sits in volume creation, not in
        // resolution: the query itself was issued.
        assert_eq!(source.calls(), vec!["query".to_owned()]);

        // A failed instance stays terminal.
        let retry = run(&mut bootstrap, source).await.unwrap();
        assert!(retry.is_none());
        assert_eq!(bootstrap.state(), BootstrapState::Failed);
    }

    #[tokio::test]
    async fn archive_failures_surface_as_typed_metadata_errors() {
        struct FailingArchive;

        #[async_trait]
        impl ImageSource for FailingArchive {
            async fn query_series(&self, _: &SeriesLocator) -> Result<Vec<Value>, DicomWebError> {
                Err(DicomWebError::Archive {
                    status: 503,
                    url: "https://example/dicomweb".into(),
                })
            }

            async fn fetch_instance(&self, _: &ImageId) -> Result<Vec<u8>, DicomWebError> {
                Ok(Vec::new())
            }
        }

        let mut bootstrap = Bootstrap::new();
        assert_eq!(bootstrap.state(), BootstrapState::NotStarted);

        let result = bootstrap
            .run_with(
                &config(),
                Arc::new(FailingArchive),
                RenderCore::cpu(),
                Arc::new(FlatDecoder),
                DisplaySurface::new(8, 8),
                DisplaySurface::new(8, 8),
            )
            .await;
        assert!(matches!(result, Err(BootstrapError::Metadata(_))));
        assert_eq!(bootstrap.state(), BootstrapState::Failed);
    }
}
