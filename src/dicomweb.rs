//! DICOMweb metadata resolution.
//!
//! [`resolve_image_ids`] is the metadata-fetch step of the bootstrap
//! pipeline: it queries the archive for the instances of one series
//! (QIDO-RS), caches the per-slice metadata needed to allocate a volume, and
//! returns the ordered list of opaque image identifiers that determines
//! slice order. [`DicomWebClient`] is the network-facing implementation of
//! the [`ImageSource`] seam; pixel retrieval (WADO-RS) goes through the same
//! seam so the whole archive can be substituted in tests.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use dicom::core::Tag;
use dicom_dictionary_std::tags;
use reqwest::StatusCode;
use reqwest::header::ACCEPT;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DicomWebError {
    #[error("archive request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("archive returned status {status} for {url}")]
    Archive { status: u16, url: String },
}

/// Immutable study/series/archive triple identifying the dataset to fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesLocator {
    pub study_instance_uid: String,
    pub series_instance_uid: String,
    pub wado_rs_root: String,
}

impl SeriesLocator {
    pub fn new(
        study_instance_uid: impl Into<String>,
        series_instance_uid: impl Into<String>,
        wado_rs_root: impl Into<String>,
    ) -> Self {
        Self {
            study_instance_uid: study_instance_uid.into(),
            series_instance_uid: series_instance_uid.into(),
            wado_rs_root: wado_rs_root.into(),
        }
    }

    fn root(&self) -> &str {
        self.wado_rs_root.trim_end_matches('/')
    }

    /// QIDO-RS instance search URL for this series.
    pub fn instances_url(&self) -> String {
        format!(
            "{}/studies/{}/series/{}/instances",
            self.root(),
            self.study_instance_uid,
            self.series_instance_uid
        )
    }

    /// WADO-RS retrieval URL for one instance of this series.
    pub fn instance_url(&self, sop_instance_uid: &str) -> String {
        format!("{}/{}", self.instances_url(), sop_instance_uid)
    }
}

/// Opaque token referencing one 2D slice within the archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImageId(String);

impl ImageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-slice attributes extracted from the QIDO-RS response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceMetadata {
    pub sop_instance_uid: String,
    pub instance_number: Option<i32>,
    pub rows: u32,
    pub columns: u32,
    pub pixel_spacing: Option<(f32, f32)>,
    pub slice_thickness: Option<f32>,
}

/// Metadata cached during identifier resolution, keyed by image id.
#[derive(Debug, Clone, Default)]
pub struct MetadataCache {
    entries: HashMap<ImageId, SliceMetadata>,
}

impl MetadataCache {
    pub fn insert(&mut self, id: ImageId, metadata: SliceMetadata) {
        self.entries.insert(id, metadata);
    }

    pub fn get(&self, id: &ImageId) -> Option<&SliceMetadata> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Archive seam consumed by the bootstrap pipeline and the volume loader.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// QIDO-RS instance search over one series, returning the raw
    /// DICOM-JSON entries.
    async fn query_series(&self, locator: &SeriesLocator) -> Result<Vec<Value>, DicomWebError>;

    /// WADO-RS retrieval of one instance as an `application/dicom` body.
    async fn fetch_instance(&self, id: &ImageId) -> Result<Vec<u8>, DicomWebError>;
}

/// DICOMweb archive client over HTTP.
pub struct DicomWebClient {
    http: reqwest::Client,
}

impl DicomWebClient {
    pub fn new() -> Result<Self, DicomWebError> {
        Ok(Self {
            http: reqwest::Client::builder().build()?,
        })
    }

    pub fn with_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ImageSource for DicomWebClient {
    async fn query_series(&self, locator: &SeriesLocator) -> Result<Vec<Value>, DicomWebError> {
        let url = locator.instances_url();
        let response = self
            .http
            .get(&url)
            .header(ACCEPT, "application/dicom+json")
            .send()
            .await?;

        // QIDO-RS signals an empty result set with 204 rather than an
        // empty JSON array.
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            return Err(DicomWebError::Archive {
                status: response.status().as_u16(),
                url,
            });
        }
        Ok(response.json().await?)
    }

    async fn fetch_instance(&self, id: &ImageId) -> Result<Vec<u8>, DicomWebError> {
        let response = self
            .http
            .get(id.as_str())
            .header(ACCEPT, "application/dicom")
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DicomWebError::Archive {
                status: response.status().as_u16(),
                url: id.as_str().to_owned(),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Resolve the ordered image identifiers of a series and cache their
/// metadata.
///
/// Instances are ordered by InstanceNumber (entries without one sort last);
/// the returned order determines slice order within the volume. Entries
/// missing the attributes needed to size a volume, or declaring zero-sized
/// images, are skipped with a warning, matching how unreadable files are
/// skipped when loading from disk.
pub async fn resolve_image_ids(
    source: &dyn ImageSource,
    locator: &SeriesLocator,
) -> Result<(Vec<ImageId>, MetadataCache), DicomWebError> {
    let entries = source.query_series(locator).await?;
    debug!(count = entries.len(), "received QIDO-RS instance entries");

    let mut slices: Vec<(SliceMetadata, ImageId)> = entries
        .iter()
        .filter_map(|entry| match parse_instance(entry) {
            Some(metadata) => {
                let id = ImageId::new(locator.instance_url(&metadata.sop_instance_uid));
                Some((metadata, id))
            }
            None => {
                warn!("skipping instance entry with incomplete metadata");
                None
            }
        })
        .collect();

    slices.sort_by_key(|(metadata, _)| metadata.instance_number.unwrap_or(i32::MAX));

    let mut cache = MetadataCache::default();
    let image_ids = slices
        .into_iter()
        .map(|(metadata, id)| {
            cache.insert(id.clone(), metadata);
            id
        })
        .collect();

    Ok((image_ids, cache))
}

pub(crate) fn parse_instance(entry: &Value) -> Option<SliceMetadata> {
    let sop_instance_uid = first_string(entry, tags::SOP_INSTANCE_UID)?;
    let rows = first_u32(entry, tags::ROWS).filter(|&r| r > 0)?;
    let columns = first_u32(entry, tags::COLUMNS).filter(|&c| c > 0)?;
    let instance_number = first_f32(entry, tags::INSTANCE_NUMBER).map(|n| n as i32);
    let pixel_spacing = match multi_f32(entry, tags::PIXEL_SPACING).as_deref() {
        Some([row, column]) => Some((*row, *column)),
        _ => None,
    };
    let slice_thickness = first_f32(entry, tags::SLICE_THICKNESS);

    Some(SliceMetadata {
        sop_instance_uid,
        instance_number,
        rows,
        columns,
        pixel_spacing,
        slice_thickness,
    })
}

fn tag_key(tag: Tag) -> String {
    format!("{:04X}{:04X}", tag.group(), tag.element())
}

fn tag_values(entry: &Value, tag: Tag) -> Option<&Vec<Value>> {
    entry.get(tag_key(tag))?.get("Value")?.as_array()
}

fn first_string(entry: &Value, tag: Tag) -> Option<String> {
    tag_values(entry, tag)?
        .first()?
        .as_str()
        .map(str::to_owned)
}

// DS and IS attributes may arrive as JSON numbers or as strings depending
// on the archive; accept both.
fn value_as_f32(value: &Value) -> Option<f32> {
    value
        .as_f64()
        .map(|v| v as f32)
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
}

fn first_f32(entry: &Value, tag: Tag) -> Option<f32> {
    tag_values(entry, tag)?.first().and_then(value_as_f32)
}

fn first_u32(entry: &Value, tag: Tag) -> Option<u32> {
    first_f32(entry, tag).map(|v| v as u32)
}

fn multi_f32(entry: &Value, tag: Tag) -> Option<Vec<f32>> {
    tag_values(entry, tag)?
        .iter()
        .map(value_as_f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn instance_entry(sop_uid: &str, instance_number: i32) -> Value {
        json!({
            "00080018": { "vr": "UI", "Value": [sop_uid] },
            "00200013": { "vr": "IS", "Value": [instance_number] },
            "00280010": { "vr": "US", "Value": [4] },
            "00280011": { "vr": "US", "Value": [4] },
            "00280030": { "vr": "DS", "Value": ["0.5", "0.5"] },
            "00180050": { "vr": "DS", "Value": [2.5] }
        })
    }

    struct RecordingSource {
        entries: Vec<Value>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ImageSource for RecordingSource {
        async fn query_series(
            &self,
            locator: &SeriesLocator,
        ) -> Result<Vec<Value>, DicomWebError> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("query:{}", locator.series_instance_uid));
            Ok(self.entries.clone())
        }

        async fn fetch_instance(&self, id: &ImageId) -> Result<Vec<u8>, DicomWebError> {
            self.calls.lock().unwrap().push(format!("fetch:{id}"));
            Ok(Vec::new())
        }
    }

    #[test]
    fn parses_numeric_and_string_ds_values() {
        let metadata = parse_instance(&instance_entry("1.2.3", 7)).unwrap();
        assert_eq!(metadata.sop_instance_uid, "1.2.3");
        assert_eq!(metadata.instance_number, Some(7));
        assert_eq!(metadata.rows, 4);
        assert_eq!(metadata.columns, 4);
        assert_eq!(metadata.pixel_spacing, Some((0.5, 0.5)));
        assert_eq!(metadata.slice_thickness, Some(2.5));
    }

    #[test]
    fn rejects_entries_without_sop_instance_uid() {
        let entry = json!({
            "00280010": { "vr": "US", "Value": [4] },
            "00280011": { "vr": "US", "Value": [4] }
        });
        assert!(parse_instance(&entry).is_none());
    }

    #[test]
    fn rejects_entries_with_zero_dimensions() {
        let mut entry = instance_entry("1.2.3", 1);
        entry["00280010"]["Value"][0] = json!(0);
        assert!(parse_instance(&entry).is_none());

        let mut entry = instance_entry("1.2.3", 1);
        entry["00280011"]["Value"][0] = json!(0);
        assert!(parse_instance(&entry).is_none());
    }

    #[test]
    fn locator_builds_qido_and_wado_urls() {
        let locator = SeriesLocator::new("S1", "SE1", "https://example/dicomweb/");
        assert_eq!(
            locator.instances_url(),
            "https://example/dicomweb/studies/S1/series/SE1/instances"
        );
        assert_eq!(
            locator.instance_url("1.2.3"),
            "https://example/dicomweb/studies/S1/series/SE1/instances/1.2.3"
        );
    }

    #[tokio::test]
    async fn resolution_orders_by_instance_number_and_fills_the_cache() {
        let source = RecordingSource {
            entries: vec![
                instance_entry("1.2.2", 2),
                instance_entry("1.2.1", 1),
                instance_entry("1.2.3", 3),
            ],
            calls: Arc::new(Mutex::new(Vec::new())),
        };
        let locator = SeriesLocator::new("S1", "SE1", "https://example/dicomweb");

        let (ids, cache) = resolve_image_ids(&source, &locator).await.unwrap();

        let sop_uids: Vec<&str> = ids
            .iter()
            .map(|id| cache.get(id).unwrap().sop_instance_uid.as_str())
            .collect();
        assert_eq!(sop_uids, ["1.2.1", "1.2.2", "1.2.3"]);
        assert_eq!(cache.len(), 3);
        assert_eq!(
            source.calls.lock().unwrap().as_slice(),
            ["query:SE1".to_owned()]
        );
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped() {
        let source = RecordingSource {
            entries: vec![instance_entry("1.2.1", 1), json!({ "not": "an instance" })],
            calls: Arc::new(Mutex::new(Vec::new())),
        };
        let locator = SeriesLocator::new("S1", "SE1", "https://example/dicomweb");

        let (ids, cache) = resolve_image_ids(&source, &locator).await.unwrap();
        assert_eq!(ids.len(), 1);
        assert_eq!(cache.len(), 1);
    }
}
