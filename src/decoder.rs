//! Image-decoding subsystem.
//!
//! Decoding runs on a dedicated worker pool sized once at bootstrap through
//! [`DecoderConfig`]; the demo configuration bounds it to a single worker.
//! Results are handed back to the async caller over a oneshot channel so the
//! runtime is never blocked on pixel-data decompression.

use std::io::Cursor;

use async_trait::async_trait;
use dicom::pixeldata::{ConvertOptions, PixelDecoder, VoiLutOption};
use futures::channel::oneshot;
use ndarray::{Array2, s};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("decode worker pool construction failed: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error("failed to read DICOM object: {0}")]
    Read(#[from] dicom::object::ReadError),

    #[error("pixel data decode failed: {0}")]
    Pixels(String),

    #[error("decode worker dropped before completion")]
    Canceled,
}

/// Decoding subsystem configuration.
#[derive(Debug, Clone, Copy)]
pub struct DecoderConfig {
    pub max_workers: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self { max_workers: 1 }
    }
}

/// Decode seam between the volume loader and the decoding subsystem.
#[async_trait]
pub trait SliceDecoder: Send + Sync {
    /// Decode one `application/dicom` body into a 2D pixel array.
    async fn decode_frame(&self, bytes: Vec<u8>) -> Result<Array2<u16>, DecodeError>;
}

/// DICOM pixel-data decoder over a bounded rayon pool.
pub struct PixelDecoderPool {
    pool: rayon::ThreadPool,
}

impl PixelDecoderPool {
    pub fn new(config: DecoderConfig) -> Result<Self, DecodeError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.max_workers.max(1))
            .build()?;
        info!(workers = config.max_workers.max(1), "decoder pool ready");
        Ok(Self { pool })
    }
}

#[async_trait]
impl SliceDecoder for PixelDecoderPool {
    async fn decode_frame(&self, bytes: Vec<u8>) -> Result<Array2<u16>, DecodeError> {
        let (sender, receiver) = oneshot::channel();
        self.pool.spawn(move || {
            let _ = sender.send(decode_object(&bytes));
        });
        receiver.await.map_err(|_| DecodeError::Canceled)?
    }
}

fn decode_object(bytes: &[u8]) -> Result<Array2<u16>, DecodeError> {
    let object = dicom::object::from_reader(Cursor::new(strip_preamble(bytes)))?;
    let pixel_data = object
        .decode_pixel_data()
        .map_err(|e| DecodeError::Pixels(e.to_string()))?;
    let options = ConvertOptions::new().with_voi_lut(VoiLutOption::First);
    let array = pixel_data
        .to_ndarray_with_options::<u16>(&options)
        .map_err(|e| DecodeError::Pixels(e.to_string()))?;
    // First frame, single channel.
    Ok(array.slice_move(s![0, .., .., 0]))
}

// WADO-RS bodies carry the full part-10 stream; `from_reader` expects the
// 128-byte preamble to be absent.
fn strip_preamble(bytes: &[u8]) -> &[u8] {
    if bytes.len() >= 132 && &bytes[128..132] == b"DICM" {
        &bytes[128..]
    } else {
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preamble_is_stripped_when_present() {
        let mut bytes = vec![0u8; 128];
        bytes.extend_from_slice(b"DICM");
        bytes.extend_from_slice(&[1, 2, 3]);
        assert_eq!(&strip_preamble(&bytes)[..4], b"DICM");
    }

    #[test]
    fn short_or_bare_streams_are_untouched() {
        let bytes = b"DICM rest".to_vec();
        assert_eq!(strip_preamble(&bytes), bytes.as_slice());
    }

    #[test]
    fn default_configuration_uses_one_worker() {
        assert_eq!(DecoderConfig::default().max_workers, 1);
    }

    #[tokio::test]
    async fn garbage_bytes_fail_with_a_read_error() {
        let pool = PixelDecoderPool::new(DecoderConfig::default()).unwrap();
        let result = pool.decode_frame(vec![0u8; 16]).await;
        assert!(matches!(result, Err(DecodeError::Read(_))));
    }
}
