use crate::enums::Orientation;
use crate::interpolator::Interpolator;

use image::ImageBuffer;
use image::Luma;
use ndarray::Array3;
use ndarray::ArrayView2;
use ndarray::s;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

/// Linear VOI (value-of-interest) window mapping 16-bit sample values to
/// 8-bit display values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoiWindow {
    pub center: f32,
    pub width: f32,
}

impl VoiWindow {
    pub fn new(center: f32, width: f32) -> Self {
        Self { center, width }
    }

    /// Window covering the full 16-bit sample range.
    pub fn full_range() -> Self {
        Self {
            center: 32768.0,
            width: 65536.0,
        }
    }

    pub fn apply(&self, value: u16) -> u8 {
        self.apply_f32(value as f32)
    }

    pub fn apply_f32(&self, value: f32) -> u8 {
        let width = self.width.max(2.0);
        let lower = self.center - 0.5 - (width - 1.0) / 2.0;
        let t = ((value - lower) / (width - 1.0)).clamp(0.0, 1.0);
        (t * 255.0).round() as u8
    }
}

impl Default for VoiWindow {
    fn default() -> Self {
        Self::full_range()
    }
}

/// In-memory 3D reconstruction of a DICOM series.
///
/// The backing array is indexed `(slice, row, column)`; the slice axis is the
/// acquisition order of the series. Spacing is `(row, column, slice)` in
/// millimeters.
#[derive(Debug, Default)]
pub struct Volume {
    data: Array3<u16>,
    spacing: (f32, f32, f32),
}

impl Volume {
    pub fn new(data: Array3<u16>, spacing: (f32, f32, f32)) -> Self {
        Self { data, spacing }
    }

    /// Allocate a zeroed volume, pending pixel population.
    pub fn zeroed(slices: usize, rows: usize, columns: usize, spacing: (f32, f32, f32)) -> Self {
        Self::new(Array3::zeros((slices, rows, columns)), spacing)
    }

    /// Dimensions of the volume as (slices, rows, columns).
    pub fn dim(&self) -> (usize, usize, usize) {
        self.data.dim()
    }

    pub fn spacing(&self) -> (f32, f32, f32) {
        self.spacing
    }

    pub fn data(&self) -> &Array3<u16> {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Array3<u16> {
        &mut self.data
    }

    /// Number of cross-sections available along the given axis.
    pub fn extent(&self, orientation: Orientation) -> usize {
        let (slices, rows, columns) = self.dim();
        match orientation {
            Orientation::Axial => slices,
            Orientation::Coronal => rows,
            Orientation::Sagittal => columns,
        }
    }

    /// 2D view of the cross-section at `index` along the given axis, or
    /// `None` when the index is out of range.
    pub fn slice_view(&self, index: usize, orientation: Orientation) -> Option<ArrayView2<'_, u16>> {
        if index >= self.extent(orientation) {
            return None;
        }
        let view = match orientation {
            Orientation::Axial => self.data.slice(s![index, .., ..]),
            Orientation::Coronal => self.data.slice(s![.., index, ..]),
            Orientation::Sagittal => self.data.slice(s![.., .., index]),
        };
        Some(view)
    }

    /// Render the cross-section at `index` into an 8-bit grayscale image of
    /// `width` × `height` pixels, windowed through `window`.
    ///
    /// The slice is resampled bilinearly when its dimensions differ from the
    /// output dimensions.
    pub fn render_to(
        &self,
        index: usize,
        orientation: Orientation,
        window: VoiWindow,
        width: u32,
        height: u32,
    ) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let slice = self.slice_view(index, orientation)?;
        let (slice_height, slice_width) = slice.dim();
        if slice_height == 0 || slice_width == 0 {
            return None;
        }
        if (slice_width as u32, slice_height as u32) == (width, height) {
            return Self::slice_to_image(&slice, window);
        }
        Self::resample_slice(&slice, window, width, height)
    }

    fn slice_to_image(
        slice: &ArrayView2<'_, u16>,
        window: VoiWindow,
    ) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let (height, width) = slice.dim();
        let pixel_data: Vec<u8> = slice.into_par_iter().map(|&v| window.apply(v)).collect();
        ImageBuffer::from_raw(width as u32, height as u32, pixel_data)
    }

    fn resample_slice(
        slice: &ArrayView2<'_, u16>,
        window: VoiWindow,
        width: u32,
        height: u32,
    ) -> Option<ImageBuffer<Luma<u8>, Vec<u8>>> {
        let (slice_height, slice_width) = slice.dim();

        let pixel_data: Vec<u8> = (0..height)
            .into_par_iter()
            .flat_map(|y| {
                (0..width)
                    .map(|x| {
                        // Normalized coordinates with half-pixel offset, the
                        // same mapping the GPU sampler uses.
                        let norm_x = (x as f32 + 0.5) / width as f32;
                        let norm_y = (y as f32 + 0.5) / height as f32;

                        let src_x = norm_x * slice_width as f32 - 0.5;
                        let src_y = norm_y * slice_height as f32 - 0.5;

                        let src_x = src_x.max(0.0).min((slice_width - 1) as f32);
                        let src_y = src_y.max(0.0).min((slice_height - 1) as f32);

                        let value = Interpolator::bilinear_interpolate(slice, src_y, src_x);
                        window.apply_f32(value)
                    })
                    .collect::<Vec<u8>>()
            })
            .collect();

        ImageBuffer::from_raw(width, height, pixel_data)
    }
}
