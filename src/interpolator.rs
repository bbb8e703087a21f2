use ndarray::ArrayView2;

pub(crate) struct Interpolator;

impl Interpolator {
    #[inline]
    pub(crate) fn bilinear_interpolate(slice: &ArrayView2<u16>, y: f32, x: f32) -> f32 {
        let (height, width) = slice.dim();

        let y0 = y.floor() as usize;
        let x0 = x.floor() as usize;
        let y1 = (y0 + 1).min(height - 1);
        let x1 = (x0 + 1).min(width - 1);

        let dy = y - y0 as f32;
        let dx = x - x0 as f32;
        let one_minus_dx = 1.0 - dx;
        let one_minus_dy = 1.0 - dy;

        let v00 = slice[[y0, x0]] as f32;
        let v01 = slice[[y0, x1]] as f32;
        let v10 = slice[[y1, x0]] as f32;
        let v11 = slice[[y1, x1]] as f32;

        let v0 = v00.mul_add(one_minus_dx, v01 * dx);
        let v1 = v10.mul_add(one_minus_dx, v11 * dx);

        v0.mul_add(one_minus_dy, v1 * dy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn interpolates_between_four_neighbors() {
        let slice = array![[0u16, 100], [200, 300]];
        let view = slice.view();

        assert_eq!(Interpolator::bilinear_interpolate(&view, 0.0, 0.0), 0.0);
        assert_eq!(Interpolator::bilinear_interpolate(&view, 0.0, 1.0), 100.0);
        assert_eq!(Interpolator::bilinear_interpolate(&view, 0.5, 0.5), 150.0);
    }

    #[test]
    fn clamps_at_the_last_row_and_column() {
        let slice = array![[10u16, 20], [30, 40]];
        let view = slice.view();

        assert_eq!(Interpolator::bilinear_interpolate(&view, 1.0, 1.0), 40.0);
    }
}
