use ndarray::Array5;

use super::{validate_operands, EngineError, EngineResult, SeparableConvolution};
use crate::tensor::Tensor;
use crate::tier::ConvolutionGeometry;

/// Straightforward host implementation of the separable convolution.
///
/// Used as the reference for the GPU engine and as a fallback on machines
/// without a usable adapter. It holds no device resources, so `prepare` only
/// flips the configured flag.
pub struct CpuSeparableConvolution {
    geometry: ConvolutionGeometry,
    prepared: bool,
}

impl CpuSeparableConvolution {
    pub fn new(geometry: ConvolutionGeometry) -> Self {
        Self {
            geometry,
            prepared: false,
        }
    }
}

impl SeparableConvolution for CpuSeparableConvolution {
    fn name(&self) -> &str {
        "cpu"
    }

    fn geometry(&self) -> ConvolutionGeometry {
        self.geometry
    }

    fn prepare(&mut self) -> EngineResult<()> {
        self.prepared = true;
        Ok(())
    }

    fn is_prepared(&self) -> bool {
        self.prepared
    }

    fn apply(
        &mut self,
        input: &Tensor,
        vertical: &Tensor,
        horizontal: &Tensor,
    ) -> EngineResult<Tensor> {
        if !self.prepared {
            return Err(EngineError::NotConfigured);
        }
        let extent = validate_operands(&self.geometry, input, vertical, horizontal)?;

        let src = input.array();
        let kv = vertical.array();
        let kh = horizontal.array();
        let l = extent.filter_length;

        let mut out = Array5::<f32>::zeros(extent.output_shape());
        for c in 0..extent.depth {
            for y in 0..extent.height {
                for x in 0..extent.width {
                    let mut acc = 0.0f32;
                    for i in 0..l {
                        let mut row = 0.0f32;
                        for j in 0..l {
                            row += kh[[0, 0, j, y, x]] * src[[0, 0, c, y + i, x + j]];
                        }
                        acc += kv[[0, 0, i, y, x]] * row;
                    }
                    out[[0, 0, c, y, x]] = acc;
                }
            }
        }
        Ok(Tensor::from_array(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> ConvolutionGeometry {
        ConvolutionGeometry::new(4, 3, 1).unwrap()
    }

    fn ramp(shape: [usize; 5]) -> Tensor {
        let len: usize = shape.iter().product();
        Tensor::from_shape_vec(shape, (0..len).map(|v| v as f32).collect()).unwrap()
    }

    fn one_hot_kernel(shape: [usize; 5], tap: usize) -> Tensor {
        let mut data = Array5::<f32>::zeros(shape);
        data.slice_mut(ndarray::s![0, 0, tap, .., ..]).fill(1.0);
        Tensor::from_array(data)
    }

    #[test]
    fn test_apply_before_prepare_is_not_configured() {
        let g = geometry();
        let mut engine = CpuSeparableConvolution::new(g);
        let err = engine
            .apply(
                &Tensor::zeros(g.input_shape()),
                &Tensor::zeros(g.kernel_shape()),
                &Tensor::zeros(g.kernel_shape()),
            )
            .unwrap_err();
        assert!(matches!(err, EngineError::NotConfigured));
    }

    #[test]
    fn test_one_hot_kernels_select_shifted_input() {
        let g = geometry();
        let mut engine = CpuSeparableConvolution::new(g);
        engine.prepare().unwrap();

        let input = ramp(g.input_shape());
        let v = one_hot_kernel(g.kernel_shape(), 2);
        let h = one_hot_kernel(g.kernel_shape(), 1);
        let out = engine.apply(&input, &v, &h).unwrap();

        assert_eq!(out.shape(), g.output_shape());
        for y in 0..4 {
            for x in 0..4 {
                assert_eq!(
                    out.array()[[0, 0, 0, y, x]],
                    input.array()[[0, 0, 0, y + 2, x + 1]]
                );
            }
        }
    }

    #[test]
    fn test_box_filter_sums_window() {
        let g = ConvolutionGeometry::new(3, 2, 1).unwrap();
        let mut engine = CpuSeparableConvolution::new(g);
        engine.prepare().unwrap();

        let input = Tensor::from_shape_vec(
            [1, 1, 1, 3, 3],
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0],
        )
        .unwrap();
        let ones = Tensor::from_shape_vec([1, 1, 2, 2, 2], vec![1.0; 8]).unwrap();
        let out = engine.apply(&input, &ones, &ones).unwrap();
        assert_eq!(out.as_slice(), &[12.0, 16.0, 24.0, 28.0]);
    }
}
