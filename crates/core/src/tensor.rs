//! Dense 5-D float tensors and the pure operations the interpolation
//! pipeline runs on them.
//!
//! Axes are `(batch, time, channel, height, width)` in row-major order. Every
//! operation allocates a new result; inputs are never mutated. Shape
//! preconditions are asserted because violating them is a caller bug, not a
//! runtime condition.

use anyhow::{ensure, Context, Result};
use ndarray::{s, Array5, ArrayView5, Axis};

use crate::types::{Frame, PixelLayout, BYTES_PER_PIXEL};

pub type Shape5 = [usize; 5];

const CHANNEL_AXIS: usize = 2;
const HEIGHT_AXIS: usize = 3;
const WIDTH_AXIS: usize = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    data: Array5<f32>,
}

impl Tensor {
    pub fn zeros(shape: Shape5) -> Self {
        Self {
            data: Array5::zeros(shape),
        }
    }

    pub fn from_shape_vec(shape: Shape5, values: Vec<f32>) -> Result<Self> {
        let len = values.len();
        let data = Array5::from_shape_vec(shape, values)
            .with_context(|| format!("cannot reshape {len} values into {shape:?}"))?;
        Ok(Self { data })
    }

    /// Wraps an array, converting it to standard layout if needed.
    pub fn from_array(data: Array5<f32>) -> Self {
        if data.is_standard_layout() {
            Self { data }
        } else {
            Self {
                data: data.as_standard_layout().to_owned(),
            }
        }
    }

    pub fn shape(&self) -> Shape5 {
        let s = self.data.shape();
        [s[0], s[1], s[2], s[3], s[4]]
    }

    pub fn channels(&self) -> usize {
        self.data.len_of(Axis(CHANNEL_AXIS))
    }

    pub fn height(&self) -> usize {
        self.data.len_of(Axis(HEIGHT_AXIS))
    }

    pub fn width(&self) -> usize {
        self.data.len_of(Axis(WIDTH_AXIS))
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn view(&self) -> ArrayView5<'_, f32> {
        self.data.view()
    }

    pub fn array(&self) -> &Array5<f32> {
        &self.data
    }

    /// Contiguous row-major values.
    pub fn as_slice(&self) -> &[f32] {
        self.data
            .as_slice()
            .expect("Tensor is always kept in standard layout")
    }

    pub fn into_array(self) -> Array5<f32> {
        self.data
    }
}

/// Border sizes added around the spatial axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Padding {
    pub left: usize,
    pub right: usize,
    pub top: usize,
    pub bottom: usize,
}

impl Padding {
    pub const ZERO: Padding = Padding {
        left: 0,
        right: 0,
        top: 0,
        bottom: 0,
    };

    pub fn new(left: usize, right: usize, top: usize, bottom: usize) -> Self {
        Self {
            left,
            right,
            top,
            bottom,
        }
    }

    /// Centered padding that grows `height x width` to `side x side`. The odd
    /// pixel, if any, goes to the right/bottom edge. Axes already at or above
    /// `side` get no padding.
    pub fn to_reach(height: usize, width: usize, side: usize) -> Self {
        if height == side && width == side {
            return Self::ZERO;
        }
        let height_pad = side.saturating_sub(height);
        let width_pad = side.saturating_sub(width);
        let left = width_pad / 2;
        let top = height_pad / 2;
        Self {
            left,
            right: width_pad - left,
            top,
            bottom: height_pad - top,
        }
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    pub fn horizontal(&self) -> usize {
        self.left + self.right
    }

    pub fn vertical(&self) -> usize {
        self.top + self.bottom
    }
}

/// Grows the spatial axes by `padding`, filling each border cell with the
/// nearest edge value of the input.
pub fn replicate_pad(input: &Tensor, padding: Padding) -> Tensor {
    let [n, t, c, h, w] = input.shape();
    assert!(h > 0 && w > 0, "cannot pad an empty tensor");
    if padding.is_zero() {
        return input.clone();
    }

    let new_h = h + padding.vertical();
    let new_w = w + padding.horizontal();
    let src = &input.data;
    let out = Array5::from_shape_fn((n, t, c, new_h, new_w), |(b, ti, ch, y, x)| {
        let sy = y.saturating_sub(padding.top).min(h - 1);
        let sx = x.saturating_sub(padding.left).min(w - 1);
        src[[b, ti, ch, sy, sx]]
    });
    Tensor { data: out }
}

/// Removes `padding` from the spatial axes. Inverse of [`replicate_pad`].
pub fn trim(input: &Tensor, padding: Padding) -> Tensor {
    let [_, _, _, h, w] = input.shape();
    assert!(
        padding.vertical() < h && padding.horizontal() < w,
        "trim {padding:?} leaves nothing of a {h}x{w} tensor"
    );
    if padding.is_zero() {
        return input.clone();
    }

    let view = input.data.slice(s![
        ..,
        ..,
        ..,
        padding.top..h - padding.bottom,
        padding.left..w - padding.right
    ]);
    Tensor {
        data: view.to_owned(),
    }
}

/// Concatenates two equally shaped tensors along the first axis whose extent
/// exceeds one, or along the last axis when every extent is one.
pub fn stack(a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(a.shape(), b.shape(), "stack requires identical shapes");
    let shape = a.shape();
    let axis = shape.iter().position(|&d| d > 1).unwrap_or(shape.len() - 1);
    let data = ndarray::concatenate(Axis(axis), &[a.data.view(), b.data.view()])
        .expect("shapes were checked to match");
    Tensor::from_array(data)
}

/// Element-wise sum.
pub fn add(a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(a.shape(), b.shape(), "add requires identical shapes");
    Tensor {
        data: &a.data + &b.data,
    }
}

/// Unpacks the RGB channels of `frame` into a `[1, 1, 3, H, W]` tensor in
/// `[0, 1]`. Alpha is discarded.
pub fn frame_to_tensor(frame: &Frame) -> Result<Tensor> {
    let h = frame.height as usize;
    let w = frame.width as usize;
    let expected = Frame::byte_len(frame.width, frame.height);
    ensure!(
        frame.data.len() == expected,
        "frame buffer holds {} bytes, expected {expected} for {w}x{h}",
        frame.data.len()
    );

    let offsets = frame.layout.rgb_offsets();
    let plane = h * w;
    let mut values = vec![0.0f32; 3 * plane];
    for (i, px) in frame.data.chunks_exact(BYTES_PER_PIXEL).enumerate() {
        for (c, &offset) in offsets.iter().enumerate() {
            values[c * plane + i] = px[offset] as f32 / 255.0;
        }
    }
    Tensor::from_shape_vec([1, 1, 3, h, w], values)
}

/// Packs a `[1, 1, 3, H, W]` tensor into an opaque RGBA frame. Values are
/// scaled by 255, rounded, and clamped to the byte range.
pub fn tensor_to_frame(tensor: &Tensor) -> Result<Frame> {
    let [n, t, c, h, w] = tensor.shape();
    ensure!(
        n == 1 && t == 1 && c == 3,
        "expected a [1,1,3,H,W] tensor, got {:?}",
        tensor.shape()
    );
    ensure!(h > 0 && w > 0, "cannot convert an empty tensor to a frame");

    let plane = h * w;
    let values = tensor.as_slice();
    let mut data = vec![0u8; plane * BYTES_PER_PIXEL];
    for (i, px) in data.chunks_exact_mut(BYTES_PER_PIXEL).enumerate() {
        px[0] = to_byte(values[i]);
        px[1] = to_byte(values[plane + i]);
        px[2] = to_byte(values[2 * plane + i]);
        px[3] = 255;
    }
    Frame::new(data, w as u32, h as u32, PixelLayout::Rgba)
}

fn to_byte(value: f32) -> u8 {
    (value * 255.0 + 0.5).clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arange(shape: Shape5) -> Tensor {
        let len: usize = shape.iter().product();
        Tensor::from_shape_vec(shape, (0..len).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn test_padding_to_reach_splits_odd_remainder() {
        let p = Padding::to_reach(200, 205, 256);
        assert_eq!(p, Padding::new(25, 26, 28, 28));
    }

    #[test]
    fn test_padding_to_reach_exact_side_is_zero() {
        assert!(Padding::to_reach(256, 256, 256).is_zero());
    }

    #[test]
    fn test_padding_never_negative() {
        let p = Padding::to_reach(300, 100, 256);
        assert_eq!(p.vertical(), 0);
        assert_eq!(p.horizontal(), 156);
    }

    #[test]
    fn test_trim_inverts_replicate_pad() {
        let t = arange([1, 1, 3, 4, 5]);
        for p in [
            Padding::new(1, 2, 3, 4),
            Padding::new(0, 7, 0, 1),
            Padding::new(5, 0, 2, 0),
        ] {
            let padded = replicate_pad(&t, p);
            assert_eq!(padded.shape(), [1, 1, 3, 4 + p.vertical(), 5 + p.horizontal()]);
            assert_eq!(trim(&padded, p), t);
        }
    }

    #[test]
    fn test_replicate_pad_borders_copy_nearest_edge() {
        let t = arange([1, 1, 1, 2, 3]);
        let p = Padding::new(2, 1, 1, 2);
        let padded = replicate_pad(&t, p);
        let a = padded.array();
        let src = t.array();

        // corners
        assert_eq!(a[[0, 0, 0, 0, 0]], src[[0, 0, 0, 0, 0]]);
        assert_eq!(a[[0, 0, 0, 0, 5]], src[[0, 0, 0, 0, 2]]);
        assert_eq!(a[[0, 0, 0, 4, 0]], src[[0, 0, 0, 1, 0]]);
        assert_eq!(a[[0, 0, 0, 4, 5]], src[[0, 0, 0, 1, 2]]);

        // edges
        assert_eq!(a[[0, 0, 0, 2, 0]], src[[0, 0, 0, 1, 0]]);
        assert_eq!(a[[0, 0, 0, 0, 3]], src[[0, 0, 0, 0, 1]]);

        // centre is an exact copy
        for y in 0..2 {
            for x in 0..3 {
                assert_eq!(a[[0, 0, 0, y + 1, x + 2]], src[[0, 0, 0, y, x]]);
            }
        }
    }

    #[test]
    fn test_zero_padding_is_identity() {
        let t = arange([1, 1, 3, 2, 2]);
        assert_eq!(replicate_pad(&t, Padding::ZERO), t);
        assert_eq!(trim(&t, Padding::ZERO), t);
    }

    #[test]
    #[should_panic(expected = "leaves nothing")]
    fn test_trim_rejects_full_crop() {
        let t = arange([1, 1, 1, 2, 2]);
        trim(&t, Padding::new(1, 1, 0, 0));
    }

    #[test]
    fn test_stack_doubles_channel_axis() {
        let a = arange([1, 1, 3, 4, 4]);
        let b = Tensor::zeros([1, 1, 3, 4, 4]);
        let stacked = stack(&a, &b);
        assert_eq!(stacked.shape(), [1, 1, 6, 4, 4]);
        assert_eq!(stacked.len(), 2 * a.len());
        assert_eq!(stacked.array()[[0, 0, 2, 3, 3]], a.array()[[0, 0, 2, 3, 3]]);
        assert_eq!(stacked.array()[[0, 0, 5, 3, 3]], 0.0);
    }

    #[test]
    fn test_stack_falls_back_to_last_axis() {
        let a = Tensor::from_shape_vec([1, 1, 1, 1, 1], vec![1.0]).unwrap();
        let b = Tensor::from_shape_vec([1, 1, 1, 1, 1], vec![2.0]).unwrap();
        let stacked = stack(&a, &b);
        assert_eq!(stacked.shape(), [1, 1, 1, 1, 2]);
        assert_eq!(stacked.as_slice(), &[1.0, 2.0]);
    }

    #[test]
    fn test_add_is_elementwise() {
        let a = arange([1, 1, 1, 2, 2]);
        let sum = add(&a, &a);
        assert_eq!(sum.as_slice(), &[0.0, 2.0, 4.0, 6.0]);
    }

    #[test]
    fn test_frame_to_tensor_honours_layout() {
        let frame = Frame::solid(2, 1, PixelLayout::Bgra, [255, 0, 51]);
        let t = frame_to_tensor(&frame).unwrap();
        assert_eq!(t.shape(), [1, 1, 3, 1, 2]);
        assert_eq!(t.as_slice(), &[1.0, 1.0, 0.0, 0.0, 0.2, 0.2]);
    }

    #[test]
    fn test_tensor_to_frame_writes_opaque_rgba() {
        let t = Tensor::from_shape_vec([1, 1, 3, 1, 1], vec![1.2, 0.5, -0.1]).unwrap();
        let frame = tensor_to_frame(&t).unwrap();
        assert_eq!(frame.layout, PixelLayout::Rgba);
        assert_eq!(frame.data, vec![255, 128, 0, 255]);
    }

    #[test]
    fn test_frame_tensor_round_trip_is_lossless() {
        let data: Vec<u8> = (0..4 * 6).map(|v| (v * 11) as u8).collect();
        let mut frame = Frame::new(data, 3, 2, PixelLayout::Rgba).unwrap();
        let back = tensor_to_frame(&frame_to_tensor(&frame).unwrap()).unwrap();
        for px in frame.data.chunks_exact_mut(4) {
            px[3] = 255;
        }
        assert_eq!(back, frame);
    }
}
