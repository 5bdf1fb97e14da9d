use std::fmt;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

/// Bytes per packed pixel. Every supported layout carries four 8-bit channels.
pub const BYTES_PER_PIXEL: usize = 4;

/// Channel order of a packed 32-bit pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelLayout {
    #[default]
    Rgba,
    Argb,
    Bgra,
    Abgr,
}

impl PixelLayout {
    /// Byte offsets of the red, green and blue channels within one pixel.
    pub fn rgb_offsets(self) -> [usize; 3] {
        match self {
            PixelLayout::Rgba => [0, 1, 2],
            PixelLayout::Argb => [1, 2, 3],
            PixelLayout::Bgra => [2, 1, 0],
            PixelLayout::Abgr => [3, 2, 1],
        }
    }

    pub fn alpha_offset(self) -> usize {
        match self {
            PixelLayout::Rgba | PixelLayout::Bgra => 3,
            PixelLayout::Argb | PixelLayout::Abgr => 0,
        }
    }

    /// Resolves the layout of a 32-bit pixel from its storage byte order and
    /// whether alpha occupies the first or last component.
    pub fn from_byte_order(little_endian: bool, alpha_first: bool) -> Self {
        match (little_endian, alpha_first) {
            (true, true) => PixelLayout::Bgra,
            (true, false) => PixelLayout::Abgr,
            (false, true) => PixelLayout::Argb,
            (false, false) => PixelLayout::Rgba,
        }
    }

    /// Matching ffmpeg rawvideo `-pix_fmt` name.
    pub fn ffmpeg_pix_fmt(self) -> &'static str {
        match self {
            PixelLayout::Rgba => "rgba",
            PixelLayout::Argb => "argb",
            PixelLayout::Bgra => "bgra",
            PixelLayout::Abgr => "abgr",
        }
    }

    pub fn from_str_lossy(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "rgba" => Some(PixelLayout::Rgba),
            "argb" => Some(PixelLayout::Argb),
            "bgra" => Some(PixelLayout::Bgra),
            "abgr" => Some(PixelLayout::Abgr),
            _ => None,
        }
    }
}

impl fmt::Display for PixelLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.ffmpeg_pix_fmt())
    }
}

/// Tightly packed 8-bit image, `width * height * 4` bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub layout: PixelLayout,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, layout: PixelLayout) -> Result<Self> {
        ensure!(
            width > 0 && height > 0,
            "frame dimensions must be non-zero, got {width}x{height}"
        );
        let expected = Self::byte_len(width, height);
        ensure!(
            data.len() == expected,
            "frame buffer size mismatch for {width}x{height} {layout}: expected {expected} bytes, got {}",
            data.len()
        );
        Ok(Self {
            data,
            width,
            height,
            layout,
        })
    }

    /// Opaque frame filled with a single RGB colour.
    pub fn solid(width: u32, height: u32, layout: PixelLayout, rgb: [u8; 3]) -> Self {
        let [r, g, b] = layout.rgb_offsets();
        let a = layout.alpha_offset();
        let mut pixel = [0u8; BYTES_PER_PIXEL];
        pixel[r] = rgb[0];
        pixel[g] = rgb[1];
        pixel[b] = rgb[2];
        pixel[a] = 255;
        let data = pixel
            .iter()
            .copied()
            .cycle()
            .take(Self::byte_len(width, height))
            .collect();
        Self {
            data,
            width,
            height,
            layout,
        }
    }

    /// Reorders channels into `layout`. No-op when the layout already matches.
    pub fn into_layout(self, layout: PixelLayout) -> Frame {
        if self.layout == layout {
            return self;
        }
        let src_rgb = self.layout.rgb_offsets();
        let src_a = self.layout.alpha_offset();
        let dst_rgb = layout.rgb_offsets();
        let dst_a = layout.alpha_offset();
        let mut data = vec![0u8; self.data.len()];
        for (dst, src) in data
            .chunks_exact_mut(BYTES_PER_PIXEL)
            .zip(self.data.chunks_exact(BYTES_PER_PIXEL))
        {
            for c in 0..3 {
                dst[dst_rgb[c]] = src[src_rgb[c]];
            }
            dst[dst_a] = src[src_a];
        }
        Frame {
            data,
            width: self.width,
            height: self.height,
            layout,
        }
    }

    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * BYTES_PER_PIXEL
    }

    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    pub fn pixel(&self, x: u32, y: u32) -> &[u8] {
        let start = y as usize * self.stride() + x as usize * BYTES_PER_PIXEL;
        &self.data[start..start + BYTES_PER_PIXEL]
    }

    pub fn rgb_at(&self, x: u32, y: u32) -> [u8; 3] {
        let px = self.pixel(x, y);
        let [r, g, b] = self.layout.rgb_offsets();
        [px[r], px[g], px[b]]
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("layout", &self.layout)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rgb_offsets_cover_all_layouts() {
        assert_eq!(PixelLayout::Rgba.rgb_offsets(), [0, 1, 2]);
        assert_eq!(PixelLayout::Argb.rgb_offsets(), [1, 2, 3]);
        assert_eq!(PixelLayout::Bgra.rgb_offsets(), [2, 1, 0]);
        assert_eq!(PixelLayout::Abgr.rgb_offsets(), [3, 2, 1]);
    }

    #[test]
    fn test_alpha_offset_is_disjoint_from_rgb() {
        for layout in [
            PixelLayout::Rgba,
            PixelLayout::Argb,
            PixelLayout::Bgra,
            PixelLayout::Abgr,
        ] {
            assert!(!layout.rgb_offsets().contains(&layout.alpha_offset()));
        }
    }

    #[test]
    fn test_from_byte_order() {
        assert_eq!(PixelLayout::from_byte_order(true, true), PixelLayout::Bgra);
        assert_eq!(PixelLayout::from_byte_order(true, false), PixelLayout::Abgr);
        assert_eq!(PixelLayout::from_byte_order(false, true), PixelLayout::Argb);
        assert_eq!(PixelLayout::from_byte_order(false, false), PixelLayout::Rgba);
    }

    #[test]
    fn test_frame_new_rejects_wrong_length() {
        let err = Frame::new(vec![0; 10], 2, 2, PixelLayout::Rgba).unwrap_err();
        assert!(err.to_string().contains("expected 16 bytes"));
    }

    #[test]
    fn test_frame_new_rejects_zero_dimension() {
        assert!(Frame::new(Vec::new(), 0, 4, PixelLayout::Rgba).is_err());
    }

    #[test]
    fn test_solid_frame_reads_back_rgb() {
        let frame = Frame::solid(3, 2, PixelLayout::Argb, [10, 20, 30]);
        assert_eq!(frame.data.len(), 24);
        assert_eq!(frame.rgb_at(2, 1), [10, 20, 30]);
        assert_eq!(frame.pixel(0, 0)[0], 255);
    }

    #[test]
    fn test_into_layout_preserves_colour_and_alpha() {
        let mut frame = Frame::solid(2, 2, PixelLayout::Abgr, [1, 2, 3]);
        frame.data[0] = 77; // alpha of the first pixel
        let rgba = frame.into_layout(PixelLayout::Rgba);
        assert_eq!(rgba.layout, PixelLayout::Rgba);
        assert_eq!(&rgba.data[..8], &[1, 2, 3, 77, 1, 2, 3, 255]);
    }
}
