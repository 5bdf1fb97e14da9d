use anyhow::{ensure, Result};
use tracing::trace;

use crate::types::{Frame, BYTES_PER_PIXEL};

/// Target size for scaling `width x height` so its longest side equals
/// `max_side`. The shorter side is truncated and never drops below one pixel.
pub fn fit_within(width: u32, height: u32, max_side: u32) -> (u32, u32) {
    if width > height {
        let other = (height as u64 * max_side as u64 / width as u64) as u32;
        (max_side, other.max(1))
    } else {
        let other = (width as u64 * max_side as u64 / height as u64) as u32;
        (other.max(1), max_side)
    }
}

/// Downscales `frame` so neither side exceeds `max_side`, preserving aspect
/// ratio. Frames that already fit are returned unchanged.
pub fn resize_to_max_side(frame: Frame, max_side: u32) -> Result<Frame> {
    ensure!(max_side > 0, "max side must be positive");
    if frame.width.max(frame.height) <= max_side {
        return Ok(frame);
    }

    let (dst_w, dst_h) = fit_within(frame.width, frame.height, max_side);
    trace!(
        from_w = frame.width,
        from_h = frame.height,
        to_w = dst_w,
        to_h = dst_h,
        "downscaling frame"
    );
    let data = resize_bilinear(
        &frame.data,
        frame.width as usize,
        frame.height as usize,
        dst_w as usize,
        dst_h as usize,
    );
    Frame::new(data, dst_w, dst_h, frame.layout)
}

/// Bilinear resize for packed 4-byte pixels. Every byte lane is filtered
/// independently, so the channel order does not matter.
pub fn resize_bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    let mut dst = vec![0u8; dst_w * dst_h * BYTES_PER_PIXEL];

    for dst_y in 0..dst_h {
        // pixel centres
        let src_yf = (dst_y as f64 + 0.5) * src_h as f64 / dst_h as f64 - 0.5;
        let src_y0 = src_yf.floor().max(0.0) as usize;
        let src_y0 = src_y0.min(src_h - 1);
        let src_y1 = (src_y0 + 1).min(src_h - 1);
        let fy = (src_yf - src_y0 as f64).clamp(0.0, 1.0);

        for dst_x in 0..dst_w {
            let src_xf = (dst_x as f64 + 0.5) * src_w as f64 / dst_w as f64 - 0.5;
            let src_x0 = src_xf.floor().max(0.0) as usize;
            let src_x0 = src_x0.min(src_w - 1);
            let src_x1 = (src_x0 + 1).min(src_w - 1);
            let fx = (src_xf - src_x0 as f64).clamp(0.0, 1.0);

            let di = (dst_y * dst_w + dst_x) * BYTES_PER_PIXEL;
            for c in 0..BYTES_PER_PIXEL {
                let p00 = src[(src_y0 * src_w + src_x0) * BYTES_PER_PIXEL + c] as f64;
                let p10 = src[(src_y0 * src_w + src_x1) * BYTES_PER_PIXEL + c] as f64;
                let p01 = src[(src_y1 * src_w + src_x0) * BYTES_PER_PIXEL + c] as f64;
                let p11 = src[(src_y1 * src_w + src_x1) * BYTES_PER_PIXEL + c] as f64;

                let top = p00 * (1.0 - fx) + p10 * fx;
                let bot = p01 * (1.0 - fx) + p11 * fx;
                let val = top * (1.0 - fy) + bot * fy;

                dst[di + c] = val.round().clamp(0.0, 255.0) as u8;
            }
        }
    }

    dst
}
