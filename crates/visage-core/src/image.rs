// crates/visage-core/src/image.rs
//
// Packed-RGBA image buffer with the few pixel operations the frame lifecycle
// needs: mirror flip at insertion, downscale for the detection image, and
// release once the preview has been displayed. Row loops run on rayon.

use rayon::prelude::*;

const BYTES_PER_PIXEL: usize = 4;

/// A packed RGBA image, row-major, no padding between rows.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImageBuffer {
    width:  u32,
    height: u32,
    data:   Vec<u8>,
}

impl ImageBuffer {
    /// Wrap an existing RGBA pixel buffer. `data.len()` must equal
    /// `width * height * 4`.
    pub fn from_rgba(width: u32, height: u32, data: Vec<u8>) -> ImageBuffer {
        assert_eq!(
            data.len(),
            width as usize * height as usize * BYTES_PER_PIXEL,
            "ImageBuffer::from_rgba — buffer is {} bytes, expected {}x{}x4",
            data.len(),
            width,
            height,
        );
        ImageBuffer { width, height, data }
    }

    /// A solid-color buffer. Test and placeholder use.
    pub fn filled(width: u32, height: u32, rgba: [u8; 4]) -> ImageBuffer {
        let data = rgba
            .iter()
            .copied()
            .cycle()
            .take(width as usize * height as usize * BYTES_PER_PIXEL)
            .collect();
        ImageBuffer { width, height, data }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// True once `release()` has dropped the pixel backing (or the buffer
    /// never had pixels).
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drop the pixel backing and zero the dimensions. Held references see an
    /// empty buffer from here on; the memory is returned immediately rather
    /// than when the last handle goes away.
    pub fn release(&mut self) {
        self.width = 0;
        self.height = 0;
        self.data = Vec::new();
    }

    /// Horizontally mirrored copy (left-right flip). Used for preview frames
    /// when mirror mode is on.
    pub fn flipped_horizontal(&self) -> ImageBuffer {
        let w = self.width as usize;
        let row_bytes = w * BYTES_PER_PIXEL;
        let mut out = vec![0u8; self.data.len()];
        out.par_chunks_exact_mut(row_bytes.max(1))
            .zip(self.data.par_chunks_exact(row_bytes.max(1)))
            .for_each(|(dst, src)| {
                for x in 0..w {
                    let s = (w - 1 - x) * BYTES_PER_PIXEL;
                    let d = x * BYTES_PER_PIXEL;
                    dst[d..d + BYTES_PER_PIXEL].copy_from_slice(&src[s..s + BYTES_PER_PIXEL]);
                }
            });
        ImageBuffer {
            width:  self.width,
            height: self.height,
            data:   out,
        }
    }

    /// Nearest-neighbor rescale by `factor` on both axes. Output dimensions
    /// are clamped to at least 1x1. Detection wants speed over fidelity here;
    /// the detector re-walks the native frame once a candidate box is found.
    pub fn downscaled(&self, factor: f64) -> ImageBuffer {
        assert!(factor > 0.0, "ImageBuffer::downscaled — factor must be positive");
        if self.is_empty() {
            return ImageBuffer::default();
        }
        let src_w = self.width as usize;
        let src_h = self.height as usize;
        let out_w = ((self.width as f64 * factor).round() as usize).max(1);
        let out_h = ((self.height as f64 * factor).round() as usize).max(1);
        let row_bytes = out_w * BYTES_PER_PIXEL;

        let mut out = vec![0u8; out_w * out_h * BYTES_PER_PIXEL];
        out.par_chunks_exact_mut(row_bytes)
            .enumerate()
            .for_each(|(y, dst_row)| {
                let sy = (((y as f64 + 0.5) / factor) as usize).min(src_h - 1);
                let src_row = &self.data[sy * src_w * BYTES_PER_PIXEL..];
                for x in 0..out_w {
                    let sx = (((x as f64 + 0.5) / factor) as usize).min(src_w - 1);
                    let s = sx * BYTES_PER_PIXEL;
                    let d = x * BYTES_PER_PIXEL;
                    dst_row[d..d + BYTES_PER_PIXEL]
                        .copy_from_slice(&src_row[s..s + BYTES_PER_PIXEL]);
                }
            });
        ImageBuffer {
            width:  out_w as u32,
            height: out_h as u32,
            data:   out,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filled_has_expected_size() {
        let img = ImageBuffer::filled(4, 3, [1, 2, 3, 4]);
        assert_eq!(img.width(), 4);
        assert_eq!(img.height(), 3);
        assert_eq!(img.data().len(), 4 * 3 * 4);
        assert_eq!(&img.data()[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn flip_reverses_pixels_within_rows() {
        // 2x1: red pixel then blue pixel.
        let img = ImageBuffer::from_rgba(2, 1, vec![255, 0, 0, 255, 0, 0, 255, 255]);
        let flipped = img.flipped_horizontal();
        assert_eq!(flipped.data(), &[0, 0, 255, 255, 255, 0, 0, 255]);
    }

    #[test]
    fn flip_twice_is_identity() {
        let img = ImageBuffer::filled(5, 4, [9, 8, 7, 6]);
        assert_eq!(img.flipped_horizontal().flipped_horizontal(), img);
    }

    #[test]
    fn downscale_halves_dimensions() {
        let img = ImageBuffer::filled(8, 6, [10, 20, 30, 40]);
        let small = img.downscaled(0.5);
        assert_eq!((small.width(), small.height()), (4, 3));
        assert_eq!(&small.data()[..4], &[10, 20, 30, 40]);
    }

    #[test]
    fn downscale_never_collapses_to_zero() {
        let img = ImageBuffer::filled(3, 3, [0, 0, 0, 255]);
        let tiny = img.downscaled(0.01);
        assert_eq!((tiny.width(), tiny.height()), (1, 1));
    }

    #[test]
    fn release_empties_the_buffer() {
        let mut img = ImageBuffer::filled(2, 2, [1, 1, 1, 1]);
        assert!(!img.is_empty());
        img.release();
        assert!(img.is_empty());
        assert_eq!(img.width(), 0);
    }
}
