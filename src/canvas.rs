//! The authoritative multi-layer canvas.
//!
//! DESIGN
//! ======
//! An ordered sequence of same-sized layers, fixed after construction.
//! `flatten` composites every layer in index order onto opaque white using
//! per-channel alpha blending with round-half-away-from-zero arithmetic.
//! The integer form `(t*2 + 255) / 510` with `t = (255-a)*dst + a*src` is
//! byte-identical to `round((255-a)/255*dst + a/255*src)` for all inputs.

use crate::codec::{self, CodecError};
use crate::layer::Layer;

pub struct Canvas {
    width: u32,
    height: u32,
    layers: Vec<Layer>,
}

impl Canvas {
    /// Create a canvas with `layer_count` transparent layers.
    #[must_use]
    pub fn new(width: u32, height: u32, layer_count: usize) -> Self {
        let layers = (0..layer_count)
            .map(|n| Layer::new(n, width, height))
            .collect();
        Self { width, height, layers }
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    #[must_use]
    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    #[must_use]
    pub fn layer(&self, n: usize) -> Option<&Layer> {
        self.layers.get(n)
    }

    pub fn layer_mut(&mut self, n: usize) -> Option<&mut Layer> {
        self.layers.get_mut(n)
    }

    /// Composite all layers onto opaque white. Returns a fresh RGBA buffer
    /// with alpha forced to 255; no layer is mutated.
    #[must_use]
    pub fn flatten_rgba(&self) -> Vec<u8> {
        let mut out = vec![255u8; self.width as usize * self.height as usize * 4];
        for layer in &self.layers {
            let src = layer.buf();
            for (dst_px, src_px) in out.chunks_exact_mut(4).zip(src.chunks_exact(4)) {
                let a = src_px[3] as u32;
                if a == 0 {
                    continue;
                }
                for c in 0..3 {
                    let t = (255 - a) * dst_px[c] as u32 + a * src_px[c] as u32;
                    dst_px[c] = ((t * 2 + 255) / 510) as u8;
                }
            }
        }
        out
    }

    /// Flatten and encode as a single snapshot image.
    ///
    /// # Errors
    ///
    /// Returns a codec error if encoding fails.
    pub fn flatten(&self) -> Result<Vec<u8>, CodecError> {
        codec::encode(self.width, self.height, &self.flatten_rgba())
    }
}

#[cfg(test)]
#[path = "canvas_test.rs"]
mod tests;
