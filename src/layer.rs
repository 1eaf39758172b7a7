//! A single raster plane of the canvas.
//!
//! DESIGN
//! ======
//! A Layer is a fixed-size RGBA8 buffer plus a cached encoded snapshot.
//! Patch writes are authoritative byte copies (alpha included; erasing is
//! a patch of zero-alpha pixels) clipped to the canvas bounds. Any write
//! that lands at least one pixel invalidates the cache; `encode_snapshot`
//! repopulates it lazily. Encoded snapshots are immutable and shared by
//! `Arc` reference.

use std::sync::Arc;

use crate::codec::{self, CodecError, DecodedImage};

pub struct Layer {
    index: usize,
    width: u32,
    height: u32,
    buf: Vec<u8>,
    snapshot: Option<Arc<Vec<u8>>>,
}

impl Layer {
    /// Create a fully transparent layer.
    #[must_use]
    pub fn new(index: usize, width: u32, height: u32) -> Self {
        Self {
            index,
            width,
            height,
            buf: vec![0; width as usize * height as usize * 4],
            snapshot: None,
        }
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn width(&self) -> u32 {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> u32 {
        self.height
    }

    /// The raw RGBA8 buffer, row-major.
    #[must_use]
    pub fn buf(&self) -> &[u8] {
        &self.buf
    }

    /// Copy a decoded patch into the buffer at `(x, y)`, clipped to the
    /// layer bounds. Pixels are copied verbatim, alpha included. A patch
    /// entirely outside the bounds is a no-op and keeps the cache valid.
    pub fn write(&mut self, patch: &DecodedImage, x: u32, y: u32) {
        if x >= self.width || y >= self.height {
            return;
        }
        let copy_w = patch.width.min(self.width - x) as usize;
        let copy_h = patch.height.min(self.height - y) as usize;
        if copy_w == 0 || copy_h == 0 {
            return;
        }

        let src_stride = patch.width as usize * 4;
        let dst_stride = self.width as usize * 4;
        for row in 0..copy_h {
            let src_off = row * src_stride;
            let dst_off = (y as usize + row) * dst_stride + x as usize * 4;
            self.buf[dst_off..dst_off + copy_w * 4]
                .copy_from_slice(&patch.rgba[src_off..src_off + copy_w * 4]);
        }

        self.snapshot = None;
    }

    /// The cached encoded snapshot, or encode the current buffer and cache
    /// it.
    ///
    /// # Errors
    ///
    /// Returns a codec error if encoding fails.
    pub fn encode_snapshot(&mut self) -> Result<Arc<Vec<u8>>, CodecError> {
        if let Some(snapshot) = &self.snapshot {
            return Ok(Arc::clone(snapshot));
        }
        let encoded = Arc::new(codec::encode(self.width, self.height, &self.buf)?);
        self.snapshot = Some(Arc::clone(&encoded));
        Ok(encoded)
    }

    /// Replace the whole buffer from a restored snapshot. The encoded form
    /// is installed as the cache since it is, by construction, the encoding
    /// of the new buffer.
    ///
    /// # Errors
    ///
    /// Returns `BufferSize` if the buffer does not match the layer
    /// dimensions.
    pub fn load(&mut self, rgba: Vec<u8>, encoded: Arc<Vec<u8>>) -> Result<(), CodecError> {
        if rgba.len() != self.buf.len() {
            return Err(CodecError::BufferSize {
                len: rgba.len(),
                width: self.width,
                height: self.height,
            });
        }
        self.buf = rgba;
        self.snapshot = Some(encoded);
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn cached_snapshot(&self) -> Option<Arc<Vec<u8>>> {
        self.snapshot.clone()
    }
}

#[cfg(test)]
#[path = "layer_test.rs"]
mod tests;
