//! Grow-on-demand byte arena used by the send path and the receive loop.

use bytes::BytesMut;

/// Headroom added on growth, as a fraction of the requested size (1/5 = 20 %).
const GROWTH_DIVISOR: usize = 5;

/// Byte arena that only ever grows.
///
/// Growth reserves `required + required / 5` bytes. The first `keep` bytes
/// stay in place, so a partially read frame survives a resize.
#[derive(Debug)]
pub struct GrowableBuffer {
    data: BytesMut,
}

impl GrowableBuffer {
    pub fn new(initial: usize) -> Self {
        Self {
            data: BytesMut::zeroed(initial),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Make room for at least `required` bytes, preserving the first `keep`.
    pub fn ensure(&mut self, required: usize, keep: usize) {
        if required <= self.data.len() {
            return;
        }
        let grown = required.saturating_add(required / GROWTH_DIVISOR);
        self.data.truncate(keep.min(self.data.len()));
        self.data.reserve(grown - self.data.len());
        self.data.resize(grown, 0);
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
