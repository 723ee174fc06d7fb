//! Bump arena for layer outputs, and the shared convolution workspace.
//!
//! Every layer's output buffer is a [`Region`] of one `Vec<f32>` owned by the
//! network. Regions are handed out in layer order, so during a forward pass the
//! arena can be peeled front to back: layer `i` reads the region it already
//! wrote and writes the next one, with no aliasing and no unsafe code.
//!
//! The [`Workspace`] is a separate scratch buffer sized to the single largest
//! per-layer requirement. Only the currently executing layer borrows it.

use std::ops::Range;

/// A contiguous run of `f32` inside an [`Arena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub offset: usize,
    pub len: usize,
}

impl Region {
    #[inline(always)]
    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }

    #[inline(always)]
    pub fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Bump allocator over an owned, zero-initialized `f32` buffer.
#[derive(Debug, Default)]
pub struct Arena {
    buf: Vec<f32>,
}

impl Arena {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    /// Reserve `len` zeroed elements at the end of the arena.
    pub fn alloc(&mut self, len: usize) -> Region {
        let offset = self.buf.len();
        self.buf.resize(offset + len, 0.0);
        Region { offset, len }
    }

    pub fn region(&self, region: Region) -> &[f32] {
        &self.buf[region.range()]
    }

    pub fn region_mut(&mut self, region: Region) -> &mut [f32] {
        &mut self.buf[region.range()]
    }

    /// The whole backing buffer, for front-to-back splitting during a pass.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.buf
    }

    /// Drop every allocation.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Elements currently allocated.
    #[inline(always)]
    pub fn used(&self) -> usize {
        self.buf.len()
    }
}

/// Scratch memory shared by all layers, sized in bytes.
#[derive(Debug, Default)]
pub struct Workspace {
    buf: Vec<f32>,
    size_bytes: usize,
}

impl Workspace {
    /// Allocate a workspace able to hold `size_bytes` bytes of `f32`.
    pub fn with_size(size_bytes: usize) -> Self {
        let elems = size_bytes.div_ceil(std::mem::size_of::<f32>());
        Self {
            buf: vec![0.0; elems],
            size_bytes,
        }
    }

    /// Size in bytes, as requested at construction.
    #[inline(always)]
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    #[inline(always)]
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.buf
    }
}
