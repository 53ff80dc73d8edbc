//! DMA descriptors and DMA-capable memory.
//!
//! The 2D DMA engine walks a chain of [`DmaDescriptor`]s. This driver only ever uses one
//! descriptor per direction: a linear one on the bitstream side and a block-addressed one on the
//! pixel side.

use std::{
    alloc::{self, Layout},
    fmt, mem,
    ops::{Deref, DerefMut},
    ptr::NonNull,
    slice,
};

use bytemuck::{Pod, Zeroable};

use crate::{
    error::{Error, Result},
    format::Pbyte,
    hal::{CacheSync, SyncDirection, SyncFlags},
};

/// Largest length representable in a descriptor's split 14+14 bit size fields.
pub const MAX_TRANSFER_LEN: usize = (1 << 28) - 1;

/// Largest picture dimension a block descriptor can address.
pub const MAX_DIMENSION: u32 = FIELD_MASK;

const FIELD_MASK: u32 = 0x3FFF;

/// Rounds `size` up to a whole multiple of `align`.
#[inline]
pub fn round_up(size: usize, align: usize) -> usize {
    size.div_ceil(align) * align
}

/// Checks that `size` can serve as a cache line size: a nonzero power of two.
pub fn check_cache_line(size: usize) -> Result<()> {
    if !size.is_power_of_two() {
        return Err(Error::invalid_arg(format!(
            "cache line size {size} is not a power of two"
        )));
    }
    Ok(())
}

/// Rejects buffers the DMA engine cannot write to without corrupting neighboring cache lines.
pub fn check_dma_aligned(buf: &[u8], align: usize) -> Result<()> {
    check_cache_line(align)?;
    let addr = buf.as_ptr() as usize;
    if addr % align != 0 || buf.len() % align != 0 {
        return Err(Error::invalid_arg(format!(
            "buffer at {addr:#x} with size {} is not aligned to {align} bytes",
            buf.len()
        )));
    }
    Ok(())
}

/// A zero-initialized heap buffer whose address and size are multiples of a given alignment.
///
/// Use this for every buffer the codec writes into, so that cache maintenance never touches
/// memory outside of the buffer.
pub struct DmaBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: `DmaBuffer` uniquely owns its allocation, like a `Box<[u8]>`.
unsafe impl Send for DmaBuffer {}
unsafe impl Sync for DmaBuffer {}

impl DmaBuffer {
    /// Allocates at least `size` bytes aligned to `align`, which must be a power of two.
    pub fn alloc(size: usize, align: usize) -> Result<Self> {
        if size == 0 {
            return Err(Error::invalid_arg("cannot allocate an empty DMA buffer"));
        }
        let layout = Layout::from_size_align(round_up(size, align.max(1)), align)
            .map_err(|_| Error::invalid_arg(format!("invalid DMA buffer alignment {align}")))?;
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or_else(|| {
            Error::no_memory(format!("failed to allocate {} byte DMA buffer", layout.size()))
        })?;
        Ok(Self { ptr, layout })
    }

    #[inline]
    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    pub fn align(&self) -> usize {
        self.layout.align()
    }
}

impl Deref for DmaBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `ptr` points to `layout.size()` initialized bytes owned by `self`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl DerefMut for DmaBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: see `deref`; `&mut self` guarantees uniqueness.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.layout.size()) }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `alloc` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

impl fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaBuffer")
            .field("addr", &format_args!("{:#x}", self.addr()))
            .field("len", &self.layout.size())
            .field("align", &self.layout.align())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Cpu,
    Dma,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
    /// The buffer is one contiguous run of bytes.
    Single,
    /// The buffer is a picture walked in `hb` x `vb` blocks.
    Multiple,
}

/// Hardware layout of a 2D DMA descriptor.
///
/// ```text
/// dw0: vb_size[13:0]  hb_length[27:14] err_eof[28] dma2d_en[29] suc_eof[30] owner[31]
/// dw1: va_size[13:0]  ha_length[27:14] pbyte[31:28]
/// dw2: y[13:0]        x[27:14]         mode[28]
/// ```
#[derive(Clone, Copy, Pod, Zeroable, PartialEq, Eq)]
#[repr(C)]
pub struct DmaDescriptor {
    dw0: u32,
    dw1: u32,
    dw2: u32,
    _reserved: u32,
    buffer: u64,
    next: u64,
}

const _: () = assert!(mem::size_of::<DmaDescriptor>() == 32);

#[inline]
fn get(word: u32, shift: u32, width: u32) -> u32 {
    (word >> shift) & ((1 << width) - 1)
}

#[inline]
fn set(word: &mut u32, shift: u32, width: u32, value: u32) {
    let mask = ((1 << width) - 1) << shift;
    *word = (*word & !mask) | ((value << shift) & mask);
}

impl DmaDescriptor {
    /// A 1D descriptor covering `len` contiguous bytes at `buffer`.
    pub fn linear(buffer: usize, len: usize, eof: bool) -> Result<Self> {
        if len == 0 || len > MAX_TRANSFER_LEN {
            return Err(Error::invalid_arg(format!(
                "DMA transfer of {len} bytes exceeds the descriptor limit of {MAX_TRANSFER_LEN}"
            )));
        }
        let low = len as u32 & FIELD_MASK;
        let high = (len >> 14) as u32;

        let mut desc = Self::zeroed();
        desc.set_sizes(low, low, high, high);
        desc.set_pbyte(Pbyte::ONE);
        desc.set_flags(false, eof, BlockMode::Single);
        desc.buffer = buffer as u64;
        Ok(desc)
    }

    /// A 2D descriptor walking a `ha` x `va` picture at `buffer` in `hb` x `vb` blocks.
    pub fn block(buffer: usize, vb: u32, hb: u32, va: u32, ha: u32, pbyte: Pbyte) -> Result<Self> {
        for (name, v) in [("vb", vb), ("hb", hb), ("va", va), ("ha", ha)] {
            if v == 0 || v > FIELD_MASK {
                return Err(Error::invalid_arg(format!(
                    "2D DMA {name} size {v} out of range"
                )));
            }
        }

        let mut desc = Self::zeroed();
        desc.set_sizes(vb, hb, va, ha);
        desc.set_pbyte(pbyte);
        desc.set_flags(true, true, BlockMode::Multiple);
        desc.buffer = buffer as u64;
        Ok(desc)
    }

    fn set_sizes(&mut self, vb: u32, hb: u32, va: u32, ha: u32) {
        set(&mut self.dw0, 0, 14, vb);
        set(&mut self.dw0, 14, 14, hb);
        set(&mut self.dw1, 0, 14, va);
        set(&mut self.dw1, 14, 14, ha);
    }

    fn set_pbyte(&mut self, pbyte: Pbyte) {
        set(&mut self.dw1, 28, 4, u32::from(pbyte.bits()));
    }

    fn set_flags(&mut self, dma2d: bool, eof: bool, mode: BlockMode) {
        set(&mut self.dw0, 29, 1, dma2d as u32);
        set(&mut self.dw0, 30, 1, eof as u32);
        set(&mut self.dw0, 31, 1, 1);
        set(&mut self.dw2, 28, 1, (mode == BlockMode::Multiple) as u32);
    }

    pub fn vb_size(&self) -> u32 {
        get(self.dw0, 0, 14)
    }

    pub fn hb_length(&self) -> u32 {
        get(self.dw0, 14, 14)
    }

    pub fn va_size(&self) -> u32 {
        get(self.dw1, 0, 14)
    }

    pub fn ha_length(&self) -> u32 {
        get(self.dw1, 14, 14)
    }

    pub fn pbyte(&self) -> u8 {
        get(self.dw1, 28, 4) as u8
    }

    pub fn is_2d(&self) -> bool {
        get(self.dw0, 29, 1) != 0
    }

    pub fn suc_eof(&self) -> bool {
        get(self.dw0, 30, 1) != 0
    }

    pub fn err_eof(&self) -> bool {
        get(self.dw0, 28, 1) != 0
    }

    pub fn owner(&self) -> Owner {
        match get(self.dw0, 31, 1) {
            0 => Owner::Cpu,
            _ => Owner::Dma,
        }
    }

    pub fn block_mode(&self) -> BlockMode {
        match get(self.dw2, 28, 1) {
            0 => BlockMode::Single,
            _ => BlockMode::Multiple,
        }
    }

    pub fn buffer(&self) -> usize {
        self.buffer as usize
    }

    /// Address of the next descriptor, 0 if this is the last one.
    pub fn next(&self) -> usize {
        self.next as usize
    }

    /// Number of bytes transferred, as written back by the engine on a 1D receive descriptor.
    pub fn transfer_len(&self) -> usize {
        ((self.ha_length() as usize) << 14) | self.hb_length() as usize
    }

    /// Writes back a completed transfer the way the engine does.
    #[cfg(test)]
    pub(crate) fn complete(&mut self, len: usize) {
        let low = len as u32 & FIELD_MASK;
        let high = (len >> 14) as u32 & FIELD_MASK;
        set(&mut self.dw0, 14, 14, low);
        set(&mut self.dw1, 14, 14, high);
        set(&mut self.dw0, 31, 1, 0);
        set(&mut self.dw0, 30, 1, 1);
    }
}

impl fmt::Debug for DmaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DmaDescriptor")
            .field("vb", &self.vb_size())
            .field("hb", &self.hb_length())
            .field("va", &self.va_size())
            .field("ha", &self.ha_length())
            .field("pbyte", &self.pbyte())
            .field("2d", &self.is_2d())
            .field("eof", &self.suc_eof())
            .field("owner", &self.owner())
            .field("mode", &self.block_mode())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Memory to codec.
    Tx,
    /// Codec to memory.
    Rx,
}

/// The TX and RX descriptors of one engine, each in its own cache-line rounded slot.
pub struct DescriptorPair {
    buf: DmaBuffer,
    slot: usize,
}

impl DescriptorPair {
    pub fn new(cache_line: usize) -> Result<Self> {
        check_cache_line(cache_line)?;
        let slot = round_up(mem::size_of::<DmaDescriptor>(), cache_line);
        let buf = DmaBuffer::alloc(slot * 2, cache_line.max(mem::align_of::<DmaDescriptor>()))?;
        Ok(Self { buf, slot })
    }

    /// Size reserved for each descriptor.
    #[inline]
    pub fn slot_size(&self) -> usize {
        self.slot
    }

    fn offset(&self, dir: Direction) -> usize {
        match dir {
            Direction::Tx => 0,
            Direction::Rx => self.slot,
        }
    }

    pub fn addr(&self, dir: Direction) -> usize {
        self.buf.addr() + self.offset(dir)
    }

    /// Stores `desc` and writes it back to memory, returning its address.
    pub fn write(
        &mut self,
        dir: Direction,
        desc: DmaDescriptor,
        cache: &dyn CacheSync,
    ) -> Result<usize> {
        let offset = self.offset(dir);
        self.buf[offset..][..mem::size_of::<DmaDescriptor>()]
            .copy_from_slice(bytemuck::bytes_of(&desc));
        let addr = self.addr(dir);
        log::trace!("{dir:?} descriptor at {addr:#x}: {desc:?}");
        cache.sync(
            addr,
            self.slot,
            SyncDirection::CpuToDevice,
            SyncFlags::INVALIDATE,
        )?;
        Ok(addr)
    }

    /// Reads a descriptor back after the engine has updated it.
    pub fn read(&self, dir: Direction, cache: &dyn CacheSync) -> Result<DmaDescriptor> {
        cache.sync(
            self.addr(dir),
            self.slot,
            SyncDirection::DeviceToCpu,
            SyncFlags::empty(),
        )?;
        let offset = self.offset(dir);
        Ok(bytemuck::pod_read_unaligned(
            &self.buf[offset..][..mem::size_of::<DmaDescriptor>()],
        ))
    }
}
