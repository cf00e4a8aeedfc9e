use core::marker::PhantomData;

use axerrno::{AxResult, ax_err_type};

use crate::{HostPhysAddr, NestedSvmHal};

pub(crate) use memory_addr::PAGE_SIZE_4K as PAGE_SIZE;

/// A 4K-sized contiguous physical memory page, it will deallocate the page
/// automatically on drop.
#[derive(Debug)]
pub struct PhysFrame<H: NestedSvmHal> {
    start_paddr: HostPhysAddr,
    _marker: PhantomData<H>,
}

impl<H: NestedSvmHal> PhysFrame<H> {
    pub fn alloc() -> AxResult<Self> {
        let start_paddr = H::alloc_frame()
            .ok_or_else(|| ax_err_type!(NoMemory, "allocate physical frame failed"))?;
        assert_ne!(start_paddr.as_usize(), 0);
        Ok(Self {
            start_paddr,
            _marker: PhantomData,
        })
    }

    pub fn alloc_zero() -> AxResult<Self> {
        let mut f = Self::alloc()?;
        f.fill(0);
        Ok(f)
    }

    pub fn start_paddr(&self) -> HostPhysAddr {
        self.start_paddr
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        H::phys_to_virt(self.start_paddr()).as_mut_ptr()
    }

    pub fn fill(&mut self, byte: u8) {
        unsafe { core::ptr::write_bytes(self.as_mut_ptr(), byte, PAGE_SIZE) }
    }
}

impl<H: NestedSvmHal> Drop for PhysFrame<H> {
    fn drop(&mut self) {
        H::dealloc_frame(self.start_paddr);
        debug!("[NSVM] deallocated PhysFrame({:#x})", self.start_paddr);
    }
}

/// A contiguous block of physical memory frames that will be automatically
/// deallocated when dropped. Used for hardware structures requiring contiguous
/// physical memory (IOPM, MSRPM).
#[derive(Debug)]
pub struct ContiguousPhysFrames<H: NestedSvmHal> {
    start_paddr: HostPhysAddr,
    frame_count: usize,
    _marker: PhantomData<H>,
}

impl<H: NestedSvmHal> ContiguousPhysFrames<H> {
    pub fn alloc(frame_count: usize) -> AxResult<Self> {
        let start_paddr = H::alloc_contiguous_frames(frame_count)
            .ok_or_else(|| ax_err_type!(NoMemory, "allocate contiguous frames failed"))?;

        assert_ne!(start_paddr.as_usize(), 0);
        Ok(Self {
            start_paddr,
            frame_count,
            _marker: PhantomData,
        })
    }

    pub fn alloc_zero(frame_count: usize) -> AxResult<Self> {
        let mut frames = Self::alloc(frame_count)?;
        frames.fill(0);
        Ok(frames)
    }

    pub fn start_paddr(&self) -> HostPhysAddr {
        self.start_paddr
    }

    pub fn size(&self) -> usize {
        PAGE_SIZE * self.frame_count
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        H::phys_to_virt(self.start_paddr()).as_mut_ptr()
    }

    /// The whole block as a byte slice.
    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.as_mut_ptr(), self.size()) }
    }

    /// The whole block as a mutable byte slice.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.as_mut_ptr(), self.size()) }
    }

    pub fn fill(&mut self, byte: u8) {
        unsafe {
            core::ptr::write_bytes(self.as_mut_ptr(), byte, self.size());
        }
    }
}

impl<H: NestedSvmHal> Drop for ContiguousPhysFrames<H> {
    fn drop(&mut self) {
        H::dealloc_contiguous_frames(self.start_paddr, self.frame_count);
        debug!(
            "[NSVM] deallocated ContiguousPhysFrames({:#x}, {} frames)",
            self.start_paddr, self.frame_count
        );
    }
}
