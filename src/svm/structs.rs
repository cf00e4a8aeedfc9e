//! AMD-SVM helper structs
//! https://www.amd.com/content/dam/amd/en/documents/processor-tech-docs/programmer-references/24593.pdf

use axerrno::AxResult;

use crate::frame::{ContiguousPhysFrames, PAGE_SIZE, PhysFrame};
use crate::{HostPhysAddr, NestedSvmHal};

/// Size of an I/O permission map: 64K+3 bits rounded up to three pages.
pub const IOPM_SIZE: usize = 3 * PAGE_SIZE;
/// Size of an MSR permission map: four 2 KiB vectors in two pages.
pub const MSRPM_SIZE: usize = 2 * PAGE_SIZE;
/// Number of I/O ports covered by one 4 KiB page of an IOPM.
pub const IOPM_PORTS_PER_PAGE: u32 = 8 * PAGE_SIZE as u32;

/// Virtual-Machine Control Block (VMCB)
/// One 4 KiB page per vCPU: [control-area | save-area].
#[derive(Debug)]
pub struct VmcbFrame<H: NestedSvmHal> {
    page: PhysFrame<H>,
}

impl<H: NestedSvmHal> VmcbFrame<H> {
    pub fn new() -> AxResult<Self> {
        Ok(Self {
            page: PhysFrame::alloc_zero()?,
        })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.page.start_paddr()
    }

    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.page.as_mut_ptr()
    }
}

// (AMD64 APM Vol.2, Section 15.10)
// The I/O Permissions Map (IOPM) occupies 12 Kbytes of contiguous physical memory.
// The map is structured as a linear array of 64K+3 bits (two 4-Kbyte pages, and the first three bits of a third 4-Kbyte page) and must be aligned on a 4-Kbyte boundary;
#[derive(Debug)]
pub struct IOPm<H: NestedSvmHal> {
    frames: ContiguousPhysFrames<H>, // 3 contiguous frames (12KB)
}

impl<H: NestedSvmHal> IOPm<H> {
    pub fn intercept_all() -> AxResult<Self> {
        let mut frames = ContiguousPhysFrames::<H>::alloc(3)?;
        frames.fill(0xFF); // Set all bits to 1 (intercept)
        Ok(Self { frames })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frames.start_paddr()
    }

    pub fn set_intercept(&mut self, port: u32, intercept: bool) {
        let byte_index = port as usize / 8;
        let bit_offset = (port % 8) as u8;
        let byte = &mut self.frames.as_mut_slice()[byte_index];
        if intercept {
            *byte |= 1 << bit_offset;
        } else {
            *byte &= !(1 << bit_offset);
        }
    }

    pub fn is_intercepted(&self, port: u32) -> bool {
        io_bitmap_test(self.frames.as_slice(), port)
    }
}

/// Test the bit of `port` in an I/O bitmap.
pub fn io_bitmap_test(bitmap: &[u8], port: u32) -> bool {
    bitmap
        .get(port as usize / 8)
        .is_some_and(|byte| byte & (1 << (port % 8)) != 0)
}

/// Locate the read (or write) intercept bit of `msr` in an MSR permission
/// map, as `(byte offset, bit in byte)`. `None` for MSRs the map does not
/// cover.
pub fn msrpm_bit(msr: u32, is_write: bool) -> Option<(usize, u8)> {
    let (segment, msr_low) = if msr <= 0x1fff {
        (0u32, msr)
    } else if (0xc000_0000..=0xc000_1fff).contains(&msr) {
        (1u32, msr & 0x1fff)
    } else if (0xc001_0000..=0xc001_1fff).contains(&msr) {
        (2u32, msr & 0x1fff)
    } else {
        return None;
    };

    let base_offset = (segment * 2048) as usize;
    let byte_in_segment = (msr_low as usize) / 4;
    let bit_pair_offset = ((msr_low & 0b11) * 2) as u8; // 0,2,4,6
    let bit_offset = bit_pair_offset + is_write as u8; // +0 read, +1 write

    Some((base_offset + byte_in_segment, bit_offset))
}

// (AMD64 APM Vol.2, Section 15.10)
// The VMM can intercept RDMSR and WRMSR instructions by means of the SVM MSR permissions map (MSRPM) on a per-MSR basis
// The four separate bit vectors must be packed together and located in two contiguous physical pages of memory.
#[derive(Debug)]
pub struct MSRPm<H: NestedSvmHal> {
    frames: ContiguousPhysFrames<H>,
}

impl<H: NestedSvmHal> MSRPm<H> {
    pub fn passthrough_all() -> AxResult<Self> {
        Ok(Self {
            frames: ContiguousPhysFrames::alloc_zero(2)?,
        })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frames.start_paddr()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.frames.as_slice()
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        self.frames.as_mut_slice()
    }

    pub fn set_intercept(&mut self, msr: u32, is_write: bool, intercept: bool) {
        let Some((byte_index, bit_offset)) = msrpm_bit(msr, is_write) else {
            warn!("MSR {:#x} not covered by the MSRPM", msr);
            return;
        };

        let byte = &mut self.frames.as_mut_slice()[byte_index];
        if intercept {
            *byte |= 1 << bit_offset;
        } else {
            *byte &= !(1 << bit_offset);
        }
    }

    pub fn set_read_intercept(&mut self, msr: u32, intercept: bool) {
        self.set_intercept(msr, false, intercept);
    }

    pub fn set_write_intercept(&mut self, msr: u32, intercept: bool) {
        self.set_intercept(msr, true, intercept);
    }

    /// Whether an access to `msr` traps, `None` if the map does not cover it.
    pub fn is_intercepted(&self, msr: u32, is_write: bool) -> Option<bool> {
        let (byte_index, bit_offset) = msrpm_bit(msr, is_write)?;
        Some(self.as_bytes()[byte_index] & (1 << bit_offset) != 0)
    }

    /// `self = host | guest`, one 64-bit word at a time.
    pub fn merge_from(&mut self, host: &MSRPm<H>, guest: &MSRPm<H>) {
        let words = self.as_bytes_mut().chunks_exact_mut(8);
        let host = host.as_bytes().chunks_exact(8);
        let guest = guest.as_bytes().chunks_exact(8);

        for ((dst, h), g) in words.zip(host).zip(guest) {
            let merged = read_word(h) | read_word(g);
            dst.copy_from_slice(&merged.to_ne_bytes());
        }
    }
}

fn read_word(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    u64::from_ne_bytes(word)
}
