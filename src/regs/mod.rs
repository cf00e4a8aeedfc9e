mod diff;

pub use diff::GuestUserRegsDiff;

/// General-purpose registers of a guest, in hardware encoding order.
///
/// `RSP` lives in the VMCB on SVM, so its slot is kept only to preserve the
/// register numbering.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GeneralRegisters {
    pub rax: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rbx: u64,
    _unused_rsp: u64,
    pub rbp: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

impl GeneralRegisters {
    /// Names of the registers, indexed by their encoding.
    pub const REGISTER_NAMES: [&'static str; 16] = [
        "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11", "r12",
        "r13", "r14", "r15",
    ];

    /// Returns the name of the register with the given encoding.
    pub fn register_name(index: u8) -> &'static str {
        Self::REGISTER_NAMES[index as usize]
    }

    /// Returns the value of the register with the given encoding.
    ///
    /// # Panics
    ///
    /// Panics if `index` is 4 (`RSP`) or out of range.
    pub fn get_reg_of_index(&self, index: u8) -> u64 {
        match index {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            15 => self.r15,
            _ => panic!("Illegal index of GeneralRegisters {}", index),
        }
    }

    /// Sets the register with the given encoding.
    ///
    /// # Panics
    ///
    /// Panics if `index` is 4 (`RSP`) or out of range.
    pub fn set_reg_of_index(&mut self, index: u8, value: u64) {
        match index {
            0 => self.rax = value,
            1 => self.rcx = value,
            2 => self.rdx = value,
            3 => self.rbx = value,
            5 => self.rbp = value,
            6 => self.rsi = value,
            7 => self.rdi = value,
            8 => self.r8 = value,
            9 => self.r9 = value,
            10 => self.r10 = value,
            11 => self.r11 = value,
            12 => self.r12 = value,
            13 => self.r13 = value,
            14 => self.r14 = value,
            15 => self.r15 = value,
            _ => panic!("Illegal index of GeneralRegisters {}", index),
        }
    }

    /// The MSR index operand of `RDMSR`/`WRMSR`.
    pub fn ecx(&self) -> u32 {
        self.rcx as u32
    }
}

/// Register frame of the guest currently executing on a vcpu.
///
/// These are the authoritative `RIP`/`RSP`/`RFLAGS`/`RAX` values: they may be
/// newer than what the active VMCB holds, e.g. right after an instruction was
/// emulated.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GuestUserRegs {
    pub gpr: GeneralRegisters,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
}

impl GuestUserRegs {
    /// Advance `RIP` past an emulated instruction.
    pub fn advance_rip(&mut self, instr_len: u8) {
        self.rip = self.rip.wrapping_add(instr_len as u64);
    }
}
