use alloc::format;
use core::fmt::Debug;

use super::{GeneralRegisters, GuestUserRegs};

/// The registers that changed across a level switch.
///
/// Used to trace what an emulated `VMRUN` or `#VMEXIT` did to the guest
/// register frame.
pub struct GuestUserRegsDiff {
    old: GuestUserRegs,
    new: GuestUserRegs,
}

impl GuestUserRegsDiff {
    const INDEX_RANGE: core::ops::Range<u8> = 0..16;
    const RSP_INDEX: u8 = 4;

    pub fn new(old: GuestUserRegs, new: GuestUserRegs) -> Self {
        GuestUserRegsDiff { old, new }
    }

    /// Returns `true` if no register changed.
    pub fn is_same(&self) -> bool {
        self.old == self.new
    }
}

impl Debug for GuestUserRegsDiff {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let mut debug = f.debug_struct("GuestUserRegsDiff");

        for (name, old, new) in [
            ("rip", self.old.rip, self.new.rip),
            ("rsp", self.old.rsp, self.new.rsp),
            ("rflags", self.old.rflags, self.new.rflags),
        ] {
            if old != new {
                debug.field(name, &format!("{old:#x} -> {new:#x}"));
            }
        }

        for i in Self::INDEX_RANGE {
            if i == Self::RSP_INDEX {
                continue;
            }

            let old = self.old.gpr.get_reg_of_index(i);
            let new = self.new.gpr.get_reg_of_index(i);

            if old != new {
                debug.field(
                    GeneralRegisters::register_name(i),
                    &format!("{old:#x} -> {new:#x}"),
                );
            }
        }

        debug.finish()
    }
}
