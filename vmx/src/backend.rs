// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The seam between "VMCS manipulation" and "the actual VMX instructions".
//! Mirrors the donor workspace's own split between `HypervisorX86_64`/
//! `VmX86_64`/`VcpuX86_64` and a concrete backend (there, an ioctl to
//! KVM/WHPX/HAXM; here, the real VMX instruction stream) — the same
//! reasoning applies: everything in `vmcs.rs` and `vcpu.rs` is written
//! once against this trait and exercised in tests against an in-memory
//! double, never against real hardware.

use crate::error::Error;
use crate::error::Result;
use crate::exit::ExitReason;
use crate::exit::VmExitInfo;
use crate::field::VmcsField;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InveptType {
    SingleContext = 1,
    Global = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvvpidType {
    IndividualAddress = 0,
    SingleContext = 1,
    AllContexts = 2,
    SingleContextRetainGlobals = 3,
}

/// One physical CPU's view of the VMX instruction set, scoped to a single
/// VMCS region at a time (matching the hardware's own "current VMCS"
/// concept — `vmptrld` is part of this trait, not implicit).
pub trait VmcsBackend: Send {
    /// `VMCLEAR vmcs_pa`.
    fn vmclear(&mut self, vmcs_pa: u64) -> Result<()>;

    /// `VMPTRLD vmcs_pa`. Subsequent `vmread`/`vmwrite` target this VMCS.
    fn vmptrld(&mut self, vmcs_pa: u64) -> Result<()>;

    fn vmread(&self, field: VmcsField) -> Result<u64>;

    fn vmwrite(&mut self, field: VmcsField, value: u64) -> Result<()>;

    /// `VMLAUNCH`. Only valid the first time a VMCS is entered after
    /// `vmclear`.
    fn vmlaunch(&mut self) -> Result<VmExitInfo>;

    /// `VMRESUME`. Valid for every subsequent entry.
    fn vmresume(&mut self) -> Result<VmExitInfo>;

    fn invept(&mut self, ty: InveptType, eptp: u64) -> Result<()>;

    fn invvpid(&mut self, ty: InvvpidType, vpid: u16) -> Result<()>;

    /// A raw host-side `WRMSR`, outside the guest MSR-intercept bitmap
    /// entirely (e.g. `IA32_PRED_CMD`/`PRED_SET_IBPB` around VM-entry).
    fn wrmsr_host(&mut self, index: u32, value: u64) -> Result<()>;
}

/// Real hardware backend: issues the actual VMX instructions. `unsafe`
/// because every method assumes VMX operation is already enabled
/// (`VMXON` executed) on the calling pCPU and that `vmcs_pa` is a valid,
/// revision-stamped 4 KiB-aligned physical address — invariants owned by
/// `hvcore`'s pCPU bring-up path, not by this type.
#[cfg(target_arch = "x86_64")]
pub struct RealBackend {
    _private: (),
}

#[cfg(target_arch = "x86_64")]
impl RealBackend {
    /// # Safety
    /// The calling pCPU must already be in VMX operation.
    pub unsafe fn new() -> Self {
        RealBackend { _private: () }
    }

    /// Reads `RFLAGS.{CF,ZF}` immediately after a VMX instruction and turns
    /// them into the `VMfailInvalid`/`VMfailValid` distinction the SDM
    /// defines for every VMX instruction's failure reporting.
    fn check_flags(&self, rflags: u64, what: &'static str) -> Result<()> {
        const CF: u64 = 1 << 0;
        const ZF: u64 = 1 << 6;
        if rflags & CF != 0 {
            return Err(Error::FailInvalid(what));
        }
        if rflags & ZF != 0 {
            let err = self.vmread(VmcsField::VmInstructionError).unwrap_or(0) as u32;
            return Err(Error::FailValid(what, err));
        }
        Ok(())
    }
}

#[cfg(target_arch = "x86_64")]
impl VmcsBackend for RealBackend {
    fn vmclear(&mut self, vmcs_pa: u64) -> Result<()> {
        let rflags: u64;
        unsafe {
            std::arch::asm!(
                "vmclear [{0}]",
                "pushfq",
                "pop {1}",
                in(reg) &vmcs_pa,
                out(reg) rflags,
                options(nostack),
            );
        }
        self.check_flags(rflags, "VMCLEAR")
    }

    fn vmptrld(&mut self, vmcs_pa: u64) -> Result<()> {
        let rflags: u64;
        unsafe {
            std::arch::asm!(
                "vmptrld [{0}]",
                "pushfq",
                "pop {1}",
                in(reg) &vmcs_pa,
                out(reg) rflags,
                options(nostack),
            );
        }
        self.check_flags(rflags, "VMPTRLD")
    }

    fn vmread(&self, field: VmcsField) -> Result<u64> {
        let mut value: u64 = 0;
        let rflags: u64;
        unsafe {
            std::arch::asm!(
                "vmread {1}, {0}",
                "pushfq",
                "pop {2}",
                in(reg) field.encoding(),
                lateout(reg) value,
                out(reg) rflags,
                options(nostack, pure, readonly),
            );
        }
        self.check_flags(rflags, "VMREAD")?;
        Ok(value)
    }

    fn vmwrite(&mut self, field: VmcsField, value: u64) -> Result<()> {
        let rflags: u64;
        unsafe {
            std::arch::asm!(
                "vmwrite {0}, {1}",
                "pushfq",
                "pop {2}",
                in(reg) field.encoding(),
                in(reg) value,
                out(reg) rflags,
                options(nostack),
            );
        }
        self.check_flags(rflags, "VMWRITE")
    }

    fn vmlaunch(&mut self) -> Result<VmExitInfo> {
        self.enter(true)
    }

    fn vmresume(&mut self) -> Result<VmExitInfo> {
        self.enter(false)
    }

    fn invept(&mut self, ty: InveptType, eptp: u64) -> Result<()> {
        let descriptor: [u64; 2] = [eptp, 0];
        let rflags: u64;
        unsafe {
            std::arch::asm!(
                "invept {1}, [{0}]",
                "pushfq",
                "pop {2}",
                in(reg) &descriptor,
                in(reg) ty as u64,
                out(reg) rflags,
                options(nostack, readonly),
            );
        }
        self.check_flags(rflags, "INVEPT")
    }

    fn invvpid(&mut self, ty: InvvpidType, vpid: u16) -> Result<()> {
        let descriptor: [u64; 2] = [vpid as u64, 0];
        let rflags: u64;
        unsafe {
            std::arch::asm!(
                "invvpid {1}, [{0}]",
                "pushfq",
                "pop {2}",
                in(reg) &descriptor,
                in(reg) ty as u64,
                out(reg) rflags,
                options(nostack, readonly),
            );
        }
        self.check_flags(rflags, "INVVPID")
    }

    fn wrmsr_host(&mut self, index: u32, value: u64) -> Result<()> {
        unsafe {
            std::arch::asm!(
                "wrmsr",
                in("ecx") index,
                in("eax") value as u32,
                in("edx") (value >> 32) as u32,
                options(nostack),
            );
        }
        Ok(())
    }
}

#[cfg(target_arch = "x86_64")]
impl RealBackend {
    /// Shared tail of `vmlaunch`/`vmresume`: the guest's GPRs are swapped
    /// in and out by `vcpu.rs` immediately around this call, not here —
    /// this only owns the VMX instruction itself and turning its result
    /// into a `VmExitInfo`.
    fn enter(&mut self, first_entry: bool) -> Result<VmExitInfo> {
        let rflags: u64;
        unsafe {
            if first_entry {
                std::arch::asm!("vmlaunch", "pushfq", "pop {0}", out(reg) rflags, options(nostack));
            } else {
                std::arch::asm!("vmresume", "pushfq", "pop {0}", out(reg) rflags, options(nostack));
            }
        }
        self.check_flags(rflags, if first_entry { "VMLAUNCH" } else { "VMRESUME" })?;

        let raw_reason = self.vmread(VmcsField::VmExitReason)? as u32;
        if ExitReason::is_entry_failure(raw_reason) {
            return Err(Error::EntryFailure(raw_reason));
        }
        Ok(VmExitInfo {
            reason: ExitReason::from_raw(raw_reason),
            qualification: self.vmread(VmcsField::ExitQualification)?,
            instruction_len: self.vmread(VmcsField::VmExitInstructionLen)? as u32,
            interruption_info: self.vmread(VmcsField::VmExitIntrInfo)? as u32,
            interruption_error_code: self.vmread(VmcsField::VmExitIntrErrorCode)? as u32,
        })
    }
}

/// In-memory stand-in for a VMCS, used by every test in this workspace
/// that needs `VmcsBackend` without real hardware. `script_exit` lets a
/// test queue up the `VmExitInfo` the next `vmlaunch`/`vmresume` should
/// return, the same role a test double plays for `HypervisorX86_64` in
/// the donor workspace.
#[derive(Default)]
pub struct TestBackend {
    current: Option<u64>,
    fields: std::collections::HashMap<(u64, u64), u64>,
    scripted_exits: std::collections::VecDeque<VmExitInfo>,
    pub host_msr_writes: Vec<(u32, u64)>,
    pub invvpid_calls: Vec<(InvvpidType, u16)>,
}

impl TestBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_exit(&mut self, exit: VmExitInfo) {
        self.scripted_exits.push_back(exit);
    }

    fn require_current(&self) -> Result<u64> {
        self.current.ok_or(Error::NoCurrentVmcs)
    }
}

impl VmcsBackend for TestBackend {
    fn vmclear(&mut self, vmcs_pa: u64) -> Result<()> {
        self.fields.retain(|(vmcs, _), _| *vmcs != vmcs_pa);
        if self.current == Some(vmcs_pa) {
            self.current = None;
        }
        Ok(())
    }

    fn vmptrld(&mut self, vmcs_pa: u64) -> Result<()> {
        self.current = Some(vmcs_pa);
        Ok(())
    }

    fn vmread(&self, field: VmcsField) -> Result<u64> {
        let vmcs = self.require_current()?;
        Ok(*self.fields.get(&(vmcs, field.encoding())).unwrap_or(&0))
    }

    fn vmwrite(&mut self, field: VmcsField, value: u64) -> Result<()> {
        let vmcs = self.require_current()?;
        self.fields.insert((vmcs, field.encoding()), value);
        Ok(())
    }

    fn vmlaunch(&mut self) -> Result<VmExitInfo> {
        self.require_current()?;
        self.scripted_exits
            .pop_front()
            .ok_or(Error::Other("TestBackend: no scripted exit queued".into()))
    }

    fn vmresume(&mut self) -> Result<VmExitInfo> {
        self.vmlaunch()
    }

    fn invept(&mut self, _ty: InveptType, _eptp: u64) -> Result<()> {
        Ok(())
    }

    fn invvpid(&mut self, ty: InvvpidType, vpid: u16) -> Result<()> {
        self.invvpid_calls.push((ty, vpid));
        Ok(())
    }

    fn wrmsr_host(&mut self, index: u32, value: u64) -> Result<()> {
        self.host_msr_writes.push((index, value));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit::ExitReason;

    #[test]
    fn test_backend_round_trips_fields_per_vmcs() {
        let mut backend = TestBackend::new();
        backend.vmptrld(0x1000).unwrap();
        backend.vmwrite(VmcsField::GuestRip, 0xfff0).unwrap();
        backend.vmptrld(0x2000).unwrap();
        assert_eq!(backend.vmread(VmcsField::GuestRip).unwrap(), 0);
        backend.vmptrld(0x1000).unwrap();
        assert_eq!(backend.vmread(VmcsField::GuestRip).unwrap(), 0xfff0);
    }

    #[test]
    fn test_backend_requires_current_vmcs() {
        let backend = TestBackend::new();
        assert_eq!(backend.vmread(VmcsField::GuestRip), Err(Error::NoCurrentVmcs));
    }

    #[test]
    fn test_backend_replays_scripted_exits() {
        let mut backend = TestBackend::new();
        backend.vmptrld(0x1000).unwrap();
        backend.script_exit(VmExitInfo {
            reason: ExitReason::Cpuid,
            qualification: 0,
            instruction_len: 2,
            interruption_info: 0,
            interruption_error_code: 0,
        });
        let exit = backend.vmlaunch().unwrap();
        assert_eq!(exit.reason, ExitReason::Cpuid);
    }
}
