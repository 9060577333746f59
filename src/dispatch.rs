// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Exit classification hand-off (spec.md §2's "C2 dispatches to C3/C4/C8,
//! or packages an I/O request for C7"). This module owns only the
//! *routing decision* — which subsystem a given [`vmx::VmExitInfo`]
//! belongs to and, for CPUID/MSR, the emulated result — not the actual
//! GPR read-back/write-back, which stays in `vmx::Vcpu` since it needs
//! the live `VmcsBackend`.

use vmx::CpuidConfig;
use vmx::ExitReason;
use vmx::MsrDisposition;
use vmx::MsrIntercept;
use vmx::VmExitInfo;

use ioreq::Direction;
use ioreq::PioRequest;

/// What the caller (the real trap handler, which alone has the live GPRs
/// and VMCS) should do next having had this exit classified.
#[derive(Debug, Clone, PartialEq)]
pub enum ExitAction {
    /// Emulated here; `vmx::emulate_cpuid` already produced the result,
    /// the caller only needs to write it into RAX/RBX/RCX/RDX and advance
    /// RIP (handled by `Vcpu::run`'s `pending_instruction_len`).
    Cpuid(vmx::CpuidResult),
    /// RDMSR/WRMSR: what to do with the access.
    Msr(MsrDisposition),
    /// Unclaimed port I/O: package into the I/O-request channel for the
    /// Service VM device model (C7, spec.md §4.7).
    PortIo(PioRequest),
    /// Nothing in this crate claims the exit; the caller routes it to
    /// whichever other subsystem (vLAPIC EOI/TPR, vIOAPIC/vPIC wire
    /// state, EPT violation -> MMIO request) owns it.
    Unclaimed(ExitReason),
}

/// Decodes the CPU's `IoInstruction` exit qualification (SDM Table on Exit
/// Qualification for I/O Instructions): bits 0-2 size, bit 3 direction,
/// bits 16-31 port.
fn decode_io_qualification(qualification: u64) -> PioRequest {
    let size = (qualification & 0x7) as u8 + 1;
    let direction = if qualification & 0x8 != 0 { Direction::Read } else { Direction::Write };
    let address = ((qualification >> 16) & 0xffff) as u16;
    PioRequest { address, direction, size, value: 0 }
}

/// `exit.reason == Cpuid`: looks up the leaf in `cfg`, falling back to
/// `physical` for anything this hypervisor doesn't claim outright
/// (spec.md §2 supplement, `emulate_cpuid`).
pub fn dispatch_cpuid(cfg: &CpuidConfig, eax: u32, ecx: u32, physical: impl FnOnce(u32, u32) -> vmx::CpuidResult) -> ExitAction {
    ExitAction::Cpuid(vmx::emulate_cpuid(cfg, eax, ecx, physical))
}

pub fn dispatch_rdmsr(intercept: &MsrIntercept, index: u32) -> ExitAction {
    ExitAction::Msr(intercept.rdmsr(index))
}

pub fn dispatch_wrmsr(intercept: &MsrIntercept, index: u32) -> ExitAction {
    ExitAction::Msr(intercept.wrmsr(index))
}

/// The top-level exit classifier (spec.md §4.2's dispatch table).
/// `exit.reason` decides which of the narrower `dispatch_*` helpers
/// applies; everything not named here is returned as `Unclaimed` for the
/// caller to route to vLAPIC/vIOAPIC/vPIC/EPT handling.
pub fn classify(
    exit: &VmExitInfo,
    cpuid_cfg: &CpuidConfig,
    msr_intercept: &MsrIntercept,
    cpuid_regs: (u32, u32),
    msr_index: u32,
    physical_cpuid: impl FnOnce(u32, u32) -> vmx::CpuidResult,
) -> ExitAction {
    match exit.reason {
        ExitReason::Cpuid => dispatch_cpuid(cpuid_cfg, cpuid_regs.0, cpuid_regs.1, physical_cpuid),
        ExitReason::RdMsr => dispatch_rdmsr(msr_intercept, msr_index),
        ExitReason::WrMsr => dispatch_wrmsr(msr_intercept, msr_index),
        ExitReason::IoInstruction => ExitAction::PortIo(decode_io_qualification(exit.qualification)),
        other => ExitAction::Unclaimed(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exit(reason: ExitReason, qualification: u64) -> VmExitInfo {
        VmExitInfo { reason, qualification, instruction_len: 2, interruption_info: 0, interruption_error_code: 0 }
    }

    #[test]
    fn io_instruction_qualification_decodes_port_size_and_direction() {
        // size=4 (0b011), direction=in (bit3=1), port=0x3f8
        let qualification = 0x3f8u64 << 16 | 0b1011;
        let req = decode_io_qualification(qualification);
        assert_eq!(req.address, 0x3f8);
        assert_eq!(req.size, 4);
        assert_eq!(req.direction, Direction::Read);
    }

    #[test]
    fn unclaimed_reasons_pass_through_for_the_caller_to_route() {
        let info = exit(ExitReason::EptViolation, 0);
        let cfg = CpuidConfig { privileged_vm: false, tsc_frequency_khz: 0 };
        let intercept = MsrIntercept::default();
        let action = classify(&info, &cfg, &intercept, (0, 0), 0, |_, _| unreachable!());
        assert!(matches!(action, ExitAction::Unclaimed(ExitReason::EptViolation)));
    }

    #[test]
    fn cpuid_exit_is_classified_and_emulated() {
        let info = exit(ExitReason::Cpuid, 0);
        let cfg = CpuidConfig { privileged_vm: true, tsc_frequency_khz: 1_000_000 };
        let intercept = MsrIntercept::default();
        let action = classify(&info, &cfg, &intercept, (0x4000_0000, 0), 0, |_, _| unreachable!());
        assert!(matches!(action, ExitAction::Cpuid(_)));
    }

    #[test]
    fn rdmsr_exit_reports_the_intercept_disposition() {
        let info = exit(ExitReason::RdMsr, 0);
        let cfg = CpuidConfig { privileged_vm: false, tsc_frequency_khz: 0 };
        let intercept = MsrIntercept::default();
        let action = classify(&info, &cfg, &intercept, (0, 0), vmx::msr::IA32_PAT, |_, _| unreachable!());
        assert_eq!(action, ExitAction::Msr(MsrDisposition::Emulate));
    }
}
