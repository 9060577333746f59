// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VM-exit classification (SDM Vol. 3C, Appendix C, "Basic Exit Reasons").
//! Only the subset this hypervisor's dispatch table in `vcpu.rs` actually
//! branches on is named explicitly; everything else still round-trips
//! through `ExitReason::from_raw`/`as_raw` via its catch-all variant so a
//! reason this crate doesn't yet handle is still representable (and
//! eventually routed to the default "not found" path rather than panicking
//! the dispatch loop).

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    ExceptionOrNmi,
    ExternalInterrupt,
    TripleFault,
    InterruptWindow,
    NmiWindow,
    TaskSwitch,
    Cpuid,
    Hlt,
    Invlpg,
    Rdtsc,
    VmCall,
    CrAccess,
    MovDr,
    IoInstruction,
    RdMsr,
    WrMsr,
    VmEntryFailureInvalidGuestState,
    VmEntryFailureMsrLoading,
    Mwait,
    MonitorTrapFlag,
    Pause,
    TprBelowThreshold,
    ApicAccess,
    VirtualizedEoi,
    GdtrIdtrAccess,
    LdtrTrAccess,
    EptViolation,
    EptMisconfig,
    RdtscP,
    VmxPreemptionTimerExpired,
    Wbinvd,
    Xsetbv,
    ApicWrite,
    Invpcid,
    Other(u32),
}

impl ExitReason {
    pub fn from_raw(raw: u32) -> Self {
        // Bit 31 flags "VM-entry failed"; the low 16 bits are the basic
        // exit reason. Callers that need the entry-failure flag itself
        // read it directly off the raw value before classifying.
        let basic = raw & 0xffff;
        match basic {
            0 => ExitReason::ExceptionOrNmi,
            1 => ExitReason::ExternalInterrupt,
            2 => ExitReason::TripleFault,
            7 => ExitReason::InterruptWindow,
            8 => ExitReason::NmiWindow,
            9 => ExitReason::TaskSwitch,
            10 => ExitReason::Cpuid,
            12 => ExitReason::Hlt,
            14 => ExitReason::Invlpg,
            16 => ExitReason::Rdtsc,
            18 => ExitReason::VmCall,
            28 => ExitReason::CrAccess,
            29 => ExitReason::MovDr,
            30 => ExitReason::IoInstruction,
            31 => ExitReason::RdMsr,
            32 => ExitReason::WrMsr,
            33 => ExitReason::VmEntryFailureInvalidGuestState,
            34 => ExitReason::VmEntryFailureMsrLoading,
            36 => ExitReason::Mwait,
            37 => ExitReason::MonitorTrapFlag,
            40 => ExitReason::Pause,
            43 => ExitReason::TprBelowThreshold,
            44 => ExitReason::ApicAccess,
            45 => ExitReason::VirtualizedEoi,
            46 => ExitReason::GdtrIdtrAccess,
            47 => ExitReason::LdtrTrAccess,
            48 => ExitReason::EptViolation,
            49 => ExitReason::EptMisconfig,
            51 => ExitReason::RdtscP,
            52 => ExitReason::VmxPreemptionTimerExpired,
            54 => ExitReason::Wbinvd,
            55 => ExitReason::Xsetbv,
            56 => ExitReason::ApicWrite,
            58 => ExitReason::Invpcid,
            other => ExitReason::Other(other),
        }
    }

    pub fn is_entry_failure(raw: u32) -> bool {
        raw & (1 << 31) != 0
    }
}

/// Everything C2's dispatch needs about a single VM-exit.
#[derive(Debug, Clone, Copy)]
pub struct VmExitInfo {
    pub reason: ExitReason,
    pub qualification: u64,
    pub instruction_len: u32,
    pub interruption_info: u32,
    pub interruption_error_code: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_reasons() {
        assert_eq!(ExitReason::from_raw(10), ExitReason::Cpuid);
        assert_eq!(ExitReason::from_raw(48), ExitReason::EptViolation);
        assert_eq!(ExitReason::from_raw(999), ExitReason::Other(999));
    }

    #[test]
    fn entry_failure_bit_is_separate_from_basic_reason() {
        assert!(ExitReason::is_entry_failure(0x8000_0021));
        assert_eq!(ExitReason::from_raw(0x8000_0021), ExitReason::Other(0x21));
    }
}
