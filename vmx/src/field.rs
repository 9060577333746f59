// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VMCS field encodings and their 16/32/64/natural-width taxonomy (SDM
//! Vol. 3C, Appendix B). `VmcsField::encoding` is the value VMREAD/VMWRITE
//! take; `VmcsField::width` tells a caller how many bits of the returned
//! `u64` are meaningful and whether a write should sign- or zero-extend.

/// The four field-width classes the VMX architecture defines. A 16-bit or
/// 32-bit field's upper bits are undefined on read and ignored on write;
/// a natural-width field is 32 bits wide in a 32-bit VMM and 64 in ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldWidth {
    Bits16,
    Bits32,
    Bits64,
    Natural,
}

macro_rules! vmcs_fields {
    ($($variant:ident = ($encoding:literal, $width:ident)),* $(,)?) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum VmcsField {
            $($variant),*
        }

        impl VmcsField {
            pub fn encoding(self) -> u64 {
                match self {
                    $(VmcsField::$variant => $encoding),*
                }
            }

            pub fn width(self) -> FieldWidth {
                match self {
                    $(VmcsField::$variant => FieldWidth::$width),*
                }
            }
        }
    };
}

vmcs_fields! {
    // 16-bit control fields.
    VirtualProcessorId = (0x0000, Bits16),
    PostedIntrNv = (0x0002, Bits16),
    EptpIndex = (0x0004, Bits16),

    // 16-bit guest-state fields.
    GuestEsSelector = (0x0800, Bits16),
    GuestCsSelector = (0x0802, Bits16),
    GuestSsSelector = (0x0804, Bits16),
    GuestDsSelector = (0x0806, Bits16),
    GuestFsSelector = (0x0808, Bits16),
    GuestGsSelector = (0x080a, Bits16),
    GuestLdtrSelector = (0x080c, Bits16),
    GuestTrSelector = (0x080e, Bits16),
    GuestIntrStatus = (0x0810, Bits16),

    // 16-bit host-state fields.
    HostEsSelector = (0x0c00, Bits16),
    HostCsSelector = (0x0c02, Bits16),
    HostSsSelector = (0x0c04, Bits16),
    HostDsSelector = (0x0c06, Bits16),
    HostFsSelector = (0x0c08, Bits16),
    HostGsSelector = (0x0c0a, Bits16),
    HostTrSelector = (0x0c0c, Bits16),

    // 64-bit control fields.
    IoBitmapA = (0x2000, Bits64),
    IoBitmapB = (0x2002, Bits64),
    MsrBitmap = (0x2004, Bits64),
    VmExitMsrStoreAddr = (0x2006, Bits64),
    VmExitMsrLoadAddr = (0x2008, Bits64),
    VmEntryMsrLoadAddr = (0x200a, Bits64),
    TscOffset = (0x2010, Bits64),
    VirtualApicPageAddr = (0x2012, Bits64),
    ApicAccessAddr = (0x2014, Bits64),
    PostedIntrDescAddr = (0x2016, Bits64),
    VmFunctionControls = (0x2018, Bits64),
    EptPointer = (0x201a, Bits64),
    EoiExitBitmap0 = (0x201c, Bits64),
    EoiExitBitmap1 = (0x201e, Bits64),
    EoiExitBitmap2 = (0x2020, Bits64),
    EoiExitBitmap3 = (0x2022, Bits64),
    VmreadBitmap = (0x2026, Bits64),
    VmwriteBitmap = (0x2028, Bits64),
    XssExitingBitmap = (0x202c, Bits64),
    TscMultiplier = (0x2032, Bits64),

    // 64-bit guest-state fields.
    VmcsLinkPointer = (0x2800, Bits64),
    GuestIa32Debugctl = (0x2802, Bits64),
    GuestIa32Pat = (0x2804, Bits64),
    GuestIa32Efer = (0x2806, Bits64),
    GuestIa32PerfGlobalCtrl = (0x2808, Bits64),
    GuestPdpte0 = (0x280a, Bits64),
    GuestPdpte1 = (0x280c, Bits64),
    GuestPdpte2 = (0x280e, Bits64),
    GuestPdpte3 = (0x2810, Bits64),

    // 32-bit control fields.
    PinBasedVmExecControl = (0x4000, Bits32),
    CpuBasedVmExecControl = (0x4002, Bits32),
    ExceptionBitmap = (0x4004, Bits32),
    PageFaultErrorCodeMask = (0x4006, Bits32),
    PageFaultErrorCodeMatch = (0x4008, Bits32),
    Cr3TargetCount = (0x400a, Bits32),
    VmExitControls = (0x400c, Bits32),
    VmExitMsrStoreCount = (0x400e, Bits32),
    VmExitMsrLoadCount = (0x4010, Bits32),
    VmEntryControls = (0x4012, Bits32),
    VmEntryMsrLoadCount = (0x4014, Bits32),
    VmEntryIntrInfoField = (0x4016, Bits32),
    VmEntryExceptionErrorCode = (0x4018, Bits32),
    VmEntryInstructionLen = (0x401a, Bits32),
    TprThreshold = (0x401c, Bits32),
    SecondaryVmExecControl = (0x401e, Bits32),
    PleGap = (0x4020, Bits32),
    PleWindow = (0x4022, Bits32),

    // 32-bit read-only data fields.
    VmInstructionError = (0x4400, Bits32),
    VmExitReason = (0x4402, Bits32),
    VmExitIntrInfo = (0x4404, Bits32),
    VmExitIntrErrorCode = (0x4406, Bits32),
    IdtVectoringInfoField = (0x4408, Bits32),
    IdtVectoringErrorCode = (0x440a, Bits32),
    VmExitInstructionLen = (0x440c, Bits32),
    VmxInstructionInfo = (0x440e, Bits32),

    // 32-bit guest-state fields.
    GuestEsLimit = (0x4800, Bits32),
    GuestCsLimit = (0x4802, Bits32),
    GuestSsLimit = (0x4804, Bits32),
    GuestDsLimit = (0x4806, Bits32),
    GuestFsLimit = (0x4808, Bits32),
    GuestGsLimit = (0x480a, Bits32),
    GuestLdtrLimit = (0x480c, Bits32),
    GuestTrLimit = (0x480e, Bits32),
    GuestGdtrLimit = (0x4810, Bits32),
    GuestIdtrLimit = (0x4812, Bits32),
    GuestEsArBytes = (0x4814, Bits32),
    GuestCsArBytes = (0x4816, Bits32),
    GuestSsArBytes = (0x4818, Bits32),
    GuestDsArBytes = (0x481a, Bits32),
    GuestFsArBytes = (0x481c, Bits32),
    GuestGsArBytes = (0x481e, Bits32),
    GuestLdtrArBytes = (0x4820, Bits32),
    GuestTrArBytes = (0x4822, Bits32),
    GuestInterruptibilityInfo = (0x4824, Bits32),
    GuestActivityState = (0x4826, Bits32),
    GuestSysenterCs = (0x482a, Bits32),
    VmxPreemptionTimerValue = (0x482e, Bits32),

    // 32-bit host-state field.
    HostIa32SysenterCs = (0x4c00, Bits32),

    // Natural-width control fields.
    Cr0GuestHostMask = (0x6000, Natural),
    Cr4GuestHostMask = (0x6002, Natural),
    Cr0ReadShadow = (0x6004, Natural),
    Cr4ReadShadow = (0x6006, Natural),
    Cr3TargetValue0 = (0x6008, Natural),
    Cr3TargetValue1 = (0x600a, Natural),
    Cr3TargetValue2 = (0x600c, Natural),
    Cr3TargetValue3 = (0x600e, Natural),

    // Natural-width read-only data fields.
    ExitQualification = (0x6400, Natural),
    GuestLinearAddress = (0x640a, Natural),

    // Natural-width guest-state fields.
    GuestCr0 = (0x6800, Natural),
    GuestCr3 = (0x6802, Natural),
    GuestCr4 = (0x6804, Natural),
    GuestEsBase = (0x6806, Natural),
    GuestCsBase = (0x6808, Natural),
    GuestSsBase = (0x680a, Natural),
    GuestDsBase = (0x680c, Natural),
    GuestFsBase = (0x680e, Natural),
    GuestGsBase = (0x6810, Natural),
    GuestLdtrBase = (0x6812, Natural),
    GuestTrBase = (0x6814, Natural),
    GuestGdtrBase = (0x6816, Natural),
    GuestIdtrBase = (0x6818, Natural),
    GuestDr7 = (0x681a, Natural),
    GuestRsp = (0x681c, Natural),
    GuestRip = (0x681e, Natural),
    GuestRflags = (0x6820, Natural),
    GuestPendingDbgExceptions = (0x6822, Natural),
    GuestSysenterEsp = (0x6824, Natural),
    GuestSysenterEip = (0x6826, Natural),

    // Natural-width host-state fields.
    HostCr0 = (0x6c00, Natural),
    HostCr3 = (0x6c02, Natural),
    HostCr4 = (0x6c04, Natural),
    HostFsBase = (0x6c06, Natural),
    HostGsBase = (0x6c08, Natural),
    HostTrBase = (0x6c0a, Natural),
    HostGdtrBase = (0x6c0c, Natural),
    HostIdtrBase = (0x6c0e, Natural),
    HostIa32SysenterEsp = (0x6c10, Natural),
    HostIa32SysenterEip = (0x6c12, Natural),
    HostRsp = (0x6c14, Natural),
    HostRip = (0x6c16, Natural),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_rip_is_natural_width() {
        assert_eq!(VmcsField::GuestRip.width(), FieldWidth::Natural);
        assert_eq!(VmcsField::GuestRip.encoding(), 0x681e);
    }

    #[test]
    fn control_field_encodings_match_sdm_appendix_b() {
        assert_eq!(VmcsField::PinBasedVmExecControl.encoding(), 0x4000);
        assert_eq!(VmcsField::SecondaryVmExecControl.encoding(), 0x401e);
        assert_eq!(VmcsField::MsrBitmap.encoding(), 0x2004);
    }
}
