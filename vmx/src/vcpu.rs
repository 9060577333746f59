// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The per-vCPU register cache and the `run_vcpu` contract (C2). Exit
//! *dispatch* — routing a classified exit to the vLAPIC/vIOAPIC/ioreq/MSR
//! handler that owns it — lives in `hvcore`, which is the only crate that
//! depends on every subsystem crate; this module only owns what's true of
//! every vCPU regardless of which other subsystem ends up handling a
//! given exit.

use bit_field::bitfield;
use data_model::DataInit;
use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

use crate::backend::InvvpidType;
use crate::backend::VmcsBackend;
use crate::error::Error;
use crate::error::Result;
use crate::exit::VmExitInfo;
use crate::field::VmcsField;
use crate::host_caps::HostCaps;
use crate::msr::msr as msr_id;
use crate::vmcs::CurrentVmcsTracker;

/// Index of a general-purpose register within [`GuestCpuState::gprs`] and
/// [`RegisterCache`], in the order the original register-transfer
/// hypercall struct lists them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum Gpr {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

/// Segment descriptor pointer (`GDTR`/`IDTR`), packed exactly as the
/// register-transfer hypercall's wire format: 2-byte limit, 8-byte base,
/// 6 bytes of padding, 16 bytes total.
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct DescriptorPtr {
    pub limit: u16,
    pub base: u64,
    reserved: [u16; 3],
}

/// The wire shape of the set-regs/get-regs hypercall parameter block,
/// kept byte-for-byte compatible with the register-transfer struct this
/// spec was distilled from (SPEC_FULL §2): GPRs, descriptor tables, the
/// fields `write_cached_registers` flushes into the VMCS, and the CS
/// segment's cached access rights/limit/selector plus the other data
/// segment selectors.
#[derive(Debug, Clone, Copy, Default, AsBytes, FromBytes, FromZeroes)]
#[repr(C)]
pub struct GuestCpuState {
    pub gprs: [u64; 16],
    pub gdt: DescriptorPtr,
    pub idt: DescriptorPtr,
    pub rip: u64,
    pub cs_base: u64,
    pub cr0: u64,
    pub cr4: u64,
    pub cr3: u64,
    pub ia32_efer: u64,
    pub rflags: u64,
    reserved_64: [u64; 4],
    pub cs_ar: u32,
    pub cs_limit: u32,
    reserved_32: [u32; 3],
    pub cs_sel: u16,
    pub ss_sel: u16,
    pub ds_sel: u16,
    pub es_sel: u16,
    pub fs_sel: u16,
    pub gs_sel: u16,
    pub tr_sel: u16,
    pub ldtr_sel: u16,
}

/// Real-mode reset state per SDM Vol. 3A §10.1.4, the state every vCPU's
/// register cache starts in before its first `launch_vcpu`.
impl GuestCpuState {
    pub fn reset_state() -> Self {
        let mut state = GuestCpuState {
            rip: 0xfff0,
            cs_base: 0xffff_0000,
            cr0: 1 << 4, // CR0.ET
            rflags: 1 << 1,
            cs_sel: 0xf000,
            cs_ar: 0x9b,
            cs_limit: 0xffff,
            ..Default::default()
        };
        state.ss_sel = 0;
        state.ds_sel = 0;
        state.es_sel = 0;
        state.fs_sel = 0;
        state.gs_sel = 0;
        state
    }
}

#[bitfield]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CachedFields {
    pub gprs: bit_field::BitField16,
    pub rip: bool,
    pub rsp: bool,
    pub rflags: bool,
    pub cr0: bool,
    pub cr3: bool,
    pub cr4: bool,
    pub efer: bool,
    reserved: bit_field::BitField41,
}

/// A vCPU's logical register state plus the dirty-tracking spec.md §3
/// describes: `reg_cached` (read back from the VMCS since the last
/// entry) and `reg_updated` (written by emulation, not yet flushed).
pub struct RegisterCache {
    state: GuestCpuState,
    cached: CachedFields,
    updated: CachedFields,
}

impl Default for RegisterCache {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterCache {
    pub fn new() -> Self {
        RegisterCache {
            state: GuestCpuState::reset_state(),
            cached: CachedFields::new(),
            updated: CachedFields::new(),
        }
    }

    pub fn gpr(&self, reg: Gpr) -> u64 {
        self.state.gprs[reg as usize]
    }

    pub fn set_gpr(&mut self, reg: Gpr, value: u64) {
        self.state.gprs[reg as usize] = value;
        let mut mask = self.updated.get_gprs();
        mask |= 1 << (reg as usize);
        self.updated.set_gprs(mask);
    }

    pub fn rip(&self) -> u64 {
        self.state.rip
    }

    pub fn set_rip(&mut self, value: u64) {
        self.state.rip = value;
        self.updated.set_rip(true);
    }

    pub fn rflags(&self) -> u64 {
        self.state.rflags
    }

    pub fn set_rflags(&mut self, value: u64) {
        self.state.rflags = value;
        self.updated.set_rflags(true);
    }

    pub fn cr0(&self) -> u64 {
        self.state.cr0
    }

    /// Sets the CR0 shadow value. The bits actually loaded into the VMCS
    /// guest-CR0 field are computed from this plus `HostCaps`'s
    /// host-owned mask at flush time, per spec.md §4.2's "CR0/CR4 go
    /// through the CR write emulation path" rule.
    pub fn set_cr0(&mut self, value: u64) {
        self.state.cr0 = value;
        self.updated.set_cr0(true);
    }

    pub fn cr4(&self) -> u64 {
        self.state.cr4
    }

    pub fn set_cr4(&mut self, value: u64) {
        self.state.cr4 = value;
        self.updated.set_cr4(true);
    }

    pub fn has_pending_updates(&self) -> bool {
        self.updated != CachedFields::new()
    }

    /// Writes every field marked `updated` into the VMCS, clears
    /// `updated`, and is always called immediately before VM-entry
    /// (spec.md §5's ordering guarantee: "updates ... happen-before the
    /// next VM-entry").
    pub fn write_cached_registers(&mut self, backend: &mut dyn VmcsBackend, caps: &HostCaps) -> Result<()> {
        if self.updated.get_rip() {
            backend.vmwrite(VmcsField::GuestRip, self.state.rip)?;
        }
        if self.updated.get_rsp() {
            backend.vmwrite(VmcsField::GuestRsp, self.state.gprs[Gpr::Rsp as usize])?;
        }
        if self.updated.get_rflags() {
            backend.vmwrite(VmcsField::GuestRflags, self.state.rflags)?;
        }
        if self.updated.get_cr0() {
            let mask = caps.cr0_host_owned_mask();
            let real = (self.state.cr0 & !mask) | (caps.cr0_fixed0 & mask);
            backend.vmwrite(VmcsField::GuestCr0, real)?;
            backend.vmwrite(VmcsField::Cr0ReadShadow, self.state.cr0)?;
        }
        if self.updated.get_cr4() {
            let mask = caps.cr4_host_owned_mask();
            let real = (self.state.cr4 & !mask) | (caps.cr4_fixed0 & mask);
            backend.vmwrite(VmcsField::GuestCr4, real)?;
            backend.vmwrite(VmcsField::Cr4ReadShadow, self.state.cr4)?;
        }
        if self.updated.get_cr3() {
            backend.vmwrite(VmcsField::GuestCr3, self.state.cr3)?;
        }
        if self.updated.get_efer() {
            backend.vmwrite(VmcsField::GuestIa32Efer, self.state.ia32_efer)?;
        }
        self.updated = CachedFields::new();
        Ok(())
    }

    /// Drops every "read back since last entry" marker. Called right
    /// after capturing a VM-exit, per spec.md §4.2 step 3.
    pub fn invalidate_cache(&mut self) {
        self.cached = CachedFields::new();
    }
}

/// A vCPU's lifecycle state (spec.md §3's `Run-context transitions`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuRunState {
    Init,
    Running,
    Zombie,
    Offline,
}

pub struct Vcpu {
    pub regs: RegisterCache,
    pub vmcs_phys_addr: u64,
    pub vpid: u16,
    pub run_state: VcpuRunState,
    launched: bool,
    /// Cached instruction length from the last exit, advanced into RIP on
    /// the following entry unless the handler already moved RIP itself
    /// (e.g. an injected exception).
    pub pending_instruction_len: Option<u32>,
}

impl Vcpu {
    pub fn new(vmcs_phys_addr: u64, vpid: u16) -> Self {
        Vcpu {
            regs: RegisterCache::new(),
            vmcs_phys_addr,
            vpid,
            run_state: VcpuRunState::Init,
            launched: false,
            pending_instruction_len: None,
        }
    }

    /// `run_vcpu(vcpu) -> status`, spec.md §4.2. Flushes dirty registers,
    /// advances RIP over the previously decoded instruction when
    /// applicable, issues `VMLAUNCH`/`VMRESUME`, and returns the
    /// classified exit. The caller (`hvcore`) owns dispatching the
    /// returned `VmExitInfo` to the right subsystem.
    pub fn run(
        &mut self,
        backend: &mut dyn VmcsBackend,
        pcpu: &CurrentVmcsTracker,
        caps: &HostCaps,
    ) -> Result<VmExitInfo> {
        pcpu.load_vmcs(backend, self.vmcs_phys_addr)?;

        if let Some(len) = self.pending_instruction_len.take() {
            if len != 0 {
                let rip = self.regs.rip();
                self.regs.set_rip(rip + len as u64);
            }
        }
        if self.regs.has_pending_updates() {
            self.regs.write_cached_registers(backend, caps)?;
        }

        let result = if !self.launched {
            // A power-up or VMCS switch invalidates every linear,
            // guest-physical, and combined mapping.
            backend.invvpid(InvvpidType::AllContexts, 0)?;
            // Avoid RSB reuse across the VMCS switch (no other place does
            // one currently; a future vmcs-switch case like a nested
            // launch needs its own IBPB here too).
            if caps.ibrs_raw_mitigation {
                backend.wrmsr_host(msr_id::IA32_PRED_CMD, msr_id::PRED_SET_IBPB)?;
            }
            self.launched = true;
            self.run_state = VcpuRunState::Running;
            backend.vmlaunch()
        } else {
            backend.vmresume()
        };

        self.regs.invalidate_cache();

        match result {
            Ok(exit) => {
                self.pending_instruction_len = Some(exit.instruction_len);
                Ok(exit)
            }
            Err(err @ Error::EntryFailure(_)) => {
                self.run_state = VcpuRunState::Zombie;
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Tears the vCPU down to `Init` via `Zombie`, per spec.md §3's
    /// "any state-losing operation ... returns the vCPU to Init via
    /// Zombie". The next `run` will `VMLAUNCH` again.
    pub fn reset(&mut self) {
        self.run_state = VcpuRunState::Zombie;
        self.launched = false;
        self.regs = RegisterCache::new();
        self.pending_instruction_len = None;
        self.run_state = VcpuRunState::Init;
    }
}

// `GuestCpuState` is POD (every field a fixed-size integer or array of
// one) so it picks up `DataInit` via `data_model`'s blanket impl with no
// extra derives; this just pins that down for anyone refactoring it.
const _: () = {
    fn assert_data_init<T: DataInit>() {}
    fn check() {
        assert_data_init::<GuestCpuState>();
    }
};
