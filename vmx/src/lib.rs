// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! VMCS lifecycle, the per-vCPU run-loop, MSR interception, and CPUID leaf
//! emulation (C1, C2, C8). `hvcore` is the only crate that dispatches a
//! classified [`exit::VmExitInfo`] to the other subsystem crates; this one
//! only owns what's true of every vCPU regardless of which handler a given
//! exit ends up routed to.

mod backend;
mod cpuid;
mod error;
mod exit;
mod field;
mod host_caps;
mod msr;
mod vcpu;
mod vmcs;

pub use backend::InveptType;
pub use backend::InvvpidType;
pub use backend::RealBackend;
pub use backend::TestBackend;
pub use backend::VmcsBackend;
pub use cpuid::emulate_cpuid;
pub use cpuid::CpuidConfig;
pub use cpuid::CpuidResult;
pub use cpuid::HypervisorLeaf;
pub use error::Error;
pub use error::Result;
pub use exit::ExitReason;
pub use exit::VmExitInfo;
pub use field::FieldWidth;
pub use field::VmcsField;
pub use host_caps::HostCaps;
pub use msr::msr;
pub use msr::MsrBitmap;
pub use msr::MsrDisposition;
pub use msr::MsrIntercept;
pub use vcpu::CachedFields;
pub use vcpu::DescriptorPtr;
pub use vcpu::Gpr;
pub use vcpu::GuestCpuState;
pub use vcpu::RegisterCache;
pub use vcpu::Vcpu;
pub use vcpu::VcpuRunState;
pub use vmcs::cpu2_ctls;
pub use vmcs::cpu_ctls;
pub use vmcs::entry_ctls;
pub use vmcs::exit_ctls;
pub use vmcs::init_vmcs;
pub use vmcs::pin_ctls;
pub use vmcs::CurrentVmcsTracker;
pub use vmcs::VmcsInit;
