// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Per-vCPU local APIC model (C3): xAPIC/x2APIC register file and mode
//! transitions, ICR/IPI decoding, LVT, IRR/ISR/TMR bitmaps, TSC-deadline,
//! and the per-VM destination fan-out `vlapic_receive_intr` performs.

mod complex;
mod error;
mod lapic;

pub use complex::DeliveryTarget;
pub use complex::IntrRequest;
pub use complex::VlapicAggregateMode;
pub use complex::VlapicComplex;
pub use error::Error;
pub use error::Result;
pub use lapic::ApicMode;
pub use lapic::DeliveryMode;
pub use lapic::DestShorthand;
pub use lapic::DestinationMode;
pub use lapic::EoiInfo;
pub use lapic::IcrWrite;
pub use lapic::KickMode;
pub use lapic::Level;
pub use lapic::LvtEntry;
pub use lapic::LvtTimer;
pub use lapic::ModeTransition;
pub use lapic::PostedInterruptDescriptor;
pub use lapic::TimerMode;
pub use lapic::TriggerMode;
pub use lapic::Vlapic;
