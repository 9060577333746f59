// Copyright 2018 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Marker types consumed by the `#[bitfield]` attribute macro
//! (`bit_field_derive`) to describe the width of each sub-field of a packed
//! hardware register.
//!
//! A `BitFieldN` type is never constructed; it only ever appears as the
//! declared type of a field inside a `#[bitfield]` struct, where the macro
//! reads `N` back out of the type name to learn that field's width in bits.
//! The macro then replaces the struct body entirely with a single unsigned
//! integer sized to hold the sum of all field widths, and emits
//! `get_<field>`/`set_<field>` accessors that shift and mask into it.

pub use bit_field_derive::bitfield;

/// Implemented by enums used as the type of a `#[bits = N]` struct field.
/// The macro does not implement this itself; enums need `#[bitfield]` on
/// them too, which emits it from the enum's explicit discriminants.
pub trait BitFieldSpecifier: Sized {
    /// The error returned when a raw value has no corresponding variant.
    type Error: std::fmt::Debug;

    fn from_u64(value: u64) -> Result<Self, Self::Error>;
    fn into_u64(self) -> u64;
}

macro_rules! bit_field_widths {
    ($($name:ident),* $(,)?) => {
        $(
            /// A marker for a packed-register field of this many bits.
            /// Never constructed; see the crate docs.
            #[allow(non_camel_case_types)]
            pub struct $name {
                _private: (),
            }
        )*
    };
}

bit_field_widths! {
    BitField1, BitField2, BitField3, BitField4, BitField5, BitField6,
    BitField7, BitField8, BitField9, BitField10, BitField11, BitField12,
    BitField13, BitField14, BitField15, BitField16, BitField17, BitField18,
    BitField19, BitField20, BitField21, BitField22, BitField23, BitField24,
    BitField25, BitField26, BitField27, BitField28, BitField29, BitField30,
    BitField31, BitField32, BitField33, BitField34, BitField35, BitField36,
    BitField37, BitField38, BitField39, BitField40, BitField41, BitField42,
    BitField43, BitField44, BitField45, BitField46, BitField47, BitField48,
    BitField49, BitField50, BitField51, BitField52, BitField53, BitField54,
    BitField55, BitField56, BitField57, BitField58, BitField59, BitField60,
    BitField61, BitField62, BitField63, BitField64,
}
