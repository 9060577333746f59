// Copyright 2018 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A marker trait for types that may be safely reinterpreted as a byte
//! slice and vice versa: no padding, no pointers, no validity invariant
//! beyond "any bit pattern is valid". Every struct shared across the
//! guest/host boundary — the I/O-request page, the VM-creation parameter
//! block, the register-transfer block — needs this, since the far side of
//! that boundary writes raw bytes with no knowledge of Rust's type system.
//!
//! Built on `zerocopy` rather than hand-rolled `unsafe` transmutes: the
//! derive on each shared-page struct proves the no-padding/no-pointer
//! requirement at compile time instead of trusting whoever wrote the
//! struct to get the `repr` and field order right by hand.

use std::io;
use std::mem::size_of;

use zerocopy::AsBytes;
use zerocopy::FromBytes;
use zerocopy::FromZeroes;

/// Implemented for every POD type usable as the element type of a
/// guest/host shared memory region.
///
/// # Safety
///
/// The type must have no padding bytes, must be valid for any bit pattern,
/// and must not contain any reference, pointer, or `Drop` impl. The
/// `zerocopy` supertraits enforce exactly this, so implementing this trait
/// manually (rather than via the blanket impl below) should never be
/// necessary.
pub unsafe trait DataInit: Copy + Send + Sync + Sized + AsBytes + FromBytes + FromZeroes {
    /// Views `self` as a byte slice.
    fn as_slice(&self) -> &[u8] {
        self.as_bytes()
    }

    /// Views `self` as a mutable byte slice.
    fn as_mut_slice(&mut self) -> &mut [u8] {
        self.as_bytes_mut()
    }

    /// Reinterprets a byte slice as `&Self`, failing if the slice isn't
    /// exactly `size_of::<Self>()` bytes or isn't aligned for `Self`.
    fn from_slice(data: &[u8]) -> Option<&Self> {
        zerocopy::Ref::<_, Self>::new(data).map(zerocopy::Ref::into_ref)
    }

    /// Reinterprets a mutable byte slice as `&mut Self`.
    fn from_mut_slice(data: &mut [u8]) -> Option<&mut Self> {
        zerocopy::Ref::<_, Self>::new(data).map(zerocopy::Ref::into_mut)
    }

    /// Copies `self` out of a reader in one shot.
    fn from_reader<R: io::Read>(mut src: R) -> io::Result<Self> {
        let mut val = Self::new_zeroed();
        src.read_exact(val.as_mut_slice())?;
        Ok(val)
    }
}

unsafe impl<T> DataInit for T where T: Copy + Send + Sync + Sized + AsBytes + FromBytes + FromZeroes {}

/// Returns the byte offset of `$field` within `$ty`, for structs whose
/// layout (and therefore field offsets) is part of a wire contract with
/// code outside this crate (e.g. the shared I/O-request page).
#[macro_export]
macro_rules! offset_of {
    ($ty:ty, $field:ident) => {{
        let uninit = std::mem::MaybeUninit::<$ty>::uninit();
        let base = uninit.as_ptr();
        // SAFETY: we only ever compute pointer arithmetic here, never read
        // through either pointer.
        unsafe {
            let field = std::ptr::addr_of!((*base).$field);
            (field as *const u8).offset_from(base as *const u8) as usize
        }
    }};
}

/// Asserts, at compile time, that `$ty` is exactly `$size` bytes. Used next
/// to every shared-page struct definition to pin its size against the wire
/// contract instead of discovering a mismatch at runtime.
#[macro_export]
macro_rules! assert_size_eq {
    ($ty:ty, $size:expr) => {
        const _: () = assert!(std::mem::size_of::<$ty>() == $size);
    };
}

/// Returns the number of `T`s that fit in `bytes`, rounding down.
pub fn elements_that_fit<T>(bytes: usize) -> usize {
    bytes / size_of::<T>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::AsBytes as _;
    use zerocopy::FromBytes as _;
    use zerocopy::FromZeroes as _;

    #[derive(Copy, Clone, Default, AsBytes, FromBytes, FromZeroes)]
    #[repr(C)]
    struct Example {
        a: u32,
        b: u16,
        c: u16,
    }

    #[test]
    fn round_trips_through_bytes() {
        let val = Example { a: 1, b: 2, c: 3 };
        let bytes = val.as_slice().to_vec();
        let back = Example::from_slice(&bytes).unwrap();
        assert_eq!(back.a, 1);
        assert_eq!(back.b, 2);
        assert_eq!(back.c, 3);
    }

    #[test]
    fn offset_of_matches_repr_c_layout() {
        assert_eq!(offset_of!(Example, a), 0);
        assert_eq!(offset_of!(Example, b), 4);
        assert_eq!(offset_of!(Example, c), 6);
    }
}
