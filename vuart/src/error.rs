// Copyright 2023 The Hypervisor Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("vuart index {0} is out of range (MAX_VUART_NUM_PER_VM = {1})")]
    IndexOutOfRange(usize, usize),

    #[error("vuart {0} is not active")]
    NotActive(usize),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for base::Error {
    fn from(err: Error) -> Self {
        base::Error::invalid_argument(err.to_string())
    }
}
