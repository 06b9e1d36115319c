// SPDX-License-Identifier: MPL-2.0

mod bitmap;
mod buf;

pub use self::{bitmap::BitMap, buf::Buf};
