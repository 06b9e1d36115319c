// SPDX-License-Identifier: MPL-2.0

pub(crate) use std::sync::Arc;

pub(crate) use spin::Mutex as SpinLock;

pub(crate) use crate::{
    bail,
    error::{Errno::*, Error},
    geom::BLOCK_SIZE,
};

pub(crate) type Result<T> = core::result::Result<T, Error>;

#[allow(unused_imports)]
pub(crate) use log::{debug, error, info, trace, warn};
