/*
 * This file is part of Anillo OS
 * Copyright (C) 2023 Anillo OS Developers
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Lesser General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU Lesser General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Dymple, the Anillo OS dynamic linker.
//!
//! Dymple loads Mach-O images into the process, wires up their dependency
//! graph, applies rebase and bind information, and resolves lazily-bound
//! imports on first call through the architecture-specific binding stub.
//!
//! The process bootstrap hands us a [`sys::System`] implementation (the
//! syscall-backed one in the real process; an in-memory one under the test
//! harness) and the path of the process binary, then calls
//! [`images::images_init`].

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bind;
pub mod error;
pub mod exports;
pub mod images;
pub mod macho;
pub mod stub;
pub mod sys;

mod util;

#[cfg(test)]
mod testmacho;

pub use error::{Error, Result};
