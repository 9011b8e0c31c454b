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

//! A subsystem for managing interrupts in the kernel.
//!
//! # Safety
//!
//! Great care must be taken with interrupt code, as it can be executed at any time.
//!
//! For example: it's very important for interrupt handlers not to access data that isn't protected by a lock.
//! Such data may already be in-use by the code that was just interrupted; if so, accessing it in the interrupt
//! handler would violate Rust's aliasing rules.

mod common;

#[cfg(all(target_arch = "x86_64", not(test)))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(test)))]
use x86_64 as arch;

#[cfg(all(target_arch = "aarch64", not(test)))]
mod aarch64;
#[cfg(all(target_arch = "aarch64", not(test)))]
use aarch64 as arch;

// the hosted test harness has no interrupt flag to manage; the locks built on
// top of this module still provide mutual exclusion there
#[cfg(test)]
mod hosted;
#[cfg(test)]
use hosted as arch;

pub use arch::*;
