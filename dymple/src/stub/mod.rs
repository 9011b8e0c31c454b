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

//! The lazy-binding stubs.
//!
//! Every image's binding helper pushes `{image handle, lazy-bind info
//! offset}` below the return address and jumps here. The stub's contract is
//! ABI-preserving: by the time control reaches the resolved function, every
//! register that could carry caller state (the integer argument set, the
//! linker scratch pair, and the caller's vector/FPU state) holds exactly
//! what it held at the call site, and the stack looks like a direct call.
//!
//! On entry: `[sp+0]` = image handle, `[sp+8]` = lazy-bind info offset,
//! `[sp+16]` = return address.
//!
//! The compact variant skips the extended-state save/restore. It is only
//! safe when the binder provably touches no vector or floating-point state;
//! verify that with debug traps on vector use before wiring it up.

#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
mod aarch64;

#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
extern "C" {
	/// The full lazy-binding stub (integer and extended state preserved).
	pub fn dymple_bind_lazy_stub();

	/// The reduced stub (no extended-state handling).
	pub fn dymple_bind_lazy_stub_compact();
}

/// The address the loader hands to images for their lazy-binding plumbing.
#[cfg(any(target_arch = "x86_64", target_arch = "aarch64"))]
pub fn bind_trampoline_address() -> u64 {
	dymple_bind_lazy_stub as usize as u64
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub fn bind_trampoline_address() -> u64 {
	0
}
