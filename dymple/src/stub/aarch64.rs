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

//! The aarch64 lazy-binding stubs.
//!
//! Frame layout, sp-relative (the first 32 bytes are `BindStubFrame`):
//!
//! ```text
//!   sp + 0     extended-state mask (always 0 here)
//!   sp + 8     extended-state area (always 0 here)
//!   sp + 16    lazy-bind info offset
//!   sp + 24    image handle
//!   sp + 32    x0..x7 (pairs)
//!   sp + 96    x16, x17
//!   sp + 112   q0..q7 (pairs)
//! ```
//!
//! There is no CPU-reported extended-state save instruction on this
//! architecture, so the saved state is enumerated explicitly: the integer
//! argument registers x0–x7, the intra-procedure scratch pair x16/x17, and
//! the caller-saved vector argument registers q0–q7. The resolved target
//! travels in x16 (IP0), which the ABI reserves for exactly this kind of
//! linker veneer.

use core::arch::global_asm;

global_asm!(
	".text",
	".p2align 2",
	".global dymple_bind_lazy_stub",
	"dymple_bind_lazy_stub:",
	// entry: [sp] = image handle, [sp+8] = lazy-bind info offset,
	//        [sp+16] = saved return address, [sp+24] = pad
	"sub sp, sp, #240",
	"stp x0, x1, [sp, #32]",
	"stp x2, x3, [sp, #48]",
	"stp x4, x5, [sp, #64]",
	"stp x6, x7, [sp, #80]",
	"stp x16, x17, [sp, #96]",
	"stp xzr, xzr, [sp]",
	// the two stub parameters move into the frame
	"ldr x16, [sp, #240]",
	"ldr x17, [sp, #248]",
	"stp x17, x16, [sp, #16]",
	"stp q0, q1, [sp, #112]",
	"stp q2, q3, [sp, #144]",
	"stp q4, q5, [sp, #176]",
	"stp q6, q7, [sp, #208]",
	"mov x0, sp",
	"bl {binder}",
	"mov x16, x0",
	"ldp q0, q1, [sp, #112]",
	"ldp q2, q3, [sp, #144]",
	"ldp q4, q5, [sp, #176]",
	"ldp q6, q7, [sp, #208]",
	"ldp x0, x1, [sp, #32]",
	"ldp x2, x3, [sp, #48]",
	"ldp x4, x5, [sp, #64]",
	"ldp x6, x7, [sp, #80]",
	"ldr x17, [sp, #104]",
	"add sp, sp, #240",
	// restore the caller's return address and drop the helper frame
	"ldr x30, [sp, #16]",
	"add sp, sp, #32",
	"br x16",
	binder = sym crate::bind::dymple_bind_entry,
);

global_asm!(
	".text",
	".p2align 2",
	".global dymple_bind_lazy_stub_compact",
	"dymple_bind_lazy_stub_compact:",
	"sub sp, sp, #112",
	"stp x0, x1, [sp, #32]",
	"stp x2, x3, [sp, #48]",
	"stp x4, x5, [sp, #64]",
	"stp x6, x7, [sp, #80]",
	"stp x16, x17, [sp, #96]",
	"stp xzr, xzr, [sp]",
	"ldr x16, [sp, #112]",
	"ldr x17, [sp, #120]",
	"stp x17, x16, [sp, #16]",
	"mov x0, sp",
	"bl {binder}",
	"mov x16, x0",
	"ldp x0, x1, [sp, #32]",
	"ldp x2, x3, [sp, #48]",
	"ldp x4, x5, [sp, #64]",
	"ldp x6, x7, [sp, #80]",
	"ldr x17, [sp, #104]",
	"add sp, sp, #112",
	"ldr x30, [sp, #16]",
	"add sp, sp, #32",
	"br x16",
	binder = sym crate::bind::dymple_bind_entry,
);
