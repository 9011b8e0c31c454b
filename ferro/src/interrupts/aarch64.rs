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

use core::arch::asm;

pub use super::common::InterruptState;

/// The IRQ mask bit within DAIF. When set, IRQs are *masked* (disabled).
pub const IRQ_MASK_BIT: u64 = 1 << 7;

/// Disables interrupts unconditionally.
pub fn disable_interrupts() {
	// SAFETY: masking interrupts should be perfectly safe as there's no possibility to violate any compiler assumptions.
	unsafe {
		asm!("msr daifset, #2", options(nostack, preserves_flags));
	}
}

/// Enables interrupts unconditionally.
///
/// # Safety
///
/// This operation is unsafe because it allows interrupt code to run, which may violate safety rules such as aliasing if care is not taken.
pub unsafe fn enable_interrupts() {
	asm!("msr daifclr, #2", options(nostack, preserves_flags));
}

pub fn read_processor_flags() -> u64 {
	let daif: u64;

	// SAFETY: reading DAIF is perfectly safe; we're not modifying it.
	unsafe {
		asm!("mrs {}, daif", out(reg) daif, options(nostack, nomem, preserves_flags));
	}

	daif
}

pub fn interrupts_enabled() -> bool {
	(read_processor_flags() & IRQ_MASK_BIT) == 0
}

/// Saves the current interrupt state, disables interrupts, and then returns the saved interrupt state.
pub fn disable_and_save_interrupts() -> InterruptState {
	let enabled = interrupts_enabled();
	disable_interrupts();
	InterruptState(enabled)
}

/// Enables interrupts if they were previously enabled.
///
/// # Safety
///
/// This operation is unsafe for the same reason [`enable_interrupts()`] is unsafe.
pub unsafe fn restore_interrupts(interrupt_state: InterruptState) {
	if interrupt_state.0 {
		enable_interrupts();
	}
}
