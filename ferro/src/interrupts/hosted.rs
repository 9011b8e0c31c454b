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

//! Interrupt-state shims for the hosted test harness, where the interrupt
//! flag is not ours to touch.

pub use super::common::InterruptState;

pub fn disable_interrupts() {}

/// # Safety
///
/// Trivially safe under the hosted harness; this mirrors the real API.
pub unsafe fn enable_interrupts() {}

pub fn read_processor_flags() -> u64 {
	0
}

pub fn interrupts_enabled() -> bool {
	true
}

pub fn disable_and_save_interrupts() -> InterruptState {
	InterruptState(false)
}

/// # Safety
///
/// Trivially safe under the hosted harness; this mirrors the real API.
pub unsafe fn restore_interrupts(_interrupt_state: InterruptState) {}
