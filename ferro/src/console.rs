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

//! The kernel console.
//!
//! Output is routed through a sink registered by the platform setup code (a
//! serial port or framebuffer writer; those drivers live outside this crate).
//! Until a sink is registered, output is discarded.

use core::{
	fmt::{write, Arguments, Result, Write},
	sync::atomic::{AtomicBool, Ordering},
};

use crate::sync::{Lock, SpinLock};

/// A console sink. Must tolerate being called with interrupts disabled and
/// must not block.
pub type ConsoleSink = fn(&str);

struct Console {
	sink: Option<ConsoleSink>,
}

impl Write for Console {
	fn write_str(&mut self, string: &str) -> Result {
		if let Some(sink) = self.sink {
			sink(string);
		}

		// no sink simply means there's nowhere to put the output; that's not an error
		Ok(())
	}
}

static CONSOLE: SpinLock<Console> = SpinLock::new(Console { sink: None });

/// Whether debug-level kernel logging is emitted. Flipped by the boot
/// arguments (or a debugger).
static DEBUG_LOGGING: AtomicBool = AtomicBool::new(false);

pub fn register_sink(sink: ConsoleSink) {
	CONSOLE.lock().sink = Some(sink);
}

pub fn set_debug_logging(enabled: bool) {
	DEBUG_LOGGING.store(enabled, Ordering::Relaxed);
}

pub fn debug_logging_enabled() -> bool {
	DEBUG_LOGGING.load(Ordering::Relaxed)
}

#[macro_export]
macro_rules! kprint {
	($($arg:tt)*) => {{
		$crate::console::kprint_args(::core::format_args!($($arg)*)).unwrap();
	}};
}

#[macro_export]
macro_rules! kprintln {
	() => {
		$crate::kprint!("\n")
	};
	($($arg:tt)*) => {{
		$crate::kprint!("{}\n", ::core::format_args!($($arg)*));
	}};
}

/// Like [`kprintln!`], but only emitted when debug logging is enabled.
#[macro_export]
macro_rules! kdebugln {
	($($arg:tt)*) => {{
		if $crate::console::debug_logging_enabled() {
			$crate::kprintln!($($arg)*);
		}
	}};
}

pub fn kprint_args(args: Arguments) -> Result {
	let mut console = CONSOLE.lock();
	write(&mut *console, args)
}
