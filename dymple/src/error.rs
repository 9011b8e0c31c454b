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

//! The linker's error type; the userspace mirror of the kernel's kinds.

use core::fmt;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Error {
	/// Malformed input: a bad Mach-O structure, an impossible request.
	InvalidArgument,

	/// A resource (usually memory) is temporarily unavailable.
	TemporaryOutage,

	/// A resource is permanently unavailable (e.g. a file handle cannot be retained).
	PermanentOutage,

	/// The named image, file, or symbol does not exist.
	NoSuchResource,

	/// The operation has already been performed.
	AlreadyInProgress,

	/// An unclassified failure, e.g. a short read where more data was expected.
	Unknown,

	/// The request is outside the operation's contract.
	Unsupported,
}

pub type Result<T> = core::result::Result<T, Error>;

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let desc = match self {
			Self::InvalidArgument => "invalid argument",
			Self::TemporaryOutage => "temporary resource outage",
			Self::PermanentOutage => "permanent resource outage",
			Self::NoSuchResource => "no such resource",
			Self::AlreadyInProgress => "already in progress",
			Self::Unknown => "unknown failure",
			Self::Unsupported => "unsupported operation",
		};
		f.write_str(desc)
	}
}
