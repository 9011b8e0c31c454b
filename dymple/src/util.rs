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

//! Byte-stream decoding helpers for the Mach-O side tables (LEB128 and
//! NUL-terminated strings).

use crate::{Error, Result};

/// A bounds-checked cursor over a byte slice.
pub(crate) struct ByteCursor<'a> {
	data: &'a [u8],
	offset: usize,
}

impl<'a> ByteCursor<'a> {
	pub fn new(data: &'a [u8]) -> Self {
		Self { data, offset: 0 }
	}

	pub fn at_offset(data: &'a [u8], offset: usize) -> Result<Self> {
		if offset > data.len() {
			return Err(Error::InvalidArgument);
		}
		Ok(Self { data, offset })
	}

	pub fn position(&self) -> usize {
		self.offset
	}

	pub fn is_at_end(&self) -> bool {
		self.offset >= self.data.len()
	}

	pub fn u8(&mut self) -> Result<u8> {
		let byte = *self.data.get(self.offset).ok_or(Error::Unknown)?;
		self.offset += 1;
		Ok(byte)
	}

	/// Unsigned LEB128.
	pub fn uleb128(&mut self) -> Result<u64> {
		let mut result: u64 = 0;
		let mut shift: u32 = 0;

		loop {
			let byte = self.u8()?;
			if shift >= 64 {
				return Err(Error::InvalidArgument);
			}
			result |= ((byte & 0x7f) as u64) << shift;
			if (byte & 0x80) == 0 {
				return Ok(result);
			}
			shift += 7;
		}
	}

	/// Signed LEB128.
	pub fn sleb128(&mut self) -> Result<i64> {
		let mut result: i64 = 0;
		let mut shift: u32 = 0;

		loop {
			let byte = self.u8()?;
			if shift >= 64 {
				return Err(Error::InvalidArgument);
			}
			result |= ((byte & 0x7f) as i64) << shift;
			shift += 7;
			if (byte & 0x80) == 0 {
				if shift < 64 && (byte & 0x40) != 0 {
					// sign-extend
					result |= -1i64 << shift;
				}
				return Ok(result);
			}
		}
	}

	/// A NUL-terminated UTF-8 string; the cursor advances past the NUL.
	pub fn cstr(&mut self) -> Result<&'a str> {
		let start = self.offset;
		let rest = &self.data[start..];
		let nul = rest
			.iter()
			.position(|&byte| byte == 0)
			.ok_or(Error::Unknown)?;
		self.offset = start + nul + 1;
		core::str::from_utf8(&rest[..nul]).map_err(|_| Error::InvalidArgument)
	}

	pub fn seek(&mut self, offset: usize) -> Result<()> {
		if offset > self.data.len() {
			return Err(Error::InvalidArgument);
		}
		self.offset = offset;
		Ok(())
	}
}
