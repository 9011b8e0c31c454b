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

//! The relocation engine: rebase and bind opcode interpretation, plus the
//! C-level binder the lazy-binding stub calls into.
//!
//! Rebase and (non-lazy) bind streams are applied at load time; the
//! lazy-bind stream is only ever decoded one record at a time, on first call
//! through a lazily-bound import.

use alloc::{borrow::ToOwned, string::String, vec::Vec};

use log::debug;
use static_assertions::const_assert_eq;

use crate::{
	exports,
	images::{self, Image, ImageHandle, RegistryState},
	macho,
	util::ByteCursor,
	Error, Result,
};

/// The target slot of a rebase or bind: `segment_index`/`offset` per the
/// opcode stream, checked against the image's real segments.
fn segment_target(image: &Image, segment_index: usize, offset: u64) -> Result<u64> {
	let segment = image
		.segments()
		.get(segment_index)
		.ok_or(Error::InvalidArgument)?;
	if segment.reserved || offset.checked_add(8).ok_or(Error::InvalidArgument)? > segment.size {
		return Err(Error::InvalidArgument);
	}
	Ok(segment.address + offset)
}

/// Applies the image's rebase stream: every recorded pointer gets the load
/// slide added.
pub(crate) fn apply_rebase(handle: ImageHandle) -> Result<()> {
	// SAFETY: callers hold the registry mutex. Writes below go into the
	//         image's *mapping*, never into the `Image` structure itself.
	let image = unsafe { handle.get() };

	let blob = image.rebase_info();
	if blob.is_empty() {
		return Ok(());
	}

	let slide = image
		.base_address()
		.wrapping_sub(image.preferred_base_address());

	let mut cursor = ByteCursor::new(blob);
	let mut segment_index = 0usize;
	let mut segment_offset = 0u64;
	let mut rebase_type = macho::REBASE_TYPE_POINTER;

	let rebase_one =
		|segment_index: usize, segment_offset: &mut u64, rebase_type: u8| -> Result<()> {
			if rebase_type != macho::REBASE_TYPE_POINTER {
				return Err(Error::Unsupported);
			}
			let target = segment_target(image, segment_index, *segment_offset)?;
			// SAFETY: `segment_target` bounds-checked the slot against the mapping.
			unsafe {
				let pointer = target as *mut u64;
				*pointer = (*pointer).wrapping_add(slide);
			}
			*segment_offset += 8;
			Ok(())
		};

	while !cursor.is_at_end() {
		let byte = cursor.u8()?;
		let opcode = byte & macho::REBASE_OPCODE_MASK;
		let immediate = byte & macho::REBASE_IMMEDIATE_MASK;

		match opcode {
			macho::REBASE_OPCODE_DONE => break,
			macho::REBASE_OPCODE_SET_TYPE_IMM => rebase_type = immediate,
			macho::REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
				segment_index = immediate as usize;
				segment_offset = cursor.uleb128()?;
			},
			macho::REBASE_OPCODE_ADD_ADDR_ULEB => {
				segment_offset = segment_offset.wrapping_add(cursor.uleb128()?);
			},
			macho::REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
				segment_offset = segment_offset.wrapping_add((immediate as u64) * 8);
			},
			macho::REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
				for _ in 0..immediate {
					rebase_one(segment_index, &mut segment_offset, rebase_type)?;
				}
			},
			macho::REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
				let count = cursor.uleb128()?;
				for _ in 0..count {
					rebase_one(segment_index, &mut segment_offset, rebase_type)?;
				}
			},
			macho::REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
				rebase_one(segment_index, &mut segment_offset, rebase_type)?;
				segment_offset = segment_offset.wrapping_add(cursor.uleb128()?);
			},
			macho::REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
				let count = cursor.uleb128()?;
				let skip = cursor.uleb128()?;
				for _ in 0..count {
					rebase_one(segment_index, &mut segment_offset, rebase_type)?;
					segment_offset = segment_offset.wrapping_add(skip);
				}
			},
			_ => return Err(Error::InvalidArgument),
		}
	}

	Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum BindStream {
	Normal,
	Weak,
}

/// Applies one of the image's eager bind streams (normal or weak-definition
/// overrides). Lazy bindings never come through here.
pub(crate) fn apply_bind_stream(
	state: &RegistryState,
	handle: ImageHandle,
	stream: BindStream,
) -> Result<()> {
	// the blob is copied out so symbol resolution below (which may touch this
	// image's export cache) cannot alias it
	let blob: Vec<u8> = {
		// SAFETY: callers hold the registry mutex; the borrow ends with this scope.
		let image = unsafe { handle.get() };
		match stream {
			BindStream::Normal => image.bind_info().to_vec(),
			BindStream::Weak => image.weak_bind_info().to_vec(),
		}
	};
	if blob.is_empty() {
		return Ok(());
	}

	let mut cursor = ByteCursor::new(&blob);
	let mut symbol_name = String::new();
	let mut library_ordinal: i64 = macho::BIND_SPECIAL_DYLIB_SELF;
	let mut bind_type = macho::BIND_TYPE_POINTER;
	let mut addend: i64 = 0;
	let mut weak_import = false;
	let mut segment_index = 0usize;
	let mut segment_offset = 0u64;

	while !cursor.is_at_end() {
		let byte = cursor.u8()?;
		let opcode = byte & macho::BIND_OPCODE_MASK;
		let immediate = byte & macho::BIND_IMMEDIATE_MASK;

		match opcode {
			macho::BIND_OPCODE_DONE => break,
			macho::BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => library_ordinal = immediate as i64,
			macho::BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
				library_ordinal = cursor.uleb128()? as i64;
			},
			macho::BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
				library_ordinal = decode_special_ordinal(immediate);
			},
			macho::BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
				symbol_name = cursor.cstr()?.to_owned();
				weak_import = (immediate & macho::BIND_SYMBOL_FLAGS_WEAK_IMPORT) != 0;
			},
			macho::BIND_OPCODE_SET_TYPE_IMM => bind_type = immediate,
			macho::BIND_OPCODE_SET_ADDEND_SLEB => addend = cursor.sleb128()?,
			macho::BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
				segment_index = immediate as usize;
				segment_offset = cursor.uleb128()?;
			},
			macho::BIND_OPCODE_ADD_ADDR_ULEB => {
				segment_offset = segment_offset.wrapping_add(cursor.uleb128()?);
			},
			macho::BIND_OPCODE_DO_BIND => {
				perform_bind(
					state,
					handle,
					bind_type,
					segment_index,
					&mut segment_offset,
					library_ordinal,
					&symbol_name,
					weak_import,
					addend,
				)?;
			},
			macho::BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
				perform_bind(
					state,
					handle,
					bind_type,
					segment_index,
					&mut segment_offset,
					library_ordinal,
					&symbol_name,
					weak_import,
					addend,
				)?;
				segment_offset = segment_offset.wrapping_add(cursor.uleb128()?);
			},
			macho::BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
				perform_bind(
					state,
					handle,
					bind_type,
					segment_index,
					&mut segment_offset,
					library_ordinal,
					&symbol_name,
					weak_import,
					addend,
				)?;
				segment_offset = segment_offset.wrapping_add((immediate as u64) * 8);
			},
			macho::BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
				let count = cursor.uleb128()?;
				let skip = cursor.uleb128()?;
				for _ in 0..count {
					perform_bind(
						state,
						handle,
						bind_type,
						segment_index,
						&mut segment_offset,
						library_ordinal,
						&symbol_name,
						weak_import,
						addend,
					)?;
					segment_offset = segment_offset.wrapping_add(skip);
				}
			},
			_ => return Err(Error::InvalidArgument),
		}
	}

	Ok(())
}

fn decode_special_ordinal(immediate: u8) -> i64 {
	if immediate == 0 {
		macho::BIND_SPECIAL_DYLIB_SELF
	} else {
		// the immediate sign-extends: 0xf -> -1 (main executable), 0xe -> -2 (flat)
		((immediate | 0xf0) as i8) as i64
	}
}

#[allow(clippy::too_many_arguments)]
fn perform_bind(
	state: &RegistryState,
	handle: ImageHandle,
	bind_type: u8,
	segment_index: usize,
	segment_offset: &mut u64,
	library_ordinal: i64,
	symbol_name: &str,
	weak_import: bool,
	addend: i64,
) -> Result<()> {
	if bind_type != macho::BIND_TYPE_POINTER {
		return Err(Error::Unsupported);
	}
	if symbol_name.is_empty() {
		return Err(Error::InvalidArgument);
	}

	let resolved = resolve_bind_target(state, handle, library_ordinal, symbol_name, weak_import)?;

	let target = {
		// SAFETY: callers hold the registry mutex; the borrow ends with this scope.
		let image = unsafe { handle.get() };
		segment_target(image, segment_index, *segment_offset)?
	};

	// SAFETY: `segment_target` bounds-checked the slot against the mapping.
	unsafe {
		*(target as *mut u64) = (resolved as i64).wrapping_add(addend) as u64;
	}

	*segment_offset += 8;
	Ok(())
}

/// Resolves a bound symbol through the dependency graph: the named library
/// (or all images, for flat lookup) first, reexports depth-first, first
/// match wins. Missing weak imports bind to 0.
pub(crate) fn resolve_bind_target(
	state: &RegistryState,
	handle: ImageHandle,
	library_ordinal: i64,
	symbol_name: &str,
	weak_import: bool,
) -> Result<u64> {
	let resolved = match exports::image_for_ordinal(state, handle, library_ordinal)? {
		exports::OrdinalTarget::Image(target) => {
			exports::resolve_in_image(state, target, symbol_name)?
		},
		exports::OrdinalTarget::Flat => exports::resolve_flat(state, symbol_name)?,
	};

	match resolved {
		Some(address) => Ok(address),
		None if weak_import => Ok(0),
		None => Err(Error::NoSuchResource),
	}
}

/// One decoded lazy-binding record.
#[derive(Debug)]
pub(crate) struct LazyBindRecord {
	pub segment_index: usize,
	pub segment_offset: u64,
	pub library_ordinal: i64,
	pub symbol_name: String,
}

/// Decodes the single lazy-binding record starting at `start_offset` in the
/// lazy-bind instruction stream (each record ends at its `DO_BIND`).
pub(crate) fn decode_lazy_record(blob: &[u8], start_offset: usize) -> Result<LazyBindRecord> {
	let mut cursor = ByteCursor::at_offset(blob, start_offset)?;

	let mut symbol_name: Option<String> = None;
	let mut library_ordinal: i64 = macho::BIND_SPECIAL_DYLIB_SELF;
	let mut target: Option<(usize, u64)> = None;

	loop {
		if cursor.is_at_end() {
			return Err(Error::InvalidArgument);
		}
		let byte = cursor.u8()?;
		let opcode = byte & macho::BIND_OPCODE_MASK;
		let immediate = byte & macho::BIND_IMMEDIATE_MASK;

		match opcode {
			// a DONE between records; the interesting part is behind us only
			// if we've already seen DO_BIND, which breaks out below
			macho::BIND_OPCODE_DONE => continue,
			macho::BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => library_ordinal = immediate as i64,
			macho::BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
				library_ordinal = cursor.uleb128()? as i64;
			},
			macho::BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
				library_ordinal = decode_special_ordinal(immediate);
			},
			macho::BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
				symbol_name = Some(cursor.cstr()?.to_owned());
			},
			macho::BIND_OPCODE_SET_TYPE_IMM => {
				if immediate != macho::BIND_TYPE_POINTER {
					return Err(Error::Unsupported);
				}
			},
			macho::BIND_OPCODE_SET_ADDEND_SLEB => {
				let _ = cursor.sleb128()?;
			},
			macho::BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
				target = Some((immediate as usize, cursor.uleb128()?));
			},
			macho::BIND_OPCODE_DO_BIND => break,
			_ => return Err(Error::InvalidArgument),
		}
	}

	let (segment_index, segment_offset) = target.ok_or(Error::InvalidArgument)?;
	let symbol_name = symbol_name.ok_or(Error::InvalidArgument)?;

	Ok(LazyBindRecord {
		segment_index,
		segment_offset,
		library_ordinal,
		symbol_name,
	})
}

/// Resolves and patches one lazy binding. Called (via the registry) from the
/// binding stub's C entry point.
pub(crate) fn bind_lazy(
	state: &RegistryState,
	handle: ImageHandle,
	info_offset: u64,
) -> Result<u64> {
	let record = {
		// SAFETY: callers hold the registry mutex; the borrow ends with this scope.
		let image = unsafe { handle.get() };
		decode_lazy_record(image.lazy_bind_info(), info_offset as usize)?
	};

	// there is no graceful return path out of the stub, so a missing symbol
	// is an error here and a panic in the stub's entry point
	let resolved = resolve_bind_target(
		state,
		handle,
		record.library_ordinal,
		&record.symbol_name,
		false,
	)?;

	let target = {
		// SAFETY: callers hold the registry mutex; the borrow ends with this scope.
		let image = unsafe { handle.get() };
		debug!(
			"lazily binding {} in {} -> {:#x}",
			record.symbol_name,
			image.path(),
			resolved
		);
		segment_target(image, record.segment_index, record.segment_offset)?
	};

	// patch the import slot; later calls jump straight to the target
	//
	// SAFETY: `segment_target` bounds-checked the slot against the mapping.
	unsafe {
		*(target as *mut u64) = resolved;
	}

	Ok(resolved)
}

/// The register frame the lazy-binding stub hands to [`dymple_bind_entry`].
/// Layout is shared with the assembly in [`crate::stub`]; the saved
/// general-purpose registers follow these fields and are opaque here.
#[repr(C)]
pub struct BindStubFrame {
	/// The extended-state feature mask in effect when the stub saved state
	/// (zero on architectures without one).
	pub extended_state_mask: u64,
	/// Where the extended-state save area lives on the stack (zero when unused).
	pub extended_state_area: u64,
	/// Offset into the image's lazy-bind instruction stream for this import.
	pub info_offset: u64,
	/// The image that owns the import (written into the image's linker slot
	/// at load time).
	pub image_handle: u64,
}

// the stubs build the frame by hand; its layout is part of their contract
const_assert_eq!(core::mem::size_of::<BindStubFrame>(), 32);

/// The C-level binder. Looks up the image, resolves the lazy import named by
/// the frame, patches the slot, and returns the resolved target for the stub
/// to jump to.
///
/// # Safety
///
/// Only the lazy-binding stub may call this, with a frame it just built.
#[no_mangle]
pub unsafe extern "C" fn dymple_bind_entry(frame: *mut BindStubFrame) -> u64 {
	let frame = &*frame;

	let handle = ImageHandle::from_raw(frame.image_handle as *mut Image)
		.expect("lazy binding stub invoked with a null image handle");

	let registry = images::registry()
		.expect("lazy binding cannot happen before the image registry exists");

	match registry.bind_lazy_symbol(handle, frame.info_offset) {
		Ok(address) => address,
		// no graceful return path exists from the stub
		Err(err) => panic!("unresolvable lazy binding: {}", err),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn special_ordinals() {
		assert_eq!(decode_special_ordinal(0), macho::BIND_SPECIAL_DYLIB_SELF);
		assert_eq!(
			decode_special_ordinal(0x0f),
			macho::BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE
		);
		assert_eq!(
			decode_special_ordinal(0x0e),
			macho::BIND_SPECIAL_DYLIB_FLAT_LOOKUP
		);
	}

	#[test]
	fn lazy_record_decoding() {
		// SET_SEGMENT_AND_OFFSET_ULEB(seg 1, 0x10); SET_DYLIB_ORDINAL_IMM(2);
		// SET_SYMBOL "_foo"; DO_BIND; DONE
		let mut blob = alloc::vec::Vec::new();
		blob.push(macho::BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1);
		blob.push(0x10);
		blob.push(macho::BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | 2);
		blob.push(macho::BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
		blob.extend_from_slice(b"_foo\0");
		blob.push(macho::BIND_OPCODE_DO_BIND);
		blob.push(macho::BIND_OPCODE_DONE);

		let record = decode_lazy_record(&blob, 0).unwrap();
		assert_eq!(record.segment_index, 1);
		assert_eq!(record.segment_offset, 0x10);
		assert_eq!(record.library_ordinal, 2);
		assert_eq!(record.symbol_name, "_foo");

		// decoding past the end is malformed
		assert!(decode_lazy_record(&blob, blob.len()).is_err());
	}
}
