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

//! Symbol resolution through the export trie.
//!
//! The export trie is the sole resolution mechanism; the classic symbol
//! tables are parsed but never consulted. An image's exported set is its own
//! trie plus, depth-first, the exports of everything it reexports. Results
//! are cached per image on first resolve.

use alloc::{borrow::ToOwned, string::String, vec::Vec};

use crate::{
	images::{ImageHandle, RegistryState},
	macho,
	util::ByteCursor,
	Error, Result,
};

/// How far a reexport chain may lead before we assume the graph is malformed.
const MAX_REEXPORT_DEPTH: usize = 64;

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum ExportedSymbol {
	/// A symbol at `address_offset` from the image's load base.
	Regular { address_offset: u64 },

	/// A symbol whose value is not image-relative at all.
	Absolute { address: u64 },

	/// A symbol actually provided by another library.
	Reexport {
		library_ordinal: u64,
		imported_name: Option<String>,
	},

	/// A symbol with a resolver function; we bind to the stub.
	StubAndResolver { stub_offset: u64 },
}

/// Looks `symbol` up in a raw export trie.
pub(crate) fn walk_trie(trie: &[u8], symbol: &str) -> Result<Option<ExportedSymbol>> {
	if trie.is_empty() {
		return Ok(None);
	}

	let mut cursor = ByteCursor::new(trie);
	let mut remaining = symbol;

	loop {
		let terminal_size = cursor.uleb128()? as usize;

		if remaining.is_empty() {
			if terminal_size == 0 {
				return Ok(None);
			}
			return parse_terminal(&mut cursor).map(Some);
		}

		// hop over the terminal payload to the child edges
		let children_offset = cursor.position() + terminal_size;
		cursor.seek(children_offset)?;

		let child_count = cursor.u8()?;
		let mut next_node: Option<u64> = None;

		for _ in 0..child_count {
			let edge = cursor.cstr()?;
			let child_offset = cursor.uleb128()?;

			if next_node.is_none() {
				if let Some(stripped) = remaining.strip_prefix(edge) {
					remaining = stripped;
					next_node = Some(child_offset);
				}
			}
		}

		match next_node {
			Some(offset) => cursor.seek(offset as usize)?,
			None => return Ok(None),
		}
	}
}

fn parse_terminal(cursor: &mut ByteCursor<'_>) -> Result<ExportedSymbol> {
	let flags = cursor.uleb128()?;

	if (flags & macho::EXPORT_SYMBOL_FLAGS_REEXPORT) != 0 {
		let library_ordinal = cursor.uleb128()?;
		let imported_name = cursor.cstr()?;
		return Ok(ExportedSymbol::Reexport {
			library_ordinal,
			imported_name: if imported_name.is_empty() {
				None
			} else {
				Some(imported_name.to_owned())
			},
		});
	}

	if (flags & macho::EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER) != 0 {
		let stub_offset = cursor.uleb128()?;
		let _resolver_offset = cursor.uleb128()?;
		return Ok(ExportedSymbol::StubAndResolver { stub_offset });
	}

	let offset = cursor.uleb128()?;
	if (flags & macho::EXPORT_SYMBOL_FLAGS_KIND_MASK) == macho::EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE
	{
		Ok(ExportedSymbol::Absolute { address: offset })
	} else {
		Ok(ExportedSymbol::Regular {
			address_offset: offset,
		})
	}
}

/// Where a library ordinal points.
pub(crate) enum OrdinalTarget {
	Image(ImageHandle),
	/// Flat lookup: search every loaded image in load order.
	Flat,
}

pub(crate) fn image_for_ordinal(
	state: &RegistryState,
	handle: ImageHandle,
	ordinal: i64,
) -> Result<OrdinalTarget> {
	match ordinal {
		macho::BIND_SPECIAL_DYLIB_SELF => Ok(OrdinalTarget::Image(handle)),
		macho::BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE => state
			.process_image
			.map(OrdinalTarget::Image)
			.ok_or(Error::NoSuchResource),
		macho::BIND_SPECIAL_DYLIB_FLAT_LOOKUP => Ok(OrdinalTarget::Flat),
		n if n >= 1 => {
			// SAFETY: callers hold the registry mutex.
			let image = unsafe { handle.get() };
			image
				.dependencies()
				.get((n - 1) as usize)
				.copied()
				.map(OrdinalTarget::Image)
				.ok_or(Error::InvalidArgument)
		},
		_ => Err(Error::InvalidArgument),
	}
}

/// Resolves `symbol` against `handle`'s exports: its own trie first, then its
/// reexported libraries depth-first. The first match wins.
pub(crate) fn resolve_in_image(
	state: &RegistryState,
	handle: ImageHandle,
	symbol: &str,
) -> Result<Option<u64>> {
	resolve_with_depth(state, handle, symbol, 0)
}

/// Flat lookup: every loaded image in load order, first match wins.
pub(crate) fn resolve_flat(state: &RegistryState, symbol: &str) -> Result<Option<u64>> {
	for handle in state.load_order.iter().copied() {
		if let Some(address) = resolve_in_image(state, handle, symbol)? {
			return Ok(Some(address));
		}
	}
	Ok(None)
}

fn resolve_with_depth(
	state: &RegistryState,
	handle: ImageHandle,
	symbol: &str,
	depth: usize,
) -> Result<Option<u64>> {
	if depth > MAX_REEXPORT_DEPTH {
		// mutually-reexporting libraries with a missing symbol would
		// otherwise chase each other forever
		return Err(Error::Unknown);
	}

	// SAFETY: callers hold the registry mutex; the borrow ends before any recursion.
	if let Some(address) = unsafe { handle.get() }.cached_export(symbol) {
		return Ok(Some(address));
	}

	let (found, base) = {
		// SAFETY: as above; the trie borrow is dropped with this scope.
		let image = unsafe { handle.get() };
		(
			walk_trie(image.export_trie(), symbol)?,
			image.base_address(),
		)
	};

	let resolved = match found {
		Some(ExportedSymbol::Regular { address_offset }) => Some(base + address_offset),
		Some(ExportedSymbol::Absolute { address }) => Some(address),
		Some(ExportedSymbol::StubAndResolver { stub_offset }) => Some(base + stub_offset),
		Some(ExportedSymbol::Reexport {
			library_ordinal,
			imported_name,
		}) => {
			let target_name = imported_name.as_deref().unwrap_or(symbol);
			match image_for_ordinal(state, handle, library_ordinal as i64)? {
				OrdinalTarget::Image(target) => {
					resolve_with_depth(state, target, target_name, depth + 1)?
				},
				OrdinalTarget::Flat => resolve_flat(state, target_name)?,
			}
		},
		None => {
			// not ours directly; anything we reexport is also part of our
			// exported set
			let reexports: Vec<ImageHandle> = {
				// SAFETY: as above; copied out so no borrow survives the recursion.
				unsafe { handle.get() }.reexports().to_vec()
			};

			let mut result = None;
			for dependency in reexports {
				if let Some(address) =
					resolve_with_depth(state, dependency, symbol, depth + 1)?
				{
					result = Some(address);
					break;
				}
			}
			result
		},
	};

	if let Some(address) = resolved {
		// SAFETY: callers hold the registry mutex; no other image borrow is live here.
		unsafe { handle.get_mut() }.cache_export(symbol, address);
	}

	Ok(resolved)
}
