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

//! Test support: builds small but structurally-real Mach-O images in memory
//! (including genuine rebase/bind/lazy-bind opcode streams and export
//! tries), plus an in-memory [`System`] for the loader to run against.

#![allow(dead_code)]

use std::{
	boxed::Box,
	collections::HashMap,
	string::{String, ToString},
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
	vec::Vec,
};

use core::ptr::NonNull;

use crate::{
	macho,
	sys::{page_round_up, File, System},
	Error, Result,
};

// ---------------------------------------------------------------------------
// little-endian emit helpers
// ---------------------------------------------------------------------------

fn push_u32(bytes: &mut Vec<u8>, value: u32) {
	bytes.extend_from_slice(&value.to_le_bytes());
}

fn push_u64(bytes: &mut Vec<u8>, value: u64) {
	bytes.extend_from_slice(&value.to_le_bytes());
}

fn push_fixed_name(bytes: &mut Vec<u8>, name: &str) {
	let mut raw = [0u8; 16];
	raw[..name.len()].copy_from_slice(name.as_bytes());
	bytes.extend_from_slice(&raw);
}

pub(crate) fn uleb_encode(mut value: u64) -> Vec<u8> {
	let mut out = Vec::new();
	loop {
		let mut byte = (value & 0x7f) as u8;
		value >>= 7;
		if value != 0 {
			byte |= 0x80;
		}
		out.push(byte);
		if value == 0 {
			return out;
		}
	}
}

// ---------------------------------------------------------------------------
// export trie encoder
// ---------------------------------------------------------------------------

#[derive(Default)]
struct TrieNode {
	terminal: Option<u64>,
	children: Vec<(String, TrieNode)>,
}

fn common_prefix_len(a: &str, b: &str) -> usize {
	a.bytes().zip(b.bytes()).take_while(|(x, y)| x == y).count()
}

fn trie_insert(node: &mut TrieNode, name: &str, offset: u64) {
	if name.is_empty() {
		node.terminal = Some(offset);
		return;
	}

	for index in 0..node.children.len() {
		let common = common_prefix_len(&node.children[index].0, name);
		if common == 0 {
			continue;
		}

		if common == node.children[index].0.len() {
			trie_insert(&mut node.children[index].1, &name[common..], offset);
		} else {
			// split the edge
			let (edge, old_child) = node.children.remove(index);
			let mut intermediate = TrieNode::default();
			intermediate.children.push((edge[common..].to_string(), old_child));
			trie_insert(&mut intermediate, &name[common..], offset);
			node.children.insert(index, (edge[..common].to_string(), intermediate));
		}
		return;
	}

	let mut leaf = TrieNode::default();
	leaf.terminal = Some(offset);
	node.children.push((name.to_string(), leaf));
}

fn flatten<'a>(node: &'a TrieNode, out: &mut Vec<&'a TrieNode>) {
	out.push(node);
	for (_, child) in &node.children {
		flatten(child, out);
	}
}

fn encode_node(node: &TrieNode, offsets: &HashMap<*const TrieNode, usize>) -> Vec<u8> {
	let mut out = Vec::new();

	match node.terminal {
		Some(offset) => {
			let mut payload = Vec::new();
			payload.extend_from_slice(&uleb_encode(macho::EXPORT_SYMBOL_FLAGS_KIND_REGULAR));
			payload.extend_from_slice(&uleb_encode(offset));
			out.extend_from_slice(&uleb_encode(payload.len() as u64));
			out.extend_from_slice(&payload);
		},
		None => out.push(0),
	}

	out.push(node.children.len() as u8);
	for (edge, child) in &node.children {
		out.extend_from_slice(edge.as_bytes());
		out.push(0);
		let child_offset = offsets
			.get(&(child as *const TrieNode))
			.copied()
			.unwrap_or(0);
		out.extend_from_slice(&uleb_encode(child_offset as u64));
	}

	out
}

/// Encodes an export trie for `(symbol, image-relative offset)` pairs.
pub(crate) fn build_export_trie(symbols: &[(&str, u64)]) -> Vec<u8> {
	let mut root = TrieNode::default();
	for (name, offset) in symbols {
		trie_insert(&mut root, name, *offset);
	}

	let mut nodes = Vec::new();
	flatten(&root, &mut nodes);

	// child offsets are ULEB-encoded, so node sizes depend on the offsets and
	// vice versa; iterate to a fixed point
	let mut offsets: HashMap<*const TrieNode, usize> =
		nodes.iter().map(|&node| (node as *const TrieNode, 0)).collect();

	loop {
		let mut position = 0usize;
		let mut changed = false;
		for &node in &nodes {
			let key = node as *const TrieNode;
			if offsets[&key] != position {
				offsets.insert(key, position);
				changed = true;
			}
			position += encode_node(node, &offsets).len();
		}
		if !changed {
			break;
		}
	}

	let mut out = Vec::new();
	for &node in &nodes {
		out.extend_from_slice(&encode_node(node, &offsets));
	}
	out
}

// ---------------------------------------------------------------------------
// image builder
// ---------------------------------------------------------------------------

struct BindEntry {
	got_index: usize,
	library_ordinal: i64,
	symbol: String,
	weak: bool,
}

/// Builds a minimal but structurally-real 64-bit Mach-O image: `__PAGEZERO`
/// (executables), `__TEXT` (header + commands + code), `__DATA` (the import
/// table and, optionally, the linker-private `__dymple` section), and the
/// compressed dynamic linker info blobs.
pub(crate) struct ImageBuilder {
	file_type: u32,
	preferred_base: u64,
	pagezero: bool,
	text: Vec<u8>,
	got_words: Vec<u64>,
	dymple_section: bool,
	dependencies: Vec<(String, bool)>,
	exports: Vec<(String, u64)>,
	rebases: Vec<usize>,
	binds: Vec<BindEntry>,
	lazy_binds: Vec<BindEntry>,
	entry_text_offset: Option<u64>,
}

pub(crate) struct BuiltImage {
	pub bytes: Vec<u8>,
	/// Offset of each lazy import's record in the lazy-bind stream, by symbol.
	pub lazy_offsets: HashMap<String, u64>,
	/// File offset (== preferred-base-relative offset) of the text content.
	pub text_offset: u64,
	/// Preferred-base-relative offset of the `__DATA` segment (the import table).
	pub data_memory_offset: u64,
}

impl BuiltImage {
	/// The image-relative offset of a `__got` slot.
	pub fn got_memory_offset(&self, index: usize) -> u64 {
		self.data_memory_offset + (index as u64) * 8
	}
}

impl ImageBuilder {
	pub fn executable(preferred_base: u64) -> Self {
		Self::new(2, preferred_base, true)
	}

	pub fn dylib(preferred_base: u64) -> Self {
		Self::new(6, preferred_base, false)
	}

	fn new(file_type: u32, preferred_base: u64, pagezero: bool) -> Self {
		Self {
			file_type,
			preferred_base,
			pagezero,
			// something harmless for sections and entry points to land in
			text: vec![0xccu8; 64],
			got_words: Vec::new(),
			dymple_section: false,
			dependencies: Vec::new(),
			exports: Vec::new(),
			rebases: Vec::new(),
			binds: Vec::new(),
			lazy_binds: Vec::new(),
			entry_text_offset: None,
		}
	}

	pub fn text(mut self, bytes: &[u8]) -> Self {
		self.text = bytes.to_vec();
		self
	}

	/// Adds an import-table slot with the given initial value; returns its index.
	pub fn got_word(&mut self, value: u64) -> usize {
		self.got_words.push(value);
		self.got_words.len() - 1
	}

	pub fn with_dymple_section(mut self) -> Self {
		self.dymple_section = true;
		self
	}

	pub fn depend_on(mut self, path: &str) -> Self {
		self.dependencies.push((path.to_string(), false));
		self
	}

	pub fn reexport(mut self, path: &str) -> Self {
		self.dependencies.push((path.to_string(), true));
		self
	}

	/// Exports `name` at the given offset into the text content.
	pub fn export_text(mut self, name: &str, text_offset: u64) -> Self {
		self.exports.push((name.to_string(), text_offset));
		self
	}

	pub fn entry(mut self, text_offset: u64) -> Self {
		self.entry_text_offset = Some(text_offset);
		self
	}

	pub fn rebase_got(mut self, got_index: usize) -> Self {
		self.rebases.push(got_index);
		self
	}

	pub fn bind_got(mut self, got_index: usize, library_ordinal: i64, symbol: &str) -> Self {
		self.binds.push(BindEntry {
			got_index,
			library_ordinal,
			symbol: symbol.to_string(),
			weak: false,
		});
		self
	}

	pub fn weak_bind_got(mut self, got_index: usize, library_ordinal: i64, symbol: &str) -> Self {
		self.binds.push(BindEntry {
			got_index,
			library_ordinal,
			symbol: symbol.to_string(),
			weak: true,
		});
		self
	}

	pub fn lazy_bind_got(mut self, got_index: usize, library_ordinal: i64, symbol: &str) -> Self {
		self.lazy_binds.push(BindEntry {
			got_index,
			library_ordinal,
			symbol: symbol.to_string(),
			weak: false,
		});
		self
	}

	fn push_ordinal(stream: &mut Vec<u8>, ordinal: i64) {
		if ordinal < 0 {
			let immediate = (ordinal as u8) & macho::BIND_IMMEDIATE_MASK;
			stream.push(macho::BIND_OPCODE_SET_DYLIB_SPECIAL_IMM | immediate);
		} else if ordinal <= 15 {
			stream.push(macho::BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | ordinal as u8);
		} else {
			stream.push(macho::BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB);
			stream.extend_from_slice(&uleb_encode(ordinal as u64));
		}
	}

	pub fn build(self) -> BuiltImage {
		let align8 = |value: u64| (value + 7) & !7;
		let page_align = |value: u64| (value + 0xfff) & !0xfff;

		let data_segment_index: u8 = if self.pagezero { 2 } else { 1 };

		// -- command sizes (independent of layout) --

		let pagezero_size = if self.pagezero { 72u32 } else { 0 };
		let text_cmd_size = 72 + 80u32; // one section
		let data_section_count = 1 + if self.dymple_section { 1 } else { 0 };
		let data_cmd_size = 72 + 80 * data_section_count as u32;
		let dylib_cmd_sizes: Vec<u32> = self
			.dependencies
			.iter()
			.map(|(path, _)| align8(8 + 16 + path.len() as u64 + 1) as u32)
			.collect();
		let dyld_info_size = 48u32;
		let symtab_size = 24u32;
		let main_size = if self.entry_text_offset.is_some() {
			24u32
		} else {
			0
		};

		let total_command_size = pagezero_size
			+ text_cmd_size
			+ data_cmd_size
			+ dylib_cmd_sizes.iter().sum::<u32>()
			+ dyld_info_size
			+ symtab_size
			+ main_size;
		let command_count = (if self.pagezero { 1 } else { 0 })
			+ 2 + self.dependencies.len() as u32
			+ 2 + if self.entry_text_offset.is_some() { 1 } else { 0 };

		// -- file layout --

		let text_offset = 32 + total_command_size as u64;
		let text_file_end = text_offset + self.text.len() as u64;
		let text_vm_size = page_align(text_file_end);

		let data_bytes =
			(self.got_words.len() as u64) * 8 + if self.dymple_section { 16 } else { 0 };
		let data_file_offset = align8(text_file_end);
		let data_memory_offset = text_vm_size;
		let data_vm_size = page_align(data_bytes.max(8));

		// -- linker info blobs --

		let mut rebase_stream = Vec::new();
		if !self.rebases.is_empty() {
			rebase_stream
				.push(macho::REBASE_OPCODE_SET_TYPE_IMM | macho::REBASE_TYPE_POINTER);
			for got_index in &self.rebases {
				rebase_stream.push(
					macho::REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | data_segment_index,
				);
				rebase_stream.extend_from_slice(&uleb_encode((*got_index as u64) * 8));
				rebase_stream.push(macho::REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1);
			}
			rebase_stream.push(macho::REBASE_OPCODE_DONE);
		}

		let mut bind_stream = Vec::new();
		if !self.binds.is_empty() {
			for entry in &self.binds {
				Self::push_ordinal(&mut bind_stream, entry.library_ordinal);
				bind_stream.push(
					macho::BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM
						| if entry.weak {
							macho::BIND_SYMBOL_FLAGS_WEAK_IMPORT
						} else {
							0
						},
				);
				bind_stream.extend_from_slice(entry.symbol.as_bytes());
				bind_stream.push(0);
				bind_stream.push(macho::BIND_OPCODE_SET_TYPE_IMM | macho::BIND_TYPE_POINTER);
				bind_stream
					.push(macho::BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | data_segment_index);
				bind_stream.extend_from_slice(&uleb_encode((entry.got_index as u64) * 8));
				bind_stream.push(macho::BIND_OPCODE_DO_BIND);
			}
			bind_stream.push(macho::BIND_OPCODE_DONE);
		}

		let mut lazy_stream = Vec::new();
		let mut lazy_offsets = HashMap::new();
		for entry in &self.lazy_binds {
			lazy_offsets.insert(entry.symbol.clone(), lazy_stream.len() as u64);
			lazy_stream
				.push(macho::BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | data_segment_index);
			lazy_stream.extend_from_slice(&uleb_encode((entry.got_index as u64) * 8));
			Self::push_ordinal(&mut lazy_stream, entry.library_ordinal);
			lazy_stream.push(macho::BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
			lazy_stream.extend_from_slice(entry.symbol.as_bytes());
			lazy_stream.push(0);
			lazy_stream.push(macho::BIND_OPCODE_DO_BIND);
			lazy_stream.push(macho::BIND_OPCODE_DONE);
		}

		let export_symbols: Vec<(&str, u64)> = self
			.exports
			.iter()
			.map(|(name, text_rel)| (name.as_str(), text_offset + text_rel))
			.collect();
		let export_trie = if export_symbols.is_empty() {
			Vec::new()
		} else {
			build_export_trie(&export_symbols)
		};

		let rebase_offset = align8(data_file_offset + data_bytes);
		let bind_offset = align8(rebase_offset + rebase_stream.len() as u64);
		let lazy_offset = align8(bind_offset + bind_stream.len() as u64);
		let export_offset = align8(lazy_offset + lazy_stream.len() as u64);
		let file_end = export_offset + export_trie.len() as u64;

		// -- emit --

		let mut bytes = Vec::with_capacity(file_end as usize);

		// header
		push_u32(&mut bytes, macho::MAGIC_64);
		push_u32(
			&mut bytes,
			if cfg!(target_arch = "aarch64") {
				macho::CPU_TYPE_AARCH64
			} else {
				macho::CPU_TYPE_X86_64
			},
		);
		push_u32(&mut bytes, 3);
		push_u32(&mut bytes, self.file_type);
		push_u32(&mut bytes, command_count);
		push_u32(&mut bytes, total_command_size);
		push_u32(&mut bytes, 0);
		push_u32(&mut bytes, 0);

		let emit_segment = |bytes: &mut Vec<u8>,
		                        name: &str,
		                        vm_address: u64,
		                        vm_size: u64,
		                        file_offset: u64,
		                        file_size: u64,
		                        max_protection: u32,
		                        initial_protection: u32,
		                        sections: &[(&str, &str, u64, u64, u64)]| {
			push_u32(bytes, macho::LC_SEGMENT_64);
			push_u32(bytes, 72 + 80 * sections.len() as u32);
			push_fixed_name(bytes, name);
			push_u64(bytes, vm_address);
			push_u64(bytes, vm_size);
			push_u64(bytes, file_offset);
			push_u64(bytes, file_size);
			push_u32(bytes, max_protection);
			push_u32(bytes, initial_protection);
			push_u32(bytes, sections.len() as u32);
			push_u32(bytes, 0);

			for (section_name, segment_name, address, size, section_file_offset) in sections {
				push_fixed_name(bytes, section_name);
				push_fixed_name(bytes, segment_name);
				push_u64(bytes, *address);
				push_u64(bytes, *size);
				push_u32(bytes, *section_file_offset as u32);
				push_u32(bytes, 3); // 8-byte alignment
				push_u32(bytes, 0);
				push_u32(bytes, 0);
				push_u32(bytes, 0);
				push_u32(bytes, 0);
				push_u32(bytes, 0);
				push_u32(bytes, 0);
			}
		};

		if self.pagezero {
			emit_segment(
				&mut bytes,
				"__PAGEZERO",
				0,
				self.preferred_base,
				0,
				0,
				0,
				0,
				&[],
			);
		}

		emit_segment(
			&mut bytes,
			"__TEXT",
			self.preferred_base,
			text_vm_size,
			0,
			text_file_end,
			7,
			5,
			&[(
				"__text",
				"__TEXT",
				self.preferred_base + text_offset,
				self.text.len() as u64,
				text_offset,
			)],
		);

		let data_vm_address = self.preferred_base + data_memory_offset;
		let got_size = (self.got_words.len() as u64) * 8;
		let mut data_sections: Vec<(&str, &str, u64, u64, u64)> = vec![(
			"__got",
			"__DATA",
			data_vm_address,
			got_size,
			data_file_offset,
		)];
		if self.dymple_section {
			data_sections.push((
				"__dymple",
				"__DATA",
				data_vm_address + got_size,
				16,
				data_file_offset + got_size,
			));
		}
		emit_segment(
			&mut bytes,
			"__DATA",
			data_vm_address,
			data_vm_size,
			data_file_offset,
			data_bytes,
			3,
			3,
			&data_sections,
		);

		for (index, (path, reexported)) in self.dependencies.iter().enumerate() {
			push_u32(
				&mut bytes,
				if *reexported {
					macho::LC_REEXPORT_DYLIB
				} else {
					macho::LC_LOAD_DYLIB
				},
			);
			push_u32(&mut bytes, dylib_cmd_sizes[index]);
			push_u32(&mut bytes, 24); // name offset
			push_u32(&mut bytes, 0);
			push_u32(&mut bytes, 0x10000);
			push_u32(&mut bytes, 0x10000);
			bytes.extend_from_slice(path.as_bytes());
			bytes.push(0);
			while bytes.len() % 8 != 0 {
				bytes.push(0);
			}
		}

		push_u32(&mut bytes, macho::LC_COMPRESSED_DYNAMIC_LINKER_INFO_ONLY);
		push_u32(&mut bytes, dyld_info_size);
		push_u32(&mut bytes, rebase_offset as u32);
		push_u32(&mut bytes, rebase_stream.len() as u32);
		push_u32(&mut bytes, bind_offset as u32);
		push_u32(&mut bytes, bind_stream.len() as u32);
		push_u32(&mut bytes, 0);
		push_u32(&mut bytes, 0);
		push_u32(&mut bytes, lazy_offset as u32);
		push_u32(&mut bytes, lazy_stream.len() as u32);
		push_u32(&mut bytes, export_offset as u32);
		push_u32(&mut bytes, export_trie.len() as u32);

		push_u32(&mut bytes, macho::LC_SYMBOL_TABLE_INFO);
		push_u32(&mut bytes, symtab_size);
		push_u32(&mut bytes, 0);
		push_u32(&mut bytes, 0);
		push_u32(&mut bytes, 0);
		push_u32(&mut bytes, 0);

		if let Some(entry_text_offset) = self.entry_text_offset {
			push_u32(&mut bytes, macho::LC_MAIN);
			push_u32(&mut bytes, main_size);
			push_u64(&mut bytes, text_offset + entry_text_offset);
			push_u64(&mut bytes, 0);
		}

		assert_eq!(bytes.len() as u64, text_offset, "command sizing is off");

		// text content
		bytes.extend_from_slice(&self.text);

		// data content
		while (bytes.len() as u64) < data_file_offset {
			bytes.push(0);
		}
		for word in &self.got_words {
			push_u64(&mut bytes, *word);
		}
		if self.dymple_section {
			bytes.extend_from_slice(&[0u8; 16]);
		}

		// blobs
		for (offset, blob) in [
			(rebase_offset, &rebase_stream),
			(bind_offset, &bind_stream),
			(lazy_offset, &lazy_stream),
			(export_offset, &export_trie),
		] {
			while (bytes.len() as u64) < offset {
				bytes.push(0);
			}
			bytes.extend_from_slice(blob);
		}

		BuiltImage {
			bytes,
			lazy_offsets,
			text_offset,
			data_memory_offset,
		}
	}
}

// ---------------------------------------------------------------------------
// in-memory system
// ---------------------------------------------------------------------------

pub(crate) struct MemFile {
	data: Arc<Vec<u8>>,
	reads: Arc<AtomicUsize>,
}

impl File for MemFile {
	fn byte_count(&self) -> u64 {
		self.data.len() as u64
	}

	fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<usize> {
		self.reads.fetch_add(1, Ordering::Relaxed);
		let offset = offset as usize;
		if offset >= self.data.len() {
			return Ok(0);
		}
		let available = &self.data[offset..];
		let count = available.len().min(buffer.len());
		buffer[..count].copy_from_slice(&available[..count]);
		Ok(count)
	}

	fn duplicate(&self) -> Result<Box<dyn File>> {
		Ok(Box::new(MemFile {
			data: self.data.clone(),
			reads: self.reads.clone(),
		}))
	}
}

pub(crate) struct MemSystem {
	files: Mutex<HashMap<String, Arc<Vec<u8>>>>,
	opens: AtomicUsize,
	reads: Arc<AtomicUsize>,
	mappings: Mutex<HashMap<u64, usize>>,
}

impl MemSystem {
	pub fn new() -> Self {
		Self {
			files: Mutex::new(HashMap::new()),
			opens: AtomicUsize::new(0),
			reads: Arc::new(AtomicUsize::new(0)),
			mappings: Mutex::new(HashMap::new()),
		}
	}

	pub fn add_file(&self, path: &str, bytes: Vec<u8>) {
		self.files
			.lock()
			.unwrap()
			.insert(path.to_string(), Arc::new(bytes));
	}

	pub fn open_count(&self) -> usize {
		self.opens.load(Ordering::Relaxed)
	}

	pub fn read_count(&self) -> usize {
		self.reads.load(Ordering::Relaxed)
	}

	pub fn live_mapping_count(&self) -> usize {
		self.mappings.lock().unwrap().len()
	}
}

impl System for MemSystem {
	fn open(&self, path: &str) -> Result<Box<dyn File>> {
		let data = self
			.files
			.lock()
			.unwrap()
			.get(path)
			.cloned()
			.ok_or(Error::NoSuchResource)?;
		self.opens.fetch_add(1, Ordering::Relaxed);
		Ok(Box::new(MemFile {
			data,
			reads: self.reads.clone(),
		}))
	}

	fn map_shared(&self, byte_count: u64) -> Result<NonNull<u8>> {
		let size = page_round_up(byte_count).max(0x1000) as usize;
		let layout = std::alloc::Layout::from_size_align(size, 0x1000).unwrap();
		// SAFETY: the layout is non-zero-sized.
		let pointer = unsafe { std::alloc::alloc_zeroed(layout) };
		let pointer = NonNull::new(pointer).ok_or(Error::TemporaryOutage)?;
		self.mappings
			.lock()
			.unwrap()
			.insert(pointer.as_ptr() as u64, size);
		Ok(pointer)
	}

	unsafe fn unmap_shared(&self, address: NonNull<u8>, byte_count: u64) {
		let size = self
			.mappings
			.lock()
			.unwrap()
			.remove(&(address.as_ptr() as u64))
			.expect("unmapping something that was never mapped");
		assert_eq!(size, page_round_up(byte_count).max(0x1000) as usize);
		let layout = std::alloc::Layout::from_size_align(size, 0x1000).unwrap();
		std::alloc::dealloc(address.as_ptr(), layout);
	}
}
