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

//! The image registry and loader.
//!
//! Images are keyed by absolute path; at most one image is ever loaded per
//! path, and images live until the process exits (there is no unload).
//! Loading is recursive: an image's `load_dylib`/`reexport_dylib` commands
//! pull its dependencies in before the image itself finishes loading. The
//! registry entry is created *before* recursion so that dependency cycles
//! terminate by observing the half-constructed entry.
//!
//! One process-wide mutex guards the whole registry; recursive loads run
//! within a single acquisition.

use alloc::{borrow::ToOwned, boxed::Box, string::String, vec, vec::Vec};
use core::ptr::NonNull;

use hashbrown::HashMap;
use log::{debug, warn};
use spin::{Mutex, Once};

use crate::{
	bind,
	macho::{self, FileType, MachHeader, SegmentCommand64},
	stub,
	sys::{page_round_up, File, System},
	util::ByteCursor,
	Error, Result,
};

/// The canonical path of the linker's own image.
pub const LIBDYMPLE_PATH: &str = "/sys/lib/libdymple.dylib";

/// A loaded segment. Reserve-as-invalid segments (zero initial and maximum
/// protection, e.g. `__PAGEZERO`) are recorded with their *preferred*
/// address and never backed by the mapping.
#[derive(Debug)]
pub struct Segment {
	pub name: String,
	pub address: u64,
	pub size: u64,
	pub reserved: bool,
}

#[derive(Debug)]
pub struct Section {
	pub segment_name: String,
	pub name: String,
	pub address: u64,
	pub size: u64,
	pub file_offset: u64,
	pub memory_offset: u64,
}

/// A loaded Mach-O image.
///
/// All mutation happens under the registry mutex; [`ImageHandle`]s stay
/// valid for the life of the process.
pub struct Image {
	path: String,
	file: Box<dyn File>,
	file_type: FileType,
	header_flags: macho::HeaderFlags,

	base: u64,
	size: u64,
	/// The lowest segment address the file asked for; the difference between
	/// this and `base` is the slide applied by rebasing.
	preferred_base: u64,

	segments: Vec<Segment>,
	sections: Vec<Section>,

	dependencies: Vec<ImageHandle>,
	reexports: Vec<ImageHandle>,
	dependents: Vec<ImageHandle>,

	rebase_info: Box<[u8]>,
	bind_info: Box<[u8]>,
	weak_bind_info: Box<[u8]>,
	lazy_bind_info: Box<[u8]>,
	export_trie: Box<[u8]>,

	/// Counts from `symbol_table_info`; carried for diagnostics only (the
	/// export trie is the sole resolution mechanism).
	symbol_table: Option<macho::SymbolTableInfoCommand>,

	/// Lazily-populated cache over the export trie.
	exports: HashMap<String, u64>,

	entry_address: Option<u64>,
	dynamic_linker_path: Option<String>,
}

impl Image {
	fn empty(path: &str, file: Box<dyn File>) -> Self {
		Self {
			path: path.to_owned(),
			file,
			file_type: FileType::DynamicLibrary,
			header_flags: macho::HeaderFlags::empty(),
			base: 0,
			size: 0,
			preferred_base: 0,
			segments: Vec::new(),
			sections: Vec::new(),
			dependencies: Vec::new(),
			reexports: Vec::new(),
			dependents: Vec::new(),
			rebase_info: Box::new([]),
			bind_info: Box::new([]),
			weak_bind_info: Box::new([]),
			lazy_bind_info: Box::new([]),
			export_trie: Box::new([]),
			symbol_table: None,
			exports: HashMap::new(),
			entry_address: None,
			dynamic_linker_path: None,
		}
	}

	pub fn path(&self) -> &str {
		&self.path
	}

	pub fn file_type(&self) -> FileType {
		self.file_type
	}

	pub fn header_flags(&self) -> macho::HeaderFlags {
		self.header_flags
	}

	pub fn base_address(&self) -> u64 {
		self.base
	}

	pub fn byte_count(&self) -> u64 {
		self.size
	}

	pub fn preferred_base_address(&self) -> u64 {
		self.preferred_base
	}

	pub fn segments(&self) -> &[Segment] {
		&self.segments
	}

	pub fn sections(&self) -> &[Section] {
		&self.sections
	}

	pub fn dependencies(&self) -> &[ImageHandle] {
		&self.dependencies
	}

	pub fn reexports(&self) -> &[ImageHandle] {
		&self.reexports
	}

	pub fn dependents(&self) -> &[ImageHandle] {
		&self.dependents
	}

	pub fn entry_address(&self) -> Option<u64> {
		self.entry_address
	}

	pub fn dynamic_linker_path(&self) -> Option<&str> {
		self.dynamic_linker_path.as_deref()
	}

	/// The classic symbol-table counts, if the image carried them. Parsed for
	/// diagnostics; never consulted for resolution.
	pub fn symbol_table_info(&self) -> Option<macho::SymbolTableInfoCommand> {
		self.symbol_table
	}

	pub(crate) fn export_trie(&self) -> &[u8] {
		&self.export_trie
	}

	pub(crate) fn rebase_info(&self) -> &[u8] {
		&self.rebase_info
	}

	pub(crate) fn bind_info(&self) -> &[u8] {
		&self.bind_info
	}

	pub(crate) fn weak_bind_info(&self) -> &[u8] {
		&self.weak_bind_info
	}

	pub(crate) fn lazy_bind_info(&self) -> &[u8] {
		&self.lazy_bind_info
	}

	pub(crate) fn cached_export(&self, name: &str) -> Option<u64> {
		self.exports.get(name).copied()
	}

	pub(crate) fn cache_export(&mut self, name: &str, address: u64) {
		self.exports.insert(name.to_owned(), address);
	}

	pub fn contains_address(&self, address: u64) -> bool {
		self.base != 0 && address >= self.base && address < self.base + self.size
	}
}

/// A reference to a loaded image. Handles are plain pointers under the hood;
/// the image storage is never freed (images live for the process), and all
/// access to the pointee goes through the registry mutex.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ImageHandle(NonNull<Image>);

// SAFETY: the pointee is only ever touched under the registry mutex.
unsafe impl Send for ImageHandle {}
unsafe impl Sync for ImageHandle {}

impl ImageHandle {
	/// # Safety
	/// The registry mutex must be held, and no `&mut Image` to the same image
	/// may be live.
	pub(crate) unsafe fn get(&self) -> &Image {
		self.0.as_ref()
	}

	/// # Safety
	/// The registry mutex must be held, and no other reference to the same
	/// image may be live.
	#[allow(clippy::mut_from_ref)]
	pub(crate) unsafe fn get_mut(&self) -> &mut Image {
		&mut *self.0.as_ptr()
	}

	pub fn as_raw(&self) -> *mut Image {
		self.0.as_ptr()
	}

	pub fn from_raw(raw: *mut Image) -> Option<Self> {
		NonNull::new(raw).map(Self)
	}
}

pub(crate) struct RegistryState {
	images: HashMap<String, ImageHandle>,
	/// Images in completion order; flat symbol lookup and address scans walk this.
	pub(crate) load_order: Vec<ImageHandle>,
	pub(crate) process_image: Option<ImageHandle>,
	dymple_image: Option<ImageHandle>,
}

/// The process-wide image registry.
pub struct ImageRegistry {
	system: &'static dyn System,
	state: Mutex<RegistryState>,
}

impl ImageRegistry {
	pub fn new(system: &'static dyn System) -> Self {
		Self {
			system,
			state: Mutex::new(RegistryState {
				images: HashMap::new(),
				load_order: Vec::new(),
				process_image: None,
				dymple_image: None,
			}),
		}
	}

	/// One-shot process setup: loads the process binary and records it.
	pub fn initialize_process(&self, path: &str) -> Result<ImageHandle> {
		let mut state = self.state.lock();
		if state.process_image.is_some() {
			return Err(Error::AlreadyInProgress);
		}

		let handle = self.load_by_name_locked(&mut state, path)?;
		state.process_image = Some(handle);
		Ok(handle)
	}

	pub fn load_image_by_name(&self, name: &str) -> Result<ImageHandle> {
		let mut state = self.state.lock();
		self.load_by_name_locked(&mut state, name)
	}

	pub fn load_image_from_file(&self, file: Box<dyn File>, path: &str) -> Result<ImageHandle> {
		let mut state = self.state.lock();
		self.load_from_file_locked(&mut state, file, path)
	}

	pub fn find_loaded_image_by_name(&self, name: &str) -> Result<ImageHandle> {
		let state = self.state.lock();
		state.images.get(name).copied().ok_or(Error::NoSuchResource)
	}

	/// The image whose mapped range contains `address`, if any. A linear
	/// scan under the registry mutex.
	pub fn image_containing_address(&self, address: u64) -> Option<ImageHandle> {
		let state = self.state.lock();
		state
			.load_order
			.iter()
			.copied()
			// SAFETY: we hold the registry mutex.
			.find(|handle| unsafe { handle.get() }.contains_address(address))
	}

	/// Duplicates the file handle of the process binary.
	pub fn open_process_binary_raw(&self) -> Result<Box<dyn File>> {
		let state = self.state.lock();
		let handle = state.process_image.ok_or(Error::NoSuchResource)?;
		// SAFETY: we hold the registry mutex.
		unsafe { handle.get() }.file.duplicate()
	}

	pub fn process_image(&self) -> Option<ImageHandle> {
		self.state.lock().process_image
	}

	/// The linker's own image, once something has loaded it by its canonical path.
	pub fn dymple_image(&self) -> Option<ImageHandle> {
		self.state.lock().dymple_image
	}

	/// Resolves one lazy binding for `image` (identified by the offset into
	/// its lazy-bind instruction stream), patches the import slot, and
	/// returns the resolved address.
	pub fn bind_lazy_symbol(&self, image: ImageHandle, info_offset: u64) -> Result<u64> {
		let state = self.state.lock();
		bind::bind_lazy(&state, image, info_offset)
	}

	fn load_by_name_locked(
		&self,
		state: &mut RegistryState,
		path: &str,
	) -> Result<ImageHandle> {
		if let Some(&handle) = state.images.get(path) {
			return Ok(handle);
		}

		let file = self.system.open(path)?;
		self.load_from_file_locked(state, file, path)
	}

	fn load_from_file_locked(
		&self,
		state: &mut RegistryState,
		file: Box<dyn File>,
		path: &str,
	) -> Result<ImageHandle> {
		// loading the same path twice is a success, not an error
		if let Some(&handle) = state.images.get(path) {
			return Ok(handle);
		}

		// the slot goes in *before* the dependency pass so that cycles
		// terminate by finding it
		let handle = ImageHandle(
			NonNull::new(Box::into_raw(Box::new(Image::empty(path, file))))
				.expect("Box::into_raw never returns null"),
		);
		state.images.insert(path.to_owned(), handle);
		state.load_order.push(handle);

		match self.populate_image(state, handle) {
			Ok(()) => {
				if path == LIBDYMPLE_PATH {
					state.dymple_image = Some(handle);
				}
				// SAFETY: we hold the registry mutex.
				debug!(
					"loaded image {} at {:#x} (size {:#x})",
					path,
					unsafe { handle.get() }.base,
					unsafe { handle.get() }.size
				);
				Ok(handle)
			},
			Err(err) => {
				warn!("failed to load image {}: {}", path, err);
				self.unwind_failed_load(state, handle, path);
				Err(err)
			},
		}
	}

	/// Clears every trace of a load that failed partway: the registry slot,
	/// dependency back-links, the shared-memory mapping, and the image
	/// storage itself (which also releases the file handle).
	fn unwind_failed_load(&self, state: &mut RegistryState, handle: ImageHandle, path: &str) {
		state.images.remove(path);
		state.load_order.retain(|&other| other != handle);

		let (dependencies, base, size) = {
			// SAFETY: we hold the registry mutex and the image is no longer reachable.
			let image = unsafe { handle.get_mut() };
			(
				core::mem::take(&mut image.dependencies),
				image.base,
				image.size,
			)
		};

		for dependency in dependencies {
			if dependency == handle {
				continue;
			}
			// SAFETY: we hold the registry mutex.
			unsafe { dependency.get_mut() }
				.dependents
				.retain(|&other| other != handle);
		}

		if base != 0 {
			// SAFETY: the mapping was created by `populate_image` with exactly
			//         this base and rounded size, and nothing refers to it anymore.
			unsafe {
				self.system.unmap_shared(
					NonNull::new(base as *mut u8).expect("mapped base is never null"),
					page_round_up(size),
				);
			}
		}

		// SAFETY: the handle was created from Box::into_raw above and is now
		//         unreachable from the registry.
		drop(unsafe { Box::from_raw(handle.as_raw()) });
	}

	fn populate_image(&self, state: &mut RegistryState, handle: ImageHandle) -> Result<()> {
		// -- header and load commands --------------------------------------

		let (header, commands) = {
			// SAFETY: we hold the registry mutex; no other reference is live.
			let image = unsafe { handle.get_mut() };

			let mut header_bytes = [0u8; core::mem::size_of::<MachHeader>()];
			image.file.read_exact_at(0, &mut header_bytes)?;
			let header: MachHeader = macho::read_struct(&header_bytes, 0)?;
			image.file_type = macho::validate_header(&header)?;
			image.header_flags = macho::HeaderFlags::from_bits_truncate(header.flags);

			// an obviously-bogus command area is rejected before we try to
			// allocate for it
			if header.total_command_size as u64
				> image
					.file
					.byte_count()
					.saturating_sub(header_bytes.len() as u64)
			{
				return Err(Error::InvalidArgument);
			}

			let mut commands = vec![0u8; header.total_command_size as usize];
			image
				.file
				.read_exact_at(header_bytes.len() as u64, &mut commands)?;
			(header, commands)
		};

		// -- sizing pass ----------------------------------------------------

		let mut file_load_base = u64::MAX;
		let mut file_load_top = 0u64;
		let mut segment_count = 0usize;
		let mut section_count = 0usize;

		for command in macho::LoadCommandIterator::new(&commands, header.command_count) {
			let (id, body) = command?;
			if id != macho::LC_SEGMENT_64 {
				continue;
			}

			let segment: SegmentCommand64 = macho::read_struct(body, 8)?;
			segment_count += 1;
			section_count += segment.section_count as usize;

			// reserve-as-invalid ranges don't contribute to the load bounds
			if segment.initial_protection == 0 && segment.maximum_protection == 0 {
				continue;
			}

			file_load_base = file_load_base.min(segment.vm_address);
			file_load_top = file_load_top.max(segment.vm_address + segment.vm_size);
		}

		if segment_count == 0 || file_load_base == u64::MAX || file_load_top <= file_load_base {
			return Err(Error::InvalidArgument);
		}

		// -- backing storage ------------------------------------------------

		let size = file_load_top - file_load_base;
		let mapped_size = page_round_up(size);
		let base = self.system.map_shared(mapped_size)?.as_ptr() as u64;

		{
			// SAFETY: we hold the registry mutex; no other reference is live.
			let image = unsafe { handle.get_mut() };
			image.base = base;
			image.size = size;
			image.preferred_base = file_load_base;
			image.segments = Vec::with_capacity(segment_count);
			image.sections = Vec::with_capacity(section_count);
		}

		// -- loading pass ---------------------------------------------------

		let mut raw_segments: Vec<SegmentCommand64> = Vec::with_capacity(segment_count);
		let mut entry_file_offset: Option<u64> = None;
		let mut entry_pc: Option<u64> = None;

		for command in macho::LoadCommandIterator::new(&commands, header.command_count) {
			let (id, body) = command?;
			match id {
				macho::LC_SEGMENT_64 => {
					let segment: SegmentCommand64 = macho::read_struct(body, 8)?;
					let name = macho::fixed_name(&segment.name)?.to_owned();
					let reserved =
						segment.initial_protection == 0 && segment.maximum_protection == 0;

					// SAFETY: we hold the registry mutex; references are scoped per block.
					let image = unsafe { handle.get_mut() };

					if reserved {
						image.segments.push(Segment {
							name,
							address: segment.vm_address,
							size: segment.vm_size,
							reserved: true,
						});
					} else {
						if segment.file_size > segment.vm_size {
							return Err(Error::InvalidArgument);
						}
						let shm_offset = segment.vm_address - file_load_base;
						if shm_offset + segment.vm_size > mapped_size {
							return Err(Error::InvalidArgument);
						}

						let load_address = base + shm_offset;
						if segment.file_size > 0 {
							// the rest of `vm_size` stays zero; the shared
							// memory came zero-filled
							//
							// SAFETY: the destination lies within the mapping we just created.
							let destination = unsafe {
								core::slice::from_raw_parts_mut(
									load_address as *mut u8,
									segment.file_size as usize,
								)
							};
							image
								.file
								.read_exact_at(segment.file_offset, destination)?;
						}

						image.segments.push(Segment {
							name,
							address: load_address,
							size: segment.vm_size,
							reserved: false,
						});
					}

					// inline section descriptors follow the segment command
					let mut section_offset = 8 + core::mem::size_of::<SegmentCommand64>();
					for _ in 0..segment.section_count {
						let section: macho::Section64 =
							macho::read_struct(body, section_offset)?;
						section_offset += core::mem::size_of::<macho::Section64>();

						let memory_offset = section.address.wrapping_sub(file_load_base);
						image.sections.push(Section {
							segment_name: macho::fixed_name(&section.segment_name)?.to_owned(),
							name: macho::fixed_name(&section.section_name)?.to_owned(),
							address: base + memory_offset,
							size: section.size,
							file_offset: section.file_offset as u64,
							memory_offset,
						});
					}

					raw_segments.push(segment);
				},
				macho::LC_MAIN => {
					let entry: macho::EntryPointCommand = macho::read_struct(body, 8)?;
					entry_file_offset = Some(entry.entry_offset);
				},
				macho::LC_UNIX_THREAD => {
					let thread: macho::ThreadCommandHeader = macho::read_struct(body, 8)?;
					let pc_offset = 16 + macho::THREAD_STATE_PC_INDEX * 8;
					if (thread.count as usize) * 4 + 16 <= body.len() {
						entry_pc = Some(macho::read_struct(body, pc_offset)?);
					}
				},
				macho::LC_COMPRESSED_DYNAMIC_LINKER_INFO
				| macho::LC_COMPRESSED_DYNAMIC_LINKER_INFO_ONLY => {
					let info: macho::CompressedDynamicLinkerInfoCommand =
						macho::read_struct(body, 8)?;

					// SAFETY: we hold the registry mutex; references are scoped per block.
					let image = unsafe { handle.get_mut() };
					image.rebase_info =
						read_blob(&*image.file, info.rebase_offset, info.rebase_size)?;
					image.bind_info = read_blob(&*image.file, info.bind_offset, info.bind_size)?;
					image.weak_bind_info =
						read_blob(&*image.file, info.weak_bind_offset, info.weak_bind_size)?;
					image.lazy_bind_info =
						read_blob(&*image.file, info.lazy_bind_offset, info.lazy_bind_size)?;
					image.export_trie =
						read_blob(&*image.file, info.export_offset, info.export_size)?;
				},
				macho::LC_SYMBOL_TABLE_INFO => {
					let info: macho::SymbolTableInfoCommand = macho::read_struct(body, 8)?;
					// SAFETY: we hold the registry mutex; references are scoped per block.
					unsafe { handle.get_mut() }.symbol_table = Some(info);
				},
				macho::LC_LOAD_DYNAMIC_LINKER => {
					let linker: macho::DylinkerCommand = macho::read_struct(body, 8)?;
					let path = command_string(body, linker.name_offset as usize)?;
					// SAFETY: we hold the registry mutex; references are scoped per block.
					unsafe { handle.get_mut() }.dynamic_linker_path = Some(path.to_owned());
				},
				_ => {},
			}
		}

		// a unix_thread entry names a virtual address; turn it into a file
		// offset so both entry flavors resolve the same way below
		if let (None, Some(pc)) = (entry_file_offset, entry_pc) {
			entry_file_offset = raw_segments
				.iter()
				.find(|segment| {
					pc >= segment.vm_address && pc < segment.vm_address + segment.file_size
				})
				.map(|segment| pc - segment.vm_address + segment.file_offset);
		}

		// -- entry resolution -----------------------------------------------

		if let Some(offset) = entry_file_offset {
			// SAFETY: we hold the registry mutex; references are scoped per block.
			let image = unsafe { handle.get_mut() };
			let section = image
				.sections
				.iter()
				.find(|section| {
					section.size > 0
						&& offset >= section.file_offset
						&& offset < section.file_offset + section.size
				})
				.ok_or(Error::InvalidArgument)?;
			image.entry_address = Some(section.address + (offset - section.file_offset));
		}

		// -- dependency pass (recursive) ------------------------------------

		for command in macho::LoadCommandIterator::new(&commands, header.command_count) {
			let (id, body) = command?;
			if id != macho::LC_LOAD_DYLIB && id != macho::LC_REEXPORT_DYLIB {
				continue;
			}

			let dylib: macho::DylibCommand = macho::read_struct(body, 8)?;
			let dependency_path = command_string(body, dylib.name_offset as usize)?.to_owned();

			let dependency = self.load_by_name_locked(state, &dependency_path)?;

			{
				// SAFETY: we hold the registry mutex; references are scoped per block.
				let image = unsafe { handle.get_mut() };
				image.dependencies.push(dependency);
				if id == macho::LC_REEXPORT_DYLIB {
					image.reexports.push(dependency);
				}
			}

			if dependency == handle {
				// an image that lists itself; the back-link is already implied
				continue;
			}
			// SAFETY: we hold the registry mutex; `dependency != handle`, so this
			//         does not alias the scoped borrow above.
			let dependency_image = unsafe { dependency.get_mut() };
			if !dependency_image.dependents.contains(&handle) {
				dependency_image.dependents.push(handle);
			}
		}

		// -- relocations ----------------------------------------------------
		//
		// lazy bindings are deliberately *not* applied here; they resolve on
		// first call through the binding stub.

		bind::apply_rebase(handle)?;
		bind::apply_bind_stream(state, handle, bind::BindStream::Normal)?;
		bind::apply_bind_stream(state, handle, bind::BindStream::Weak)?;

		self.install_linker_hooks(handle);

		Ok(())
	}

	/// Fills the image's linker-private slot (the `__DATA,__dymple` section,
	/// when present) with the image handle and the lazy-binding stub address.
	/// The image's binding helpers push these for the stub.
	fn install_linker_hooks(&self, handle: ImageHandle) {
		// SAFETY: we hold the registry mutex.
		let image = unsafe { handle.get() };
		let hook_section = image
			.sections
			.iter()
			.find(|section| section.segment_name == "__DATA" && section.name == "__dymple");

		if let Some(section) = hook_section {
			if section.size >= 16 {
				// SAFETY: the section lies within the image's mapping.
				unsafe {
					*(section.address as *mut u64) = handle.as_raw() as u64;
					*((section.address + 8) as *mut u64) = stub::bind_trampoline_address();
				}
			}
		}
	}
}

fn read_blob(file: &dyn File, offset: u32, size: u32) -> Result<Box<[u8]>> {
	if size == 0 {
		return Ok(Box::new([]));
	}
	let mut blob = vec![0u8; size as usize];
	file.read_exact_at(offset as u64, &mut blob)?;
	Ok(blob.into_boxed_slice())
}

/// A string embedded in a load command at the given offset (NUL-terminated,
/// within the command's declared size).
fn command_string(body: &[u8], offset: usize) -> Result<&str> {
	let mut cursor = ByteCursor::at_offset(body, offset)?;
	cursor.cstr()
}

static REGISTRY: Once<ImageRegistry> = Once::new();

/// One-shot initialisation of the process-wide registry: loads the process
/// binary and returns its image. A second call fails.
pub fn images_init(
	system: &'static dyn System,
	process_binary_path: &str,
) -> Result<ImageHandle> {
	if REGISTRY.is_completed() {
		return Err(Error::AlreadyInProgress);
	}
	let registry = REGISTRY.call_once(|| ImageRegistry::new(system));
	registry.initialize_process(process_binary_path)
}

/// The process-wide registry, once [`images_init`] has created it.
pub fn registry() -> Result<&'static ImageRegistry> {
	REGISTRY.get().ok_or(Error::NoSuchResource)
}

pub fn load_image_by_name(name: &str) -> Result<ImageHandle> {
	registry()?.load_image_by_name(name)
}

pub fn find_loaded_image_by_name(name: &str) -> Result<ImageHandle> {
	registry()?.find_loaded_image_by_name(name)
}

pub fn image_containing_address(address: u64) -> Option<ImageHandle> {
	registry().ok()?.image_containing_address(address)
}

pub fn open_process_binary_raw() -> Result<Box<dyn File>> {
	registry()?.open_process_binary_raw()
}

#[cfg(test)]
mod tests {
	use alloc::boxed::Box;

	use super::*;
	use crate::testmacho::{ImageBuilder, MemSystem};

	const LIBC_PATH: &str = "/sys/lib/libcore.dylib";
	const LIBB_PATH: &str = "/sys/lib/libmiddle.dylib";
	const BIN_PATH: &str = "/bin/app";

	const FOO_TEXT_OFFSET: u64 = 0x10;
	const BAR_TEXT_OFFSET: u64 = 0x20;

	/// `/bin/app` depends on `libmiddle` and `libcore`; `libmiddle` reexports
	/// `libcore` (which defines `_foo`) and defines `_bar` itself.
	struct Fixture {
		system: &'static MemSystem,
		registry: ImageRegistry,
		app: crate::testmacho::BuiltImage,
		libb: crate::testmacho::BuiltImage,
		libc: crate::testmacho::BuiltImage,
	}

	fn build_fixture() -> Fixture {
		let system: &'static MemSystem = Box::leak(Box::new(MemSystem::new()));

		let libc = ImageBuilder::dylib(0)
			.export_text("_foo", FOO_TEXT_OFFSET)
			.build();
		system.add_file(LIBC_PATH, libc.bytes.clone());

		let libb = ImageBuilder::dylib(0)
			.reexport(LIBC_PATH)
			.export_text("_bar", BAR_TEXT_OFFSET)
			.build();
		system.add_file(LIBB_PATH, libb.bytes.clone());

		let mut app_builder = ImageBuilder::executable(0x1_0000_0000)
			.with_dymple_section()
			.depend_on(LIBB_PATH)
			.depend_on(LIBC_PATH)
			.entry(0);
		let local_slot = app_builder.got_word(0x1_0000_0000); // patched by rebase
		let bar_slot = app_builder.got_word(0);
		let weak_slot = app_builder.got_word(0xffff_ffff);
		let foo_slot = app_builder.got_word(0);
		let app = app_builder
			.rebase_got(local_slot)
			.bind_got(bar_slot, 1, "_bar")
			.weak_bind_got(weak_slot, 1, "_definitely_not_there")
			.lazy_bind_got(foo_slot, 1, "_foo")
			.build();
		system.add_file(BIN_PATH, app.bytes.clone());

		Fixture {
			system,
			registry: ImageRegistry::new(system),
			app,
			libb,
			libc,
		}
	}

	fn read_got(image: &Image, built: &crate::testmacho::BuiltImage, index: usize) -> u64 {
		let address = image.base_address() + built.got_memory_offset(index);
		// SAFETY: the slot lies within the image's live mapping.
		unsafe { *(address as *const u64) }
	}

	#[test]
	fn dependency_graph_shape() {
		let fixture = build_fixture();
		let app = fixture.registry.initialize_process(BIN_PATH).unwrap();

		let libb = fixture.registry.find_loaded_image_by_name(LIBB_PATH).unwrap();
		let libc = fixture.registry.find_loaded_image_by_name(LIBC_PATH).unwrap();

		// SAFETY: no loads are in flight; handles are stable.
		let (app_image, libb_image, libc_image) =
			unsafe { (app.get(), libb.get(), libc.get()) };

		// declaration order is preserved
		assert_eq!(app_image.dependencies(), &[libb, libc]);
		assert!(app_image.reexports().is_empty());

		assert_eq!(libb_image.dependencies(), &[libc]);
		assert_eq!(libb_image.reexports(), &[libc]);

		// back-links are exactly the inverse of the dependency edges
		assert!(libb_image.dependents().contains(&app));
		assert!(libc_image.dependents().contains(&app));
		assert!(libc_image.dependents().contains(&libb));
		assert!(!app_image.dependents().contains(&libb));

		// images occupy disjoint ranges and know their own addresses
		for handle in [app, libb, libc] {
			// SAFETY: as above.
			let image = unsafe { handle.get() };
			let middle = image.base_address() + image.byte_count() / 2;
			assert_eq!(fixture.registry.image_containing_address(middle), Some(handle));
		}

		let entry = app_image.entry_address().expect("executables have an entry");
		assert_eq!(fixture.registry.image_containing_address(entry), Some(app));
	}

	#[test]
	fn loading_is_idempotent() {
		let fixture = build_fixture();
		let first = fixture.registry.load_image_by_name(BIN_PATH).unwrap();

		let opens_after_first = fixture.system.open_count();
		let reads_after_first = fixture.system.read_count();

		let second = fixture.registry.load_image_by_name(BIN_PATH).unwrap();
		assert_eq!(first, second);

		// the second load performed no file I/O at all
		assert_eq!(fixture.system.open_count(), opens_after_first);
		assert_eq!(fixture.system.read_count(), reads_after_first);

		assert_eq!(
			fixture.registry.find_loaded_image_by_name(BIN_PATH).unwrap(),
			first
		);
	}

	#[test]
	fn rebase_applies_the_slide() {
		let fixture = build_fixture();
		let app = fixture.registry.load_image_by_name(BIN_PATH).unwrap();
		// SAFETY: no loads are in flight.
		let app_image = unsafe { app.get() };

		// the slot held a preferred-base pointer; after loading it points at
		// the slid location
		let slide = app_image.base_address() - app_image.preferred_base_address();
		assert_eq!(
			read_got(app_image, &fixture.app, 0),
			0x1_0000_0000u64.wrapping_add(slide)
		);
	}

	#[test]
	fn eager_binds_resolve_through_reexports() {
		let fixture = build_fixture();
		let app = fixture.registry.load_image_by_name(BIN_PATH).unwrap();
		let libb = fixture.registry.find_loaded_image_by_name(LIBB_PATH).unwrap();

		// SAFETY: no loads are in flight.
		let (app_image, libb_image) = unsafe { (app.get(), libb.get()) };

		// _bar lives in libmiddle's own text
		let bound_bar = read_got(app_image, &fixture.app, 1);
		assert_eq!(
			bound_bar,
			libb_image.base_address() + fixture.libb.text_offset + BAR_TEXT_OFFSET
		);
		assert_eq!(fixture.registry.image_containing_address(bound_bar), Some(libb));

		// a missing weak import binds to 0 rather than failing the load
		assert_eq!(read_got(app_image, &fixture.app, 2), 0);
	}

	#[test]
	fn lazy_binding_patches_the_slot() {
		let fixture = build_fixture();
		let app = fixture.registry.load_image_by_name(BIN_PATH).unwrap();
		let libc = fixture.registry.find_loaded_image_by_name(LIBC_PATH).unwrap();

		// SAFETY: no loads are in flight.
		let (app_image, libc_image) = unsafe { (app.get(), libc.get()) };

		// nothing resolved _foo at load time
		assert_eq!(read_got(app_image, &fixture.app, 3), 0);

		let info_offset = fixture.app.lazy_offsets["_foo"];
		let resolved = fixture.registry.bind_lazy_symbol(app, info_offset).unwrap();

		// _foo is libcore's even though the record names libmiddle: the
		// reexport chain carries it, depth-first from the declared library
		assert_eq!(
			fixture.registry.image_containing_address(resolved),
			Some(libc)
		);
		assert_eq!(
			resolved - libc_image.base_address(),
			fixture.libc.text_offset + FOO_TEXT_OFFSET
		);

		// the slot now short-circuits; binding again is stable
		assert_eq!(read_got(app_image, &fixture.app, 3), resolved);
		assert_eq!(
			fixture.registry.bind_lazy_symbol(app, info_offset).unwrap(),
			resolved
		);
	}

	#[test]
	fn linker_hooks_installed() {
		let fixture = build_fixture();
		let app = fixture.registry.load_image_by_name(BIN_PATH).unwrap();
		// SAFETY: no loads are in flight.
		let app_image = unsafe { app.get() };

		let hook_section = app_image
			.sections()
			.iter()
			.find(|section| section.name == "__dymple")
			.expect("the fixture binary carries a linker section");

		// SAFETY: the section lies within the image's live mapping.
		let (handle_word, stub_word) = unsafe {
			(
				*(hook_section.address as *const u64),
				*((hook_section.address + 8) as *const u64),
			)
		};
		assert_eq!(handle_word, app.as_raw() as u64);
		assert_eq!(stub_word, crate::stub::bind_trampoline_address());
		assert_ne!(stub_word, 0);
	}

	#[test]
	fn failed_loads_unwind_completely() {
		let system: &'static MemSystem = Box::leak(Box::new(MemSystem::new()));

		// a busted image: claims more load commands than the file holds
		let mut broken = ImageBuilder::dylib(0).build().bytes;
		broken.truncate(64);
		system.add_file("/sys/lib/broken.dylib", broken);

		let registry = ImageRegistry::new(system);
		assert!(registry.load_image_by_name("/sys/lib/broken.dylib").is_err());

		// no trace: not findable, nothing mapped
		assert!(registry
			.find_loaded_image_by_name("/sys/lib/broken.dylib")
			.is_err());
		assert_eq!(system.live_mapping_count(), 0);

		// a dependency that fails takes its dependent down with it, but
		// leaves the successfully-loaded dependencies behind as loaded images
		let needs_broken = ImageBuilder::executable(0x1_0000_0000)
			.depend_on(LIBC_PATH)
			.depend_on("/sys/lib/broken.dylib")
			.entry(0)
			.build();
		let libc = ImageBuilder::dylib(0).export_text("_foo", 0).build();
		system.add_file(LIBC_PATH, libc.bytes);
		system.add_file("/bin/needy", needs_broken.bytes);

		assert!(registry.load_image_by_name("/bin/needy").is_err());
		assert!(registry.find_loaded_image_by_name("/bin/needy").is_err());

		let libc_handle = registry.find_loaded_image_by_name(LIBC_PATH).unwrap();
		// SAFETY: no loads are in flight.
		let libc_image = unsafe { libc_handle.get() };
		// the failed dependent was unlinked from the survivor's back-links
		assert!(libc_image.dependents().is_empty());
	}

	#[test]
	fn flat_lookup_scans_load_order() {
		let system: &'static MemSystem = Box::leak(Box::new(MemSystem::new()));

		let libc = ImageBuilder::dylib(0).export_text("_flat", 0x8).build();
		let libc_text_offset = libc.text_offset;
		system.add_file(LIBC_PATH, libc.bytes);

		let mut app_builder = ImageBuilder::executable(0x1_0000_0000)
			.depend_on(LIBC_PATH)
			.entry(0);
		let slot = app_builder.got_word(0);
		let app = app_builder
			.bind_got(slot, macho::BIND_SPECIAL_DYLIB_FLAT_LOOKUP, "_flat")
			.build();
		let app_got_memory_offset = app.got_memory_offset(0);
		system.add_file(BIN_PATH, app.bytes);

		let registry = ImageRegistry::new(system);
		let handle = registry.load_image_by_name(BIN_PATH).unwrap();
		let libc_handle = registry.find_loaded_image_by_name(LIBC_PATH).unwrap();

		// SAFETY: no loads are in flight.
		let (app_image, libc_image) = unsafe { (handle.get(), libc_handle.get()) };
		let bound = {
			let address = app_image.base_address() + app_got_memory_offset;
			// SAFETY: the slot lies within the image's live mapping.
			unsafe { *(address as *const u64) }
		};
		assert_eq!(bound, libc_image.base_address() + libc_text_offset + 0x8);
	}

	#[test]
	fn process_binary_handle_duplication() {
		let fixture = build_fixture();
		let app = fixture.registry.initialize_process(BIN_PATH).unwrap();
		assert_eq!(fixture.registry.process_image(), Some(app));

		// initialising twice is refused
		assert_eq!(
			fixture.registry.initialize_process(BIN_PATH).unwrap_err(),
			Error::AlreadyInProgress
		);

		let raw = fixture.registry.open_process_binary_raw().unwrap();
		assert_eq!(raw.byte_count(), fixture.app.bytes.len() as u64);

		let mut magic = [0u8; 4];
		raw.read_exact_at(0, &mut magic).unwrap();
		assert_eq!(u32::from_le_bytes(magic), macho::MAGIC_64);
	}
}
