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

//! The kernel address space.
//!
//! A single L4 slot is carved out for kernel allocations and managed as one
//! big buddy tree. Free ranges are tracked with side-table nodes (allocated
//! from a [`PSlab`]) rather than intrusively: a free *virtual* range has no
//! backing memory to write a list node into.
//!
//! Pages allocated without [`AllocationFlags::PREBOUND`] are bound to
//! physical frames on first touch by the page-fault path; prebound pages are
//! bound (and optionally zeroed) before the allocation call returns, which is
//! what makes them safe to touch with interrupts disabled.

use core::ptr::NonNull;

use bitflags::bitflags;
use intrusive_collections::{LinkedList, LinkedListAtomicLink};

use super::{
	arch,
	common::EntryType,
	order::{byte_count_of_order, order_of_unit_count_ceil, MAX_ORDER},
	pmm::{self, PhysicalFrame},
	pslab::{IntrusivePSlabAllocation, PSlab, PSlabPointerOps, PSlabRegion},
	DecomposedAddress, PageTable, PhysicalAddress, KERNEL_SPACE_L4_INDEX, PAGE_SIZE,
	PHYSICAL_MAPPED_BASE,
};
use crate::{
	custom_intrusive_adapter,
	sync::{Lock, SpinLock},
	Error, Result,
};

bitflags! {
	pub struct AllocationFlags: u64 {
		/// Bind every page of the allocation to a physical frame before
		/// returning; no page fault can occur on a prebound allocation.
		const PREBOUND = 1 << 0;

		/// Zero the allocation. Demand-bound pages are zeroed at bind time
		/// anyway, so this only does extra work together with `PREBOUND`.
		const ZERO = 1 << 1;
	}
}

/// The base of the kernel allocation window (one full L4 slot).
const KERNEL_SPACE_START: u64 =
	super::make_virtual_address(KERNEL_SPACE_L4_INDEX as u16, 0, 0, 0, 0);

/// One L4 slot spans 512GiB.
const KERNEL_SPACE_PAGE_COUNT: u64 = (512 * 1024 * 1024 * 1024) / PAGE_SIZE;

struct FreeSpaceNode {
	link: LinkedListAtomicLink,
	region: NonNull<PSlabRegion>,
	addr: u64,
}

static FREE_SPACE_SLAB: PSlab<FreeSpaceNode> = PSlab::new();

impl IntrusivePSlabAllocation for FreeSpaceNode {
	fn slab() -> *const PSlab<Self> {
		&FREE_SPACE_SLAB
	}

	fn region(&self) -> NonNull<PSlabRegion> {
		self.region
	}
}

custom_intrusive_adapter!(FreeSpaceNodeAdapter = PSlabPointerOps<FreeSpaceNode>: FreeSpaceNode { link: LinkedListAtomicLink });

struct AddressSpace {
	buckets: [LinkedList<FreeSpaceNodeAdapter>; MAX_ORDER],
}

// SAFETY: the address space is only ever accessed through the KERNEL_SPACE lock.
unsafe impl Send for AddressSpace {}

static KERNEL_SPACE: SpinLock<Option<AddressSpace>> = SpinLock::new(None);

impl AddressSpace {
	fn insert_free_block(&mut self, addr: u64, order: usize) -> Result<()> {
		let allocation = FREE_SPACE_SLAB
			.allocate_with(|region, ptr| {
				ptr.write(FreeSpaceNode {
					link: Default::default(),
					region,
					addr,
				});
			})
			.ok_or(Error::TemporaryOutage)?;
		self.buckets[order].push_front(allocation);
		Ok(())
	}

	/// Covers an arbitrary page-aligned range with maximal free blocks.
	fn insert_free_range(&mut self, mut start: u64, end: u64) -> Result<()> {
		while start < end {
			let offset_pages = (start - KERNEL_SPACE_START) / PAGE_SIZE;
			let remaining_pages = (end - start) / PAGE_SIZE;

			// the block must be aligned to its own size within the window and
			// must not overrun the range
			let alignment_order = if offset_pages == 0 {
				MAX_ORDER - 1
			} else {
				(offset_pages.trailing_zeros() as usize).min(MAX_ORDER - 1)
			};
			let size_order = super::order::order_of_unit_count_floor(remaining_pages);
			let order = alignment_order.min(size_order);

			self.insert_free_block(start, order)?;
			start += byte_count_of_order(order, PAGE_SIZE);
		}
		Ok(())
	}

	/// Removes the given block from its bucket; dropping the returned
	/// allocation returns the node's storage to the slab.
	fn remove_block(&mut self, node: *const FreeSpaceNode, order: usize) {
		// SAFETY: the caller guarantees that `node` lives in the bucket of the given order.
		let allocation = unsafe { self.buckets[order].cursor_mut_from_ptr(node) }
			.remove()
			.expect("Expected free-space cursor to point to valid element");
		drop(allocation);
	}

	fn allocate_space(&mut self, page_count: u64, alignment_power: u8) -> Result<u64> {
		let needed_order = order_of_unit_count_ceil(page_count);
		if needed_order == usize::MAX {
			return Err(Error::InvalidArgument);
		}

		// blocks of order `k` start at window offsets that are multiples of
		// `2^k` pages; because the window base is aligned far beyond any
		// supported request, a block of high enough order is automatically
		// aligned in the absolute sense as well
		let alignment_order = (alignment_power as usize).saturating_sub(PAGE_SIZE.ilog2() as usize);
		let search_order = needed_order.max(alignment_order);
		if search_order >= MAX_ORDER {
			return Err(Error::InvalidArgument);
		}

		for order in search_order..MAX_ORDER {
			let node = match self.buckets[order].front().get() {
				Some(x) => (x as *const FreeSpaceNode, x.addr),
				None => continue,
			};
			let (node_ptr, addr) = node;

			self.remove_block(node_ptr, order);

			// hand back the tail we don't need, smallest block first
			let mut start_split = addr + byte_count_of_order(needed_order, PAGE_SIZE);
			for split_order in needed_order..order {
				self.insert_free_block(start_split, split_order)?;
				start_split += byte_count_of_order(split_order, PAGE_SIZE);
			}

			return Ok(addr);
		}

		Err(Error::TemporaryOutage)
	}

	fn free_space(&mut self, mut addr: u64, page_count: u64) -> Result<()> {
		let mut order = order_of_unit_count_ceil(page_count);
		if order == usize::MAX
			|| addr < KERNEL_SPACE_START
			|| addr >= KERNEL_SPACE_START + KERNEL_SPACE_PAGE_COUNT * PAGE_SIZE
		{
			return Err(Error::InvalidArgument);
		}

		// merge with free buddies as far up as possible
		while order < MAX_ORDER - 1 {
			let offset = addr - KERNEL_SPACE_START;
			let buddy_offset = offset ^ byte_count_of_order(order, PAGE_SIZE);
			let buddy = KERNEL_SPACE_START + buddy_offset;

			if buddy_offset + byte_count_of_order(order, PAGE_SIZE)
				> KERNEL_SPACE_PAGE_COUNT * PAGE_SIZE
			{
				break;
			}

			let buddy_node = match self.buckets[order]
				.iter()
				.find(|node| node.addr == buddy)
			{
				Some(x) => x as *const FreeSpaceNode,
				None => break,
			};

			self.remove_block(buddy_node, order);

			if buddy < addr {
				addr = buddy;
			}
			order += 1;
		}

		self.insert_free_block(addr, order)
	}
}

pub(super) fn initialize() -> Result<()> {
	let mut space = KERNEL_SPACE.lock();
	if space.is_some() {
		return Err(Error::AlreadyInProgress);
	}

	let mut address_space = AddressSpace {
		buckets: Default::default(),
	};
	address_space.insert_free_range(
		KERNEL_SPACE_START,
		KERNEL_SPACE_START + KERNEL_SPACE_PAGE_COUNT * PAGE_SIZE,
	)?;

	*space = Some(address_space);
	Ok(())
}

fn with_space<T>(f: impl FnOnce(&mut AddressSpace) -> Result<T>) -> Result<T> {
	let mut space = KERNEL_SPACE.lock();
	let space = space
		.as_mut()
		.expect("The kernel address space must be initialized before use");
	f(space)
}

/// Retrieves a virtual pointer to the current root (L4) page table.
///
/// # Safety
///
/// This operation is unsafe because of aliasing; Rust assumes it is the only one accessing the table.
unsafe fn root_page_table_pointer() -> *mut PageTable {
	((arch::root_page_table_pointer_phys() as u64) + PHYSICAL_MAPPED_BASE) as *mut PageTable
}

/// Walks (optionally creating) the tables down to the L1 entry for `virt`.
///
/// # Safety
///
/// Callers must hold the kernel space lock (table modifications must be serialised).
unsafe fn l1_entry_pointer(virt: u64, create: bool) -> Result<*mut arch::Entry> {
	let decomp = DecomposedAddress::new(virt);
	let mut table = root_page_table_pointer();

	for index in [decomp.l4 as usize, decomp.l3 as usize, decomp.l2 as usize] {
		let entry = &mut (*table).entries[index];
		if !entry.is_present() {
			if !create {
				return Err(Error::NoSuchResource);
			}

			let frame = PhysicalFrame::allocate_advanced(1, 0, 0, true)
				.map_err(|_| Error::TemporaryOutage)?;
			let (frame_addr, _) = frame.detach();
			*entry = arch::Entry::new_from_address(frame_addr.as_value(), EntryType::Table)
				.as_writable(true);
		}
		table = (entry.address() + PHYSICAL_MAPPED_BASE) as *mut PageTable;
	}

	Ok(&mut (*table).entries[decomp.l1 as usize] as *mut arch::Entry)
}

/// Maps `page_count` pages starting at `virt` onto physical memory starting at `phys`.
///
/// Callers must hold the kernel space lock.
unsafe fn map_range(virt: u64, phys: u64, page_count: u64) -> Result<()> {
	for i in 0..page_count {
		let entry = l1_entry_pointer(virt + i * PAGE_SIZE, true)?;
		*entry = arch::Entry::new_from_address(phys + i * PAGE_SIZE, EntryType::Regular)
			.as_writable(true);
	}
	arch::synchronize_after_table_modification();
	Ok(())
}

/// Clears the mappings for the given range, returning each page's previous
/// physical address (if any) to the callback.
///
/// Callers must hold the kernel space lock.
unsafe fn unmap_range(virt: u64, page_count: u64, mut on_unmapped: impl FnMut(u64)) {
	for i in 0..page_count {
		let page = virt + i * PAGE_SIZE;
		if let Ok(entry) = l1_entry_pointer(page, false) {
			if (*entry).is_present() {
				on_unmapped((*entry).address());
				*entry = arch::Entry::new();
				arch::invalidate_page(page);
			}
		}
	}
	arch::synchronize_after_table_modification();
}

/// Allocates a range of kernel address space.
pub fn space_allocate(page_count: u64, flags: AllocationFlags) -> Result<u64> {
	space_allocate_aligned(page_count, 0, flags)
}

/// Allocates an aligned range of kernel address space.
///
/// `alignment_power` is the lg2 of the required byte alignment of the
/// returned address.
pub fn space_allocate_aligned(
	page_count: u64,
	alignment_power: u8,
	flags: AllocationFlags,
) -> Result<u64> {
	with_space(|space| {
		let virt = space.allocate_space(page_count, alignment_power)?;

		if flags.contains(AllocationFlags::PREBOUND) {
			for i in 0..page_count {
				let bound = PhysicalFrame::allocate_advanced(
					1,
					0,
					0,
					flags.contains(AllocationFlags::ZERO),
				)
				.and_then(|frame| {
					let (frame_addr, _) = frame.detach();
					// SAFETY: the range is ours (we just allocated it) and we hold the space lock.
					unsafe { map_range(virt + i * PAGE_SIZE, frame_addr.as_value(), 1) }
				});

				if bound.is_err() {
					// unwind: unbind what we've bound so far and give the space back
					// SAFETY: we own these mappings; we just created them.
					unsafe {
						unmap_range(virt, i, |phys| {
							// SAFETY: prebound pages own their frames; we detached them above.
							let _ = unsafe { pmm::free_physical(PhysicalAddress::new(phys), 1) };
						});
					}
					space.free_space(virt, page_count)?;
					return Err(Error::TemporaryOutage);
				}
			}
		}

		Ok(virt)
	})
}

/// Releases a range of kernel address space, freeing any physical frames
/// that were bound to it.
pub fn space_free(addr: u64, page_count: u64) -> Result<()> {
	with_space(|space| {
		// SAFETY: the caller owns this range; we hold the space lock.
		unsafe {
			unmap_range(addr, page_count, |phys| {
				// SAFETY: pages bound into an owned allocation own their frames.
				let _ = unsafe { pmm::free_physical(PhysicalAddress::new(phys), 1) };
			});
		}
		space.free_space(addr, page_count)
	})
}

/// Maps the given physical region into the kernel address space at an
/// `alignment_power`-aligned virtual address.
///
/// The physical region is *not* owned by the mapping; unmapping leaves it
/// untouched.
pub fn space_map_aligned(
	phys: PhysicalAddress,
	page_count: u64,
	alignment_power: u8,
	_flags: AllocationFlags,
) -> Result<u64> {
	with_space(|space| {
		let virt = space.allocate_space(page_count, alignment_power)?;

		// SAFETY: the range is ours (we just allocated it) and we hold the space lock.
		if let Err(err) = unsafe { map_range(virt, phys.as_value(), page_count) } {
			// SAFETY: unbinding the partial work we just did.
			unsafe { unmap_range(virt, page_count, |_| {}) };
			space.free_space(virt, page_count)?;
			return Err(err);
		}

		Ok(virt)
	})
}

/// Unmaps a range previously mapped with [`space_map_aligned`] and releases
/// the virtual range. The backing physical memory is left alone.
pub fn space_unmap(addr: u64, page_count: u64) -> Result<()> {
	with_space(|space| {
		// SAFETY: the caller owns this mapping; we hold the space lock.
		unsafe { unmap_range(addr, page_count, |_| {}) };
		space.free_space(addr, page_count)
	})
}

/// Converts the given virtual address to a physical address using a manual
/// table walk.
///
/// Returns `u64::MAX` when the address is unmapped.
pub fn space_virtual_to_physical(virt_addr: u64) -> u64 {
	let _space = KERNEL_SPACE.lock();

	// SAFETY: we hold the space lock, so nobody is modifying the kernel tables.
	unsafe {
		let decomp = DecomposedAddress::new(virt_addr);
		let root = root_page_table_pointer();

		let l4_entry = (*root).entries[decomp.l4 as usize];
		if !l4_entry.is_present() {
			return u64::MAX;
		}

		let l4 = (l4_entry.address() + PHYSICAL_MAPPED_BASE) as *mut PageTable;
		let l3_entry = (*l4).entries[decomp.l3 as usize];
		match l3_entry.entry_type(3) {
			EntryType::Table => {},
			EntryType::VeryLarge => {
				if !l3_entry.is_present() {
					return u64::MAX;
				}
				return l3_entry.address()
					| super::make_virtual_address(0, 0, decomp.l2, decomp.l1, decomp.offset);
			},
			_ => return u64::MAX,
		}
		if !l3_entry.is_present() {
			return u64::MAX;
		}

		let l3 = (l3_entry.address() + PHYSICAL_MAPPED_BASE) as *mut PageTable;
		let l2_entry = (*l3).entries[decomp.l2 as usize];
		match l2_entry.entry_type(2) {
			EntryType::Table => {},
			EntryType::Large => {
				if !l2_entry.is_present() {
					return u64::MAX;
				}
				return l2_entry.address() | ((virt_addr) & 0x1f_ffff);
			},
			_ => return u64::MAX,
		}
		if !l2_entry.is_present() {
			return u64::MAX;
		}

		let l2 = (l2_entry.address() + PHYSICAL_MAPPED_BASE) as *mut PageTable;
		let l1_entry = (*l2).entries[decomp.l1 as usize];
		if !l1_entry.is_present() {
			return u64::MAX;
		}

		l1_entry.address() | (decomp.offset as u64)
	}
}

/// Ensures the next `page_count` pages below the current stack pointer are
/// resident, so that code running with a spin lock held (and interrupts
/// disabled) cannot take a page fault on its own stack.
#[cfg(not(test))]
pub fn prefault_stack(page_count: u64) {
	use crate::util::align_up_pow2;

	let stack_pointer: u64;

	#[cfg(target_arch = "x86_64")]
	// SAFETY: reading the stack pointer has no side effects.
	unsafe {
		core::arch::asm!("mov {}, rsp", out(reg) stack_pointer, options(nostack, nomem, preserves_flags));
	}

	#[cfg(target_arch = "aarch64")]
	// SAFETY: reading the stack pointer has no side effects.
	unsafe {
		core::arch::asm!("mov {}, sp", out(reg) stack_pointer, options(nostack, nomem, preserves_flags));
	}

	for i in 1..=page_count {
		let probe = align_up_pow2(stack_pointer, PAGE_SIZE) - i * PAGE_SIZE;
		// SAFETY: probing our own stack guard pages; the fault handler binds them.
		unsafe {
			core::ptr::read_volatile(probe as *const u8);
		}
	}
}

/// Hosted builds run on a stack the host OS manages; there is nothing to prefault.
#[cfg(test)]
pub fn prefault_stack(_page_count: u64) {}
