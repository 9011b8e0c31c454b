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

//! The kernel memory pool façade.
//!
//! Three long-lived [`PoolInstance`]s share one options record but differ in
//! where their backing memory comes from:
//!   * *ordinary* - plain kernel address space, bound to frames on first
//!     touch;
//!   * *physically contiguous* - physically contiguous frames mapped at an
//!     equally-aligned virtual address (for device buffers);
//!   * *prebound* - address space with every page bound up front, safe to
//!     touch from interrupt context.
//!
//! Each instance sits behind its own spin lock. Every entry point prefaults
//! a few stack pages first so that no page fault can occur while one of
//! those locks is held (the fault path could otherwise re-enter the pool).
//! Locks are never nested: cross-instance reallocation and ownership probing
//! release one instance before taking the next.

use bitflags::bitflags;

use super::{
	pmm,
	pool::{is_sentinel, Allocation, PoolAllocator, PoolInstance, PoolOptions},
	vmm::{self, AllocationFlags},
	PhysicalAddress, PAGE_SIZE,
};
use crate::{
	sync::{Lock, SpinLock},
	util::crosses_boundary,
	Error, Result,
};

/// How many stack pages each entry point guarantees resident before touching
/// any instance lock.
pub const PREFAULT_PAGE_COUNT: u64 = 2;

/// A fresh kernel pool region spans four pages (`2^10` leaves of 16 bytes).
const OPTIMAL_MIN_REGION_ORDER: usize = 10;

/// The options shared by all three kernel pool instances.
pub const KERNEL_POOL_OPTIONS: PoolOptions = PoolOptions {
	page_size: PAGE_SIZE,
	max_order: 32,
	min_leaf_size: 16,
	min_leaf_alignment_power: 4,
	max_kept_region_count: 3,
	optimal_min_region_order: OPTIMAL_MIN_REGION_ORDER,
};

bitflags! {
	pub struct AllocateFlags: u64 {
		/// The allocation must be backed by physically contiguous frames.
		const PHYSICALLY_CONTIGUOUS = 1 << 0;

		/// The allocation must never fault (all pages bound before return).
		const PREBOUND = 1 << 1;

		/// The allocation's contents are zeroed.
		const ZERO = 1 << 2;
	}
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum AllocationClass {
	Ordinary,
	PhysicallyContiguous,
	Prebound,
}

impl AllocationClass {
	const ALL: [AllocationClass; 3] = [
		AllocationClass::Ordinary,
		AllocationClass::PhysicallyContiguous,
		AllocationClass::Prebound,
	];

	fn from_flags(flags: AllocateFlags) -> Self {
		if flags.contains(AllocateFlags::PHYSICALLY_CONTIGUOUS) {
			// contiguous memory is mapped up front, so it is implicitly prebound
			Self::PhysicallyContiguous
		} else if flags.contains(AllocateFlags::PREBOUND) {
			Self::Prebound
		} else {
			Self::Ordinary
		}
	}
}

/// The façade over the three class instances. The kernel has exactly one of
/// these ([`kernel_pool`]); tests build private ones over harness bridges.
pub struct MemoryPool {
	ordinary: SpinLock<PoolInstance>,
	contiguous: SpinLock<PoolInstance>,
	prebound: SpinLock<PoolInstance>,
}

impl MemoryPool {
	pub const fn new(
		options: PoolOptions,
		ordinary: &'static dyn PoolAllocator,
		contiguous: &'static dyn PoolAllocator,
		prebound: &'static dyn PoolAllocator,
	) -> Self {
		Self {
			ordinary: SpinLock::new(PoolInstance::new(options, ordinary)),
			contiguous: SpinLock::new(PoolInstance::new(options, contiguous)),
			prebound: SpinLock::new(PoolInstance::new(options, prebound)),
		}
	}

	fn instance(&self, class: AllocationClass) -> &SpinLock<PoolInstance> {
		match class {
			AllocationClass::Ordinary => &self.ordinary,
			AllocationClass::PhysicallyContiguous => &self.contiguous,
			AllocationClass::Prebound => &self.prebound,
		}
	}

	/// Which instance (if any) handed out `addr`. Probes instance-by-instance
	/// with the lock released between probes.
	fn class_of(&self, addr: u64) -> Option<AllocationClass> {
		for class in AllocationClass::ALL {
			let instance = self.instance(class).lock();
			if instance.owns(addr) {
				return Some(class);
			}
		}
		None
	}

	pub fn allocate(&self, byte_count: u64) -> Result<Allocation> {
		self.allocate_advanced(byte_count, 0, 0, AllocateFlags::empty())
	}

	/// Allocates `byte_count` bytes aligned to `2^alignment_power`, not
	/// crossing a `2^boundary_power` boundary, from the instance selected by
	/// `flags`.
	pub fn allocate_advanced(
		&self,
		byte_count: u64,
		alignment_power: u8,
		boundary_power: u8,
		flags: AllocateFlags,
	) -> Result<Allocation> {
		vmm::prefault_stack(PREFAULT_PAGE_COUNT);

		let class = AllocationClass::from_flags(flags);
		let allocation = {
			let mut instance = self.instance(class).lock();
			instance.allocate(byte_count, alignment_power, boundary_power)?
		};

		if flags.contains(AllocateFlags::ZERO) && allocation.byte_count > 0 {
			// zero outside the lock; pool memory may be reused and carry old contents
			//
			// SAFETY: the block was just handed to us and spans `byte_count` bytes.
			unsafe {
				core::ptr::write_bytes(
					allocation.address as *mut u8,
					0,
					allocation.byte_count as usize,
				);
			}
		}

		Ok(allocation)
	}

	pub fn reallocate(&self, old_addr: u64, new_byte_count: u64) -> Result<Allocation> {
		self.reallocate_advanced(old_addr, new_byte_count, 0, 0, AllocateFlags::empty())
	}

	/// Resizes an allocation, possibly migrating it between instances when
	/// the requested flags name a different class than the one that owns it.
	pub fn reallocate_advanced(
		&self,
		old_addr: u64,
		new_byte_count: u64,
		alignment_power: u8,
		boundary_power: u8,
		flags: AllocateFlags,
	) -> Result<Allocation> {
		vmm::prefault_stack(PREFAULT_PAGE_COUNT);

		if old_addr == 0 || is_sentinel(old_addr) {
			return self.allocate_advanced(new_byte_count, alignment_power, boundary_power, flags);
		}

		let required_class = AllocationClass::from_flags(flags);
		let current_class = self.class_of(old_addr).ok_or(Error::InvalidArgument)?;

		if current_class == required_class {
			let mut instance = self.instance(current_class).lock();
			return instance.reallocate(old_addr, new_byte_count, alignment_power, boundary_power);
		}

		// class mismatch: allocate in the required instance, copy, free the
		// original. the locks are taken strictly one at a time.
		let old_byte_count = {
			let instance = self.instance(current_class).lock();
			instance.allocated_byte_count(old_addr)?
		};

		let new_allocation =
			self.allocate_advanced(new_byte_count, alignment_power, boundary_power, flags)?;

		let copy_bytes = old_byte_count.min(new_byte_count);
		if copy_bytes > 0 && !is_sentinel(new_allocation.address) {
			// SAFETY: the old block is still live, the new one was just allocated,
			//         and they come from different instances so they cannot overlap.
			unsafe {
				core::ptr::copy_nonoverlapping(
					old_addr as *const u8,
					new_allocation.address as *mut u8,
					copy_bytes as usize,
				);
			}
		}

		{
			let mut instance = self.instance(current_class).lock();
			instance.free(old_addr)?;
		}

		Ok(new_allocation)
	}

	/// Frees an allocation made through any of the three instances. Freeing
	/// the zero-byte sentinel is a no-op.
	pub fn free(&self, addr: u64) -> Result<()> {
		vmm::prefault_stack(PREFAULT_PAGE_COUNT);

		if is_sentinel(addr) {
			return Ok(());
		}

		// probe instance-by-instance; each probe holds only that instance's lock
		for class in AllocationClass::ALL {
			let mut instance = self.instance(class).lock();
			if instance.owns(addr) {
				return instance.free(addr);
			}
		}

		Err(Error::InvalidArgument)
	}

	/// The rounded size of the given allocation.
	pub fn allocated_byte_count(&self, addr: u64) -> Result<u64> {
		vmm::prefault_stack(PREFAULT_PAGE_COUNT);

		if is_sentinel(addr) {
			return Ok(0);
		}

		for class in AllocationClass::ALL {
			let instance = self.instance(class).lock();
			if instance.owns(addr) {
				return instance.allocated_byte_count(addr);
			}
		}

		Err(Error::InvalidArgument)
	}
}

/// Bridge for the ordinary instance: plain address space, demand-bound.
struct OrdinarySpaceAllocator;

impl PoolAllocator for OrdinarySpaceAllocator {
	fn allocate(&self, page_count: u64, alignment_power: u8, _boundary_power: u8) -> Result<u64> {
		// the pool requests region alignment covering the boundary requirement,
		// so plain aligned space allocation suffices here
		vmm::space_allocate_aligned(page_count, alignment_power, AllocationFlags::empty())
	}

	fn free(&self, addr: u64, page_count: u64) {
		vmm::space_free(addr, page_count).expect("Failed to release pool region space");
	}

	fn allocate_header(&self, page_count: u64) -> Result<u64> {
		// headers are touched with the pool lock held; they must never fault
		vmm::space_allocate(
			page_count,
			AllocationFlags::PREBOUND | AllocationFlags::ZERO,
		)
	}

	fn free_header(&self, addr: u64, page_count: u64) {
		vmm::space_free(addr, page_count).expect("Failed to release pool header space");
	}
}

/// Bridge for the physically-contiguous instance: contiguous frames, mapped
/// at an equally-aligned virtual address.
struct ContiguousAllocator;

impl PoolAllocator for ContiguousAllocator {
	fn allocate(&self, page_count: u64, alignment_power: u8, boundary_power: u8) -> Result<u64> {
		let frame = pmm::PhysicalFrame::allocate_advanced(
			page_count,
			alignment_power,
			boundary_power,
			false,
		)?;
		let (phys, _) = frame.detach();

		match vmm::space_map_aligned(phys, page_count, alignment_power, AllocationFlags::empty())
		{
			Ok(virt) => Ok(virt),
			Err(err) => {
				// SAFETY: we own the frames; the mapping never happened.
				unsafe { pmm::free_physical(phys, page_count)? };
				Err(err)
			},
		}
	}

	fn free(&self, addr: u64, page_count: u64) {
		let phys = vmm::space_virtual_to_physical(addr);
		if phys == u64::MAX {
			panic!("Contiguous pool region was not mapped");
		}
		vmm::space_unmap(addr, page_count).expect("Failed to unmap contiguous pool region");
		// SAFETY: the region's frames were detached into the mapping at allocation time.
		unsafe { pmm::free_physical(PhysicalAddress::new(phys), page_count) }
			.expect("Failed to free contiguous pool frames");
	}

	fn allocate_header(&self, page_count: u64) -> Result<u64> {
		vmm::space_allocate(
			page_count,
			AllocationFlags::PREBOUND | AllocationFlags::ZERO,
		)
	}

	fn free_header(&self, addr: u64, page_count: u64) {
		vmm::space_free(addr, page_count).expect("Failed to release pool header space");
	}

	fn is_aligned(
		&self,
		addr: u64,
		alignment_power: u8,
		boundary_power: u8,
		byte_count: u64,
	) -> bool {
		// candidates must also be properly placed *physically*
		let phys = vmm::space_virtual_to_physical(addr);
		if phys == u64::MAX {
			return false;
		}
		phys % (1u64 << alignment_power) == 0
			&& !crosses_boundary(phys, byte_count, boundary_power)
	}
}

/// Bridge for the prebound instance: address space with every page bound
/// before the region is handed over.
struct PreboundSpaceAllocator;

impl PoolAllocator for PreboundSpaceAllocator {
	fn allocate(&self, page_count: u64, alignment_power: u8, _boundary_power: u8) -> Result<u64> {
		vmm::space_allocate_aligned(
			page_count,
			alignment_power,
			AllocationFlags::PREBOUND | AllocationFlags::ZERO,
		)
	}

	fn free(&self, addr: u64, page_count: u64) {
		vmm::space_free(addr, page_count).expect("Failed to release pool region space");
	}

	fn allocate_header(&self, page_count: u64) -> Result<u64> {
		vmm::space_allocate(
			page_count,
			AllocationFlags::PREBOUND | AllocationFlags::ZERO,
		)
	}

	fn free_header(&self, addr: u64, page_count: u64) {
		vmm::space_free(addr, page_count).expect("Failed to release pool header space");
	}
}

static ORDINARY_ALLOCATOR: OrdinarySpaceAllocator = OrdinarySpaceAllocator;
static CONTIGUOUS_ALLOCATOR: ContiguousAllocator = ContiguousAllocator;
static PREBOUND_ALLOCATOR: PreboundSpaceAllocator = PreboundSpaceAllocator;

static KERNEL_POOL: MemoryPool = MemoryPool::new(
	KERNEL_POOL_OPTIONS,
	&ORDINARY_ALLOCATOR,
	&CONTIGUOUS_ALLOCATOR,
	&PREBOUND_ALLOCATOR,
);

/// The process-wide kernel pool. Usable any time after
/// [`super::initialize`] has brought up the PMM and VMM.
pub fn kernel_pool() -> &'static MemoryPool {
	&KERNEL_POOL
}

#[cfg(test)]
mod tests {
	extern crate std;

	use std::{collections::HashMap, sync::Mutex, thread, vec::Vec};

	use super::super::pool::tests::{TestAllocator, TEST_OPTIONS};
	use super::*;

	fn test_facade() -> MemoryPool {
		MemoryPool::new(
			TEST_OPTIONS,
			TestAllocator::leaked(),
			TestAllocator::leaked(),
			TestAllocator::leaked(),
		)
	}

	#[test]
	fn class_routing() {
		let pool = test_facade();

		let ordinary = pool.allocate(100).unwrap();
		let contiguous = pool
			.allocate_advanced(100, 0, 0, AllocateFlags::PHYSICALLY_CONTIGUOUS)
			.unwrap();
		let prebound = pool
			.allocate_advanced(100, 0, 0, AllocateFlags::PREBOUND)
			.unwrap();

		assert_eq!(pool.class_of(ordinary.address), Some(AllocationClass::Ordinary));
		assert_eq!(
			pool.class_of(contiguous.address),
			Some(AllocationClass::PhysicallyContiguous)
		);
		assert_eq!(pool.class_of(prebound.address), Some(AllocationClass::Prebound));

		pool.free(ordinary.address).unwrap();
		pool.free(contiguous.address).unwrap();
		pool.free(prebound.address).unwrap();
	}

	#[test]
	fn zeroed_allocations() {
		let pool = test_facade();

		// dirty a block, free it, then demand a zeroed one; the pool will
		// reuse the same leaves
		let dirty = pool.allocate(256).unwrap();
		// SAFETY: writing within our own allocation.
		unsafe { core::ptr::write_bytes(dirty.address as *mut u8, 0xaa, 256) };
		pool.free(dirty.address).unwrap();

		let clean = pool
			.allocate_advanced(256, 0, 0, AllocateFlags::ZERO)
			.unwrap();
		// SAFETY: reading within our own allocation.
		unsafe {
			for i in 0..256u64 {
				assert_eq!(*((clean.address + i) as *const u8), 0);
			}
		}
		pool.free(clean.address).unwrap();
	}

	#[test]
	fn cross_class_reallocation_copies() {
		let pool = test_facade();

		let ordinary = pool.allocate(64).unwrap();
		// SAFETY: writing within our own allocation.
		unsafe {
			for i in 0..64u64 {
				*((ordinary.address + i) as *mut u8) = (i + 1) as u8;
			}
		}

		// same bytes, different class: the block must migrate
		let migrated = pool
			.reallocate_advanced(ordinary.address, 64, 0, 0, AllocateFlags::PREBOUND)
			.unwrap();
		assert_ne!(migrated.address, ordinary.address);
		assert_eq!(pool.class_of(migrated.address), Some(AllocationClass::Prebound));
		assert_eq!(pool.class_of(ordinary.address), None);

		// SAFETY: reading within our own allocation.
		unsafe {
			for i in 0..64u64 {
				assert_eq!(*((migrated.address + i) as *const u8), (i + 1) as u8);
			}
		}

		pool.free(migrated.address).unwrap();
	}

	#[test]
	fn sentinel_preserved_across_facade() {
		let pool = test_facade();

		let zero = pool.allocate(0).unwrap();
		assert!(is_sentinel(zero.address));

		pool.free(zero.address).unwrap();
		assert_eq!(pool.allocated_byte_count(zero.address).unwrap(), 0);

		let grown = pool.reallocate(zero.address, 40).unwrap();
		assert!(!is_sentinel(grown.address));
		assert_eq!(grown.byte_count, 48);
		pool.free(grown.address).unwrap();
	}

	#[test]
	fn unknown_pointer_rejected() {
		let pool = test_facade();
		assert_eq!(pool.free(0x1234_5678_9abc_0000).unwrap_err(), Error::InvalidArgument);
		assert_eq!(
			pool.reallocate(0x1234_5678_9abc_0000, 32).unwrap_err(),
			Error::InvalidArgument
		);
	}

	#[test]
	fn concurrent_mixed_use() {
		let pool = test_facade();
		let live: Mutex<HashMap<u64, u64>> = Mutex::new(HashMap::new());

		thread::scope(|scope| {
			for worker in 0..8u64 {
				let pool = &pool;
				let live = &live;
				scope.spawn(move || {
					let mut state = 0x9e37_79b9_7f4a_7c15u64.wrapping_mul(worker + 1);
					let mut next = move || {
						state = state
							.wrapping_mul(6364136223846793005)
							.wrapping_add(1442695040888963407);
						state >> 33
					};
					let mut mine: Vec<u64> = Vec::new();

					for _ in 0..500 {
						if next() % 3 != 0 || mine.is_empty() {
							let size = (next() % 2000) + 1;
							let flags = match next() % 3 {
								0 => AllocateFlags::empty(),
								1 => AllocateFlags::PREBOUND,
								_ => AllocateFlags::PHYSICALLY_CONTIGUOUS,
							};
							let allocation =
								pool.allocate_advanced(size, 0, 0, flags).unwrap();

							// nobody else may currently hold this block
							{
								let mut map = live.lock().unwrap();
								for (&other, &other_size) in map.iter() {
									let disjoint = allocation.address + allocation.byte_count
										<= other || other + other_size <= allocation.address;
									assert!(disjoint, "pointer handed out twice");
								}
								assert!(map
									.insert(allocation.address, allocation.byte_count)
									.is_none());
							}
							mine.push(allocation.address);
						} else {
							let index = (next() as usize) % mine.len();
							let addr = mine.swap_remove(index);
							assert!(live.lock().unwrap().remove(&addr).is_some());
							pool.free(addr).unwrap();
						}
					}

					for addr in mine {
						assert!(live.lock().unwrap().remove(&addr).is_some());
						pool.free(addr).unwrap();
					}
				});
			}
		});

		assert!(live.lock().unwrap().is_empty());
	}
}
