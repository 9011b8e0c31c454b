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

//! The general-purpose buddy pool.
//!
//! A [`PoolInstance`] is a buddy allocator over leaves of
//! `options.min_leaf_size` bytes (16 in the kernel pool), asking its
//! [`PoolAllocator`] bridge for page-granular backing memory and header
//! memory as needed. Each backing region carries a separately-allocated
//! header: the region list link, one free-list head per order, and a
//! bookkeeping byte per leaf encoding `{in-use, order}`.
//!
//! A pool instance performs no locking of its own; callers must serialise
//! access (the façade in [`super::mempool`] holds one spin lock per
//! instance).

use core::{cell::UnsafeCell, mem::size_of};

use intrusive_collections::{intrusive_adapter, LinkedList, LinkedListAtomicLink};
use static_assertions::const_assert_eq;

use super::region::AllocationConstraints;
use crate::{
	util::{align_up_pow2, is_aligned_pow2},
	Error, Result,
};

/// Free-list heads are a fixed-size array in the region header; an instance's
/// `options.max_order` may be at most this.
pub const MAX_ORDER: usize = 32;

const LEAF_IN_USE: u8 = 1 << 7;
const LEAF_ORDER_MASK: u8 = 0x3f;

/// The immutable parameters of a pool instance.
#[derive(Clone, Copy)]
pub struct PoolOptions {
	/// The allocation granularity of the backing allocator, in bytes.
	pub page_size: u64,

	/// Orders run `0..max_order`; a single allocation spans at most
	/// `2^(max_order - 1)` leaves.
	pub max_order: usize,

	/// The size of a single leaf, in bytes. Never smaller than the free-list
	/// node that free leaves are overlaid with.
	pub min_leaf_size: u64,

	/// lg2 of the minimum alignment every allocation receives, regardless of
	/// what the caller asks for.
	pub min_leaf_alignment_power: u8,

	/// How many fully-free regions the instance may keep around instead of
	/// returning them to the backing allocator.
	pub max_kept_region_count: usize,

	/// The preferred order for a brand new region (clamped to the request's
	/// minimum order and the maximum representable region).
	pub optimal_min_region_order: usize,
}

impl PoolOptions {
	pub(super) const fn byte_count_of_order(&self, order: usize) -> u64 {
		(1u64 << order) * self.min_leaf_size
	}

	/// The smallest order whose block can hold `byte_count` bytes, or `None`
	/// when the request exceeds the largest representable block.
	pub(super) fn min_order_for_byte_count(&self, byte_count: u64) -> Option<usize> {
		let leaves = align_up_pow2(byte_count, self.min_leaf_size) / self.min_leaf_size;
		let order = if leaves <= 1 {
			0
		} else {
			let floor = leaves.ilog2() as usize;
			if leaves.is_power_of_two() {
				floor
			} else {
				floor + 1
			}
		};
		if order >= self.max_order {
			None
		} else {
			Some(order)
		}
	}

	pub(super) const fn region_page_count_for_leaf_count(&self, leaf_count: u64) -> u64 {
		(leaf_count * self.min_leaf_size + (self.page_size - 1)) / self.page_size
	}

	/// One page for the header struct plus whatever the bookkeeping vector
	/// doesn't fit of.
	pub(super) const fn header_page_count_for_leaf_count(&self, leaf_count: u64) -> u64 {
		let first_page_capacity = self.page_size - (size_of::<RegionHeader>() as u64);
		if leaf_count <= first_page_capacity {
			1
		} else {
			1 + (leaf_count - first_page_capacity + (self.page_size - 1)) / self.page_size
		}
	}
}

/// The allocator bridge: how a pool instance obtains and releases backing
/// memory. Implementations decide what kind of memory backs the pool (plain
/// address space, physically-contiguous mappings, prebound pages, or a host
/// allocator under the test harness).
///
/// Bridges are shared by every thread that touches the pool, hence `Sync`.
pub trait PoolAllocator: Sync {
	/// Allocates `page_count` pages for region storage, aligned to
	/// `2^alignment_power` bytes and (if `boundary_power` is non-zero) placed
	/// so the region start doesn't sit astride a `2^boundary_power` boundary.
	fn allocate(&self, page_count: u64, alignment_power: u8, boundary_power: u8) -> Result<u64>;

	/// Releases region storage previously returned by [`Self::allocate`].
	fn free(&self, addr: u64, page_count: u64);

	/// Allocates `page_count` pages of always-accessible memory for a region
	/// header. Header memory is touched with the pool lock held, so it must
	/// never fault.
	fn allocate_header(&self, page_count: u64) -> Result<u64>;

	/// Releases header storage previously returned by [`Self::allocate_header`].
	fn free_header(&self, addr: u64, page_count: u64);

	/// An extra acceptance check on candidate blocks; the
	/// physically-contiguous bridge uses this to re-check the *physical*
	/// placement of a candidate.
	fn is_aligned(
		&self,
		_addr: u64,
		_alignment_power: u8,
		_boundary_power: u8,
		_byte_count: u64,
	) -> bool {
		true
	}

	/// Marks a range as off-limits for the instrumentation in use (if any).
	fn poison(&self, _addr: u64, _byte_count: u64) {}

	/// Undoes [`Self::poison`] for a range.
	fn unpoison(&self, _addr: u64, _byte_count: u64) {}
}

/// When a leaf is free, its first bytes are re-used as the free-list node.
struct FreeLeaf {
	link: LinkedListAtomicLink,
}

// a free leaf node must fit within the smallest leaf we ever hand out
const_assert_eq!(size_of::<FreeLeaf>(), 16);

intrusive_adapter!(FreeLeafAdapter = &'static FreeLeaf: FreeLeaf { link: LinkedListAtomicLink });

struct InnerRegionHeader {
	leaf_count: u64,
	free_leaf_count: u64,
	start: u64,
	region_page_count: u64,
	header_page_count: u64,
	buckets: [LinkedList<FreeLeafAdapter>; MAX_ORDER],
	bookkeeping: &'static mut [u8],
}

pub(super) struct RegionHeader {
	link: LinkedListAtomicLink,
	inner: UnsafeCell<InnerRegionHeader>,
}

impl RegionHeader {
	/// # Safety
	/// Callers must hold whatever exclusion protects the owning pool instance;
	/// region headers are only ever reached through the instance's region
	/// list.
	unsafe fn inner(&self) -> &mut InnerRegionHeader {
		&mut *self.inner.get()
	}
}

// SAFETY: this is not safe to copy between threads, but it *is* safe to access between threads
//         when the owning pool instance is protected by a lock. we must ONLY access it while
//         holding that lock and always access it by reference (we must NEVER move it).
unsafe impl Send for RegionHeader {}
unsafe impl Sync for RegionHeader {}

intrusive_adapter!(pub(super) RegionHeaderAdapter = &'static RegionHeader: RegionHeader { link: LinkedListAtomicLink });

#[repr(align(4096))]
struct ZeroSizeSentinel([u8; 16]);

/// Zero-byte allocations all return the address of this; it is distinct from
/// every pointer a pool can produce, and freeing it is a no-op.
static ZERO_SIZE_SENTINEL: ZeroSizeSentinel = ZeroSizeSentinel([0; 16]);

pub fn sentinel_address() -> u64 {
	(&ZERO_SIZE_SENTINEL as *const ZeroSizeSentinel) as u64
}

pub fn is_sentinel(addr: u64) -> bool {
	addr == sentinel_address()
}

/// A successful allocation: the block address and the rounded byte count the
/// block actually spans.
#[derive(Clone, Copy, Debug)]
pub struct Allocation {
	pub address: u64,
	pub byte_count: u64,
}

impl InnerRegionHeader {
	fn end(&self, options: &PoolOptions) -> u64 {
		self.start + self.leaf_count * options.min_leaf_size
	}

	fn contains(&self, addr: u64, options: &PoolOptions) -> bool {
		addr >= self.start && addr < self.end(options)
	}

	fn leaf_index(&self, addr: u64, options: &PoolOptions) -> usize {
		((addr - self.start) / options.min_leaf_size) as usize
	}

	/// Reads the `{in-use, order}` bookkeeping entry for the block starting at `addr`.
	///
	/// Only block-start entries are authoritative; interior leaves keep stale
	/// values until they become block starts themselves.
	fn leaf_state(&self, addr: u64, options: &PoolOptions) -> (bool, usize) {
		let byte = self.bookkeeping[self.leaf_index(addr, options)];
		((byte & LEAF_IN_USE) != 0, (byte & LEAF_ORDER_MASK) as usize)
	}

	fn set_leaf_state(&mut self, addr: u64, in_use: bool, order: usize, options: &PoolOptions) {
		let index = self.leaf_index(addr, options);
		self.bookkeeping[index] =
			(order as u8 & LEAF_ORDER_MASK) | (if in_use { LEAF_IN_USE } else { 0 });
	}

	/// SAFETY: the block starting at `addr` must be truly free: not part of any other block,
	///         neither one that's in-use nor one that's free.
	unsafe fn insert_free_leaf(
		&mut self,
		addr: u64,
		order: usize,
		options: &PoolOptions,
		allocator: &dyn PoolAllocator,
	) {
		debug_assert!(is_aligned_pow2(
			addr - self.start,
			options.byte_count_of_order(order)
		));

		// the node overlays the first bytes of the leaf
		allocator.unpoison(addr, size_of::<FreeLeaf>() as u64);
		let leaf = addr as *mut core::mem::MaybeUninit<FreeLeaf>;
		let leaf_ref = &mut *leaf;
		leaf_ref.write(FreeLeaf {
			link: Default::default(),
		});

		// free lists are strictly LIFO within an order
		self.buckets[order].push_front(leaf_ref.assume_init_mut());
		self.set_leaf_state(addr, false, order, options);
		self.free_leaf_count += 1u64 << order;

		allocator.poison(
			addr + size_of::<FreeLeaf>() as u64,
			options.byte_count_of_order(order) - size_of::<FreeLeaf>() as u64,
		);
	}

	/// SAFETY: `addr` must be the start of a free block currently linked into
	///         the bucket of the given order.
	unsafe fn remove_free_leaf(
		&mut self,
		addr: u64,
		order: usize,
		mark_in_use: bool,
		options: &PoolOptions,
		allocator: &dyn PoolAllocator,
	) {
		let node = addr as *const FreeLeaf;
		self.buckets[order]
			.cursor_mut_from_ptr(node)
			.remove()
			.expect("Expected leaf cursor to point to valid element");

		if mark_in_use {
			self.set_leaf_state(addr, true, order, options);
			allocator.unpoison(addr, options.byte_count_of_order(order));
		}
		self.free_leaf_count -= 1u64 << order;
	}

	/// The buddy of the block at `addr` with the given order, if it lies
	/// within the region.
	fn find_buddy(&self, addr: u64, order: usize, options: &PoolOptions) -> Option<u64> {
		let block_size = options.byte_count_of_order(order);
		let buddy = ((addr - self.start) ^ block_size) + self.start;
		if buddy + block_size > self.end(options) {
			None
		} else {
			Some(buddy)
		}
	}

	fn find_candidate_block(
		&mut self,
		min_order: usize,
		constraints: &AllocationConstraints,
		options: &PoolOptions,
		allocator: &dyn PoolAllocator,
		previous_candidate_order: &mut Option<usize>,
	) -> Option<(usize, Option<u64>, Option<usize>)> {
		let accepts = |addr: u64| {
			constraints.satisfied_by(addr)
				&& allocator.is_aligned(
					addr,
					constraints.alignment_power,
					constraints.boundary_power,
					constraints.byte_count,
				)
		};

		let orig_candidate_order: Option<usize> = *previous_candidate_order;
		let mut new_candidate_order: Option<usize> = None;
		let mut aligned_candidate_block = None;
		let mut aligned_candidate_order = None;

		for order in min_order..options.max_order {
			if order
				>= new_candidate_order
					.or(orig_candidate_order)
					.unwrap_or(usize::MAX)
			{
				break;
			}

			let block = match self.buckets[order].front().get() {
				Some(x) => x,
				None => continue,
			};
			let block_addr = (block as *const FreeLeaf) as u64;

			// if the block's own address doesn't work, see whether a sub-block's does
			if !accepts(block_addr) {
				if order == min_order {
					// can't split up a min order block to get an acceptable block big enough
					continue;
				}

				let mut subblock_end = block_addr + options.byte_count_of_order(order);
				let target_address = match constraints.next_acceptable_address(block_addr) {
					Some(x) => x,
					None => continue,
				};

				if target_address <= block_addr || target_address >= subblock_end {
					// the next acceptable address isn't inside this block
					continue;
				}

				let mut subblock = block_addr;
				let mut suborder = order - 1;
				let mut found = false;

				while suborder >= min_order && subblock < subblock_end {
					if accepts(subblock) {
						// this sub-block is big enough and it's placed properly
						found = true;
						aligned_candidate_block = Some(subblock);
						aligned_candidate_order = Some(suborder);
						break;
					} else if target_address > subblock
						&& target_address < subblock + options.byte_count_of_order(suborder)
					{
						// this sub-block contains the address; search its sub-leaves
						if suborder == min_order {
							break;
						}
						subblock_end = subblock + options.byte_count_of_order(suborder);
						suborder -= 1;
					} else {
						// skip to the sibling sub-block
						subblock += options.byte_count_of_order(suborder);
					}
				}

				if !found {
					continue;
				}
			}

			new_candidate_order = Some(order);

			if order == min_order {
				// we're not going to be able to find a smaller candidate block
				break;
			}
		}

		new_candidate_order.map(|order| {
			*previous_candidate_order = new_candidate_order;
			(order, aligned_candidate_block, aligned_candidate_order)
		})
	}

	/// Carves the requested block out of the first block in the candidate
	/// bucket, splitting as needed. Returns the block's address; the block is
	/// marked in-use at `min_order`.
	fn allocate_candidate(
		&mut self,
		min_order: usize,
		candidate: (usize, Option<u64>, Option<usize>),
		constraints: &AllocationConstraints,
		options: &PoolOptions,
		allocator: &dyn PoolAllocator,
	) -> Option<u64> {
		let (mut candidate_order, aligned_candidate_block, aligned_candidate_order) = candidate;

		let accepts = |addr: u64| {
			constraints.satisfied_by(addr)
				&& allocator.is_aligned(
					addr,
					constraints.alignment_power,
					constraints.boundary_power,
					constraints.byte_count,
				)
		};

		let block = self.buckets[candidate_order].front().get()?;
		let mut candidate_block_addr = (block as *const FreeLeaf) as u64;

		// okay, we've chosen our candidate block. un-free it
		//
		// SAFETY: this block sits at the front of the bucket we just read it from.
		unsafe {
			self.remove_free_leaf(candidate_block_addr, candidate_order, false, options, allocator)
		};

		if !accepts(candidate_block_addr) {
			// we've already determined the block has a properly-placed
			// sub-block big enough for us; split the block to get to it
			let aligned_candidate_block = aligned_candidate_block.unwrap();
			let aligned_candidate_order = aligned_candidate_order.unwrap();

			let mut block_end = candidate_block_addr + options.byte_count_of_order(candidate_order);
			let mut subblock = candidate_block_addr;
			let mut suborder = candidate_order - 1;

			while suborder >= aligned_candidate_order {
				let mut next_subblock = 0;

				for split_block in (subblock..block_end)
					.step_by(options.byte_count_of_order(suborder) as usize)
				{
					if aligned_candidate_block >= split_block
						&& aligned_candidate_block
							< split_block + options.byte_count_of_order(suborder)
					{
						// this block either is or contains the aligned candidate block
						next_subblock = split_block;
					} else {
						// a block we don't care about; back into the region it goes
						//
						// SAFETY: it was carved out of a free block, so it's truly free.
						unsafe { self.insert_free_leaf(split_block, suborder, options, allocator) };
					}
				}

				if suborder == aligned_candidate_order {
					assert_eq!(next_subblock, aligned_candidate_block);
					candidate_block_addr = aligned_candidate_block;
					candidate_order = aligned_candidate_order;
					break;
				} else {
					assert_ne!(next_subblock, aligned_candidate_block);
					subblock = next_subblock;
					block_end = subblock + options.byte_count_of_order(suborder);
					suborder -= 1;
				}
			}
		}

		// we might have gotten a bigger block than we wanted. split off the
		// tail, smallest block first.
		let mut start_split = candidate_block_addr + options.byte_count_of_order(min_order);
		for order in min_order..candidate_order {
			// SAFETY: carved out of the block we just removed; truly free.
			unsafe { self.insert_free_leaf(start_split, order, options, allocator) };
			start_split += options.byte_count_of_order(order);
		}

		self.set_leaf_state(candidate_block_addr, true, min_order, options);
		allocator.unpoison(candidate_block_addr, options.byte_count_of_order(min_order));

		Some(candidate_block_addr)
	}
}

/// A buddy pool instance: an ordered list of regions sharing one options
/// record and one allocator bridge.
pub struct PoolInstance {
	options: PoolOptions,
	allocator: &'static dyn PoolAllocator,
	regions: LinkedList<RegionHeaderAdapter>,
}

// SAFETY: instances contain raw region pointers, but those are only ever touched through
//         `&mut self`, and callers serialise all access (see the module docs).
unsafe impl Send for PoolInstance {}

impl PoolInstance {
	pub const fn new(options: PoolOptions, allocator: &'static dyn PoolAllocator) -> Self {
		Self {
			options,
			allocator,
			regions: LinkedList::new(RegionHeaderAdapter::NEW),
		}
	}

	fn check_options(&self) {
		debug_assert!(self.options.max_order <= MAX_ORDER);
		debug_assert!(self.options.min_leaf_size as usize >= size_of::<FreeLeaf>());
		debug_assert!(self.options.min_leaf_size.is_power_of_two());
		debug_assert!(
			(1u64 << self.options.min_leaf_alignment_power) <= self.options.min_leaf_size
		);
	}

	/// Tears the instance down, handing every region and header back to the
	/// bridge. No allocations are permitted afterwards.
	pub fn destroy(&mut self) {
		while let Some(region) = self.regions.pop_front() {
			// SAFETY: we have exclusive access to the instance, so nothing else can
			//         be looking at this region.
			let inner = unsafe { region.inner() };
			let (start, page_count, header_page_count) =
				(inner.start, inner.region_page_count, inner.header_page_count);

			self.allocator.free(start, page_count);
			self.allocator
				.free_header((region as *const RegionHeader) as u64, header_page_count);
		}
	}

	/// Allocates at least `byte_count` bytes aligned to
	/// `2^alignment_power` (or the instance minimum, whichever is larger),
	/// not crossing any `2^boundary_power` boundary.
	pub fn allocate(
		&mut self,
		byte_count: u64,
		alignment_power: u8,
		boundary_power: u8,
	) -> Result<Allocation> {
		self.check_options();

		if byte_count == 0 {
			return Ok(Allocation {
				address: sentinel_address(),
				byte_count: 0,
			});
		}

		if boundary_power != 0 && byte_count > (1u64 << boundary_power) {
			// nothing that large can avoid crossing the boundary
			return Err(Error::InvalidArgument);
		}

		let alignment_power = alignment_power.max(self.options.min_leaf_alignment_power);
		let min_order = self
			.options
			.min_order_for_byte_count(byte_count)
			.ok_or(Error::InvalidArgument)?;
		let constraints = AllocationConstraints {
			alignment_power,
			boundary_power,
			byte_count,
		};

		let mut grown = false;
		loop {
			if let Some(addr) = self.allocate_from_existing(min_order, &constraints) {
				#[cfg(memory_log_alloc)]
				kprintln!("Allocating pool block {:#x} (order = {})", addr, min_order);

				return Ok(Allocation {
					address: addr,
					byte_count: self.options.byte_count_of_order(min_order),
				});
			}

			if grown {
				// a fresh region still couldn't satisfy the request
				return Err(Error::TemporaryOutage);
			}
			self.grow(min_order, &constraints)?;
			grown = true;
		}
	}

	fn allocate_from_existing(
		&mut self,
		min_order: usize,
		constraints: &AllocationConstraints,
	) -> Option<u64> {
		let options = self.options;
		let allocator = self.allocator;
		let mut candidate_order = None;

		// look for the smallest usable block from any region
		let result = self
			.regions
			.iter()
			.filter_map(|region| {
				// SAFETY: we have exclusive access to the instance, so regions can't be aliased.
				let inner = unsafe { region.inner() };

				inner
					.find_candidate_block(
						min_order,
						constraints,
						&options,
						allocator,
						&mut candidate_order,
					)
					.map(|result| (inner, result))
			})
			.min_by_key(|item| item.1 .0)?;

		let (inner, candidate) = result;
		inner.allocate_candidate(min_order, candidate, constraints, &options, allocator)
	}

	/// Requests a new region from the bridge, preferring
	/// `options.optimal_min_region_order` and halving down towards
	/// `min_order` under memory pressure.
	fn grow(&mut self, min_order: usize, constraints: &AllocationConstraints) -> Result<()> {
		let max_region_order = self.options.max_order - 1;
		let mut region_order = self
			.options
			.optimal_min_region_order
			.clamp(min_order, max_region_order);

		// aligning the region start to the boundary guarantees the first
		// block can satisfy the no-cross requirement
		let region_alignment = constraints.alignment_power.max(constraints.boundary_power);

		loop {
			let leaf_count = 1u64 << region_order;
			let region_pages = self.options.region_page_count_for_leaf_count(leaf_count);
			let header_pages = self.options.header_page_count_for_leaf_count(leaf_count);

			let outcome = self
				.allocator
				.allocate(region_pages, region_alignment, constraints.boundary_power)
				.and_then(|start| {
					match self.allocator.allocate_header(header_pages) {
						Ok(header) => Ok((start, header)),
						Err(err) => {
							self.allocator.free(start, region_pages);
							Err(err)
						},
					}
				});

			match outcome {
				Ok((start, header_addr)) => {
					self.adopt_region(start, header_addr, leaf_count, region_pages, header_pages);
					return Ok(());
				},
				Err(_) if region_order > min_order => {
					// halve and retry
					region_order -= 1;
				},
				Err(_) => return Err(Error::TemporaryOutage),
			}
		}
	}

	fn adopt_region(
		&mut self,
		start: u64,
		header_addr: u64,
		leaf_count: u64,
		region_pages: u64,
		header_pages: u64,
	) {
		let options = self.options;
		let allocator = self.allocator;

		let header_val = RegionHeader {
			link: Default::default(),
			inner: UnsafeCell::new(InnerRegionHeader {
				leaf_count,
				free_leaf_count: 0,
				start,
				region_page_count: region_pages,
				header_page_count: header_pages,
				buckets: Default::default(),
				// SAFETY: the bookkeeping vector starts right after the header struct and the
				//         header allocation was sized to hold one byte per leaf. alignment is
				//         not an issue because `u8`s have single byte alignment.
				bookkeeping: unsafe {
					core::slice::from_raw_parts_mut(
						(header_addr + size_of::<RegionHeader>() as u64) as *mut u8,
						leaf_count as usize,
					)
				},
			}),
		};

		// SAFETY: the header memory is ours (freshly bridge-allocated) and unaliased.
		let header = unsafe { &mut *(header_addr as *mut core::mem::MaybeUninit<RegionHeader>) };
		header.write(header_val);
		// SAFETY: we just initialized it above
		let header = unsafe { header.assume_init_mut() };
		let inner = header.inner.get_mut();

		inner.bookkeeping.fill(0);

		// seed the free lists with a greedy decomposition into maximal blocks
		let mut block_addr = start;
		let mut remaining = leaf_count;
		while remaining > 0 {
			let order = (remaining.ilog2() as usize).min(options.max_order - 1);
			// SAFETY: non-overlapping blocks carved from a fresh region.
			unsafe { inner.insert_free_leaf(block_addr, order, &options, allocator) };
			block_addr += options.byte_count_of_order(order);
			remaining -= 1u64 << order;
		}

		// fresh regions go to the head of the list
		self.regions.push_front(header);
	}

	fn region_of(&self, addr: u64) -> Option<*const RegionHeader> {
		let options = self.options;
		self.regions
			.iter()
			.find(|region| {
				// SAFETY: exclusive access via the instance.
				let inner = unsafe { region.inner() };
				inner.contains(addr, &options)
			})
			.map(|region| region as *const RegionHeader)
	}

	/// Whether `addr` was returned (and not yet freed) by this instance. The
	/// façade uses this to find a pointer's owner.
	pub fn owns(&self, addr: u64) -> bool {
		if is_sentinel(addr) {
			return false;
		}
		match self.region_of(addr) {
			Some(region) => {
				// SAFETY: the region is linked into our list and we have exclusive access.
				let inner = unsafe { (*region).inner() };
				is_aligned_pow2(addr - inner.start, self.options.min_leaf_size)
					&& inner.leaf_state(addr, &self.options).0
			},
			None => false,
		}
	}

	/// Frees a block previously returned by this instance. Freeing the
	/// zero-byte sentinel is a no-op.
	pub fn free(&mut self, addr: u64) -> Result<()> {
		if is_sentinel(addr) {
			return Ok(());
		}

		let options = self.options;
		let allocator = self.allocator;

		let region = self.region_of(addr).ok_or(Error::InvalidArgument)?;
		// SAFETY: the region is linked into our list and we have exclusive access.
		let inner = unsafe { (*region).inner() };

		if !is_aligned_pow2(addr - inner.start, options.min_leaf_size) {
			return Err(Error::InvalidArgument);
		}

		let (in_use, mut order) = inner.leaf_state(addr, &options);
		if !in_use || !is_aligned_pow2(addr - inner.start, options.byte_count_of_order(order)) {
			// not something we handed out
			return Err(Error::InvalidArgument);
		}

		#[cfg(memory_log_alloc)]
		kprintln!("Freeing pool block {:#x} (order = {})", addr, order);

		let mut addr = addr;
		inner.set_leaf_state(addr, false, order, &options);

		// merge with free buddies as far up as possible
		while order < options.max_order - 1 {
			let buddy = match inner.find_buddy(addr, order, &options) {
				Some(x) => x,
				None => break,
			};

			let (buddy_in_use, buddy_order) = inner.leaf_state(buddy, &options);
			if buddy_in_use || buddy_order != order {
				// the buddy is busy or partially split; no more merging
				break;
			}

			// SAFETY: the bookkeeping entry says the buddy is a free block of this order,
			//         so its node is linked into this order's bucket.
			unsafe { inner.remove_free_leaf(buddy, order, false, &options, allocator) };

			// whoever's got the lower address is the start of the bigger block
			if buddy < addr {
				addr = buddy;
			}
			order += 1;
		}

		// SAFETY: the block (possibly merged) is truly free now.
		unsafe { inner.insert_free_leaf(addr, order, &options, allocator) };

		if inner.free_leaf_count == inner.leaf_count {
			self.collect_free_regions();
		}

		Ok(())
	}

	/// Releases fully-free regions beyond the configured retention count,
	/// keeping the largest ones.
	fn collect_free_regions(&mut self) {
		loop {
			let mut fully_free = 0usize;
			let mut smallest: Option<(*const RegionHeader, u64)> = None;

			for region in self.regions.iter() {
				// SAFETY: exclusive access via the instance.
				let inner = unsafe { region.inner() };
				if inner.free_leaf_count != inner.leaf_count {
					continue;
				}
				fully_free += 1;
				if smallest.map_or(true, |(_, count)| inner.leaf_count < count) {
					smallest = Some((region as *const RegionHeader, inner.leaf_count));
				}
			}

			if fully_free <= self.options.max_kept_region_count {
				return;
			}

			let (victim, _) = smallest.unwrap();
			// SAFETY: `victim` came from our own region list just above.
			let removed = unsafe { self.regions.cursor_mut_from_ptr(victim) }
				.remove()
				.expect("Expected region cursor to point to valid element");

			// SAFETY: the region is out of the list; nothing else refers to it.
			let inner = unsafe { removed.inner() };
			let (start, page_count, header_page_count) =
				(inner.start, inner.region_page_count, inner.header_page_count);

			self.allocator.free(start, page_count);
			self.allocator
				.free_header((removed as *const RegionHeader) as u64, header_page_count);
		}
	}

	/// The rounded size of the block at `addr` (0 for the sentinel).
	pub fn allocated_byte_count(&self, addr: u64) -> Result<u64> {
		if is_sentinel(addr) {
			return Ok(0);
		}

		let region = self.region_of(addr).ok_or(Error::InvalidArgument)?;
		// SAFETY: the region is linked into our list and we have exclusive access.
		let inner = unsafe { (*region).inner() };

		if !is_aligned_pow2(addr - inner.start, self.options.min_leaf_size) {
			return Err(Error::InvalidArgument);
		}

		let (in_use, order) = inner.leaf_state(addr, &self.options);
		if !in_use {
			return Err(Error::InvalidArgument);
		}

		Ok(self.options.byte_count_of_order(order))
	}

	/// Resizes a block, preserving its contents up to the smaller of the old
	/// and new sizes. `old_addr` of null or the sentinel behaves as a plain
	/// allocation; a new byte count of 0 frees the block and returns the
	/// sentinel.
	pub fn reallocate(
		&mut self,
		old_addr: u64,
		new_byte_count: u64,
		alignment_power: u8,
		boundary_power: u8,
	) -> Result<Allocation> {
		if old_addr == 0 || is_sentinel(old_addr) {
			return self.allocate(new_byte_count, alignment_power, boundary_power);
		}

		if new_byte_count == 0 {
			self.free(old_addr)?;
			return Ok(Allocation {
				address: sentinel_address(),
				byte_count: 0,
			});
		}

		let options = self.options;
		let allocator = self.allocator;
		let alignment_power = alignment_power.max(options.min_leaf_alignment_power);

		let new_order = options
			.min_order_for_byte_count(new_byte_count)
			.ok_or(Error::InvalidArgument)?;

		let (cur_order, placement_ok) = {
			let region = self.region_of(old_addr).ok_or(Error::InvalidArgument)?;
			// SAFETY: the region is linked into our list and we have exclusive access.
			let inner = unsafe { (*region).inner() };

			if !is_aligned_pow2(old_addr - inner.start, options.min_leaf_size) {
				return Err(Error::InvalidArgument);
			}
			let (in_use, cur_order) = inner.leaf_state(old_addr, &options);
			if !in_use {
				return Err(Error::InvalidArgument);
			}

			// the old block only stays put if it also satisfies the (possibly
			// new) placement requirements at the new size
			let placement_ok = is_aligned_pow2(old_addr, 1 << alignment_power)
				&& !crate::util::crosses_boundary(old_addr, new_byte_count, boundary_power)
				&& allocator.is_aligned(
					old_addr,
					alignment_power,
					boundary_power,
					new_byte_count,
				);

			(cur_order, placement_ok)
		};

		if placement_ok && new_order == cur_order {
			// in place, unchanged
			return Ok(Allocation {
				address: old_addr,
				byte_count: options.byte_count_of_order(cur_order),
			});
		}

		if placement_ok && new_order < cur_order {
			// in-place shrink: reduce the block's order and hand the tail
			// back, smallest block first
			let region = self.region_of(old_addr).unwrap();
			// SAFETY: the region is linked into our list and we have exclusive access.
			let inner = unsafe { (*region).inner() };

			inner.set_leaf_state(old_addr, true, new_order, &options);
			let mut start_split = old_addr + options.byte_count_of_order(new_order);
			for order in new_order..cur_order {
				// SAFETY: the tail was part of our own in-use block.
				unsafe { inner.insert_free_leaf(start_split, order, &options, allocator) };
				start_split += options.byte_count_of_order(order);
			}

			return Ok(Allocation {
				address: old_addr,
				byte_count: options.byte_count_of_order(new_order),
			});
		}

		if placement_ok && self.try_expand_in_place(old_addr, cur_order, new_order) {
			return Ok(Allocation {
				address: old_addr,
				byte_count: options.byte_count_of_order(new_order),
			});
		}

		// no luck in place; allocate elsewhere and copy
		let new_allocation = self.allocate(new_byte_count, alignment_power, boundary_power)?;
		let copy_bytes = options
			.byte_count_of_order(cur_order)
			.min(new_allocation.byte_count);

		// SAFETY: both blocks are live and disjoint (the new one was just allocated
		//         while the old one was still in use), and `copy_bytes` fits in both.
		unsafe {
			core::ptr::copy_nonoverlapping(
				old_addr as *const u8,
				new_allocation.address as *mut u8,
				copy_bytes as usize,
			);
		}

		self.free(old_addr)?;
		Ok(new_allocation)
	}

	/// Grows the block at `old_addr` from `cur_order` to `new_order` by
	/// consuming its forward buddies, all-or-nothing.
	fn try_expand_in_place(&mut self, old_addr: u64, cur_order: usize, new_order: usize) -> bool {
		let options = self.options;
		let allocator = self.allocator;

		let region = match self.region_of(old_addr) {
			Some(x) => x,
			None => return false,
		};
		// SAFETY: the region is linked into our list and we have exclusive access.
		let inner = unsafe { (*region).inner() };

		// every step's buddy must lie *forward* of the block, which requires
		// the block to sit on the larger block's start
		if !is_aligned_pow2(
			old_addr - inner.start,
			options.byte_count_of_order(new_order),
		) {
			return false;
		}

		// probe first: every forward buddy must be a free block of exactly the
		// stepping order
		for order in cur_order..new_order {
			let buddy = old_addr + options.byte_count_of_order(order);
			if buddy + options.byte_count_of_order(order) > inner.end(&options) {
				return false;
			}
			let (in_use, buddy_order) = inner.leaf_state(buddy, &options);
			if in_use || buddy_order != order {
				return false;
			}
		}

		// commit
		for order in cur_order..new_order {
			let buddy = old_addr + options.byte_count_of_order(order);
			// SAFETY: the probe above verified each buddy is a linked free block of this order.
			unsafe { inner.remove_free_leaf(buddy, order, false, &options, allocator) };
		}

		inner.set_leaf_state(old_addr, true, new_order, &options);
		allocator.unpoison(old_addr, options.byte_count_of_order(new_order));
		true
	}

	/// Diagnostics: how many regions the instance currently holds.
	pub fn region_count(&self) -> usize {
		self.regions.iter().count()
	}

	#[cfg(test)]
	fn verify_integrity(&self) {
		for region in self.regions.iter() {
			// SAFETY: exclusive access via the instance.
			let inner = unsafe { region.inner() };

			let mut counted_free = 0u64;
			for order in 0..self.options.max_order {
				for leaf in inner.buckets[order].iter() {
					let addr = (leaf as *const FreeLeaf) as u64;
					assert!(inner.contains(addr, &self.options));

					let (in_use, recorded_order) = inner.leaf_state(addr, &self.options);
					assert!(!in_use, "free-list entry marked in-use at {addr:#x}");
					assert_eq!(recorded_order, order, "order mismatch at {addr:#x}");

					// two free buddies of the same order must have been merged
					if let Some(buddy) = inner.find_buddy(addr, order, &self.options) {
						let (buddy_in_use, buddy_order) = inner.leaf_state(buddy, &self.options);
						assert!(
							buddy_in_use || buddy_order != order,
							"unmerged buddies at {addr:#x}/{buddy:#x}"
						);
					}

					counted_free += 1u64 << order;
				}
			}
			assert_eq!(counted_free, inner.free_leaf_count);
			assert!(inner.free_leaf_count <= inner.leaf_count);
		}
	}
}

#[cfg(test)]
pub(super) mod tests {
	extern crate std;

	use std::{
		alloc::{alloc, dealloc, Layout},
		boxed::Box,
		collections::HashMap,
		sync::Mutex,
		vec::Vec,
	};

	use super::*;

	pub(in crate::memory) const TEST_OPTIONS: PoolOptions = PoolOptions {
		page_size: 0x1000,
		max_order: 32,
		min_leaf_size: 16,
		min_leaf_alignment_power: 4,
		max_kept_region_count: 3,
		optimal_min_region_order: 10,
	};

	pub(in crate::memory) struct TestAllocator {
		allocations: Mutex<HashMap<u64, Layout>>,
	}

	impl TestAllocator {
		pub(in crate::memory) fn leaked() -> &'static Self {
			Box::leak(Box::new(Self {
				allocations: Mutex::new(HashMap::new()),
			}))
		}

		pub(in crate::memory) fn outstanding(&self) -> usize {
			self.allocations.lock().unwrap().len()
		}

		fn allocate_pages(&self, page_count: u64, alignment_power: u8) -> Result<u64> {
			let size = (page_count * TEST_OPTIONS.page_size) as usize;
			let align = (1usize << alignment_power).max(TEST_OPTIONS.page_size as usize);
			let layout = Layout::from_size_align(size, align).unwrap();
			// SAFETY: the layout is non-zero-sized.
			let ptr = unsafe { alloc(layout) };
			assert!(!ptr.is_null());
			self.allocations
				.lock()
				.unwrap()
				.insert(ptr as u64, layout);
			Ok(ptr as u64)
		}

		fn free_pages(&self, addr: u64) {
			let layout = self
				.allocations
				.lock()
				.unwrap()
				.remove(&addr)
				.expect("freeing something the bridge never allocated");
			// SAFETY: the layout was recorded at allocation time.
			unsafe { dealloc(addr as *mut u8, layout) };
		}
	}

	impl PoolAllocator for TestAllocator {
		fn allocate(
			&self,
			page_count: u64,
			alignment_power: u8,
			_boundary_power: u8,
		) -> Result<u64> {
			self.allocate_pages(page_count, alignment_power)
		}

		fn free(&self, addr: u64, _page_count: u64) {
			self.free_pages(addr);
		}

		fn allocate_header(&self, page_count: u64) -> Result<u64> {
			self.allocate_pages(page_count, 12)
		}

		fn free_header(&self, addr: u64, _page_count: u64) {
			self.free_pages(addr);
		}
	}

	fn test_pool() -> PoolInstance {
		PoolInstance::new(TEST_OPTIONS, TestAllocator::leaked())
	}

	#[test]
	fn rounded_sizes_and_retention() {
		let mut pool = test_pool();

		let a = pool.allocate(1, 0, 0).unwrap();
		let b = pool.allocate(32, 0, 0).unwrap();
		let c = pool.allocate(16384, 0, 0).unwrap();

		assert_eq!(a.byte_count, 16);
		assert_eq!(b.byte_count, 32);
		assert_eq!(c.byte_count, 16384);

		assert_eq!(pool.allocated_byte_count(a.address).unwrap(), 16);
		assert_eq!(pool.allocated_byte_count(b.address).unwrap(), 32);
		assert_eq!(pool.allocated_byte_count(c.address).unwrap(), 16384);

		pool.free(c.address).unwrap();
		pool.free(b.address).unwrap();
		pool.free(a.address).unwrap();

		pool.verify_integrity();
		assert!(pool.region_count() >= 1);
		assert!(pool.region_count() <= TEST_OPTIONS.max_kept_region_count);

		pool.destroy();
	}

	#[test]
	fn minimum_alignment_always_honoured() {
		let mut pool = test_pool();
		let mut live = Vec::new();

		for size in [1u64, 2, 15, 16, 17, 100, 4000] {
			let allocation = pool.allocate(size, 0, 0).unwrap();
			assert!(allocation.byte_count >= size);
			assert_eq!(allocation.address % 16, 0);
			live.push(allocation.address);
		}

		for addr in live {
			pool.free(addr).unwrap();
		}
		pool.verify_integrity();
		pool.destroy();
	}

	#[test]
	fn large_alignment_request() {
		let mut pool = test_pool();

		// 1MiB aligned to 2MiB
		let allocation = pool.allocate(1024 * 1024, 21, 0).unwrap();
		assert_eq!(allocation.address % (1 << 21), 0);
		assert!(allocation.byte_count >= 1024 * 1024);

		// fill with a pattern, grow to 3MiB at the same alignment, verify the
		// bytes made it over
		// SAFETY: writing within our own allocation.
		unsafe {
			for i in 0..1024u64 {
				*((allocation.address + i * 1024) as *mut u8) = (i % 251) as u8;
			}
		}

		let grown = pool
			.reallocate(allocation.address, 3 * 1024 * 1024, 21, 0)
			.unwrap();
		assert_eq!(grown.address % (1 << 21), 0);
		assert!(grown.byte_count >= 3 * 1024 * 1024);

		// SAFETY: reading within our own allocation.
		unsafe {
			for i in 0..1024u64 {
				assert_eq!(*((grown.address + i * 1024) as *const u8), (i % 251) as u8);
			}
		}

		pool.free(grown.address).unwrap();
		pool.verify_integrity();
		pool.destroy();
	}

	#[test]
	fn no_cross_boundary() {
		let mut pool = test_pool();
		let mut live = Vec::new();

		// none of these may straddle a 4KiB line
		for _ in 0..64 {
			let allocation = pool.allocate(192, 0, 12).unwrap();
			let first_page = allocation.address >> 12;
			let last_page = (allocation.address + 192 - 1) >> 12;
			assert_eq!(first_page, last_page);
			live.push(allocation.address);
		}

		for addr in live {
			pool.free(addr).unwrap();
		}
		pool.verify_integrity();

		// a request that cannot possibly fit inside the boundary is malformed
		assert_eq!(
			pool.allocate(0x2000, 0, 12).unwrap_err(),
			Error::InvalidArgument
		);

		pool.destroy();
	}

	#[test]
	fn zero_byte_sentinel() {
		let mut pool = test_pool();

		let zero = pool.allocate(0, 0, 0).unwrap();
		assert!(is_sentinel(zero.address));
		assert_eq!(zero.byte_count, 0);
		assert_eq!(pool.allocated_byte_count(zero.address).unwrap(), 0);

		// freeing the sentinel is a no-op
		pool.free(zero.address).unwrap();
		pool.free(zero.address).unwrap();

		// reallocating from the sentinel behaves like a fresh allocation
		let real = pool.reallocate(zero.address, 100, 0, 0).unwrap();
		assert!(!is_sentinel(real.address));
		// 100 bytes round up to 7 leaves, and the next order holds 8
		assert_eq!(real.byte_count, 128);

		// reallocating down to zero hands the sentinel back
		let gone = pool.reallocate(real.address, 0, 0, 0).unwrap();
		assert!(is_sentinel(gone.address));

		pool.verify_integrity();
		pool.destroy();
	}

	#[test]
	fn free_of_unknown_pointer() {
		let mut pool = test_pool();

		let a = pool.allocate(64, 0, 0).unwrap();

		let bogus = 0xdead_beef_cafe_0000u64;
		assert_eq!(pool.free(bogus).unwrap_err(), Error::InvalidArgument);

		// an interior pointer isn't a block start either
		assert_eq!(
			pool.free(a.address + 16).unwrap_err(),
			Error::InvalidArgument
		);

		// the original allocation is untouched
		assert_eq!(pool.allocated_byte_count(a.address).unwrap(), 64);
		pool.free(a.address).unwrap();
		pool.verify_integrity();
		pool.destroy();
	}

	#[test]
	fn reallocate_preserves_contents() {
		let mut pool = test_pool();

		let small = pool.allocate(64, 0, 0).unwrap();
		// SAFETY: writing within our own allocation.
		unsafe {
			for i in 0..64u64 {
				*((small.address + i) as *mut u8) = i as u8;
			}
		}

		let big = pool.reallocate(small.address, 4096, 0, 0).unwrap();
		assert!(big.byte_count >= 4096);
		// SAFETY: reading within our own allocation.
		unsafe {
			for i in 0..64u64 {
				assert_eq!(*((big.address + i) as *const u8), i as u8);
			}
		}

		// shrinking also preserves the prefix
		let back = pool.reallocate(big.address, 16, 0, 0).unwrap();
		assert_eq!(back.byte_count, 16);
		// SAFETY: reading within our own allocation.
		unsafe {
			for i in 0..16u64 {
				assert_eq!(*((back.address + i) as *const u8), i as u8);
			}
		}

		pool.free(back.address).unwrap();
		pool.verify_integrity();
		pool.destroy();
	}

	#[test]
	fn shrink_stays_in_place() {
		let mut pool = test_pool();

		let big = pool.allocate(16384, 0, 0).unwrap();
		let small = pool.reallocate(big.address, 16, 0, 0).unwrap();

		assert_eq!(small.address, big.address);
		assert_eq!(small.byte_count, 16);
		assert_eq!(pool.allocated_byte_count(big.address).unwrap(), 16);

		pool.free(small.address).unwrap();
		pool.verify_integrity();
		pool.destroy();
	}

	#[test]
	fn expand_consumes_forward_buddies() {
		let mut pool = test_pool();

		// the first allocation of a fresh region lands at its start, so all
		// of its forward buddies are free
		let first = pool.allocate(16, 0, 0).unwrap();
		let grown = pool.reallocate(first.address, 64, 0, 0).unwrap();

		assert_eq!(grown.address, first.address);
		assert_eq!(grown.byte_count, 64);

		pool.free(grown.address).unwrap();
		pool.verify_integrity();
		pool.destroy();
	}

	#[test]
	fn region_collection_keeps_largest() {
		let allocator = TestAllocator::leaked();
		let mut pool = PoolInstance::new(TEST_OPTIONS, allocator);

		// each of these fills one whole fresh region (region order == request order)
		let region_bytes = TEST_OPTIONS.byte_count_of_order(TEST_OPTIONS.optimal_min_region_order);
		let mut live = Vec::new();
		for _ in 0..6 {
			live.push(pool.allocate(region_bytes, 0, 0).unwrap());
		}
		assert_eq!(pool.region_count(), 6);

		for allocation in live {
			pool.free(allocation.address).unwrap();
		}

		// collection keeps only the configured number of fully-free regions
		assert_eq!(pool.region_count(), TEST_OPTIONS.max_kept_region_count);
		pool.verify_integrity();

		pool.destroy();
		// destroy returned every region and header to the bridge
		assert_eq!(allocator.outstanding(), 0);
	}

	#[test]
	fn mixed_workload_quiesces_clean() {
		let mut pool = test_pool();
		let mut live: Vec<(u64, u64, u8)> = Vec::new();

		// simple deterministic LCG; no external randomness in kernel tests
		let mut state = 0x243f_6a88_85a3_08d3u64;
		let mut next = move || {
			state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
			state >> 33
		};

		for round in 0..2000 {
			if round % 3 != 0 || live.is_empty() {
				let size = (next() % 5000) + 1;
				let align: u8 = (next() % 4) as u8 * 2; // 0, 2, 4, 6
				let allocation = pool.allocate(size, align, 0).unwrap();

				assert!(allocation.byte_count >= size);
				assert_eq!(allocation.address % (1u64 << align.max(4)), 0);

				// live blocks must be pairwise disjoint
				for (other, other_size, _) in &live {
					let disjoint = allocation.address + allocation.byte_count <= *other
						|| *other + *other_size <= allocation.address;
					assert!(disjoint, "overlapping allocations");
				}

				live.push((allocation.address, allocation.byte_count, align));
			} else {
				let index = (next() as usize) % live.len();
				let (addr, _, _) = live.swap_remove(index);
				pool.free(addr).unwrap();
			}
		}

		pool.verify_integrity();

		for (addr, _, _) in live {
			pool.free(addr).unwrap();
		}

		pool.verify_integrity();
		assert!(pool.region_count() <= TEST_OPTIONS.max_kept_region_count);
		pool.destroy();
	}

	#[test]
	fn ownership_probe() {
		let mut pool = test_pool();
		let mut other = test_pool();

		let a = pool.allocate(128, 0, 0).unwrap();

		assert!(pool.owns(a.address));
		assert!(!other.owns(a.address));
		assert!(!pool.owns(sentinel_address()));

		pool.free(a.address).unwrap();
		assert!(!pool.owns(a.address));

		pool.destroy();
		other.destroy();
	}
}
