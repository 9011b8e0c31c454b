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

//! The x86_64 lazy-binding stubs.
//!
//! Frame layout, rbp-relative (ascending addresses from `rbp - 0x68` match
//! `BindStubFrame` followed by the saved integer registers):
//!
//! ```text
//!   rbp - 0x68   extended-state mask (XCR0 at save time)
//!   rbp - 0x60   extended-state save area pointer
//!   rbp - 0x58   lazy-bind info offset
//!   rbp - 0x50   image handle
//!   rbp - 0x48   r11
//!   rbp - 0x40   r10
//!   rbp - 0x38   r9
//!   rbp - 0x30   r8
//!   rbp - 0x28   rcx
//!   rbp - 0x20   rdx
//!   rbp - 0x18   rsi
//!   rbp - 0x10   rdi
//!   rbp - 0x08   rax
//! ```
//!
//! r11 is the one register deliberately not restored: it carries the
//! resolved target across the tail jump, which the ABI permits (it is
//! call-clobbered).

use core::arch::global_asm;

global_asm!(
	".text",
	".p2align 4",
	".global dymple_bind_lazy_stub",
	"dymple_bind_lazy_stub:",
	// entry: [rsp] = image handle, [rsp+8] = lazy-bind info offset,
	//        [rsp+16] = return address (all placed by the binding helper)
	"push rbp",
	"mov rbp, rsp",
	"sub rsp, 0x68",
	// the integer argument registers, rax (varargs count), and the
	// linker scratch pair
	"mov [rbp - 0x08], rax",
	"mov [rbp - 0x10], rdi",
	"mov [rbp - 0x18], rsi",
	"mov [rbp - 0x20], rdx",
	"mov [rbp - 0x28], rcx",
	"mov [rbp - 0x30], r8",
	"mov [rbp - 0x38], r9",
	"mov [rbp - 0x40], r10",
	"mov [rbp - 0x48], r11",
	// the two stub parameters move into the frame
	"mov rax, [rbp + 8]",
	"mov [rbp - 0x50], rax",
	"mov rax, [rbp + 16]",
	"mov [rbp - 0x58], rax",
	// reserve the CPU-reported extended-state area, 64-byte aligned
	"mov rsi, rbx", // cpuid clobbers rbx, which is callee-saved
	"mov eax, 0xd",
	"xor ecx, ecx",
	"cpuid",
	"mov eax, ebx", // save-area size for the currently enabled features
	"mov rbx, rsi",
	"sub rsp, rax",
	"and rsp, -64",
	// the XSAVE header (bytes 512..576) must be zero before xsave
	"xor eax, eax",
	"mov [rsp + 512], rax",
	"mov [rsp + 520], rax",
	"mov [rsp + 528], rax",
	"mov [rsp + 536], rax",
	"mov [rsp + 544], rax",
	"mov [rsp + 552], rax",
	"mov [rsp + 560], rax",
	"mov [rsp + 568], rax",
	// save everything XCR0 enables, and remember the mask and area
	"xor ecx, ecx",
	"xgetbv",
	"mov [rbp - 0x60], rsp",
	"shl rdx, 32",
	"or rax, rdx",
	"mov [rbp - 0x68], rax",
	"mov rdx, rax",
	"shr rdx, 32",
	"xsave64 [rsp]",
	// hand the frame to the binder
	"lea rdi, [rbp - 0x68]",
	"call {binder}",
	"mov r11, rax",
	// bring the extended state back
	"mov rax, [rbp - 0x68]",
	"mov rdx, rax",
	"shr rdx, 32",
	"xrstor64 [rsp]",
	// reload the saved integer registers (r11 keeps the target)
	"mov rax, [rbp - 0x08]",
	"mov rdi, [rbp - 0x10]",
	"mov rsi, [rbp - 0x18]",
	"mov rdx, [rbp - 0x20]",
	"mov rcx, [rbp - 0x28]",
	"mov r8,  [rbp - 0x30]",
	"mov r9,  [rbp - 0x38]",
	"mov r10, [rbp - 0x40]",
	"mov rsp, rbp",
	"pop rbp",
	// drop the two stub parameters so the stack matches a direct call
	"add rsp, 16",
	"jmp r11",
	binder = sym crate::bind::dymple_bind_entry,
);

global_asm!(
	".text",
	".p2align 4",
	".global dymple_bind_lazy_stub_compact",
	"dymple_bind_lazy_stub_compact:",
	"push rbp",
	"mov rbp, rsp",
	"sub rsp, 0x70",
	"mov [rbp - 0x08], rax",
	"mov [rbp - 0x10], rdi",
	"mov [rbp - 0x18], rsi",
	"mov [rbp - 0x20], rdx",
	"mov [rbp - 0x28], rcx",
	"mov [rbp - 0x30], r8",
	"mov [rbp - 0x38], r9",
	"mov [rbp - 0x40], r10",
	"mov [rbp - 0x48], r11",
	"mov rax, [rbp + 8]",
	"mov [rbp - 0x50], rax",
	"mov rax, [rbp + 16]",
	"mov [rbp - 0x58], rax",
	// no extended state; the frame records that with zeroes
	"xor eax, eax",
	"mov [rbp - 0x60], rax",
	"mov [rbp - 0x68], rax",
	"lea rdi, [rbp - 0x68]",
	"call {binder}",
	"mov r11, rax",
	"mov rax, [rbp - 0x08]",
	"mov rdi, [rbp - 0x10]",
	"mov rsi, [rbp - 0x18]",
	"mov rdx, [rbp - 0x20]",
	"mov rcx, [rbp - 0x28]",
	"mov r8,  [rbp - 0x30]",
	"mov r9,  [rbp - 0x38]",
	"mov r10, [rbp - 0x40]",
	"mov rsp, rbp",
	"pop rbp",
	"add rsp, 16",
	"jmp r11",
	binder = sym crate::bind::dymple_bind_entry,
);
