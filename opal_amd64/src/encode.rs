//! AMD64 instruction encoding primitives.
//!
//! Every helper appends bytes to a code buffer. Encodings default to 64-bit
//! operand size (REX.W); the sized stack load/store helpers drop to narrower
//! operand sizes where the slot type requires it. Jump and call helpers
//! write a zeroed rel32 displacement and return its buffer offset so the
//! caller can record a fixup or relocation.

use crate::reg::{Gpr, Xmm};

/// Condition codes: the low nibble shared by SETcc (`0F 9x`) and the near
/// Jcc forms (`0F 8x`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CondCode {
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    Be = 0x6,
    A = 0x7,
    L = 0xC,
    Ge = 0xD,
    Le = 0xE,
    G = 0xF,
}

impl CondCode {
    /// Second opcode byte of `SETcc r/m8`.
    pub fn setcc_opcode(self) -> u8 {
        0x90 | self as u8
    }

    /// Second opcode byte of the near `Jcc rel32` form.
    pub fn jcc_opcode(self) -> u8 {
        0x80 | self as u8
    }
}

/// A pending rel32 patch recorded while a jump target's offset is unknown.
#[derive(Debug)]
pub struct JumpFixup {
    /// Buffer offset where the 4 placeholder bytes start.
    pub patch_offset: usize,
    /// Label this jump targets.
    pub target: u32,
}

fn push_i32(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

/// ModR/M for `[rbp + disp32]` (mod=10, rm=101) with the given reg field.
fn modrm_rbp(buf: &mut Vec<u8>, reg_enc: u8, disp: i32) {
    buf.push(0x85 | (reg_enc << 3));
    push_i32(buf, disp);
}

/// ModR/M for register-direct operands (mod=11).
fn modrm_direct(reg_enc: u8, rm_enc: u8) -> u8 {
    0xC0 | (reg_enc << 3) | rm_enc
}

// ── Constant materialization ──

/// `mov r64, imm64` (`REX.W B8+r`).
pub fn mov_ri64(buf: &mut Vec<u8>, dst: Gpr, imm: i64) {
    let rex = 0x48 | u8::from(dst.needs_rex());
    buf.push(rex);
    buf.push(0xB8 + dst.encoding());
    buf.extend_from_slice(&imm.to_le_bytes());
}

/// `xor r64, r64`.
pub fn xor_rr(buf: &mut Vec<u8>, dst: Gpr, src: Gpr) {
    let rex = 0x48 | (u8::from(src.needs_rex()) << 2) | u8::from(dst.needs_rex());
    buf.push(rex);
    buf.push(0x31);
    buf.push(modrm_direct(src.encoding(), dst.encoding()));
}

/// Materialize an integer constant: `xor` for zero, `mov imm64` otherwise.
pub fn load_const_int(buf: &mut Vec<u8>, dst: Gpr, imm: i64) {
    if imm == 0 {
        xor_rr(buf, dst, dst);
    } else {
        mov_ri64(buf, dst, imm);
    }
}

// ── Stack slot moves ──

/// Sized load from `[rbp + offset]`. 1- and 2-byte loads zero-extend via
/// `movzx`; the 4-byte `mov r32` form zero-extends implicitly.
pub fn load_slot(buf: &mut Vec<u8>, dst: Gpr, offset: i32, size: u64) {
    let rex_w = 0x48 | (u8::from(dst.needs_rex()) << 2);
    match size {
        1 => {
            buf.push(rex_w);
            buf.push(0x0F);
            buf.push(0xB6);
            modrm_rbp(buf, dst.encoding(), offset);
        }
        2 => {
            buf.push(rex_w);
            buf.push(0x0F);
            buf.push(0xB7);
            modrm_rbp(buf, dst.encoding(), offset);
        }
        4 => {
            if dst.needs_rex() {
                buf.push(0x44);
            }
            buf.push(0x8B);
            modrm_rbp(buf, dst.encoding(), offset);
        }
        _ => {
            buf.push(rex_w);
            buf.push(0x8B);
            modrm_rbp(buf, dst.encoding(), offset);
        }
    }
}

/// Sized store to `[rbp + offset]`. The 4-byte form is emitted without
/// REX.W so the write stays 32 bits wide.
pub fn store_slot(buf: &mut Vec<u8>, src: Gpr, offset: i32, size: u64) {
    let r_bit = u8::from(src.needs_rex()) << 2;
    match size {
        1 => {
            // SIL/DIL-class sources are unreachable without a REX prefix.
            if r_bit != 0 || src.byte_form_needs_rex() {
                buf.push(0x40 | r_bit);
            }
            buf.push(0x88);
            modrm_rbp(buf, src.encoding(), offset);
        }
        2 => {
            buf.push(0x66);
            if r_bit != 0 {
                buf.push(0x40 | r_bit);
            }
            buf.push(0x89);
            modrm_rbp(buf, src.encoding(), offset);
        }
        4 => {
            if r_bit != 0 {
                buf.push(0x40 | r_bit);
            }
            buf.push(0x89);
            modrm_rbp(buf, src.encoding(), offset);
        }
        _ => {
            buf.push(0x48 | r_bit);
            buf.push(0x89);
            modrm_rbp(buf, src.encoding(), offset);
        }
    }
}

/// `movss`/`movsd` load from `[rbp + offset]` into an XMM register.
pub fn fp_load_slot(buf: &mut Vec<u8>, dst: Xmm, offset: i32, double: bool) {
    buf.push(if double { 0xF2 } else { 0xF3 });
    buf.push(0x0F);
    buf.push(0x10);
    modrm_rbp(buf, dst.encoding(), offset);
}

/// `movss`/`movsd` store from an XMM register to `[rbp + offset]`.
pub fn fp_store_slot(buf: &mut Vec<u8>, src: Xmm, offset: i32, double: bool) {
    buf.push(if double { 0xF2 } else { 0xF3 });
    buf.push(0x0F);
    buf.push(0x11);
    modrm_rbp(buf, src.encoding(), offset);
}

/// `movd xmm, r32`: move the low 32 bits of a GPR into an XMM register.
pub fn movd_to_xmm(buf: &mut Vec<u8>, dst: Xmm, src: Gpr) {
    buf.push(0x66);
    if src.needs_rex() {
        buf.push(0x41);
    }
    buf.push(0x0F);
    buf.push(0x6E);
    buf.push(modrm_direct(dst.encoding(), src.encoding()));
}

/// `movq xmm, r64`.
pub fn movq_to_xmm(buf: &mut Vec<u8>, dst: Xmm, src: Gpr) {
    buf.push(0x66);
    buf.push(0x48 | u8::from(src.needs_rex()));
    buf.push(0x0F);
    buf.push(0x6E);
    buf.push(modrm_direct(dst.encoding(), src.encoding()));
}

// ── Address computation ──

/// `lea r64, [rip + disp32]` with a zeroed displacement. Returns the buffer
/// offset of the displacement so the caller can record a relocation there.
pub fn lea_rip(buf: &mut Vec<u8>, dst: Gpr) -> usize {
    buf.push(0x48 | (u8::from(dst.needs_rex()) << 2));
    buf.push(0x8D);
    buf.push(0x05 | (dst.encoding() << 3));
    let patch = buf.len();
    buf.extend_from_slice(&[0; 4]);
    patch
}

/// `lea r64, [rbp + disp32]`.
pub fn lea_rbp(buf: &mut Vec<u8>, dst: Gpr, offset: i32) {
    buf.push(0x48 | (u8::from(dst.needs_rex()) << 2));
    buf.push(0x8D);
    modrm_rbp(buf, dst.encoding(), offset);
}

// ── ALU on the RAX/RCX working pair ──

/// `<op> rax, rcx` for the `/r` ALU opcodes (add 01, sub 29, and 21,
/// or 09, xor 31).
pub fn alu_rax_rcx(buf: &mut Vec<u8>, opcode: u8) {
    buf.push(0x48);
    buf.push(opcode);
    buf.push(0xC8);
}

/// `<op> rax, imm` with the ModR/M extension selecting the operation
/// (add /0, or /1, and /4, sub /5, xor /6). Emits the `83 ib` form only
/// for imm8-range values and `81 id` otherwise.
pub fn alu_rax_imm(buf: &mut Vec<u8>, ext: u8, imm: i32) {
    buf.push(0x48);
    if (-128..=127).contains(&imm) {
        buf.push(0x83);
        buf.push(modrm_direct(ext, 0));
        buf.push(imm as u8);
    } else {
        buf.push(0x81);
        buf.push(modrm_direct(ext, 0));
        push_i32(buf, imm);
    }
}

/// `imul rax, rcx`.
pub fn imul_rax_rcx(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&[0x48, 0x0F, 0xAF, 0xC1]);
}

/// `cqo`: sign-extend RAX into RDX:RAX.
pub fn cqo(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&[0x48, 0x99]);
}

/// `idiv rcx`.
pub fn idiv_rcx(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&[0x48, 0xF7, 0xF9]);
}

/// `div rcx`.
pub fn div_rcx(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&[0x48, 0xF7, 0xF1]);
}

/// `xor edx, edx` (zero-extends to RDX).
pub fn xor_edx_edx(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&[0x31, 0xD2]);
}

// ── Shifts on RAX (shl /4, shr /5, sar /7) ──

/// Shift RAX left/right by one (`D1 /ext`).
pub fn shift_rax_one(buf: &mut Vec<u8>, ext: u8) {
    buf.push(0x48);
    buf.push(0xD1);
    buf.push(modrm_direct(ext, 0));
}

/// Shift RAX by an immediate (`C1 /ext ib`).
pub fn shift_rax_imm(buf: &mut Vec<u8>, ext: u8, amount: u8) {
    buf.push(0x48);
    buf.push(0xC1);
    buf.push(modrm_direct(ext, 0));
    buf.push(amount);
}

/// Shift RAX by CL (`D3 /ext`).
pub fn shift_rax_cl(buf: &mut Vec<u8>, ext: u8) {
    buf.push(0x48);
    buf.push(0xD3);
    buf.push(modrm_direct(ext, 0));
}

// ── Compare / select ──

/// `cmp rax, rcx`.
pub fn cmp_rax_rcx(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&[0x48, 0x39, 0xC8]);
}

/// `cmp rax, imm` (`83 /7 ib` or the RAX short form `3D id`).
pub fn cmp_rax_imm(buf: &mut Vec<u8>, imm: i32) {
    if (-128..=127).contains(&imm) {
        buf.extend_from_slice(&[0x48, 0x83, 0xF8, imm as u8]);
    } else {
        buf.extend_from_slice(&[0x48, 0x3D]);
        push_i32(buf, imm);
    }
}

/// `setcc al`.
pub fn setcc_al(buf: &mut Vec<u8>, cc: CondCode) {
    buf.push(0x0F);
    buf.push(cc.setcc_opcode());
    buf.push(0xC0);
}

/// `movzx rax, al`.
pub fn movzx_rax_al(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&[0x48, 0x0F, 0xB6, 0xC0]);
}

/// `test rax, rax`.
pub fn test_rax_rax(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&[0x48, 0x85, 0xC0]);
}

/// `cmovz rcx, rdx`.
pub fn cmovz_rcx_rdx(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&[0x48, 0x0F, 0x44, 0xCA]);
}

/// `ucomiss`/`ucomisd` xmm0, xmm1.
pub fn ucomis_xmm0_xmm1(buf: &mut Vec<u8>, double: bool) {
    if double {
        buf.push(0x66);
    }
    buf.extend_from_slice(&[0x0F, 0x2E, 0xC1]);
}

// ── Control flow ──

/// `jmp rel32` with a zeroed displacement; returns the patch offset.
pub fn jmp_rel32(buf: &mut Vec<u8>) -> usize {
    buf.push(0xE9);
    let patch = buf.len();
    buf.extend_from_slice(&[0; 4]);
    patch
}

/// `jcc rel32` with a zeroed displacement; returns the patch offset.
pub fn jcc_rel32(buf: &mut Vec<u8>, cc: CondCode) -> usize {
    buf.push(0x0F);
    buf.push(cc.jcc_opcode());
    let patch = buf.len();
    buf.extend_from_slice(&[0; 4]);
    patch
}

/// `call rel32` with a zeroed displacement; returns the patch offset.
pub fn call_rel32(buf: &mut Vec<u8>) -> usize {
    buf.push(0xE8);
    let patch = buf.len();
    buf.extend_from_slice(&[0; 4]);
    patch
}

/// Patch a previously emitted rel32 displacement.
pub fn patch_rel32(buf: &mut [u8], patch_offset: usize, rel: i32) {
    buf[patch_offset..patch_offset + 4].copy_from_slice(&rel.to_le_bytes());
}

// ── Stack adjustment ──

/// `push r64`.
pub fn push_reg(buf: &mut Vec<u8>, reg: Gpr) {
    if reg.needs_rex() {
        buf.push(0x41);
    }
    buf.push(0x50 + reg.encoding());
}

/// `sub rsp, imm`.
pub fn sub_rsp(buf: &mut Vec<u8>, imm: i32) {
    if (-128..=127).contains(&imm) {
        buf.extend_from_slice(&[0x48, 0x83, 0xEC, imm as u8]);
    } else {
        buf.extend_from_slice(&[0x48, 0x81, 0xEC]);
        push_i32(buf, imm);
    }
}

/// `add rsp, imm`.
pub fn add_rsp(buf: &mut Vec<u8>, imm: i32) {
    if (-128..=127).contains(&imm) {
        buf.extend_from_slice(&[0x48, 0x83, 0xC4, imm as u8]);
    } else {
        buf.extend_from_slice(&[0x48, 0x81, 0xC4]);
        push_i32(buf, imm);
    }
}

/// Function prologue: `push rbp; mov rbp, rsp; sub rsp, frame`.
pub fn prologue(buf: &mut Vec<u8>, frame_size: i32) {
    buf.push(0x55);
    buf.extend_from_slice(&[0x48, 0x89, 0xE5]);
    if frame_size > 0 {
        sub_rsp(buf, frame_size);
    }
}

/// Function epilogue: `leave; ret`.
pub fn epilogue(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&[0xC9, 0xC3]);
}

// ── Pointer-indirect moves (RAX/RCX working pair) ──

/// Sized load `rax <- [rax]`.
pub fn load_mem_rax(buf: &mut Vec<u8>, size: u64) {
    match size {
        1 => buf.extend_from_slice(&[0x48, 0x0F, 0xB6, 0x00]),
        2 => buf.extend_from_slice(&[0x48, 0x0F, 0xB7, 0x00]),
        4 => buf.extend_from_slice(&[0x8B, 0x00]),
        _ => buf.extend_from_slice(&[0x48, 0x8B, 0x00]),
    }
}

/// Sized store `[rcx] <- rax`.
pub fn store_mem_rcx_rax(buf: &mut Vec<u8>, size: u64) {
    match size {
        1 => buf.extend_from_slice(&[0x88, 0x01]),
        2 => buf.extend_from_slice(&[0x66, 0x89, 0x01]),
        4 => buf.extend_from_slice(&[0x89, 0x01]),
        _ => buf.extend_from_slice(&[0x48, 0x89, 0x01]),
    }
}

/// `add rax, imm`.
pub fn add_rax_imm(buf: &mut Vec<u8>, imm: i32) {
    if (-128..=127).contains(&imm) {
        buf.extend_from_slice(&[0x48, 0x83, 0xC0, imm as u8]);
    } else {
        buf.extend_from_slice(&[0x48, 0x05]);
        push_i32(buf, imm);
    }
}

/// `add rcx, imm`.
pub fn add_rcx_imm(buf: &mut Vec<u8>, imm: i32) {
    if (-128..=127).contains(&imm) {
        buf.extend_from_slice(&[0x48, 0x83, 0xC1, imm as u8]);
    } else {
        buf.extend_from_slice(&[0x48, 0x81, 0xC1]);
        push_i32(buf, imm);
    }
}

/// `add rax, rcx`.
pub fn add_rax_rcx(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&[0x48, 0x01, 0xC8]);
}

/// `imul rcx, rcx, imm` (`6B ib` / `69 id`).
pub fn imul_rcx_imm(buf: &mut Vec<u8>, imm: i32) {
    if (-128..=127).contains(&imm) {
        buf.extend_from_slice(&[0x48, 0x6B, 0xC9, imm as u8]);
    } else {
        buf.extend_from_slice(&[0x48, 0x69, 0xC9]);
        push_i32(buf, imm);
    }
}

// ── Width changes on RAX ──

/// Zero-extend RAX from a narrower source size.
pub fn zext_rax(buf: &mut Vec<u8>, src_size: u64) {
    match src_size {
        1 => buf.extend_from_slice(&[0x48, 0x0F, 0xB6, 0xC0]),
        2 => buf.extend_from_slice(&[0x48, 0x0F, 0xB7, 0xC0]),
        // mov eax, eax zero-extends the upper half.
        4 => buf.extend_from_slice(&[0x89, 0xC0]),
        _ => {}
    }
}

/// Sign-extend RAX from a narrower source size.
pub fn sext_rax(buf: &mut Vec<u8>, src_size: u64) {
    match src_size {
        1 => buf.extend_from_slice(&[0x48, 0x0F, 0xBE, 0xC0]),
        2 => buf.extend_from_slice(&[0x48, 0x0F, 0xBF, 0xC0]),
        4 => buf.extend_from_slice(&[0x48, 0x63, 0xC0]),
        _ => {}
    }
}

// ── SSE arithmetic and conversions (XMM0/XMM1 working pair) ──

/// Scalar SSE arithmetic `xmm0 <- xmm0 op xmm1` (add 58, sub 5C, mul 59,
/// div 5E), single or double precision.
pub fn sse_op_xmm0_xmm1(buf: &mut Vec<u8>, opcode: u8, double: bool) {
    buf.push(if double { 0xF2 } else { 0xF3 });
    buf.push(0x0F);
    buf.push(opcode);
    buf.push(0xC1);
}

/// `cvtss2sd xmm0, xmm0`.
pub fn cvtss2sd_xmm0(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&[0xF3, 0x0F, 0x5A, 0xC0]);
}

/// `cvtsd2ss xmm0, xmm0`.
pub fn cvtsd2ss_xmm0(buf: &mut Vec<u8>) {
    buf.extend_from_slice(&[0xF2, 0x0F, 0x5A, 0xC0]);
}

/// `cvttss2si`/`cvttsd2si rax, xmm0`.
pub fn cvtt_to_rax(buf: &mut Vec<u8>, double: bool) {
    buf.push(if double { 0xF2 } else { 0xF3 });
    buf.extend_from_slice(&[0x48, 0x0F, 0x2C, 0xC0]);
}

/// `cvtsi2ss`/`cvtsi2sd xmm0, rax`.
pub fn cvt_from_rax(buf: &mut Vec<u8>, double: bool) {
    buf.push(if double { 0xF2 } else { 0xF3 });
    buf.extend_from_slice(&[0x48, 0x0F, 0x2A, 0xC0]);
}

// ── Incoming stack arguments ──

/// Load an argument from the caller's frame: `mov eax/rax, [rbp + offset]`.
pub fn load_caller_stack_rax(buf: &mut Vec<u8>, offset: i32, size: u64) {
    if size == 4 {
        buf.push(0x8B);
    } else {
        buf.extend_from_slice(&[0x48, 0x8B]);
    }
    modrm_rbp(buf, 0, offset);
}
