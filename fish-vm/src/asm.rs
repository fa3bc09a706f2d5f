//! Thin macro assembler for the x86-64 trace emitters. Instruction records
//! are appended by typed emission methods and resolved by a two-pass link:
//! offsets first, then rel32 displacements.

use std::collections::HashMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Rax = 0,
    Rcx = 1,
    Rdx = 2,
    Rbx = 3,
    Rsp = 4,
    Rbp = 5,
    Rsi = 6,
    Rdi = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg {
    fn bits(self) -> u8 {
        self as u8
    }

    fn high(self) -> bool {
        self.bits() >= 8
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Xmm {
    Xmm0 = 0,
    Xmm1 = 1,
    Xmm2 = 2,
}

impl Xmm {
    fn bits(self) -> u8 {
        self as u8
    }
}

/// Condition codes by their encoding nibble, shared between `jcc` and
/// `setcc`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Cc {
    B = 0x2,
    Ae = 0x3,
    E = 0x4,
    Ne = 0x5,
    A = 0x7,
    P = 0xA,
    Np = 0xB,
    L = 0xC,
    G = 0xF,
}

impl Cc {
    fn code(self) -> u8 {
        self as u8
    }
}

/// Numeric local labels resolve to the nearest definition in the named
/// direction; redefinition within one trace is legal. Global labels are
/// defined once.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LabelRef {
    Forward(u8),
    Backward(u8),
    Global(&'static str),
}

enum Item {
    Bytes(Vec<u8>),
    Jump { cc: Option<Cc>, target: LabelRef },
    LocalLabel(u8),
    GlobalLabel(&'static str),
}

#[derive(Debug)]
pub enum AsmError {
    BadLocalLabel(u8),
    DuplicateGlobalLabel(&'static str),
    UnresolvedLabel(String),
    DisplacementOverflow,
    Map(String),
}

impl std::fmt::Display for AsmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AsmError::BadLocalLabel(number) => {
                write!(f, "local label {number} is outside 1..=9")
            }
            AsmError::DuplicateGlobalLabel(name) => {
                write!(f, "global label '{name}' defined twice")
            }
            AsmError::UnresolvedLabel(target) => write!(f, "unresolved label {target}"),
            AsmError::DisplacementOverflow => write!(f, "jump displacement exceeds rel32"),
            AsmError::Map(message) => write!(f, "executable mapping failed: {message}"),
        }
    }
}

impl std::error::Error for AsmError {}

const JMP_SIZE: usize = 5;
const JCC_SIZE: usize = 6;

pub struct Asm {
    items: Vec<Item>,
}

impl Default for Asm {
    fn default() -> Self {
        Self::new()
    }
}

impl Asm {
    pub fn new() -> Asm {
        Asm { items: Vec::new() }
    }

    fn raw(&mut self, bytes: &[u8]) {
        if let Some(Item::Bytes(run)) = self.items.last_mut() {
            run.extend_from_slice(bytes);
        } else {
            self.items.push(Item::Bytes(bytes.to_vec()));
        }
    }

    pub fn local_label(&mut self, number: u8) {
        self.items.push(Item::LocalLabel(number));
    }

    pub fn global_label(&mut self, name: &'static str) {
        self.items.push(Item::GlobalLabel(name));
    }

    pub fn jmp(&mut self, target: LabelRef) {
        self.items.push(Item::Jump { cc: None, target });
    }

    pub fn jcc(&mut self, cc: Cc, target: LabelRef) {
        self.items.push(Item::Jump {
            cc: Some(cc),
            target,
        });
    }

    // REX prefix: 0x40 | W<<3 | R<<2 | X<<1 | B. `force` covers byte
    // operations on sil/dil-class registers.
    fn rex(&mut self, w: bool, r: bool, b: bool, force: bool) {
        let mut byte = 0x40u8;
        if w {
            byte |= 0x08;
        }
        if r {
            byte |= 0x04;
        }
        if b {
            byte |= 0x01;
        }
        if byte != 0x40 || force {
            self.raw(&[byte]);
        }
    }

    // ModRM with mod=10 ([base + disp32]); r12-class bases require a SIB
    // byte.
    fn modrm_mem(&mut self, reg_bits: u8, base: Reg, disp: i32) {
        let base_bits = base.bits() & 7;
        if base_bits == 4 {
            self.raw(&[0x80 | ((reg_bits & 7) << 3) | 0x04, 0x24]);
        } else {
            self.raw(&[0x80 | ((reg_bits & 7) << 3) | base_bits]);
        }
        self.raw(&disp.to_le_bytes());
    }

    fn modrm_reg(&mut self, reg_bits: u8, rm: u8) {
        self.raw(&[0xC0 | ((reg_bits & 7) << 3) | (rm & 7)]);
    }

    pub fn push_r(&mut self, reg: Reg) {
        self.rex(false, false, reg.high(), false);
        self.raw(&[0x50 | (reg.bits() & 7)]);
    }

    pub fn pop_r(&mut self, reg: Reg) {
        self.rex(false, false, reg.high(), false);
        self.raw(&[0x58 | (reg.bits() & 7)]);
    }

    pub fn ret(&mut self) {
        self.raw(&[0xC3]);
    }

    pub fn call_r(&mut self, reg: Reg) {
        self.rex(false, false, reg.high(), false);
        self.raw(&[0xFF]);
        self.modrm_reg(2, reg.bits());
    }

    pub fn mov_rr(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.high(), dst.high(), false);
        self.raw(&[0x89]);
        self.modrm_reg(src.bits(), dst.bits());
    }

    pub fn mov_ri64(&mut self, dst: Reg, imm: i64) {
        self.rex(true, false, dst.high(), false);
        self.raw(&[0xB8 | (dst.bits() & 7)]);
        self.raw(&imm.to_le_bytes());
    }

    // 32-bit mov zero-extends, which is all the variadic-count and status
    // loads need.
    pub fn mov_r32_imm(&mut self, dst: Reg, imm: i32) {
        self.rex(false, false, dst.high(), false);
        self.raw(&[0xB8 | (dst.bits() & 7)]);
        self.raw(&imm.to_le_bytes());
    }

    pub fn load(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.high(), base.high(), false);
        self.raw(&[0x8B]);
        self.modrm_mem(dst.bits(), base, disp);
    }

    pub fn store(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex(true, src.high(), base.high(), false);
        self.raw(&[0x89]);
        self.modrm_mem(src.bits(), base, disp);
    }

    pub fn store_imm32(&mut self, base: Reg, disp: i32, imm: i32) {
        self.rex(true, false, base.high(), false);
        self.raw(&[0xC7]);
        self.modrm_mem(0, base, disp);
        self.raw(&imm.to_le_bytes());
    }

    pub fn store_imm8(&mut self, base: Reg, disp: i32, imm: u8) {
        self.rex(false, false, base.high(), false);
        self.raw(&[0xC6]);
        self.modrm_mem(0, base, disp);
        self.raw(&[imm]);
    }

    pub fn store_r8(&mut self, base: Reg, disp: i32, src: Reg) {
        self.rex(false, src.high(), base.high(), src.bits() >= 4 && !src.high());
        self.raw(&[0x88]);
        self.modrm_mem(src.bits(), base, disp);
    }

    pub fn load_u8(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(false, dst.high(), base.high(), false);
        self.raw(&[0x0F, 0xB6]);
        self.modrm_mem(dst.bits(), base, disp);
    }

    pub fn movzx_r64_r8(&mut self, dst: Reg, src: Reg) {
        self.rex(true, dst.high(), src.high(), false);
        self.raw(&[0x0F, 0xB6]);
        self.modrm_reg(dst.bits(), src.bits());
    }

    pub fn add_rr(&mut self, dst: Reg, src: Reg) {
        self.rex(true, src.high(), dst.high(), false);
        self.raw(&[0x01]);
        self.modrm_reg(src.bits(), dst.bits());
    }

    pub fn add_r_mem(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.high(), base.high(), false);
        self.raw(&[0x03]);
        self.modrm_mem(dst.bits(), base, disp);
    }

    pub fn sub_r_mem(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.high(), base.high(), false);
        self.raw(&[0x2B]);
        self.modrm_mem(dst.bits(), base, disp);
    }

    pub fn imul_r_mem(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.rex(true, dst.high(), base.high(), false);
        self.raw(&[0x0F, 0xAF]);
        self.modrm_mem(dst.bits(), base, disp);
    }

    pub fn imul_rri32(&mut self, dst: Reg, src: Reg, imm: i32) {
        self.rex(true, dst.high(), src.high(), false);
        self.raw(&[0x69]);
        self.modrm_reg(dst.bits(), src.bits());
        self.raw(&imm.to_le_bytes());
    }

    pub fn add_ri8(&mut self, reg: Reg, imm: i8) {
        self.rex(true, false, reg.high(), false);
        self.raw(&[0x83]);
        self.modrm_reg(0, reg.bits());
        self.raw(&[imm as u8]);
    }

    pub fn sub_ri8(&mut self, reg: Reg, imm: i8) {
        self.rex(true, false, reg.high(), false);
        self.raw(&[0x83]);
        self.modrm_reg(5, reg.bits());
        self.raw(&[imm as u8]);
    }

    pub fn inc_r(&mut self, reg: Reg) {
        self.rex(true, false, reg.high(), false);
        self.raw(&[0xFF]);
        self.modrm_reg(0, reg.bits());
    }

    pub fn dec_r(&mut self, reg: Reg) {
        self.rex(true, false, reg.high(), false);
        self.raw(&[0xFF]);
        self.modrm_reg(1, reg.bits());
    }

    pub fn cmp_ri8(&mut self, reg: Reg, imm: i8) {
        self.rex(true, false, reg.high(), false);
        self.raw(&[0x83]);
        self.modrm_reg(7, reg.bits());
        self.raw(&[imm as u8]);
    }

    pub fn cmp_r32_imm8(&mut self, reg: Reg, imm: i8) {
        self.rex(false, false, reg.high(), false);
        self.raw(&[0x83]);
        self.modrm_reg(7, reg.bits());
        self.raw(&[imm as u8]);
    }

    pub fn cmp_mem_imm8(&mut self, base: Reg, disp: i32, imm: i8) {
        self.rex(true, false, base.high(), false);
        self.raw(&[0x83]);
        self.modrm_mem(7, base, disp);
        self.raw(&[imm as u8]);
    }

    pub fn cmp_r_mem(&mut self, reg: Reg, base: Reg, disp: i32) {
        self.rex(true, reg.high(), base.high(), false);
        self.raw(&[0x3B]);
        self.modrm_mem(reg.bits(), base, disp);
    }

    pub fn test_rr(&mut self, a: Reg, b: Reg) {
        self.rex(true, b.high(), a.high(), false);
        self.raw(&[0x85]);
        self.modrm_reg(b.bits(), a.bits());
    }

    pub fn mov_rr32(&mut self, dst: Reg, src: Reg) {
        self.rex(false, src.high(), dst.high(), false);
        self.raw(&[0x89]);
        self.modrm_reg(src.bits(), dst.bits());
    }

    pub fn test_rr32(&mut self, a: Reg, b: Reg) {
        self.rex(false, b.high(), a.high(), false);
        self.raw(&[0x85]);
        self.modrm_reg(b.bits(), a.bits());
    }

    pub fn xor_rr32(&mut self, dst: Reg, src: Reg) {
        self.rex(false, src.high(), dst.high(), false);
        self.raw(&[0x31]);
        self.modrm_reg(src.bits(), dst.bits());
    }

    pub fn and_r32_imm8(&mut self, reg: Reg, imm: i8) {
        self.rex(false, false, reg.high(), false);
        self.raw(&[0x83]);
        self.modrm_reg(4, reg.bits());
        self.raw(&[imm as u8]);
    }

    pub fn cqo(&mut self) {
        self.raw(&[0x48, 0x99]);
    }

    pub fn cdqe(&mut self) {
        self.raw(&[0x48, 0x98]);
    }

    pub fn idiv_mem(&mut self, base: Reg, disp: i32) {
        self.rex(true, false, base.high(), false);
        self.raw(&[0xF7]);
        self.modrm_mem(7, base, disp);
    }

    // setcc targets the classic byte registers (al/cl/dl).
    pub fn setcc(&mut self, cc: Cc, reg: Reg) {
        self.raw(&[0x0F, 0x90 | cc.code()]);
        self.modrm_reg(0, reg.bits());
    }

    pub fn and_r8(&mut self, dst: Reg, src: Reg) {
        self.raw(&[0x20]);
        self.modrm_reg(src.bits(), dst.bits());
    }

    pub fn not_r8(&mut self, reg: Reg) {
        self.raw(&[0xF6]);
        self.modrm_reg(2, reg.bits());
    }

    pub fn movsd_x_mem(&mut self, dst: Xmm, base: Reg, disp: i32) {
        self.raw(&[0xF2]);
        self.rex(false, false, base.high(), false);
        self.raw(&[0x0F, 0x10]);
        self.modrm_mem(dst.bits(), base, disp);
    }

    pub fn movsd_mem_x(&mut self, base: Reg, disp: i32, src: Xmm) {
        self.raw(&[0xF2]);
        self.rex(false, false, base.high(), false);
        self.raw(&[0x0F, 0x11]);
        self.modrm_mem(src.bits(), base, disp);
    }

    pub fn addsd(&mut self, dst: Xmm, src: Xmm) {
        self.raw(&[0xF2, 0x0F, 0x58]);
        self.modrm_reg(dst.bits(), src.bits());
    }

    pub fn subsd(&mut self, dst: Xmm, src: Xmm) {
        self.raw(&[0xF2, 0x0F, 0x5C]);
        self.modrm_reg(dst.bits(), src.bits());
    }

    pub fn mulsd(&mut self, dst: Xmm, src: Xmm) {
        self.raw(&[0xF2, 0x0F, 0x59]);
        self.modrm_reg(dst.bits(), src.bits());
    }

    pub fn divsd(&mut self, dst: Xmm, src: Xmm) {
        self.raw(&[0xF2, 0x0F, 0x5E]);
        self.modrm_reg(dst.bits(), src.bits());
    }

    pub fn ucomisd(&mut self, a: Xmm, b: Xmm) {
        self.raw(&[0x66, 0x0F, 0x2E]);
        self.modrm_reg(a.bits(), b.bits());
    }

    pub fn xorpd(&mut self, dst: Xmm, src: Xmm) {
        self.raw(&[0x66, 0x0F, 0x57]);
        self.modrm_reg(dst.bits(), src.bits());
    }

    pub fn cvtsi2sd_x_mem(&mut self, dst: Xmm, base: Reg, disp: i32) {
        self.raw(&[0xF2]);
        self.rex(true, false, base.high(), false);
        self.raw(&[0x0F, 0x2A]);
        self.modrm_mem(dst.bits(), base, disp);
    }

    pub fn cvttsd2si_r_mem(&mut self, dst: Reg, base: Reg, disp: i32) {
        self.raw(&[0xF2]);
        self.rex(true, dst.high(), base.high(), false);
        self.raw(&[0x0F, 0x2C]);
        self.modrm_mem(dst.bits(), base, disp);
    }

    /// First pass assigns offsets, second pass resolves every jump target
    /// and encodes the final byte vector.
    pub fn link(&self) -> Result<Vec<u8>, AsmError> {
        let mut offsets = Vec::with_capacity(self.items.len());
        let mut locals: Vec<(u8, usize, usize)> = Vec::new();
        let mut globals: HashMap<&'static str, usize> = HashMap::new();
        let mut offset = 0usize;
        for (index, item) in self.items.iter().enumerate() {
            offsets.push(offset);
            match item {
                Item::Bytes(run) => offset += run.len(),
                Item::Jump { cc, .. } => {
                    offset += if cc.is_some() { JCC_SIZE } else { JMP_SIZE }
                }
                Item::LocalLabel(number) => {
                    if !(1..=9).contains(number) {
                        return Err(AsmError::BadLocalLabel(*number));
                    }
                    locals.push((*number, index, offset));
                }
                Item::GlobalLabel(name) => {
                    let name = *name;
                    if globals.insert(name, offset).is_some() {
                        return Err(AsmError::DuplicateGlobalLabel(name));
                    }
                }
            }
        }

        let mut out = Vec::with_capacity(offset);
        for (index, item) in self.items.iter().enumerate() {
            match item {
                Item::Bytes(run) => out.extend_from_slice(run),
                Item::Jump { cc, target } => {
                    let size = if cc.is_some() { JCC_SIZE } else { JMP_SIZE };
                    let origin = offsets[index] + size;
                    let dest = resolve(target, index, &locals, &globals)?;
                    let rel = i32::try_from(dest as i64 - origin as i64)
                        .map_err(|_| AsmError::DisplacementOverflow)?;
                    match cc {
                        Some(cc) => out.extend_from_slice(&[0x0F, 0x80 | cc.code()]),
                        None => out.push(0xE9),
                    }
                    out.extend_from_slice(&rel.to_le_bytes());
                }
                Item::LocalLabel(_) | Item::GlobalLabel(_) => {}
            }
        }
        Ok(out)
    }
}

fn resolve(
    target: &LabelRef,
    from_index: usize,
    locals: &[(u8, usize, usize)],
    globals: &HashMap<&'static str, usize>,
) -> Result<usize, AsmError> {
    match target {
        LabelRef::Forward(number) => locals
            .iter()
            .find(|(n, index, _)| n == number && *index > from_index)
            .map(|(_, _, offset)| *offset)
            .ok_or_else(|| AsmError::UnresolvedLabel(format!(">{number}"))),
        LabelRef::Backward(number) => locals
            .iter()
            .rev()
            .find(|(n, index, _)| n == number && *index < from_index)
            .map(|(_, _, offset)| *offset)
            .ok_or_else(|| AsmError::UnresolvedLabel(format!("<{number}"))),
        LabelRef::Global(name) => globals
            .get(name)
            .copied()
            .ok_or_else(|| AsmError::UnresolvedLabel((*name).to_string())),
    }
}

/// One executable mapping per compiled block: anonymous read+write pages,
/// code copied in, then re-protected read+execute.
pub struct ExecutableMemory {
    ptr: *mut u8,
    len: usize,
}

impl ExecutableMemory {
    pub fn map(code: &[u8]) -> Result<ExecutableMemory, AsmError> {
        if code.is_empty() {
            return Err(AsmError::Map(
                "cannot create executable region for empty code".to_string(),
            ));
        }
        let len = code.len();
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(AsmError::Map(format!(
                "mmap failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        let ptr = ptr as *mut u8;
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, len);
        }
        let rc = unsafe {
            libc::mprotect(
                ptr as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if rc != 0 {
            let error = std::io::Error::last_os_error();
            unsafe {
                libc::munmap(ptr as *mut libc::c_void, len);
            }
            return Err(AsmError::Map(format!("mprotect failed: {error}")));
        }
        Ok(ExecutableMemory { ptr, len })
    }

    pub fn ptr(&self) -> *const u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for ExecutableMemory {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}
