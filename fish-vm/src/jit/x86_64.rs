use std::collections::HashSet;
use std::mem::offset_of;

use crate::asm::{Asm, Cc, ExecutableMemory, LabelRef, Reg, Xmm};
use crate::codebox::{self, Codebox, Direction, EndState, IpState};
use crate::jit::{BlockEntry, CompiledBlock, JitError};
use crate::stack::{self, RawStack, CELL_SIZE, TAG_FLOAT, TAG_INT};

// Fixed assignments for the whole trace; all callee-saved so foreign calls
// preserve them. rax carries the block's return value into the epilogue.
const R_STACK: Reg = Reg::Rbx;
const R_TOP: Reg = Reg::R12;
const R_NUM: Reg = Reg::R13;
const R_END: Reg = Reg::R14;
const R_CALL: Reg = Reg::R11;

const CELL: i32 = CELL_SIZE as i32;

// Local label 9 is reserved for the fused-skip merge point; macro-internal
// control flow stays in 1..=8.
const SKIP_LABEL: u8 = 9;
const CHECK_OK: u8 = 8;

const EPILOGUE: &str = "epilogue";

// Opcodes the JIT may emit in-line under a skip predicate: their observable
// effects are identical whether predicated here or interpreted after a
// bailout.
const SIMPLE_OPCODES: &str = "0123456789abcdef+-*,%=():~$@onigp;";

#[derive(Clone, Copy)]
enum BinOp {
    Add,
    Sub,
    Mul,
}

#[derive(Clone, Copy)]
enum CmpOp {
    Eq,
    Lt,
    Gt,
}

fn num_items_disp() -> i32 {
    offset_of!(RawStack, num_items) as i32
}

fn data_disp() -> i32 {
    offset_of!(RawStack, data) as i32
}

fn end_row_disp() -> i32 {
    offset_of!(EndState, row) as i32
}

fn end_col_disp() -> i32 {
    offset_of!(EndState, col) as i32
}

fn end_direction_disp() -> i32 {
    offset_of!(EndState, direction) as i32
}

fn is_simple(opcode: i64) -> bool {
    u32::try_from(opcode)
        .ok()
        .and_then(char::from_u32)
        .is_some_and(|c| SIMPLE_OPCODES.contains(c))
}

fn pushes_one_value(opcode: i64) -> bool {
    u32::try_from(opcode)
        .ok()
        .and_then(char::from_u32)
        .is_some_and(|c| matches!(c, '0'..='9' | 'a'..='f' | ':' | 'l' | 'i' | 'g' | '&'))
}

/// Builds one native block for the straight-line trace starting at `start`.
/// The block runs as many source instructions as the trace covers and exits
/// through a single epilogue with the resume state written into the
/// caller's end-state slot.
pub fn compile(codebox: &Codebox, start: IpState) -> Result<CompiledBlock, JitError> {
    if codebox.is_empty() {
        return Err(JitError::EmptyCodebox);
    }
    if start.direction == Direction::Finished {
        return Err(JitError::FinishedState);
    }
    let mut trace = TraceCompiler {
        codebox,
        asm: Asm::new(),
        state: start,
        seen: HashSet::new(),
        condskip: false,
        addskip: false,
        max_stack_change: 0,
    };
    trace.emit_prologue();
    trace.run()?;
    trace.finish()
}

struct TraceCompiler<'a> {
    codebox: &'a Codebox,
    asm: Asm,
    state: IpState,
    seen: HashSet<IpState>,
    condskip: bool,
    addskip: bool,
    max_stack_change: usize,
}

impl TraceCompiler<'_> {
    fn run(&mut self) -> Result<(), JitError> {
        while self.state.direction != Direction::Finished {
            let opcode = self.codebox.get(self.state.row, self.state.col);
            if self.condskip {
                // The fused instruction executes conditionally, so it must
                // not seed the cycle set.
                self.condskip = false;
                self.addskip = true;
            } else {
                if self.seen.contains(&self.state) {
                    self.emit_state_exit(self.state);
                    break;
                }
                self.seen.insert(self.state);
            }
            self.emit_opcode(opcode)?;
            if pushes_one_value(opcode) {
                self.max_stack_change += 1;
            }
            if self.addskip {
                self.asm.local_label(SKIP_LABEL);
                self.addskip = false;
            }
            self.codebox.advance(&mut self.state);
        }
        Ok(())
    }

    fn finish(mut self) -> Result<CompiledBlock, JitError> {
        self.emit_epilogue();
        let code = self
            .asm
            .link()
            .map_err(|error| JitError::Asm(error.to_string()))?;
        let memory =
            ExecutableMemory::map(&code).map_err(|error| JitError::Map(error.to_string()))?;
        let entry = unsafe { std::mem::transmute::<*const u8, BlockEntry>(memory.ptr()) };
        Ok(CompiledBlock::new(memory, entry, code, self.max_stack_change))
    }

    fn emit_opcode(&mut self, opcode: i64) -> Result<(), JitError> {
        if let Some(direction) = codebox::steer(opcode, self.state.direction) {
            self.state.direction = direction;
            return Ok(());
        }
        let op = u32::try_from(opcode).ok().and_then(char::from_u32);
        match op {
            Some(' ') => {}
            Some(c @ '0'..='9') => self.emit_push_int(c as i64 - '0' as i64),
            Some(c @ 'a'..='f') => self.emit_push_int(c as i64 - 'a' as i64 + 10),
            Some('"') | Some('\'') => self.emit_string(opcode)?,
            Some('+') => self.emit_binary_numeric(BinOp::Add),
            Some('-') => self.emit_binary_numeric(BinOp::Sub),
            Some('*') => self.emit_binary_numeric(BinOp::Mul),
            Some(',') => self.emit_division(),
            Some('%') => self.emit_modulo(),
            Some('=') => self.emit_compare(CmpOp::Eq),
            Some('(') => self.emit_compare(CmpOp::Lt),
            Some(')') => self.emit_compare(CmpOp::Gt),
            Some(':') => self.emit_dup(),
            Some('$') => self.emit_swap(),
            Some('@') => self.emit_rotate(),
            Some('~') => self.emit_drop(),
            Some('l') => self.emit_length(),
            Some('r') => self.emit_stack_helper(stack::fish_reverse_stack as usize),
            Some('{') => self.emit_stack_helper(stack::fish_shift_left as usize),
            Some('}') => self.emit_stack_helper(stack::fish_shift_right as usize),
            Some('&') => self.emit_register_swap(),
            Some('o') => self.emit_print_char(),
            Some('n') => self.emit_print_number(),
            Some('i') => self.emit_input(),
            Some('g') => self.emit_codebox_get(),
            Some('p') => self.emit_codebox_put(),
            Some('?') => self.emit_condskip(),
            Some('.') => self.emit_jump(),
            Some('x') => self.emit_random(),
            Some(';') => self.emit_halt(),
            _ => return Err(JitError::UnknownOpcode(opcode)),
        }
        Ok(())
    }

    fn emit_prologue(&mut self) {
        let a = &mut self.asm;
        a.global_label("_entry");
        a.push_r(Reg::Rbx);
        a.push_r(Reg::R12);
        a.push_r(Reg::R13);
        a.push_r(Reg::R14);
        // Keeps rsp 16-byte aligned at foreign call sites.
        a.sub_ri8(Reg::Rsp, 8);
        a.mov_rr(R_STACK, Reg::Rdi);
        a.mov_rr(R_END, Reg::Rsi);
        a.load(R_NUM, R_STACK, num_items_disp());
        a.load(R_TOP, R_STACK, data_disp());
        a.imul_rri32(Reg::Rax, R_NUM, CELL);
        a.add_rr(R_TOP, Reg::Rax);
    }

    fn emit_epilogue(&mut self) {
        let a = &mut self.asm;
        a.global_label(EPILOGUE);
        a.store(R_STACK, num_items_disp(), R_NUM);
        a.add_ri8(Reg::Rsp, 8);
        a.pop_r(Reg::R14);
        a.pop_r(Reg::R13);
        a.pop_r(Reg::R12);
        a.pop_r(Reg::Rbx);
        a.ret();
    }

    fn emit_write_state(&mut self, state: IpState) {
        let a = &mut self.asm;
        a.store_imm32(R_END, end_row_disp(), state.row as i32);
        a.store_imm32(R_END, end_col_disp(), state.col as i32);
        a.store_imm32(R_END, end_direction_disp(), state.direction.code() as i32);
    }

    // Writes `state` as the resume position and leaves through the epilogue
    // with a zero return.
    fn emit_state_exit(&mut self, state: IpState) {
        self.emit_write_state(state);
        self.asm.xor_rr32(Reg::Rax, Reg::Rax);
        self.asm.jmp(LabelRef::Global(EPILOGUE));
    }

    fn emit_underflow_exit(&mut self) {
        let faulting = self.state;
        self.emit_write_state(faulting);
        self.asm.mov_r32_imm(Reg::Rax, 1);
        self.asm.jmp(LabelRef::Global(EPILOGUE));
    }

    fn emit_underflow_check(&mut self, needed: u8) {
        self.asm.cmp_ri8(R_NUM, needed as i8);
        self.asm.jcc(Cc::Ae, LabelRef::Forward(CHECK_OK));
        self.emit_underflow_exit();
        self.asm.local_label(CHECK_OK);
    }

    fn emit_push_int(&mut self, value: i64) {
        let a = &mut self.asm;
        if let Ok(imm) = i32::try_from(value) {
            a.store_imm32(R_TOP, 0, imm);
        } else {
            a.mov_ri64(Reg::Rax, value);
            a.store(R_TOP, 0, Reg::Rax);
        }
        a.store_imm8(R_TOP, CELL - 1, TAG_INT);
        a.add_ri8(R_TOP, CELL as i8);
        a.inc_r(R_NUM);
    }

    fn emit_string(&mut self, quote: i64) -> Result<(), JitError> {
        let chars = self
            .codebox
            .read_string(&mut self.state, quote)
            .ok_or(JitError::UnterminatedString)?;
        self.max_stack_change += chars.len();
        for &scalar in &chars {
            self.emit_push_int(scalar);
        }
        Ok(())
    }

    // Loads one operand into an xmm register, converting integer payloads.
    // The tag is expected zero-extended in `tag_reg`.
    fn emit_operand_to_xmm(&mut self, dst: Xmm, tag_reg: Reg, payload_disp: i32) {
        let a = &mut self.asm;
        a.cmp_r32_imm8(tag_reg, TAG_INT as i8);
        a.jcc(Cc::Ne, LabelRef::Forward(6));
        a.cvtsi2sd_x_mem(dst, R_TOP, payload_disp);
        a.jmp(LabelRef::Forward(7));
        a.local_label(6);
        a.movsd_x_mem(dst, R_TOP, payload_disp);
        a.local_label(7);
    }

    // Shared header for the two-operand macros: underflow check, then both
    // tags zero-extended (x in rax, y in rcx) with a branch to local 1 when
    // either operand is a float.
    fn emit_binary_header(&mut self, needed: u8) {
        self.emit_underflow_check(needed);
        let a = &mut self.asm;
        a.load_u8(Reg::Rax, R_TOP, -1);
        a.load_u8(Reg::Rcx, R_TOP, -(CELL + 1));
        a.cmp_r32_imm8(Reg::Rax, TAG_INT as i8);
        a.jcc(Cc::Ne, LabelRef::Forward(1));
        a.cmp_r32_imm8(Reg::Rcx, TAG_INT as i8);
        a.jcc(Cc::Ne, LabelRef::Forward(1));
    }

    fn emit_pop_one(&mut self) {
        self.asm.sub_ri8(R_TOP, CELL as i8);
        self.asm.dec_r(R_NUM);
    }

    fn emit_binary_numeric(&mut self, op: BinOp) {
        self.emit_binary_header(2);
        {
            let a = &mut self.asm;
            a.load(Reg::Rdx, R_TOP, -(2 * CELL));
            match op {
                BinOp::Add => a.add_r_mem(Reg::Rdx, R_TOP, -CELL),
                BinOp::Sub => a.sub_r_mem(Reg::Rdx, R_TOP, -CELL),
                BinOp::Mul => a.imul_r_mem(Reg::Rdx, R_TOP, -CELL),
            }
            a.store(R_TOP, -(2 * CELL), Reg::Rdx);
            a.store_imm8(R_TOP, -(CELL + 1), TAG_INT);
            a.jmp(LabelRef::Forward(5));
            a.local_label(1);
        }
        self.emit_operand_to_xmm(Xmm::Xmm0, Reg::Rcx, -(2 * CELL));
        self.emit_operand_to_xmm(Xmm::Xmm1, Reg::Rax, -CELL);
        {
            let a = &mut self.asm;
            match op {
                BinOp::Add => a.addsd(Xmm::Xmm0, Xmm::Xmm1),
                BinOp::Sub => a.subsd(Xmm::Xmm0, Xmm::Xmm1),
                BinOp::Mul => a.mulsd(Xmm::Xmm0, Xmm::Xmm1),
            }
            a.movsd_mem_x(R_TOP, -(2 * CELL), Xmm::Xmm0);
            a.store_imm8(R_TOP, -(CELL + 1), TAG_FLOAT);
            a.local_label(5);
        }
        self.emit_pop_one();
    }

    // `,` keeps an integer result only for exact integer division; a zero
    // divisor or a remainder promotes to the float path, so failure is the
    // host's float division (inf/NaN).
    fn emit_division(&mut self) {
        self.emit_binary_header(2);
        {
            let a = &mut self.asm;
            a.cmp_mem_imm8(R_TOP, -CELL, 0);
            a.jcc(Cc::E, LabelRef::Forward(2));
            a.load(Reg::Rax, R_TOP, -(2 * CELL));
            a.cqo();
            a.idiv_mem(R_TOP, -CELL);
            a.test_rr(Reg::Rdx, Reg::Rdx);
            a.jcc(Cc::Ne, LabelRef::Forward(2));
            a.store(R_TOP, -(2 * CELL), Reg::Rax);
            a.store_imm8(R_TOP, -(CELL + 1), TAG_INT);
            a.jmp(LabelRef::Forward(5));
            a.local_label(2);
            a.cvtsi2sd_x_mem(Xmm::Xmm0, R_TOP, -(2 * CELL));
            a.cvtsi2sd_x_mem(Xmm::Xmm1, R_TOP, -CELL);
            a.jmp(LabelRef::Forward(4));
            a.local_label(1);
        }
        self.emit_operand_to_xmm(Xmm::Xmm0, Reg::Rcx, -(2 * CELL));
        self.emit_operand_to_xmm(Xmm::Xmm1, Reg::Rax, -CELL);
        {
            let a = &mut self.asm;
            a.local_label(4);
            a.divsd(Xmm::Xmm0, Xmm::Xmm1);
            a.movsd_mem_x(R_TOP, -(2 * CELL), Xmm::Xmm0);
            a.store_imm8(R_TOP, -(CELL + 1), TAG_FLOAT);
            a.local_label(5);
        }
        self.emit_pop_one();
    }

    // Integer remainder stays inline; any float operand (or a zero divisor)
    // goes through the fmod helper.
    fn emit_modulo(&mut self) {
        self.emit_binary_header(2);
        {
            let a = &mut self.asm;
            a.cmp_mem_imm8(R_TOP, -CELL, 0);
            a.jcc(Cc::E, LabelRef::Forward(2));
            a.load(Reg::Rax, R_TOP, -(2 * CELL));
            a.cqo();
            a.idiv_mem(R_TOP, -CELL);
            a.store(R_TOP, -(2 * CELL), Reg::Rdx);
            a.store_imm8(R_TOP, -(CELL + 1), TAG_INT);
            a.jmp(LabelRef::Forward(5));
            a.local_label(2);
            a.cvtsi2sd_x_mem(Xmm::Xmm0, R_TOP, -(2 * CELL));
            a.cvtsi2sd_x_mem(Xmm::Xmm1, R_TOP, -CELL);
            a.jmp(LabelRef::Forward(4));
            a.local_label(1);
        }
        self.emit_operand_to_xmm(Xmm::Xmm0, Reg::Rcx, -(2 * CELL));
        self.emit_operand_to_xmm(Xmm::Xmm1, Reg::Rax, -CELL);
        {
            let a = &mut self.asm;
            a.local_label(4);
            a.mov_ri64(R_CALL, stack::fish_fmod as usize as i64);
            a.call_r(R_CALL);
            a.movsd_mem_x(R_TOP, -(2 * CELL), Xmm::Xmm0);
            a.store_imm8(R_TOP, -(CELL + 1), TAG_FLOAT);
            a.local_label(5);
        }
        self.emit_pop_one();
    }

    fn emit_compare(&mut self, op: CmpOp) {
        self.emit_binary_header(2);
        {
            let a = &mut self.asm;
            a.load(Reg::Rdx, R_TOP, -(2 * CELL));
            a.cmp_r_mem(Reg::Rdx, R_TOP, -CELL);
            let cc = match op {
                CmpOp::Eq => Cc::E,
                CmpOp::Lt => Cc::L,
                CmpOp::Gt => Cc::G,
            };
            a.setcc(cc, Reg::Rax);
            a.jmp(LabelRef::Forward(4));
            a.local_label(1);
        }
        self.emit_operand_to_xmm(Xmm::Xmm0, Reg::Rcx, -(2 * CELL));
        self.emit_operand_to_xmm(Xmm::Xmm1, Reg::Rax, -CELL);
        {
            let a = &mut self.asm;
            a.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
            match op {
                CmpOp::Eq => {
                    a.setcc(Cc::E, Reg::Rax);
                    a.setcc(Cc::Np, Reg::Rdx);
                    a.and_r8(Reg::Rax, Reg::Rdx);
                }
                CmpOp::Lt => {
                    a.setcc(Cc::B, Reg::Rax);
                    a.setcc(Cc::P, Reg::Rdx);
                    a.not_r8(Reg::Rdx);
                    a.and_r8(Reg::Rax, Reg::Rdx);
                }
                CmpOp::Gt => {
                    a.setcc(Cc::A, Reg::Rax);
                    a.setcc(Cc::P, Reg::Rdx);
                    a.not_r8(Reg::Rdx);
                    a.and_r8(Reg::Rax, Reg::Rdx);
                }
            }
            a.local_label(4);
            a.movzx_r64_r8(Reg::Rax, Reg::Rax);
            a.store(R_TOP, -(2 * CELL), Reg::Rax);
            a.store_imm8(R_TOP, -(CELL + 1), TAG_INT);
        }
        self.emit_pop_one();
    }

    fn emit_dup(&mut self) {
        self.emit_underflow_check(1);
        let a = &mut self.asm;
        a.load(Reg::Rax, R_TOP, -CELL);
        a.store(R_TOP, 0, Reg::Rax);
        a.load_u8(Reg::Rcx, R_TOP, -1);
        a.store_r8(R_TOP, CELL - 1, Reg::Rcx);
        a.add_ri8(R_TOP, CELL as i8);
        a.inc_r(R_NUM);
    }

    fn emit_swap(&mut self) {
        self.emit_underflow_check(2);
        let a = &mut self.asm;
        a.load(Reg::Rax, R_TOP, -CELL);
        a.load(Reg::Rcx, R_TOP, -(2 * CELL));
        a.store(R_TOP, -CELL, Reg::Rcx);
        a.store(R_TOP, -(2 * CELL), Reg::Rax);
        a.load_u8(Reg::Rdx, R_TOP, -1);
        a.load_u8(Reg::R8, R_TOP, -(CELL + 1));
        a.store_r8(R_TOP, -1, Reg::R8);
        a.store_r8(R_TOP, -(CELL + 1), Reg::Rdx);
    }

    // `@`: with z on top, [x y z] becomes [z x y].
    fn emit_rotate(&mut self) {
        self.emit_underflow_check(3);
        let a = &mut self.asm;
        a.load(Reg::Rax, R_TOP, -(3 * CELL));
        a.load(Reg::Rcx, R_TOP, -(2 * CELL));
        a.load(Reg::Rdx, R_TOP, -CELL);
        a.store(R_TOP, -(3 * CELL), Reg::Rdx);
        a.store(R_TOP, -(2 * CELL), Reg::Rax);
        a.store(R_TOP, -CELL, Reg::Rcx);
        a.load_u8(Reg::R8, R_TOP, -(2 * CELL + 1));
        a.load_u8(Reg::R9, R_TOP, -(CELL + 1));
        a.load_u8(Reg::R10, R_TOP, -1);
        a.store_r8(R_TOP, -(2 * CELL + 1), Reg::R10);
        a.store_r8(R_TOP, -(CELL + 1), Reg::R8);
        a.store_r8(R_TOP, -1, Reg::R9);
    }

    fn emit_drop(&mut self) {
        self.emit_underflow_check(1);
        self.emit_pop_one();
    }

    fn emit_length(&mut self) {
        let a = &mut self.asm;
        a.store(R_TOP, 0, R_NUM);
        a.store_imm8(R_TOP, CELL - 1, TAG_INT);
        a.add_ri8(R_TOP, CELL as i8);
        a.inc_r(R_NUM);
    }

    fn emit_spill(&mut self) {
        self.asm.store(R_STACK, num_items_disp(), R_NUM);
    }

    fn emit_reload(&mut self) {
        let a = &mut self.asm;
        a.load(R_NUM, R_STACK, num_items_disp());
        a.load(R_TOP, R_STACK, data_disp());
        a.imul_rri32(Reg::Rax, R_NUM, CELL);
        a.add_rr(R_TOP, Reg::Rax);
    }

    // Helpers see the live count; the count and top pointer are recomputed
    // afterwards.
    fn emit_stack_helper(&mut self, addr: usize) {
        self.emit_spill();
        let a = &mut self.asm;
        a.mov_rr(Reg::Rdi, R_STACK);
        a.mov_ri64(R_CALL, addr as i64);
        a.call_r(R_CALL);
        self.emit_reload();
    }

    fn emit_codebox_helper(&mut self, addr: usize) {
        self.emit_spill();
        let codebox_addr = self.codebox as *const Codebox as usize;
        let a = &mut self.asm;
        a.mov_ri64(Reg::Rdi, codebox_addr as i64);
        a.mov_rr(Reg::Rsi, R_STACK);
        a.mov_ri64(R_CALL, addr as i64);
        a.call_r(R_CALL);
        self.emit_reload();
    }

    fn emit_register_swap(&mut self) {
        self.emit_spill();
        {
            let a = &mut self.asm;
            a.mov_rr(Reg::Rdi, R_STACK);
            a.mov_ri64(R_CALL, stack::fish_register_swap as usize as i64);
            a.call_r(R_CALL);
            a.mov_rr32(Reg::R10, Reg::Rax);
        }
        self.emit_reload();
        self.asm.test_rr32(Reg::R10, Reg::R10);
        self.asm.jcc(Cc::E, LabelRef::Forward(CHECK_OK));
        self.emit_underflow_exit();
        self.asm.local_label(CHECK_OK);
    }

    fn emit_codebox_get(&mut self) {
        self.emit_underflow_check(2);
        self.emit_codebox_helper(stack::fish_codebox_get as usize);
    }

    fn emit_codebox_put(&mut self) {
        self.emit_underflow_check(3);
        self.emit_codebox_helper(stack::fish_codebox_put as usize);
    }

    // Pops the top cell into `dst` as an integer, truncating float payloads.
    fn emit_pop_number_as_int(&mut self, dst: Reg) {
        let a = &mut self.asm;
        a.load_u8(Reg::Rax, R_TOP, -1);
        a.sub_ri8(R_TOP, CELL as i8);
        a.dec_r(R_NUM);
        a.cmp_r32_imm8(Reg::Rax, TAG_INT as i8);
        a.jcc(Cc::Ne, LabelRef::Forward(6));
        a.load(dst, R_TOP, 0);
        a.jmp(LabelRef::Forward(7));
        a.local_label(6);
        a.cvttsd2si_r_mem(dst, R_TOP, 0);
        a.local_label(7);
    }

    fn emit_print_char(&mut self) {
        self.emit_underflow_check(1);
        self.emit_pop_number_as_int(Reg::Rsi);
        let a = &mut self.asm;
        a.mov_ri64(Reg::Rdi, stack::FMT_CHAR.as_ptr() as i64);
        a.xor_rr32(Reg::Rax, Reg::Rax);
        a.mov_ri64(R_CALL, stack::printf_addr() as i64);
        a.call_r(R_CALL);
    }

    // `n` marshals by runtime tag: "%ld" with no vector args, or "%.16g"
    // with the payload in xmm0 and al = 1 for the variadic convention.
    fn emit_print_number(&mut self) {
        self.emit_underflow_check(1);
        let a = &mut self.asm;
        a.load_u8(Reg::Rax, R_TOP, -1);
        a.sub_ri8(R_TOP, CELL as i8);
        a.dec_r(R_NUM);
        a.cmp_r32_imm8(Reg::Rax, TAG_INT as i8);
        a.jcc(Cc::Ne, LabelRef::Forward(1));
        a.load(Reg::Rsi, R_TOP, 0);
        a.mov_ri64(Reg::Rdi, stack::FMT_INT.as_ptr() as i64);
        a.xor_rr32(Reg::Rax, Reg::Rax);
        a.mov_ri64(R_CALL, stack::printf_addr() as i64);
        a.call_r(R_CALL);
        a.jmp(LabelRef::Forward(2));
        a.local_label(1);
        a.movsd_x_mem(Xmm::Xmm0, R_TOP, 0);
        a.mov_ri64(Reg::Rdi, stack::FMT_FLOAT.as_ptr() as i64);
        a.mov_r32_imm(Reg::Rax, 1);
        a.mov_ri64(R_CALL, stack::printf_addr() as i64);
        a.call_r(R_CALL);
        a.local_label(2);
    }

    fn emit_input(&mut self) {
        let a = &mut self.asm;
        a.mov_ri64(R_CALL, stack::getchar_addr() as i64);
        a.call_r(R_CALL);
        a.cdqe();
        a.store(R_TOP, 0, Reg::Rax);
        a.store_imm8(R_TOP, CELL - 1, TAG_INT);
        a.add_ri8(R_TOP, CELL as i8);
        a.inc_r(R_NUM);
    }

    // `?`: leaves ZF=1 exactly when the popped value was zero, then either
    // fuses with a simple following opcode as a predicated jump to local 9,
    // or bails out with both successor states written on the two paths.
    fn emit_condskip(&mut self) {
        self.emit_underflow_check(1);
        {
            let a = &mut self.asm;
            a.load_u8(Reg::Rax, R_TOP, -1);
            a.sub_ri8(R_TOP, CELL as i8);
            a.dec_r(R_NUM);
            a.cmp_r32_imm8(Reg::Rax, TAG_INT as i8);
            a.jcc(Cc::Ne, LabelRef::Forward(1));
            a.cmp_mem_imm8(R_TOP, 0, 0);
            a.jmp(LabelRef::Forward(2));
            a.local_label(1);
            a.movsd_x_mem(Xmm::Xmm0, R_TOP, 0);
            a.xorpd(Xmm::Xmm1, Xmm::Xmm1);
            a.ucomisd(Xmm::Xmm0, Xmm::Xmm1);
            a.local_label(2);
        }

        // Trailing `!`s are consumed here; parity flips which runtime
        // outcome skips.
        let mut inverted = false;
        loop {
            let next = self.codebox.advanced(self.state);
            if self.codebox.get(next.row, next.col) == '!' as i64 {
                self.state = next;
                inverted = !inverted;
            } else {
                break;
            }
        }

        let target = self.codebox.advanced(self.state);
        let target_opcode = self.codebox.get(target.row, target.col);
        let skip_cc = if inverted { Cc::Ne } else { Cc::E };
        if is_simple(target_opcode) {
            self.condskip = true;
            self.asm.jcc(skip_cc, LabelRef::Forward(SKIP_LABEL));
        } else {
            self.asm.jcc(skip_cc, LabelRef::Forward(3));
            self.emit_state_exit(target);
            self.asm.local_label(3);
            self.emit_state_exit(self.codebox.advanced(target));
            self.state.direction = Direction::Finished;
        }
    }

    // `.`: runtime pop-and-goto. The popped cell becomes the resume
    // position; the interpreter executes it directly.
    fn emit_jump(&mut self) {
        self.emit_underflow_check(2);
        self.emit_pop_number_as_int(Reg::Rsi);
        self.emit_pop_number_as_int(Reg::Rdi);
        let a = &mut self.asm;
        a.store(R_END, end_row_disp(), Reg::Rsi);
        a.store(R_END, end_col_disp(), Reg::Rdi);
        a.store_imm32(
            R_END,
            end_direction_disp(),
            self.state.direction.code() as i32,
        );
        a.xor_rr32(Reg::Rax, Reg::Rax);
        a.jmp(LabelRef::Global(EPILOGUE));
        self.state.direction = Direction::Finished;
    }

    fn successor(&self, direction: Direction) -> IpState {
        let mut next = self.state;
        next.direction = direction;
        self.codebox.advance(&mut next);
        next
    }

    // `x`: two random bits pick one of the four virtually-advanced
    // successor states.
    fn emit_random(&mut self) {
        {
            let a = &mut self.asm;
            a.mov_ri64(R_CALL, stack::rand_addr() as i64);
            a.call_r(R_CALL);
            a.and_r32_imm8(Reg::Rax, 3);
            a.cmp_r32_imm8(Reg::Rax, 0);
            a.jcc(Cc::E, LabelRef::Forward(1));
            a.cmp_r32_imm8(Reg::Rax, 1);
            a.jcc(Cc::E, LabelRef::Forward(2));
            a.cmp_r32_imm8(Reg::Rax, 2);
            a.jcc(Cc::E, LabelRef::Forward(3));
        }
        self.emit_state_exit(self.successor(Direction::Up));
        self.asm.local_label(1);
        self.emit_state_exit(self.successor(Direction::Right));
        self.asm.local_label(2);
        self.emit_state_exit(self.successor(Direction::Down));
        self.asm.local_label(3);
        self.emit_state_exit(self.successor(Direction::Left));
        self.state.direction = Direction::Finished;
    }

    fn emit_halt(&mut self) {
        let halted = IpState::new(self.state.row, self.state.col, Direction::Finished);
        self.emit_write_state(halted);
        self.asm.xor_rr32(Reg::Rax, Reg::Rax);
        self.asm.jmp(LabelRef::Global(EPILOGUE));
        if !self.addskip {
            self.state.direction = Direction::Finished;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::{Stack, Value};

    // The codebox is boxed because the compiled block bakes its address
    // into the `g`/`p` helper call sequences.
    fn run_from(
        program: &str,
        start: IpState,
        stack: &mut Stack,
    ) -> (i32, EndState, CompiledBlock, Box<Codebox>) {
        let codebox = Box::new(Codebox::parse(program));
        let block = compile(&codebox, start).expect("trace should compile");
        stack.reserve_cells(block.max_stack_change());
        let mut end = EndState::unset();
        let status = unsafe { (block.entry())(stack.raw_ptr(), &mut end) };
        (status, end, block, codebox)
    }

    fn run(program: &str, stack: &mut Stack) -> (i32, EndState) {
        let (status, end, _block, _codebox) =
            run_from(program, IpState::new(0, 0, Direction::Right), stack);
        (status, end)
    }

    #[test]
    fn literals_push_tagged_integers_and_halt() {
        let mut stack = Stack::new();
        let (status, end) = run("1a;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(end.direction, Direction::Finished.code());
        assert_eq!(stack.values(), vec![Value::Int(1), Value::Int(10)]);
    }

    #[test]
    fn addition_stays_integer_for_integer_operands() {
        let mut stack = Stack::new();
        let (status, _) = run("12+;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Int(3)]);
    }

    #[test]
    fn arithmetic_promotes_when_an_operand_is_float() {
        let mut stack = Stack::new();
        stack.push(Value::Float(1.5));
        let (status, _) = run("2*;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Float(3.0)]);
    }

    #[test]
    fn subtraction_pops_x_then_y_and_computes_y_minus_x() {
        let mut stack = Stack::new();
        let (status, _) = run("73-;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Int(4)]);
    }

    #[test]
    fn division_is_exact_integer_or_float() {
        let mut stack = Stack::new();
        let (status, _) = run("82,;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Int(4)]);

        let mut stack = Stack::new();
        let (status, _) = run("12,;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Float(0.5)]);
    }

    #[test]
    fn division_by_zero_fails_like_host_float_division() {
        let mut stack = Stack::new();
        let (status, _) = run("10,;", &mut stack);
        assert_eq!(status, 0);
        match stack.values().as_slice() {
            [Value::Float(value)] => assert!(value.is_infinite()),
            other => panic!("expected a float result, got {other:?}"),
        }
    }

    #[test]
    fn modulo_follows_the_integer_contract() {
        let mut stack = Stack::new();
        let (status, _) = run("72%;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Int(1)]);
    }

    #[test]
    fn comparisons_push_integer_flags() {
        let mut stack = Stack::new();
        let (status, _) = run("12(;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Int(1)]);

        let mut stack = Stack::new();
        let (status, _) = run("12);", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Int(0)]);

        let mut stack = Stack::new();
        let (status, _) = run("22=;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Int(1)]);
    }

    #[test]
    fn nan_comparisons_are_false() {
        let mut stack = Stack::new();
        let (status, _) = run("00,1(;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Int(0)]);
    }

    #[test]
    fn stack_shuffles_match_their_semantics() {
        let mut stack = Stack::new();
        let (status, _) = run("1:;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Int(1), Value::Int(1)]);

        let mut stack = Stack::new();
        let (status, _) = run("12$;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Int(2), Value::Int(1)]);

        let mut stack = Stack::new();
        let (status, _) = run("123@;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(
            stack.values(),
            vec![Value::Int(3), Value::Int(1), Value::Int(2)]
        );

        let mut stack = Stack::new();
        let (status, _) = run("12~;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Int(1)]);

        let mut stack = Stack::new();
        let (status, _) = run("ll;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Int(0), Value::Int(1)]);
    }

    #[test]
    fn reverse_and_shifts_run_through_runtime_helpers() {
        let mut stack = Stack::new();
        let (status, _) = run("123r;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(
            stack.values(),
            vec![Value::Int(3), Value::Int(2), Value::Int(1)]
        );

        let mut stack = Stack::new();
        let (status, _) = run("123{;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(
            stack.values(),
            vec![Value::Int(2), Value::Int(3), Value::Int(1)]
        );

        let mut stack = Stack::new();
        let (status, _) = run("123};", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(
            stack.values(),
            vec![Value::Int(3), Value::Int(1), Value::Int(2)]
        );
    }

    #[test]
    fn register_swap_moves_through_the_register() {
        let mut stack = Stack::new();
        let (status, _) = run("5&;", &mut stack);
        assert_eq!(status, 0);
        assert!(stack.is_empty());
        assert_eq!(stack.register(), Some(Value::Int(5)));

        let mut stack = Stack::new();
        let (status, _) = run("5&&;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Int(5)]);
        assert_eq!(stack.register(), None);
    }

    #[test]
    fn register_swap_with_nothing_to_move_underflows() {
        let mut stack = Stack::new();
        let (status, end) = run("&;", &mut stack);
        assert_eq!(status, 1);
        assert_eq!((end.row, end.col), (0, 0));
    }

    #[test]
    fn codebox_get_reads_cells_at_runtime() {
        let mut stack = Stack::new();
        let (status, _) = run("10g;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Int('0' as i64)]);
    }

    #[test]
    fn codebox_put_writes_cells_and_bumps_the_version() {
        let mut stack = Stack::new();
        let (status, _end, _block, codebox) = run_from(
            "a10p;",
            IpState::new(0, 0, Direction::Right),
            &mut stack,
        );
        assert_eq!(status, 0);
        assert!(stack.is_empty());
        assert_eq!(codebox.get(0, 1), 10);
        assert_eq!(codebox.version(), 1);
    }

    #[test]
    fn underflow_reports_the_faulting_position() {
        let mut stack = Stack::new();
        let (status, end) = run("  +;", &mut stack);
        assert_eq!(status, 1);
        assert_eq!((end.row, end.col), (0, 2));
    }

    #[test]
    fn drop_on_empty_stack_underflows() {
        let mut stack = Stack::new();
        let (status, end) = run("~;", &mut stack);
        assert_eq!(status, 1);
        assert_eq!((end.row, end.col), (0, 0));
    }

    #[test]
    fn fused_skip_takes_the_zero_branch() {
        let mut stack = Stack::new();
        let (status, end) = run("0?34;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(end.direction, Direction::Finished.code());
        assert_eq!(stack.values(), vec![Value::Int(4)]);

        let mut stack = Stack::new();
        let (status, _) = run("5?34;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Int(3), Value::Int(4)]);
    }

    #[test]
    fn exclamation_parity_inverts_the_skip() {
        let mut stack = Stack::new();
        let (status, _) = run("0?!34;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Int(3), Value::Int(4)]);

        let mut stack = Stack::new();
        let (status, _) = run("7?!34;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Int(4)]);

        let mut stack = Stack::new();
        let (status, _) = run("0?!!34;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(stack.values(), vec![Value::Int(4)]);
    }

    #[test]
    fn refused_skip_bails_out_with_both_successor_states() {
        let mut stack = Stack::new();
        let (status, end) = run("1?v2;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!((end.row, end.col), (0, 2));
        assert_eq!(end.direction, Direction::Right.code());
        assert!(stack.is_empty());

        let mut stack = Stack::new();
        let (status, end) = run("0?v2;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!((end.row, end.col), (0, 3));
        assert_eq!(end.direction, Direction::Right.code());
    }

    #[test]
    fn fused_skip_over_halt_continues_the_trace() {
        let mut stack = Stack::new();
        let (status, end) = run("1?;2;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(end.direction, Direction::Finished.code());
        assert!(stack.is_empty());

        let mut stack = Stack::new();
        let (status, end) = run("0?;2;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!(end.direction, Direction::Finished.code());
        assert_eq!(stack.values(), vec![Value::Int(2)]);
    }

    #[test]
    fn runtime_jump_writes_the_popped_position() {
        let mut stack = Stack::new();
        let (status, end) = run("12.;", &mut stack);
        assert_eq!(status, 0);
        assert_eq!((end.row, end.col), (2, 1));
        assert_eq!(end.direction, Direction::Right.code());
        assert!(stack.is_empty());
    }

    #[test]
    fn random_direction_exits_with_an_advanced_state() {
        let mut stack = Stack::new();
        let (status, end) = run("x", &mut stack);
        assert_eq!(status, 0);
        // 1x1 grid: every direction wraps back to the origin.
        assert_eq!((end.row, end.col), (0, 0));
        assert!((0..=3).contains(&end.direction));
    }

    #[test]
    fn mirror_cycle_closes_at_the_first_repeated_state() {
        let mut stack = Stack::new();
        let (status, end) = run(">v\n^<", &mut stack);
        assert_eq!(status, 0);
        assert_eq!((end.row, end.col), (0, 1));
        assert_eq!(end.direction, Direction::Right.code());
        assert!(stack.is_empty());
    }

    #[test]
    fn string_literals_push_scalars() {
        let mut stack = Stack::new();
        let (status, _end, block, _codebox) = run_from(
            "\"ab\";",
            IpState::new(0, 0, Direction::Right),
            &mut stack,
        );
        assert_eq!(status, 0);
        assert_eq!(
            stack.values(),
            vec![Value::Int('a' as i64), Value::Int('b' as i64)]
        );
        assert!(block.max_stack_change() >= 2);
    }

    #[test]
    fn max_stack_change_bounds_literal_runs() {
        let codebox = Codebox::parse("12345;");
        let block = compile(&codebox, IpState::new(0, 0, Direction::Right))
            .expect("trace should compile");
        assert!(block.max_stack_change() >= 5);
    }

    #[test]
    fn unknown_opcodes_refuse_the_trace() {
        let codebox = Codebox::parse("1Z;");
        let result = compile(&codebox, IpState::new(0, 0, Direction::Right));
        assert_eq!(result.err(), Some(JitError::UnknownOpcode('Z' as i64)));
    }

    #[test]
    fn standalone_exclamation_is_refused() {
        let codebox = Codebox::parse("!1;");
        let result = compile(&codebox, IpState::new(0, 0, Direction::Right));
        assert_eq!(result.err(), Some(JitError::UnknownOpcode('!' as i64)));
    }

    #[test]
    fn empty_codebox_is_refused() {
        let codebox = Codebox::parse("");
        let result = compile(&codebox, IpState::new(0, 0, Direction::Right));
        assert_eq!(result.err(), Some(JitError::EmptyCodebox));
    }

    #[test]
    fn inline_macros_emit_no_calls() {
        // call r11 encodes as 41 FF D3; the pure stack macros must not
        // contain it.
        let codebox = Codebox::parse("12+:$~=(;");
        let block = compile(&codebox, IpState::new(0, 0, Direction::Right))
            .expect("trace should compile");
        let call_count = block
            .code()
            .windows(3)
            .filter(|window| *window == [0x41, 0xFF, 0xD3])
            .count();
        assert_eq!(call_count, 0, "code bytes: {:02X?}", block.code());
    }
}
