use crate::codebox::{self, Codebox, Direction, IpState};
use crate::jit::{JitConfig, JitEngine};
use crate::stack::{self, Stack, Value};

#[cfg(all(target_arch = "x86_64", unix, not(target_os = "macos")))]
use crate::codebox::EndState;

pub type VmResult<T> = Result<T, VmError>;

#[derive(Clone, Debug, PartialEq)]
pub enum VmError {
    StackUnderflow { row: i64, col: i64 },
    UnknownOpcode { opcode: i64, row: i64, col: i64 },
    UnterminatedString { row: i64, col: i64 },
    Jit(String),
}

impl std::fmt::Display for VmError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmError::StackUnderflow { row, col } => {
                write!(f, "stack underflow at ({row},{col})")
            }
            VmError::UnknownOpcode { opcode, row, col } => {
                write!(f, "unknown opcode {opcode} (0x{opcode:X}) at ({row},{col})")
            }
            VmError::UnterminatedString { row, col } => {
                write!(f, "unterminated string literal at ({row},{col})")
            }
            VmError::Jit(message) => write!(f, "jit error: {message}"),
        }
    }
}

impl std::error::Error for VmError {}

/// The outer driver: compiles and runs one native trace per instruction
/// pointer state where it can, and interprets single instructions where the
/// JIT refuses.
pub struct Vm {
    // Boxed for address stability: compiled blocks bake the codebox pointer
    // into their helper call sequences.
    codebox: Box<Codebox>,
    stack: Stack,
    state: IpState,
    jit: JitEngine,
}

impl Vm {
    pub fn new(codebox: Codebox) -> Vm {
        Vm {
            codebox: Box::new(codebox),
            stack: Stack::new(),
            state: IpState::new(0, 0, Direction::Right),
            jit: JitEngine::default(),
        }
    }

    pub fn codebox(&self) -> &Codebox {
        &self.codebox
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn stack_mut(&mut self) -> &mut Stack {
        &mut self.stack
    }

    pub fn state(&self) -> IpState {
        self.state
    }

    pub fn set_state(&mut self, state: IpState) {
        self.state = state;
    }

    pub fn jit_config(&self) -> &JitConfig {
        self.jit.config()
    }

    pub fn set_jit_config(&mut self, config: JitConfig) {
        self.jit.set_config(config);
    }

    pub fn jit(&self) -> &JitEngine {
        &self.jit
    }

    pub fn dump_jit_info(&self) -> String {
        self.jit.dump_text()
    }

    /// Runs until the program halts via `;` or an error surfaces. Program
    /// output goes through C stdio in both execution engines; it is flushed
    /// before returning.
    pub fn run(&mut self) -> VmResult<()> {
        if self.codebox.is_empty() {
            self.state.direction = Direction::Finished;
            return Ok(());
        }
        let result = self.run_loop();
        stack::flush_host_output();
        result
    }

    fn run_loop(&mut self) -> VmResult<()> {
        loop {
            if self.state.direction == Direction::Finished {
                return Ok(());
            }
            #[cfg(all(target_arch = "x86_64", unix, not(target_os = "macos")))]
            {
                if self.jit.enabled() && self.execute_native()? {
                    continue;
                }
            }
            self.step()?;
        }
    }

    /// Executes the compiled block for the current state if one is (or can
    /// be) built. Returns false when the JIT refused this state and the
    /// interpreter should take over.
    #[cfg(all(target_arch = "x86_64", unix, not(target_os = "macos")))]
    fn execute_native(&mut self) -> VmResult<bool> {
        let (entry, max_stack_change) = match self.jit.block_for(&self.codebox, self.state) {
            Some(block) => (block.entry(), block.max_stack_change()),
            None => return Ok(false),
        };
        self.stack.reserve_cells(max_stack_change);
        let mut end = EndState::unset();
        let status = unsafe { entry(self.stack.raw_ptr(), &mut end) };
        self.jit.note_execution();
        tracing::trace!(
            status,
            row = end.row,
            col = end.col,
            direction = end.direction,
            "native block exit"
        );
        match status {
            0 => {
                self.state = end.to_state().ok_or_else(|| {
                    VmError::Jit(format!(
                        "block returned invalid direction {}",
                        end.direction
                    ))
                })?;
                Ok(true)
            }
            1 => {
                // The end-state names the faulting instruction; adopt it so
                // the VM position matches a pure-interpreter failure.
                if let Some(fault) = end.to_state() {
                    self.state = fault;
                }
                Err(VmError::StackUnderflow {
                    row: end.row,
                    col: end.col,
                })
            }
            other => Err(VmError::Jit(format!("unexpected block status {other}"))),
        }
    }

    fn underflow(&self) -> VmError {
        VmError::StackUnderflow {
            row: self.state.row,
            col: self.state.col,
        }
    }

    fn require(&self, needed: usize) -> VmResult<()> {
        if self.stack.len() < needed {
            return Err(self.underflow());
        }
        Ok(())
    }

    fn pop(&mut self) -> VmResult<Value> {
        let row = self.state.row;
        let col = self.state.col;
        self.stack
            .pop()
            .ok_or(VmError::StackUnderflow { row, col })
    }

    fn binary_numeric(
        &mut self,
        int_op: fn(i64, i64) -> i64,
        float_op: fn(f64, f64) -> f64,
    ) -> VmResult<()> {
        self.require(2)?;
        let x = self.pop()?;
        let y = self.pop()?;
        let value = match (y, x) {
            (Value::Int(a), Value::Int(b)) => Value::Int(int_op(a, b)),
            _ => Value::Float(float_op(y.as_f64(), x.as_f64())),
        };
        self.stack.push(value);
        Ok(())
    }

    fn compare(&mut self, int_op: fn(i64, i64) -> bool, float_op: fn(f64, f64) -> bool) -> VmResult<()> {
        self.require(2)?;
        let x = self.pop()?;
        let y = self.pop()?;
        let truth = match (y, x) {
            (Value::Int(a), Value::Int(b)) => int_op(a, b),
            _ => float_op(y.as_f64(), x.as_f64()),
        };
        self.stack.push(Value::Int(truth as i64));
        Ok(())
    }

    /// Interprets the instruction under the pointer and advances. Matches
    /// the emitted-code semantics opcode for opcode, and additionally
    /// handles standalone `!`, which the JIT always refuses.
    fn step(&mut self) -> VmResult<()> {
        let opcode = self.codebox.get(self.state.row, self.state.col);
        if let Some(direction) = codebox::steer(opcode, self.state.direction) {
            self.state.direction = direction;
            self.codebox.advance(&mut self.state);
            return Ok(());
        }

        let mut extra_skip = false;
        let op = u32::try_from(opcode).ok().and_then(char::from_u32);
        match op {
            Some(' ') => {}
            Some(c @ '0'..='9') => self.stack.push(Value::Int(c as i64 - '0' as i64)),
            Some(c @ 'a'..='f') => self.stack.push(Value::Int(c as i64 - 'a' as i64 + 10)),
            Some('"') | Some('\'') => {
                let row = self.state.row;
                let col = self.state.col;
                let chars = self
                    .codebox
                    .read_string(&mut self.state, opcode)
                    .ok_or(VmError::UnterminatedString { row, col })?;
                for scalar in chars {
                    self.stack.push(Value::Int(scalar));
                }
            }
            Some('+') => self.binary_numeric(|a, b| a.wrapping_add(b), |a, b| a + b)?,
            Some('-') => self.binary_numeric(|a, b| a.wrapping_sub(b), |a, b| a - b)?,
            Some('*') => self.binary_numeric(|a, b| a.wrapping_mul(b), |a, b| a * b)?,
            Some(',') => {
                self.require(2)?;
                let x = self.pop()?;
                let y = self.pop()?;
                let value = match (y, x) {
                    (Value::Int(a), Value::Int(b)) if b != 0 && a.wrapping_rem(b) == 0 => {
                        Value::Int(a.wrapping_div(b))
                    }
                    _ => Value::Float(y.as_f64() / x.as_f64()),
                };
                self.stack.push(value);
            }
            Some('%') => {
                self.require(2)?;
                let x = self.pop()?;
                let y = self.pop()?;
                let value = match (y, x) {
                    (Value::Int(a), Value::Int(b)) if b != 0 => Value::Int(a.wrapping_rem(b)),
                    _ => Value::Float(y.as_f64() % x.as_f64()),
                };
                self.stack.push(value);
            }
            Some('=') => self.compare(|a, b| a == b, |a, b| a == b)?,
            Some('(') => self.compare(|a, b| a < b, |a, b| a < b)?,
            Some(')') => self.compare(|a, b| a > b, |a, b| a > b)?,
            Some(':') => {
                self.require(1)?;
                let value = self.pop()?;
                self.stack.push(value);
                self.stack.push(value);
            }
            Some('$') => {
                self.require(2)?;
                let x = self.pop()?;
                let y = self.pop()?;
                self.stack.push(x);
                self.stack.push(y);
            }
            Some('@') => {
                self.require(3)?;
                let z = self.pop()?;
                let y = self.pop()?;
                let x = self.pop()?;
                self.stack.push(z);
                self.stack.push(x);
                self.stack.push(y);
            }
            Some('~') => {
                self.require(1)?;
                self.pop()?;
            }
            Some('l') => {
                let length = self.stack.len() as i64;
                self.stack.push(Value::Int(length));
            }
            Some('r') => self.stack.reverse(),
            Some('{') => self.stack.shift_left(),
            Some('}') => self.stack.shift_right(),
            Some('&') => {
                if !self.stack.register_swap() {
                    return Err(self.underflow());
                }
            }
            Some('o') => {
                self.require(1)?;
                let value = self.pop()?;
                stack::print_char(value);
            }
            Some('n') => {
                self.require(1)?;
                let value = self.pop()?;
                stack::print_value(value);
            }
            Some('i') => self.stack.push(Value::Int(stack::read_char())),
            Some('g') => {
                self.require(2)?;
                let row = self.pop()?.as_int_trunc();
                let col = self.pop()?.as_int_trunc();
                let value = self.codebox.get(row, col);
                self.stack.push(Value::Int(value));
            }
            Some('p') => {
                self.require(3)?;
                let row = self.pop()?.as_int_trunc();
                let col = self.pop()?.as_int_trunc();
                let value = self.pop()?.as_int_trunc();
                self.codebox.set(row, col, value);
            }
            Some('!') => extra_skip = true,
            Some('?') => {
                self.require(1)?;
                if self.pop()?.is_skip_zero() {
                    extra_skip = true;
                }
            }
            Some('.') => {
                self.require(2)?;
                let row = self.pop()?.as_int_trunc();
                let col = self.pop()?.as_int_trunc();
                self.state.row = row;
                self.state.col = col;
                // Resume executes the landing cell itself; no step here.
                return Ok(());
            }
            Some('x') => {
                self.state.direction = match stack::host_rand() & 3 {
                    0 => Direction::Right,
                    1 => Direction::Down,
                    2 => Direction::Left,
                    _ => Direction::Up,
                };
            }
            Some(';') => {
                self.state.direction = Direction::Finished;
                return Ok(());
            }
            _ => {
                return Err(VmError::UnknownOpcode {
                    opcode,
                    row: self.state.row,
                    col: self.state.col,
                })
            }
        }

        self.codebox.advance(&mut self.state);
        if extra_skip {
            self.codebox.advance(&mut self.state);
        }
        Ok(())
    }
}
