use std::cell::Cell;

pub type FishNumber = i64;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i64)]
pub enum Direction {
    Right = 0,
    Down = 1,
    Left = 2,
    Up = 3,
    Finished = 4,
}

impl Direction {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Direction> {
        match code {
            0 => Some(Direction::Right),
            1 => Some(Direction::Down),
            2 => Some(Direction::Left),
            3 => Some(Direction::Up),
            4 => Some(Direction::Finished),
            _ => None,
        }
    }

    fn reversed(self) -> Direction {
        match self {
            Direction::Right => Direction::Left,
            Direction::Left => Direction::Right,
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            Direction::Finished => Direction::Finished,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct IpState {
    pub row: i64,
    pub col: i64,
    pub direction: Direction,
}

impl IpState {
    pub fn new(row: i64, col: i64, direction: Direction) -> IpState {
        IpState {
            row,
            col,
            direction,
        }
    }
}

/// Caller-owned slot a compiled block writes on every exit. The layout is
/// fixed because emitted code stores into it with raw qword offsets.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndState {
    pub row: i64,
    pub col: i64,
    pub direction: i64,
}

impl EndState {
    pub fn unset() -> EndState {
        EndState {
            row: 0,
            col: 0,
            direction: -1,
        }
    }

    pub fn to_state(self) -> Option<IpState> {
        let direction = Direction::from_code(self.direction)?;
        Some(IpState::new(self.row, self.col, direction))
    }
}

/// Applies the direction mutators and mirrors. Returns `None` for opcodes
/// that do not steer the instruction pointer.
pub fn steer(opcode: FishNumber, direction: Direction) -> Option<Direction> {
    let steered = match opcode {
        x if x == '>' as i64 => Direction::Right,
        x if x == '<' as i64 => Direction::Left,
        x if x == '^' as i64 => Direction::Up,
        x if x == 'v' as i64 => Direction::Down,
        x if x == '/' as i64 => match direction {
            Direction::Right => Direction::Up,
            Direction::Left => Direction::Down,
            Direction::Up => Direction::Right,
            Direction::Down => Direction::Left,
            Direction::Finished => Direction::Finished,
        },
        x if x == '\\' as i64 => match direction {
            Direction::Right => Direction::Down,
            Direction::Left => Direction::Up,
            Direction::Up => Direction::Left,
            Direction::Down => Direction::Right,
            Direction::Finished => Direction::Finished,
        },
        x if x == '|' as i64 => match direction {
            Direction::Right => Direction::Left,
            Direction::Left => Direction::Right,
            other => other,
        },
        x if x == '_' as i64 => match direction {
            Direction::Up => Direction::Down,
            Direction::Down => Direction::Up,
            other => other,
        },
        x if x == '#' as i64 => direction.reversed(),
        _ => return None,
    };
    Some(steered)
}

/// The two-dimensional character grid that is both program and data. Cells
/// use interior mutability so runtime `p` stores can go through the shared
/// reference baked into compiled blocks.
pub struct Codebox {
    cells: Vec<Cell<FishNumber>>,
    width: usize,
    height: usize,
    version: Cell<u64>,
}

impl Codebox {
    pub fn parse(source: &str) -> Codebox {
        let lines: Vec<Vec<FishNumber>> = source
            .lines()
            .map(|line| line.chars().map(|c| c as i64).collect())
            .collect();
        let width = lines.iter().map(|line| line.len()).max().unwrap_or(0);
        let height = lines.len();
        let mut cells = Vec::with_capacity(width * height);
        for line in &lines {
            for col in 0..width {
                let value = line.get(col).copied().unwrap_or(' ' as i64);
                cells.push(Cell::new(value));
            }
        }
        Codebox {
            cells,
            width,
            height,
            version: Cell::new(0),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn version(&self) -> u64 {
        self.version.get()
    }

    /// Out-of-bounds reads yield 0, like an unwritten cell.
    pub fn get(&self, row: i64, col: i64) -> FishNumber {
        if row < 0 || col < 0 || row >= self.height as i64 || col >= self.width as i64 {
            return 0;
        }
        self.cells[row as usize * self.width + col as usize].get()
    }

    /// Writes inside the grid only; the box does not grow. Every effective
    /// write bumps the version so cached traces can be invalidated.
    pub fn set(&self, row: i64, col: i64, value: FishNumber) {
        if row < 0 || col < 0 || row >= self.height as i64 || col >= self.width as i64 {
            return;
        }
        let cell = &self.cells[row as usize * self.width + col as usize];
        if cell.get() != value {
            cell.set(value);
            self.version.set(self.version.get().wrapping_add(1));
        }
    }

    /// Steps the instruction pointer one cell, wrapping at the grid edge.
    pub fn advance(&self, state: &mut IpState) {
        if self.is_empty() {
            return;
        }
        let width = self.width as i64;
        let height = self.height as i64;
        match state.direction {
            Direction::Right => state.col = (state.col + 1).rem_euclid(width),
            Direction::Left => state.col = (state.col - 1).rem_euclid(width),
            Direction::Down => state.row = (state.row + 1).rem_euclid(height),
            Direction::Up => state.row = (state.row - 1).rem_euclid(height),
            Direction::Finished => {}
        }
    }

    pub fn advanced(&self, state: IpState) -> IpState {
        let mut next = state;
        self.advance(&mut next);
        next
    }

    /// Reads the scalars between the opening quote at `state` and the
    /// matching delimiter, following the current direction with wrapping.
    /// Leaves `state` on the closing quote. `None` if no delimiter is found
    /// within the grid.
    pub fn read_string(
        &self,
        state: &mut IpState,
        quote: FishNumber,
    ) -> Option<Vec<FishNumber>> {
        if self.is_empty() {
            return None;
        }
        let mut out = Vec::new();
        for _ in 0..self.width * self.height {
            self.advance(state);
            let value = self.get(state.row, state.col);
            if value == quote {
                return Some(out);
            }
            out.push(value);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pads_ragged_lines_to_a_rectangle() {
        let codebox = Codebox::parse("ab\ncdef\ng");
        assert_eq!(codebox.width(), 4);
        assert_eq!(codebox.height(), 3);
        assert_eq!(codebox.get(0, 0), 'a' as i64);
        assert_eq!(codebox.get(0, 2), ' ' as i64);
        assert_eq!(codebox.get(1, 3), 'f' as i64);
        assert_eq!(codebox.get(2, 1), ' ' as i64);
    }

    #[test]
    fn out_of_bounds_reads_are_zero_and_writes_are_ignored() {
        let codebox = Codebox::parse("ab");
        assert_eq!(codebox.get(5, 0), 0);
        assert_eq!(codebox.get(0, -1), 0);
        codebox.set(5, 0, 42);
        assert_eq!(codebox.version(), 0);
        codebox.set(0, 0, 'z' as i64);
        assert_eq!(codebox.get(0, 0), 'z' as i64);
        assert_eq!(codebox.version(), 1);
    }

    #[test]
    fn advance_wraps_in_all_four_directions() {
        let codebox = Codebox::parse("abc\ndef");
        let mut state = IpState::new(0, 2, Direction::Right);
        codebox.advance(&mut state);
        assert_eq!((state.row, state.col), (0, 0));

        let mut state = IpState::new(0, 0, Direction::Left);
        codebox.advance(&mut state);
        assert_eq!((state.row, state.col), (0, 2));

        let mut state = IpState::new(1, 1, Direction::Down);
        codebox.advance(&mut state);
        assert_eq!((state.row, state.col), (0, 1));

        let mut state = IpState::new(0, 1, Direction::Up);
        codebox.advance(&mut state);
        assert_eq!((state.row, state.col), (1, 1));
    }

    #[test]
    fn mirrors_follow_the_reflection_tables() {
        assert_eq!(
            steer('/' as i64, Direction::Right),
            Some(Direction::Up)
        );
        assert_eq!(steer('/' as i64, Direction::Down), Some(Direction::Left));
        assert_eq!(
            steer('\\' as i64, Direction::Right),
            Some(Direction::Down)
        );
        assert_eq!(steer('\\' as i64, Direction::Up), Some(Direction::Left));
        assert_eq!(steer('|' as i64, Direction::Right), Some(Direction::Left));
        assert_eq!(steer('|' as i64, Direction::Down), Some(Direction::Down));
        assert_eq!(steer('_' as i64, Direction::Up), Some(Direction::Down));
        assert_eq!(steer('_' as i64, Direction::Left), Some(Direction::Left));
        assert_eq!(steer('#' as i64, Direction::Up), Some(Direction::Down));
        assert_eq!(steer('v' as i64, Direction::Left), Some(Direction::Down));
        assert_eq!(steer('+' as i64, Direction::Left), None);
    }

    #[test]
    fn read_string_collects_until_the_matching_quote() {
        let codebox = Codebox::parse("\"ab\"c");
        let mut state = IpState::new(0, 0, Direction::Right);
        let chars = codebox.read_string(&mut state, '"' as i64);
        assert_eq!(chars, Some(vec!['a' as i64, 'b' as i64]));
        assert_eq!((state.row, state.col), (0, 3));
    }

    #[test]
    fn read_string_wraps_and_closes_on_the_opening_quote() {
        let codebox = Codebox::parse("'ab");
        let mut state = IpState::new(0, 0, Direction::Right);
        let chars = codebox.read_string(&mut state, '\'' as i64);
        assert_eq!(chars, Some(vec!['a' as i64, 'b' as i64]));
        assert_eq!((state.row, state.col), (0, 0));
    }
}
