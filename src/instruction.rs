use crate::error::RuntimeError;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt::{self, Display, Formatter};

/// Arithmetic is performed modulo this value
pub const MODULUS: u32 = 32768;

/// Mask for the 15 usable bits of a word
pub const MASK: u16 = 0x7FFF;

/// First operand word that names a register
pub const REGISTER_BASE: u16 = 32768;

/// Number of general purpose registers
pub const REGISTER_COUNT: usize = 8;

/// The 22 machine operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Halt,
    Set,
    Push,
    Pop,
    Eq,
    Gt,
    Jmp,
    Jt,
    Jf,
    Add,
    Mult,
    Mod,
    And,
    Or,
    Not,
    Rmem,
    Wmem,
    Call,
    Ret,
    Out,
    In,
    Noop,
}

impl Opcode {
    /// All opcodes in numeric order
    pub const ALL: [Opcode; 22] = [
        Opcode::Halt,
        Opcode::Set,
        Opcode::Push,
        Opcode::Pop,
        Opcode::Eq,
        Opcode::Gt,
        Opcode::Jmp,
        Opcode::Jt,
        Opcode::Jf,
        Opcode::Add,
        Opcode::Mult,
        Opcode::Mod,
        Opcode::And,
        Opcode::Or,
        Opcode::Not,
        Opcode::Rmem,
        Opcode::Wmem,
        Opcode::Call,
        Opcode::Ret,
        Opcode::Out,
        Opcode::In,
        Opcode::Noop,
    ];

    /// Look up the opcode for a memory word
    pub fn from_word(word: u16) -> Option<Self> {
        Self::ALL.get(word as usize).copied()
    }

    /// The numeric encoding of this opcode
    pub fn word(self) -> u16 {
        self as u16
    }

    /// Number of operand words following the opcode
    pub fn operand_count(self) -> usize {
        match self {
            Opcode::Halt | Opcode::Ret | Opcode::Noop => 0,
            Opcode::Push | Opcode::Pop | Opcode::Jmp | Opcode::Call | Opcode::Out | Opcode::In => 1,
            Opcode::Set | Opcode::Jt | Opcode::Jf | Opcode::Not | Opcode::Rmem | Opcode::Wmem => 2,
            Opcode::Eq
            | Opcode::Gt
            | Opcode::Add
            | Opcode::Mult
            | Opcode::Mod
            | Opcode::And
            | Opcode::Or => 3,
        }
    }

    /// True when the first operand is a destination register
    pub fn writes_register(self) -> bool {
        matches!(
            self,
            Opcode::Set
                | Opcode::Pop
                | Opcode::Eq
                | Opcode::Gt
                | Opcode::Add
                | Opcode::Mult
                | Opcode::Mod
                | Opcode::And
                | Opcode::Or
                | Opcode::Not
                | Opcode::Rmem
                | Opcode::In
        )
    }

    pub fn mnemonic(self) -> &'static str {
        match self {
            Opcode::Halt => "halt",
            Opcode::Set => "set",
            Opcode::Push => "push",
            Opcode::Pop => "pop",
            Opcode::Eq => "eq",
            Opcode::Gt => "gt",
            Opcode::Jmp => "jmp",
            Opcode::Jt => "jt",
            Opcode::Jf => "jf",
            Opcode::Add => "add",
            Opcode::Mult => "mult",
            Opcode::Mod => "mod",
            Opcode::And => "and",
            Opcode::Or => "or",
            Opcode::Not => "not",
            Opcode::Rmem => "rmem",
            Opcode::Wmem => "wmem",
            Opcode::Call => "call",
            Opcode::Ret => "ret",
            Opcode::Out => "out",
            Opcode::In => "in",
            Opcode::Noop => "noop",
        }
    }

    /// Case-insensitive mnemonic lookup
    pub fn from_mnemonic(name: &str) -> Option<Self> {
        MNEMONICS.get(name.to_ascii_lowercase().as_str()).copied()
    }
}

lazy_static! {
    static ref MNEMONICS: IndexMap<&'static str, Opcode> =
        Opcode::ALL.iter().map(|op| (op.mnemonic(), *op)).collect();
}

impl Display for Opcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:<4}", self.mnemonic().to_ascii_uppercase())
    }
}

/// A decoded operand word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    /// 0..=32767
    Literal(u16),
    /// 32768..=32775, stored as the register index
    Register(u8),
    /// 32776..=65535
    Invalid(u16),
}

impl From<u16> for Operand {
    fn from(value: u16) -> Self {
        match value {
            0..=32767 => Operand::Literal(value),
            32768..=32775 => Operand::Register((value - REGISTER_BASE) as u8),
            _ => Operand::Invalid(value),
        }
    }
}

impl Operand {
    /// The memory word this operand decodes from
    pub fn encode(self) -> u16 {
        match self {
            Operand::Literal(v) | Operand::Invalid(v) => v,
            Operand::Register(r) => REGISTER_BASE + r as u16,
        }
    }

    /// Parse `r3`, `42`, `0x1f` or a quoted character such as `'a'` or `'\n'`
    pub fn parse(token: &str) -> Result<Self, String> {
        let lower = token.to_ascii_lowercase();
        if let Some(index) = lower.strip_prefix('r') {
            let index: u8 = index
                .parse()
                .map_err(|_| format!("Invalid register name: {token}"))?;
            if index as usize >= REGISTER_COUNT {
                return Err(format!("Register out of range: {token}"));
            }
            return Ok(Operand::Register(index));
        }

        let value = if let Some(hex) = lower.strip_prefix("0x") {
            u16::from_str_radix(hex, 16).map_err(|_| format!("Invalid hex literal: {token}"))?
        } else if token.len() >= 3 && token.starts_with('\'') && token.ends_with('\'') {
            parse_char_literal(&token[1..token.len() - 1])?
        } else {
            token
                .parse::<u16>()
                .map_err(|_| format!("Invalid literal: {token}"))?
        };

        if value > MASK {
            return Err(format!("Literal {value} does not fit in 15 bits"));
        }
        Ok(Operand::Literal(value))
    }
}

fn parse_char_literal(body: &str) -> Result<u16, String> {
    let ch = match body {
        "\\n" => '\n',
        "\\t" => '\t',
        "\\\\" => '\\',
        "\\'" => '\'',
        _ => {
            let mut chars = body.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii() => c,
                _ => return Err(format!("Invalid character literal: '{body}'")),
            }
        }
    };
    Ok(ch as u16)
}

impl Display for Operand {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Literal(v) => write!(f, "{v:04x}"),
            Operand::Register(r) => write!(f, "R{r}"),
            Operand::Invalid(v) => write!(f, "E({v})"),
        }
    }
}

/// A decoded instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Address of the opcode word
    pub address: u16,
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
}

impl Instruction {
    /// Decode the instruction starting at `address`
    pub fn decode(memory: &[u16], address: usize) -> Result<Self, RuntimeError> {
        let word = *memory
            .get(address)
            .ok_or(RuntimeError::AddressOutOfRange(address))?;
        let opcode = Opcode::from_word(word).ok_or(RuntimeError::UnknownOpcode {
            address: address as u16,
            word,
        })?;

        let count = opcode.operand_count();
        let end = address + 1 + count;
        if end > memory.len() {
            return Err(RuntimeError::AddressOutOfRange(end - 1));
        }

        let mut operands = Vec::with_capacity(count);
        for raw in &memory[address + 1..end] {
            match Operand::from(*raw) {
                Operand::Invalid(word) => {
                    return Err(RuntimeError::InvalidOperand {
                        address: address as u16,
                        word,
                    })
                }
                operand => operands.push(operand),
            }
        }

        Ok(Instruction {
            address: address as u16,
            opcode,
            operands,
        })
    }

    /// Length in words, opcode included
    pub fn len(&self) -> usize {
        1 + self.operands.len()
    }

    /// The words this instruction occupies in memory
    pub fn encode(&self) -> Vec<u16> {
        let mut words = Vec::with_capacity(self.len());
        words.push(self.opcode.word());
        words.extend(self.operands.iter().map(|op| op.encode()));
        words
    }

    /// Assemble statements such as `set r0 5; out 'A'` into memory words.
    ///
    /// Statements are separated by `;` or newlines and `#` starts a comment.
    /// `name:` defines a label usable as a literal operand, and `data` emits
    /// raw words.
    pub fn assemble(text: &str) -> Result<Vec<u16>, String> {
        Self::assemble_at(text, 0)
    }

    /// Like [`assemble`](Self::assemble), with labels relative to `origin`
    pub fn assemble_at(text: &str, origin: u16) -> Result<Vec<u16>, String> {
        let mut statements: Vec<Vec<String>> = Vec::new();
        let mut labels: HashMap<String, u16> = HashMap::new();
        let mut offset = origin as usize;

        for line in text.lines() {
            for statement in split_statements(line) {
                let mut tokens = tokenize(statement)?;
                while let Some(label) = tokens.first().and_then(|t| t.strip_suffix(':')) {
                    if offset > MASK as usize {
                        return Err(format!("Label {label} is outside of memory"));
                    }
                    if labels.insert(label.to_string(), offset as u16).is_some() {
                        return Err(format!("Duplicate label: {label}"));
                    }
                    tokens.remove(0);
                }
                let Some(name) = tokens.first() else {
                    continue;
                };
                if name.eq_ignore_ascii_case("data") {
                    offset += tokens.len() - 1;
                } else {
                    let opcode = Opcode::from_mnemonic(name)
                        .ok_or_else(|| format!("Unknown mnemonic: {name}"))?;
                    offset += 1 + opcode.operand_count();
                }
                statements.push(tokens);
            }
        }

        let resolve = |arg: &str| -> Result<Operand, String> {
            match labels.get(arg) {
                Some(&address) => Ok(Operand::Literal(address)),
                None => Operand::parse(arg),
            }
        };

        let mut words = Vec::with_capacity(offset - origin as usize);
        for tokens in &statements {
            let (name, args) = tokens
                .split_first()
                .ok_or_else(|| "Empty statement".to_string())?;
            if name.eq_ignore_ascii_case("data") {
                for arg in args {
                    words.push(resolve(arg)?.encode());
                }
                continue;
            }

            let opcode = Opcode::from_mnemonic(name)
                .ok_or_else(|| format!("Unknown mnemonic: {name}"))?;
            if args.len() != opcode.operand_count() {
                return Err(format!(
                    "{} takes {} operands, got {}",
                    opcode.mnemonic(),
                    opcode.operand_count(),
                    args.len()
                ));
            }
            words.push(opcode.word());
            for (index, arg) in args.iter().enumerate() {
                let operand = resolve(arg)?;
                if index == 0 && opcode.writes_register() && !matches!(operand, Operand::Register(_))
                {
                    return Err(format!(
                        "{} needs a register destination, got {arg}",
                        opcode.mnemonic()
                    ));
                }
                words.push(operand.encode());
            }
        }
        Ok(words)
    }
}

/// Split on `;` outside of character literals
/// Split a line at `;`, dropping a trailing `#` comment. Both are literal
/// inside quoted characters.
fn split_statements(line: &str) -> Vec<&str> {
    let mut statements = Vec::new();
    let mut start = 0;
    let mut end = line.len();
    let mut in_quote = false;
    let mut escaped = false;
    for (i, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quote => escaped = true,
            '\'' => in_quote = !in_quote,
            ';' if !in_quote => {
                statements.push(&line[start..i]);
                start = i + 1;
            }
            '#' if !in_quote => {
                end = i;
                break;
            }
            _ => {}
        }
    }
    statements.push(&line[start..end]);
    statements
}

fn tokenize(statement: &str) -> Result<Vec<String>, String> {
    let mut tokens = Vec::new();
    let mut chars = statement.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() || c == ',' {
            chars.next();
            continue;
        }
        let mut token = String::new();
        if c == '\'' {
            token.push(chars.next().unwrap_or('\''));
            let mut closed = false;
            while let Some(c) = chars.next() {
                token.push(c);
                if c == '\\' {
                    if let Some(escaped) = chars.next() {
                        token.push(escaped);
                    }
                } else if c == '\'' {
                    closed = true;
                    break;
                }
            }
            if !closed {
                return Err(format!("Unterminated character literal in: {statement}"));
            }
        } else {
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() || c == ',' {
                    break;
                }
                token.push(c);
                chars.next();
            }
        }
        tokens.push(token);
    }
    Ok(tokens)
}

impl Display for Instruction {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.opcode)?;
        for operand in &self.operands {
            write!(f, " {operand}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn test_opcode_table() {
        for (i, op) in Opcode::ALL.iter().enumerate() {
            assert_eq!(op.word() as usize, i);
            assert_eq!(Opcode::from_word(i as u16), Some(*op));
        }
        assert_eq!(Opcode::from_word(22), None);
        assert_eq!(Opcode::Add.operand_count(), 3);
        assert_eq!(Opcode::Ret.operand_count(), 0);
        assert_eq!(Opcode::from_mnemonic("MULT"), Some(Opcode::Mult));
        assert_eq!(Opcode::from_mnemonic("xor"), None);
    }

    #[test]
    fn test_operand_ranges() {
        assert_eq!(Operand::from(32767), Operand::Literal(32767));
        assert_eq!(Operand::from(32768), Operand::Register(0));
        assert_eq!(Operand::from(32775), Operand::Register(7));
        assert_eq!(Operand::from(32776), Operand::Invalid(32776));
        assert_eq!(Operand::Register(3).encode(), 32771);
    }

    #[test]
    fn test_decode_add() {
        let memory = [9, 32768, 32769, 4, 19, 32768];
        let inst = Instruction::decode(&memory, 0).unwrap();
        assert_eq!(inst.opcode, Opcode::Add);
        assert_eq!(
            inst.operands,
            vec![Operand::Register(0), Operand::Register(1), Operand::Literal(4)]
        );
        assert_eq!(inst.len(), 4);
        assert_eq!(inst.to_string(), "ADD  R0 R1 0004");
        assert_eq!(inst.encode(), memory[..4].to_vec());
    }

    #[test]
    fn test_decode_errors() {
        assert_eq!(
            Instruction::decode(&[99], 0),
            Err(RuntimeError::UnknownOpcode { address: 0, word: 99 })
        );
        assert_eq!(
            Instruction::decode(&[2, 40000], 0),
            Err(RuntimeError::InvalidOperand { address: 0, word: 40000 })
        );
        // Operands run past the end of memory
        assert_eq!(
            Instruction::decode(&[9, 32768], 0),
            Err(RuntimeError::AddressOutOfRange(3))
        );
        assert_eq!(
            Instruction::decode(&[], 5),
            Err(RuntimeError::AddressOutOfRange(5))
        );
    }

    #[test]
    fn test_assemble() {
        let words = Instruction::assemble("set r0 0x10; out 'A'\nout '\\n' # newline\nhalt").unwrap();
        assert_eq!(words, vec![1, 32768, 16, 19, 65, 19, 10, 0]);

        let words = Instruction::assemble("out ' '; out ';'").unwrap();
        assert_eq!(words, vec![19, 32, 19, 59]);

        let words = Instruction::assemble("out '#'; out '\\'' # quote; out 'x'").unwrap();
        assert_eq!(words, vec![19, 35, 19, 39]);
    }

    #[test]
    fn test_assemble_labels() {
        let words = Instruction::assemble(
            "start: jmp end\n\
             msg: data 2 'o' 'k'\n\
             end: set r0 msg; jmp start",
        )
        .unwrap();
        assert_eq!(words, vec![6, 5, 2, 111, 107, 1, 32768, 2, 6, 0]);

        let words = Instruction::assemble_at("here: jmp here", 0x100).unwrap();
        assert_eq!(words, vec![6, 0x100]);

        assert!(Instruction::assemble("a: noop; a: noop").is_err());
    }

    #[test]
    fn test_assemble_errors() {
        assert!(Instruction::assemble("frob r0").is_err());
        assert!(Instruction::assemble("add r0 1").is_err());
        assert!(Instruction::assemble("set 5 5").is_err());
        assert!(Instruction::assemble("push 40000").is_err());
        assert!(Instruction::assemble("push r8").is_err());
        assert!(Instruction::assemble("out 'ab'").is_err());
    }
}
