//! Components describing the instruction set.
//!
//! An opcode byte is split into a high nibble (usually a register index or condition code)
//! and a low nibble (usually the addressing mode or the instruction family).
//!
//! This module consists of:
//! - [`Cond`]: The 16 condition codes.
//! - [`Instr`]: An opcode byte decoded into its instruction form (see [`Instr::decode`]).
//! - [`AluOp`], [`UnaryOp`], [`Mode`], [`Operand`], [`Transfer`]: The pieces of an [`Instr`].
//! - [`OPCODE_SIZES`]: The number of operand bytes that follow each opcode.

/// A condition code, selecting a boolean expression over the C, Z, S, and V flags.
///
/// Condition codes are encoded in the high nibble of `JR cc`, `JP cc`, and `IF` operands.
///
/// | code | mnemonic | holds when          |
/// |------|----------|---------------------|
/// | `0`  | `F`      | never               |
/// | `1`  | `LT`     | `S ^ V`             |
/// | `2`  | `LE`     | `Z \| (S ^ V)`      |
/// | `3`  | `ULE`    | `C \| Z`            |
/// | `4`  | `OV`     | `V`                 |
/// | `5`  | `MI`     | `S`                 |
/// | `6`  | `Z`      | `Z`                 |
/// | `7`  | `C`      | `C`                 |
/// | `8`  | (none)   | always              |
/// | `9`  | `GE`     | `!(S ^ V)`          |
/// | `A`  | `GT`     | `!(Z \| (S ^ V))`   |
/// | `B`  | `UGT`    | `!C & !Z`           |
/// | `C`  | `NOV`    | `!V`                |
/// | `D`  | `PL`     | `!S`                |
/// | `E`  | `NZ`     | `!Z`                |
/// | `F`  | `NC`     | `!C`                |
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[allow(missing_docs)]
pub enum Cond {
    Never  = 0x0,
    Lt     = 0x1,
    Le     = 0x2,
    Ule    = 0x3,
    Ov     = 0x4,
    Mi     = 0x5,
    Z      = 0x6,
    C      = 0x7,
    Always = 0x8,
    Ge     = 0x9,
    Gt     = 0xA,
    Ugt    = 0xB,
    Nov    = 0xC,
    Pl     = 0xD,
    Nz     = 0xE,
    Nc     = 0xF,
}
impl Cond {
    /// Creates a condition code from the low 4 bits of the nibble.
    pub const fn from_nibble(nibble: u8) -> Cond {
        match nibble & 0xF {
            0x0 => Cond::Never,
            0x1 => Cond::Lt,
            0x2 => Cond::Le,
            0x3 => Cond::Ule,
            0x4 => Cond::Ov,
            0x5 => Cond::Mi,
            0x6 => Cond::Z,
            0x7 => Cond::C,
            0x8 => Cond::Always,
            0x9 => Cond::Ge,
            0xA => Cond::Gt,
            0xB => Cond::Ugt,
            0xC => Cond::Nov,
            0xD => Cond::Pl,
            0xE => Cond::Nz,
            _   => Cond::Nc,
        }
    }
}
impl std::fmt::Display for Cond {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Cond::Never  => "F",
            Cond::Lt     => "LT",
            Cond::Le     => "LE",
            Cond::Ule    => "ULE",
            Cond::Ov     => "OV",
            Cond::Mi     => "MI",
            Cond::Z      => "Z",
            Cond::C      => "C",
            Cond::Always => "",
            Cond::Ge     => "GE",
            Cond::Gt     => "GT",
            Cond::Ugt    => "UGT",
            Cond::Nov    => "NOV",
            Cond::Pl     => "PL",
            Cond::Nz     => "NZ",
            Cond::Nc     => "NC",
        };
        f.write_str(name)
    }
}

/// Two-operand operations, selected by the high nibble when the low nibble is 2-7.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[allow(missing_docs)]
pub enum AluOp {
    Add, Adc, Sub, Sbc, Or, And, Tcm, Tm, Cp, Xor, Ld
}
impl AluOp {
    /// Gets the operation for a high nibble, if the nibble is in the two-operand group.
    pub const fn from_nibble(nibble: u8) -> Option<AluOp> {
        match nibble {
            0x0 => Some(AluOp::Add),
            0x1 => Some(AluOp::Adc),
            0x2 => Some(AluOp::Sub),
            0x3 => Some(AluOp::Sbc),
            0x4 => Some(AluOp::Or),
            0x5 => Some(AluOp::And),
            0x6 => Some(AluOp::Tcm),
            0x7 => Some(AluOp::Tm),
            0xA => Some(AluOp::Cp),
            0xB => Some(AluOp::Xor),
            0xE => Some(AluOp::Ld),
            _   => None
        }
    }

    /// Whether this operation writes its result back to the destination.
    ///
    /// `TCM`, `TM`, and `CP` only update the flags.
    pub fn writes_back(self) -> bool {
        !matches!(self, AluOp::Tcm | AluOp::Tm | AluOp::Cp)
    }
}

/// The addressing mode of a two-operand instruction, selected by the low nibble.
///
/// `r` is a working register (`0xE0 | n`), `R` is a full register address,
/// `I` is an indirection through a register, `IM` is an immediate byte.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Mode {
    /// `dst r, src r` (low nibble 2). Both registers are packed into one byte.
    WorkWork,
    /// `dst r, src Ir` (low nibble 3).
    WorkIndirect,
    /// `dst R, src R` (low nibble 4). Source byte comes first.
    RegReg,
    /// `dst R, src IR` (low nibble 5). Source byte comes first.
    RegIndirect,
    /// `dst R, src IM` (low nibble 6).
    RegImm,
    /// `dst IR, src IM` (low nibble 7).
    IndirectImm,
}
impl Mode {
    const fn from_nibble(nibble: u8) -> Option<Mode> {
        match nibble {
            0x2 => Some(Mode::WorkWork),
            0x3 => Some(Mode::WorkIndirect),
            0x4 => Some(Mode::RegReg),
            0x5 => Some(Mode::RegIndirect),
            0x6 => Some(Mode::RegImm),
            0x7 => Some(Mode::IndirectImm),
            _   => None
        }
    }

    /// Number of operand bytes this mode consumes.
    pub const fn operand_len(self) -> u8 {
        match self {
            Mode::WorkWork | Mode::WorkIndirect => 1,
            _ => 2
        }
    }
}

/// Single-operand operations, selected by the high nibble when the low nibble is 0 or 1.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
#[allow(missing_docs)]
pub enum UnaryOp {
    Dec, Rlc, Inc, Da, Pop, Com, Push, Decw, Rl, Incw, Clr, Rrc, Sra, Rr, Swap
}
impl UnaryOp {
    /// Gets the operation for a high nibble. Nibble 3 is not a single-operand form.
    pub const fn from_nibble(nibble: u8) -> Option<UnaryOp> {
        match nibble {
            0x0 => Some(UnaryOp::Dec),
            0x1 => Some(UnaryOp::Rlc),
            0x2 => Some(UnaryOp::Inc),
            0x4 => Some(UnaryOp::Da),
            0x5 => Some(UnaryOp::Pop),
            0x6 => Some(UnaryOp::Com),
            0x7 => Some(UnaryOp::Push),
            0x8 => Some(UnaryOp::Decw),
            0x9 => Some(UnaryOp::Rl),
            0xA => Some(UnaryOp::Incw),
            0xB => Some(UnaryOp::Clr),
            0xC => Some(UnaryOp::Rrc),
            0xD => Some(UnaryOp::Sra),
            0xE => Some(UnaryOp::Rr),
            0xF => Some(UnaryOp::Swap),
            _   => None
        }
    }
}

/// Whether a single-operand instruction addresses its register directly or through another register.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Operand {
    /// `R` (low nibble 0). `DECW`/`INCW` treat this as a register pair `RR`.
    Direct,
    /// `IR` (low nibble 1).
    Indirect,
}

/// Direction and auto-increment of the `LDE`/`LDC` memory transfers.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Transfer {
    /// `r <- mem[rr]`
    Load,
    /// `@r <- mem[rr]`, then increment both `r` and `rr`.
    LoadIncr,
    /// `mem[rr] <- r`
    Store,
    /// `mem[rr] <- @r`, then increment both `r` and `rr`.
    StoreIncr,
}
impl Transfer {
    /// Whether the transfer increments its pointers afterwards.
    pub fn increments(self) -> bool {
        matches!(self, Transfer::LoadIncr | Transfer::StoreIncr)
    }
}

/// A decoded opcode byte.
///
/// Operand bytes are not part of the decoded instruction,
/// they are fetched during execution (see [`Instr::operand_len`] for how many).
/// Variants holding a `u8` hold the working register number taken from the high nibble.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub enum Instr {
    /// `LD r, R` (`r8`)
    LoadWorking(u8),
    /// `LD R, r` (`r9`)
    StoreWorking(u8),
    /// `DJNZ r, RA` (`rA`)
    Djnz(u8),
    /// `JR cc, RA` (`cB`)
    Jr(Cond),
    /// `LD r, IM` (`rC`)
    LoadImm(u8),
    /// `JP cc, DA` (`cD`)
    Jp(Cond),
    /// `INC r` (`rE`)
    IncWorking(u8),
    /// `IF cc, t, f` (`1F`), begins a predicated-execution block.
    If,
    /// `STOP` (`6F`), clears the running flag.
    Stop,
    /// `HALT` (`7F`), parks the CPU until an interrupt is serviced.
    Halt,
    /// `DI` (`8F`)
    Di,
    /// `EI` (`9F`)
    Ei,
    /// `RET` (`AF`)
    Ret,
    /// `IRET` (`BF`)
    Iret,
    /// `RCF` (`CF`)
    Rcf,
    /// `SCF` (`DF`)
    Scf,
    /// `CCF` (`EF`)
    Ccf,
    /// `NOP` (`FF`)
    Nop,
    /// A two-operand arithmetic, logic, compare, or load instruction.
    Binary(AluOp, Mode),
    /// `JP @IRR` (`30`)
    JpIndirect,
    /// `SRP #IM` (`31`)
    Srp,
    /// A single-operand instruction.
    Unary(UnaryOp, Operand),
    /// `LDE`/`LDEI` (`82`, `83`, `92`, `93`), transfers with data memory.
    Lde(Transfer),
    /// `LDC`/`LDCI` (`C2`, `C3`, `D2`, `D3`), transfers with program memory.
    Ldc(Transfer),
    /// `LD r, X(r)` (`C7`)
    LoadIndexed,
    /// `LD X(r), r` (`D7`)
    StoreIndexed,
    /// `CALL @IRR` (`D4`)
    CallIndirect,
    /// `CALL DA` (`D6`)
    Call,
    /// `LD Ir, r` (`F3`)
    StoreIndirect,
    /// `LD IR, R` (`F5`)
    StoreIndirectReg,
    /// An opcode with no assigned instruction.
    Undefined(u8),
}

impl Instr {
    /// Decodes an opcode byte.
    ///
    /// ```
    /// use z8_sim::isa::{Instr, AluOp, Mode, Cond};
    ///
    /// assert_eq!(Instr::decode(0x12), Instr::Binary(AluOp::Adc, Mode::WorkWork));
    /// assert_eq!(Instr::decode(0x7D), Instr::Jp(Cond::C));
    /// assert_eq!(Instr::decode(0x1F), Instr::If);
    /// assert_eq!(Instr::decode(0xF2), Instr::Undefined(0xF2));
    /// ```
    pub const fn decode(opcode: u8) -> Instr {
        let hi = opcode >> 4;
        let lo = opcode & 0xF;

        match lo {
            0x8 => return Instr::LoadWorking(hi),
            0x9 => return Instr::StoreWorking(hi),
            0xA => return Instr::Djnz(hi),
            0xB => return Instr::Jr(Cond::from_nibble(hi)),
            0xC => return Instr::LoadImm(hi),
            0xD => return Instr::Jp(Cond::from_nibble(hi)),
            0xE => return Instr::IncWorking(hi),
            0xF => return match hi {
                0x1 => Instr::If,
                0x6 => Instr::Stop,
                0x7 => Instr::Halt,
                0x8 => Instr::Di,
                0x9 => Instr::Ei,
                0xA => Instr::Ret,
                0xB => Instr::Iret,
                0xC => Instr::Rcf,
                0xD => Instr::Scf,
                0xE => Instr::Ccf,
                0xF => Instr::Nop,
                _   => Instr::Undefined(opcode),
            },
            _ => {}
        }

        if let (Some(op), Some(mode)) = (AluOp::from_nibble(hi), Mode::from_nibble(lo)) {
            return Instr::Binary(op, mode);
        }

        match (hi, lo) {
            (0x3, 0x0) => Instr::JpIndirect,
            (0x3, 0x1) => Instr::Srp,
            (_, 0x0 | 0x1) => match UnaryOp::from_nibble(hi) {
                Some(op) if lo == 0 => Instr::Unary(op, Operand::Direct),
                Some(op) => Instr::Unary(op, Operand::Indirect),
                None => Instr::Undefined(opcode),
            },
            (0x8, 0x2) => Instr::Lde(Transfer::Load),
            (0x8, 0x3) => Instr::Lde(Transfer::LoadIncr),
            (0x9, 0x2) => Instr::Lde(Transfer::Store),
            (0x9, 0x3) => Instr::Lde(Transfer::StoreIncr),
            (0xC, 0x2) => Instr::Ldc(Transfer::Load),
            (0xC, 0x3) => Instr::Ldc(Transfer::LoadIncr),
            (0xD, 0x2) => Instr::Ldc(Transfer::Store),
            (0xD, 0x3) => Instr::Ldc(Transfer::StoreIncr),
            (0xC, 0x7) => Instr::LoadIndexed,
            (0xD, 0x7) => Instr::StoreIndexed,
            (0xD, 0x4) => Instr::CallIndirect,
            (0xD, 0x6) => Instr::Call,
            (0xF, 0x3) => Instr::StoreIndirect,
            (0xF, 0x5) => Instr::StoreIndirectReg,
            _ => Instr::Undefined(opcode),
        }
    }

    /// The number of operand bytes fetched by this instruction after its opcode.
    ///
    /// Undefined opcodes execute as no-ops and consume no operands.
    pub const fn operand_len(self) -> u8 {
        match self {
            Instr::LoadWorking(_)
            | Instr::StoreWorking(_)
            | Instr::Djnz(_)
            | Instr::Jr(_)
            | Instr::LoadImm(_) => 1,
            Instr::Jp(_) => 2,
            Instr::IncWorking(_) => 0,
            Instr::If => 1,
            Instr::Stop
            | Instr::Halt
            | Instr::Di
            | Instr::Ei
            | Instr::Ret
            | Instr::Iret
            | Instr::Rcf
            | Instr::Scf
            | Instr::Ccf
            | Instr::Nop => 0,
            Instr::Binary(_, mode) => mode.operand_len(),
            Instr::JpIndirect | Instr::Srp | Instr::Unary(..) => 1,
            Instr::Lde(_) | Instr::Ldc(_) => 1,
            Instr::LoadIndexed | Instr::StoreIndexed => 2,
            Instr::CallIndirect => 1,
            Instr::Call => 2,
            Instr::StoreIndirect => 1,
            Instr::StoreIndirectReg => 2,
            Instr::Undefined(_) => 0,
        }
    }
}

impl std::fmt::Display for Instr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Instr::LoadWorking(r)  => write!(f, "LD r{r}, R"),
            Instr::StoreWorking(r) => write!(f, "LD R, r{r}"),
            Instr::Djnz(r)         => write!(f, "DJNZ r{r}, RA"),
            Instr::Jr(Cond::Always) => f.write_str("JR RA"),
            Instr::Jr(cc)          => write!(f, "JR {cc}, RA"),
            Instr::LoadImm(r)      => write!(f, "LD r{r}, IM"),
            Instr::Jp(Cond::Always) => f.write_str("JP DA"),
            Instr::Jp(cc)          => write!(f, "JP {cc}, DA"),
            Instr::IncWorking(r)   => write!(f, "INC r{r}"),
            Instr::If    => f.write_str("IF"),
            Instr::Stop  => f.write_str("STOP"),
            Instr::Halt  => f.write_str("HALT"),
            Instr::Di    => f.write_str("DI"),
            Instr::Ei    => f.write_str("EI"),
            Instr::Ret   => f.write_str("RET"),
            Instr::Iret  => f.write_str("IRET"),
            Instr::Rcf   => f.write_str("RCF"),
            Instr::Scf   => f.write_str("SCF"),
            Instr::Ccf   => f.write_str("CCF"),
            Instr::Nop   => f.write_str("NOP"),
            Instr::Binary(op, mode) => {
                let op = match op {
                    AluOp::Add => "ADD",
                    AluOp::Adc => "ADC",
                    AluOp::Sub => "SUB",
                    AluOp::Sbc => "SBC",
                    AluOp::Or  => "OR",
                    AluOp::And => "AND",
                    AluOp::Tcm => "TCM",
                    AluOp::Tm  => "TM",
                    AluOp::Cp  => "CP",
                    AluOp::Xor => "XOR",
                    AluOp::Ld  => "LD",
                };
                let operands = match mode {
                    Mode::WorkWork     => "r, r",
                    Mode::WorkIndirect => "r, Ir",
                    Mode::RegReg       => "R, R",
                    Mode::RegIndirect  => "R, IR",
                    Mode::RegImm       => "R, IM",
                    Mode::IndirectImm  => "IR, IM",
                };
                write!(f, "{op} {operands}")
            },
            Instr::JpIndirect => f.write_str("JP @IRR"),
            Instr::Srp => f.write_str("SRP IM"),
            Instr::Unary(op, operand) => {
                let name = match op {
                    UnaryOp::Dec  => "DEC",
                    UnaryOp::Rlc  => "RLC",
                    UnaryOp::Inc  => "INC",
                    UnaryOp::Da   => "DA",
                    UnaryOp::Pop  => "POP",
                    UnaryOp::Com  => "COM",
                    UnaryOp::Push => "PUSH",
                    UnaryOp::Decw => "DECW",
                    UnaryOp::Rl   => "RL",
                    UnaryOp::Incw => "INCW",
                    UnaryOp::Clr  => "CLR",
                    UnaryOp::Rrc  => "RRC",
                    UnaryOp::Sra  => "SRA",
                    UnaryOp::Rr   => "RR",
                    UnaryOp::Swap => "SWAP",
                };
                match (operand, op) {
                    (Operand::Direct, UnaryOp::Decw | UnaryOp::Incw) => write!(f, "{name} RR"),
                    (Operand::Direct, _) => write!(f, "{name} R"),
                    (Operand::Indirect, _) => write!(f, "{name} IR"),
                }
            },
            Instr::Lde(t) | Instr::Ldc(t) => {
                let base = match self {
                    Instr::Lde(_) => "LDE",
                    _ => "LDC",
                };
                match t {
                    Transfer::Load      => write!(f, "{base} r, Irr"),
                    Transfer::LoadIncr  => write!(f, "{base}I Ir, Irr"),
                    Transfer::Store     => write!(f, "{base} Irr, r"),
                    Transfer::StoreIncr => write!(f, "{base}I Irr, Ir"),
                }
            },
            Instr::LoadIndexed      => f.write_str("LD r, X(r)"),
            Instr::StoreIndexed     => f.write_str("LD X(r), r"),
            Instr::CallIndirect     => f.write_str("CALL @IRR"),
            Instr::Call             => f.write_str("CALL DA"),
            Instr::StoreIndirect    => f.write_str("LD Ir, r"),
            Instr::StoreIndirectReg => f.write_str("LD IR, R"),
            Instr::Undefined(op)    => write!(f, ".byte x{op:02X}"),
        }
    }
}

/// The number of operand bytes following each opcode, indexed by `[high nibble][low nibble]`.
///
/// Predicated execution uses this to skip instructions without executing them.
pub const OPCODE_SIZES: [[u8; 16]; 16] = build_opcode_sizes();

const fn build_opcode_sizes() -> [[u8; 16]; 16] {
    let mut table = [[0; 16]; 16];
    let mut hi = 0;
    while hi < 16 {
        let mut lo = 0;
        while lo < 16 {
            table[hi][lo] = Instr::decode(((hi << 4) | lo) as u8).operand_len();
            lo += 1;
        }
        hi += 1;
    }
    table
}

/// Looks up the operand width of an opcode in [`OPCODE_SIZES`].
pub fn opcode_size(opcode: u8) -> u8 {
    OPCODE_SIZES[usize::from(opcode >> 4)][usize::from(opcode & 0xF)]
}
