//! Instruction opcodes.
//!
//! The low seven bits of an instruction word select the operation. The upper
//! four of those name the instruction type and fix the operand layout.

/// Operand layout of an instruction.
#[derive(Debug, strum::Display, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstrType {
    /// rd, rs1, rs2
    R,
    /// rd, rs1, imm
    I,
    /// rd, rs1
    F,
    /// rs1, rs2, imm
    S,
    /// dest predicate, rs1, rs2
    B,
    /// rd, imm
    U,
    /// rd, csr
    C,
    /// rd, imm
    J,
    /// predicate, imm
    P,
    /// halt
    H,
}

macro_rules! op_table {
    ($name:ident, $kind:ident { $($op:ident = $bits:literal,)+ }) => {
        #[derive(
            Debug,
            strum::FromRepr,
            strum::EnumIter,
            strum::AsRefStr,
            Clone,
            Copy,
            Hash,
            PartialEq,
            Eq,
            PartialOrd,
            Ord,
        )]
        #[repr(u8)]
        pub enum $name {
            $($op = $bits,)+
        }

        impl $name {
            pub const TYPE: InstrType = InstrType::$kind;

            /// Seven bit encoding.
            #[must_use]
            pub fn bits(self) -> u8 {
                self as u8
            }
        }
    };
}

op_table!(R_Op, R {
    ADD = 0b000_0000,
    SUB = 0b000_0001,
    MUL = 0b000_0010,
    DIV = 0b000_0011,
    AND = 0b000_0100,
    OR = 0b000_0101,
    XOR = 0b000_0110,
    SLT = 0b000_0111,
    SLTU = 0b000_1000,
    ADDF = 0b000_1001,
    SUBF = 0b000_1010,
    MULF = 0b000_1011,
    DIVF = 0b000_1100,
    SLL = 0b000_1101,
    SRL = 0b000_1110,
    SRA = 0b000_1111,
    // comparisons that spill into the second B-type nibble
    SLTF = 0b100_1011,
    SGE = 0b100_1101,
    SGEU = 0b100_1110,
    SGEF = 0b100_1111,
});

op_table!(I_Op, I {
    ADDI = 0b001_0000,
    XORI = 0b001_0100,
    ORI = 0b001_0101,
    SLTI = 0b001_0111,
    SLTIU = 0b001_1000,
    SLLI = 0b001_1101,
    SRAI = 0b001_1111,
    LW = 0b010_0000,
    LH = 0b010_0001,
    LB = 0b010_0010,
    JALR = 0b010_0011,
});

op_table!(F_Op, F {
    ISQRT = 0b010_1000,
    SIN = 0b010_1001,
    COS = 0b010_1010,
    ITOF = 0b010_1011,
    FTOI = 0b010_1100,
    SQRT = 0b010_1101,
});

op_table!(S_Op, S {
    SW = 0b011_0000,
    SH = 0b011_0001,
    SB = 0b011_0010,
});

op_table!(B_Op, B {
    BEQ = 0b100_0000,
    BNE = 0b100_0001,
    BGE = 0b100_0010,
    BGEU = 0b100_0011,
    BLT = 0b100_0100,
    BLTU = 0b100_0101,
});

op_table!(U_Op, U {
    AUIPC = 0b101_0000,
    LLI = 0b101_0001,
    LMI = 0b101_0010,
    LUI = 0b101_0100,
});

op_table!(C_Op, C {
    CSRR = 0b101_1000,
});

op_table!(J_Op, J {
    JAL = 0b110_0000,
});

op_table!(P_Op, P {
    JPNZ = 0b110_1000,
    PRR = 0b110_1100,
    PRW = 0b110_1101,
});

op_table!(H_Op, H {
    HALT = 0b111_1111,
});

/// Execution resource class of an operation.
#[derive(Debug, strum::Display, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum ArchOp {
    ALU_OP,
    INT_MUL_OP,
    INT_DIV_OP,
    FP_OP,
    FP_MUL_OP,
    FP_DIV_OP,
    SQRT_OP,
    TRIG_OP,
    INV_SQRT_OP,
    BRANCH_OP,
    LOAD_OP,
    STORE_OP,
    EXIT_OP,
}

impl ArchOp {
    #[must_use]
    pub fn is_memory(self) -> bool {
        matches!(self, Self::LOAD_OP | Self::STORE_OP)
    }
}

/// A decoded operation.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Op {
    R(R_Op),
    I(I_Op),
    F(F_Op),
    S(S_Op),
    B(B_Op),
    U(U_Op),
    C(C_Op),
    J(J_Op),
    P(P_Op),
    H(H_Op),
    /// Seven bit pattern without a matching operation.
    Undefined(u8),
}

impl Default for Op {
    fn default() -> Self {
        Self::Undefined(0)
    }
}

impl Op {
    /// Decodes the low seven bits of an instruction word.
    #[must_use]
    pub fn decode(bits: u8) -> Self {
        let bits = bits & 0x7F;
        let ty = bits >> 3;
        let decoded = match ty {
            0b0000 | 0b0001 => R_Op::from_repr(bits).map(Self::R),
            0b0010..=0b0100 => I_Op::from_repr(bits).map(Self::I),
            0b0101 => F_Op::from_repr(bits).map(Self::F),
            0b0110 | 0b0111 => S_Op::from_repr(bits).map(Self::S),
            0b1000 | 0b1001 => B_Op::from_repr(bits)
                .map(Self::B)
                .or_else(|| R_Op::from_repr(bits).map(Self::R)),
            0b1010 => U_Op::from_repr(bits).map(Self::U),
            0b1011 => C_Op::from_repr(bits).map(Self::C),
            0b1100 => J_Op::from_repr(bits).map(Self::J),
            0b1101 => P_Op::from_repr(bits).map(Self::P),
            0b1111 => H_Op::from_repr(bits).map(Self::H),
            _ => None,
        };
        decoded.unwrap_or(Self::Undefined(bits))
    }

    /// Seven bit encoding.
    #[must_use]
    pub fn bits(self) -> u8 {
        match self {
            Self::R(op) => op.bits(),
            Self::I(op) => op.bits(),
            Self::F(op) => op.bits(),
            Self::S(op) => op.bits(),
            Self::B(op) => op.bits(),
            Self::U(op) => op.bits(),
            Self::C(op) => op.bits(),
            Self::J(op) => op.bits(),
            Self::P(op) => op.bits(),
            Self::H(op) => op.bits(),
            Self::Undefined(bits) => bits,
        }
    }

    #[must_use]
    pub fn instr_type(self) -> Option<InstrType> {
        match self {
            Self::R(_) => Some(InstrType::R),
            Self::I(_) => Some(InstrType::I),
            Self::F(_) => Some(InstrType::F),
            Self::S(_) => Some(InstrType::S),
            Self::B(_) => Some(InstrType::B),
            Self::U(_) => Some(InstrType::U),
            Self::C(_) => Some(InstrType::C),
            Self::J(_) => Some(InstrType::J),
            Self::P(_) => Some(InstrType::P),
            Self::H(_) => Some(InstrType::H),
            Self::Undefined(_) => None,
        }
    }

    #[must_use]
    pub fn is_defined(self) -> bool {
        !matches!(self, Self::Undefined(_))
    }

    #[must_use]
    pub fn is_halt(self) -> bool {
        matches!(self, Self::H(H_Op::HALT))
    }

    /// Resource class, `None` for undefined operations.
    #[must_use]
    pub fn category(self) -> Option<ArchOp> {
        let category = match self {
            Self::R(op) => match op {
                R_Op::MUL => ArchOp::INT_MUL_OP,
                R_Op::DIV => ArchOp::INT_DIV_OP,
                R_Op::ADDF | R_Op::SUBF | R_Op::SLTF | R_Op::SGEF => ArchOp::FP_OP,
                R_Op::MULF => ArchOp::FP_MUL_OP,
                R_Op::DIVF => ArchOp::FP_DIV_OP,
                _ => ArchOp::ALU_OP,
            },
            Self::I(op) => match op {
                I_Op::LW | I_Op::LH | I_Op::LB => ArchOp::LOAD_OP,
                I_Op::JALR => ArchOp::BRANCH_OP,
                _ => ArchOp::ALU_OP,
            },
            Self::F(op) => match op {
                F_Op::ISQRT => ArchOp::INV_SQRT_OP,
                F_Op::SIN | F_Op::COS => ArchOp::TRIG_OP,
                F_Op::ITOF | F_Op::FTOI => ArchOp::FP_OP,
                F_Op::SQRT => ArchOp::SQRT_OP,
            },
            Self::S(_) => ArchOp::STORE_OP,
            Self::B(_) | Self::J(_) | Self::P(P_Op::JPNZ) => ArchOp::BRANCH_OP,
            Self::U(_) | Self::C(_) | Self::P(_) => ArchOp::ALU_OP,
            Self::H(_) => ArchOp::EXIT_OP,
            Self::Undefined(_) => return None,
        };
        Some(category)
    }

    /// Whether the operation writes `rd`.
    #[must_use]
    pub fn writes_register(self) -> bool {
        match self {
            Self::R(_) | Self::U(_) | Self::C(_) | Self::J(_) => true,
            Self::I(_) | Self::F(_) => true,
            Self::P(op) => op == P_Op::PRR,
            Self::S(_) | Self::B(_) | Self::H(_) | Self::Undefined(_) => false,
        }
    }

    /// Whether the operation writes the predicate slot named by the `rd` field.
    #[must_use]
    pub fn writes_predicate(self) -> bool {
        matches!(self, Self::B(_) | Self::P(P_Op::PRW))
    }

    /// Whether the operation may redirect the program counter.
    #[must_use]
    pub fn is_jump(self) -> bool {
        matches!(
            self,
            Self::I(I_Op::JALR) | Self::J(J_Op::JAL) | Self::P(P_Op::JPNZ)
        )
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::R(op) => write!(f, "{}", op.as_ref()),
            Self::I(op) => write!(f, "{}", op.as_ref()),
            Self::F(op) => write!(f, "{}", op.as_ref()),
            Self::S(op) => write!(f, "{}", op.as_ref()),
            Self::B(op) => write!(f, "{}", op.as_ref()),
            Self::U(op) => write!(f, "{}", op.as_ref()),
            Self::C(op) => write!(f, "{}", op.as_ref()),
            Self::J(op) => write!(f, "{}", op.as_ref()),
            Self::P(op) => write!(f, "{}", op.as_ref()),
            Self::H(op) => write!(f, "{}", op.as_ref()),
            Self::Undefined(bits) => write!(f, "UNDEFINED({bits:#09b})"),
        }
    }
}
