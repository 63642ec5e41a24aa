//! Instruction decoding: bit-field extraction and the five immediate
//! encodings, per `spec.md` §4.3.

use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unknown opcode {0:#09b}")]
    IllegalOpcode(u32),
    #[error("unknown funct3 {funct3:#05b} for opcode {opcode:?}")]
    IllegalFunct3 { opcode: Opcode, funct3: u32 },
}

/// The seven-bit opcode field, decoded into a tagged enum with an
/// explicit `Illegal` case rather than leaving an unmatched value to
/// fall through a lookup (`spec.md` §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Lui,
    Auipc,
    Jal,
    Jalr,
    Branch,
    Load,
    Store,
    Imm,
    Op,
    Misc,
    System,
}

impl TryFrom<u32> for Opcode {
    type Error = DecodeError;

    fn try_from(bits: u32) -> Result<Self, DecodeError> {
        match bits {
            0x37 => Ok(Opcode::Lui),
            0x17 => Ok(Opcode::Auipc),
            0x6f => Ok(Opcode::Jal),
            0x67 => Ok(Opcode::Jalr),
            0x63 => Ok(Opcode::Branch),
            0x03 => Ok(Opcode::Load),
            0x23 => Ok(Opcode::Store),
            0x13 => Ok(Opcode::Imm),
            0x33 => Ok(Opcode::Op),
            0x0f => Ok(Opcode::Misc),
            0x73 => Ok(Opcode::System),
            other => Err(DecodeError::IllegalOpcode(other)),
        }
    }
}

fn field(instr: u32, hi: u32, lo: u32) -> u32 {
    let width = hi - lo + 1;
    let mask = if width == 32 { u32::MAX } else { (1 << width) - 1 };
    (instr >> lo) & mask
}

/// Sign-extend the low `width` bits of `value` to a full 32-bit
/// two's-complement value.
pub fn sign_extend(value: u32, width: u32) -> u32 {
    let shift = 32 - width;
    (((value << shift) as i32) >> shift) as u32
}

pub fn opcode_bits(instr: u32) -> u32 {
    field(instr, 6, 0)
}

pub fn rd(instr: u32) -> u8 {
    field(instr, 11, 7) as u8
}

pub fn funct3(instr: u32) -> u8 {
    field(instr, 14, 12) as u8
}

pub fn rs1(instr: u32) -> u8 {
    field(instr, 19, 15) as u8
}

pub fn rs2(instr: u32) -> u8 {
    field(instr, 24, 20) as u8
}

pub fn funct7(instr: u32) -> u8 {
    field(instr, 31, 25) as u8
}

/// I-immediate: `inst[31:20]`, sign-extended from 12 bits.
pub fn imm_i(instr: u32) -> u32 {
    sign_extend(field(instr, 31, 20), 12)
}

/// S-immediate: `inst[31:25] ++ inst[11:7]`, sign-extended from 12 bits.
pub fn imm_s(instr: u32) -> u32 {
    let bits = (field(instr, 31, 25) << 5) | field(instr, 11, 7);
    sign_extend(bits, 12)
}

/// B-immediate: `inst[31] inst[7] inst[30:25] inst[11:8] 0`, sign-extended
/// from 13 bits.
pub fn imm_b(instr: u32) -> u32 {
    let bits = (field(instr, 31, 31) << 12)
        | (field(instr, 7, 7) << 11)
        | (field(instr, 30, 25) << 5)
        | (field(instr, 11, 8) << 1);
    sign_extend(bits, 13)
}

/// U-immediate: `inst[31:12] ++ 0x000`. Already a full 32-bit value;
/// sign extension is a no-op but included for uniformity.
pub fn imm_u(instr: u32) -> u32 {
    sign_extend(field(instr, 31, 12) << 12, 32)
}

/// J-immediate: `inst[31] inst[19:12] inst[20] inst[30:21] 0`,
/// sign-extended from 21 bits.
pub fn imm_j(instr: u32) -> u32 {
    let bits = (field(instr, 31, 31) << 20)
        | (field(instr, 19, 12) << 12)
        | (field(instr, 20, 20) << 11)
        | (field(instr, 30, 21) << 1);
    sign_extend(bits, 21)
}

/// The fields and immediates extracted from one instruction word.
/// Computing all five immediates unconditionally, even though most
/// are unused for a given opcode, is acceptable per `spec.md` §4.3 and
/// keeps the data path branch-free.
#[derive(Debug, Clone, Copy)]
pub struct Decoded {
    pub opcode: Opcode,
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    pub funct3: u8,
    pub funct7: u8,
    pub imm_i: u32,
    pub imm_s: u32,
    pub imm_b: u32,
    pub imm_u: u32,
    pub imm_j: u32,
}

impl Decoded {
    pub fn decode(instr: u32) -> Result<Self, DecodeError> {
        let opcode = Opcode::try_from(opcode_bits(instr))?;
        Ok(Self {
            opcode,
            rd: rd(instr),
            rs1: rs1(instr),
            rs2: rs2(instr),
            funct3: funct3(instr),
            funct7: funct7(instr),
            imm_i: imm_i(instr),
            imm_s: imm_s(instr),
            imm_b: imm_b(instr),
            imm_u: imm_u(instr),
            imm_j: imm_j(instr),
        })
    }

    /// `true` iff funct7 selects the "alternate" ALU behaviour (SUB
    /// instead of ADD, or an arithmetic instead of logical right
    /// shift), per `spec.md` §4.4.
    pub fn alt(&self) -> bool {
        let srli_or_srai = self.funct3 == 0b101;
        match self.opcode {
            Opcode::Op => self.funct7 == 0x20,
            Opcode::Imm => self.funct7 == 0x20 && srli_or_srai,
            _ => false,
        }
    }
}
