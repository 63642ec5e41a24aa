//! The fetch-decode-execute-writeback loop, per `spec.md` §4.5.

use thiserror::Error;

use crate::alu::{alu, ArithOp, BranchCond};
use crate::decode::{DecodeError, Decoded, Opcode};
use crate::memory::{Memory, MemoryError};
use crate::register_file::{RegisterError, RegisterFile, PC};
use crate::syscall::{self, HostState, SyscallArgs, SyscallOutcome, UnimplementedSyscall};

/// Every way a hart can stop running. Some are ordinary guest-visible
/// exits; the rest are conditions the emulator itself cannot recover
/// from and hands back to the caller as a fatal error.
#[derive(Error, Debug)]
pub enum Trap {
    #[error("illegal instruction at pc {pc:#010x}: {source}")]
    IllegalInstruction {
        pc: u32,
        #[source]
        source: DecodeError,
    },
    #[error("out-of-range access at pc {pc:#010x}: {source}")]
    OutOfRangeAccess {
        pc: u32,
        #[source]
        source: MemoryError,
    },
    #[error("unimplemented syscall at pc {pc:#010x}: {source}")]
    UnimplementedSyscall {
        pc: u32,
        #[source]
        source: UnimplementedSyscall,
    },
    #[error("guest exited with code {0}")]
    GuestExit(i32),
    #[error("self-jump detected at pc {0:#010x}")]
    SelfJump(u32),
    #[error("breakpoint at pc {0:#010x}")]
    Breakpoint(u32),
}

impl From<RegisterError> for Trap {
    fn from(source: RegisterError) -> Self {
        // The only way this fires is an internal bug: every register
        // index the interpreter produces comes from a 5-bit decoded
        // field or the fixed PC constant, both always in range.
        unreachable!("register file rejected an index the decoder guarantees is valid: {source}")
    }
}

/// One RV32I hart: program counter, register file, and the memory it
/// executes against.
pub struct Hart {
    pc: u32,
    registers: RegisterFile,
    memory: Memory,
    host: HostState,
    instret: u64,
    /// When set, a branch or jump whose target equals its own address
    /// is treated as fatal rather than allowed to spin forever. See
    /// `spec.md` §9 for why this is opt-out rather than unconditional.
    break_on_self_jump: bool,
}

impl Hart {
    pub fn new(memory: Memory) -> Self {
        Self {
            pc: 0,
            registers: RegisterFile::new(),
            memory,
            host: HostState::new(),
            instret: 0,
            break_on_self_jump: true,
        }
    }

    pub fn with_self_jump_guard(mut self, enabled: bool) -> Self {
        self.break_on_self_jump = enabled;
        self
    }

    pub fn pc(&self) -> u32 {
        self.pc
    }

    /// Set the program counter, keeping the register file's `pc` slot
    /// (used by introspection and the `rvemu` register dump) in sync.
    pub fn set_pc(&mut self, pc: u32) {
        self.pc = pc;
        let _ = self.registers.write(PC, pc);
    }

    pub fn registers(&self) -> &RegisterFile {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut RegisterFile {
        &mut self.registers
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut Memory {
        &mut self.memory
    }

    pub fn instret(&self) -> u64 {
        self.instret
    }

    fn x(&self, index: u8) -> u32 {
        self.registers.read(index as usize).unwrap_or(0)
    }

    fn set_x(&mut self, index: u8, value: u32) {
        let _ = self.registers.write(index as usize, value);
    }

    /// Execute exactly one instruction. Returns `Ok(())` having
    /// advanced `pc` and retired the instruction, or `Err(trap)` if
    /// execution cannot continue.
    pub fn step(&mut self) -> Result<(), Trap> {
        let pc = self.pc;
        let word = self.memory.read_u32(pc as i64).map_err(|source| Trap::OutOfRangeAccess { pc, source })?;
        let decoded = Decoded::decode(word).map_err(|source| Trap::IllegalInstruction { pc, source })?;

        let mut next_pc = pc.wrapping_add(4);

        match decoded.opcode {
            Opcode::Lui => {
                self.set_x(decoded.rd, decoded.imm_u);
            }
            Opcode::Auipc => {
                self.set_x(decoded.rd, pc.wrapping_add(decoded.imm_u));
            }
            Opcode::Jal => {
                self.set_x(decoded.rd, next_pc);
                next_pc = pc.wrapping_add(decoded.imm_j);
            }
            Opcode::Jalr => {
                let target = self.x(decoded.rs1).wrapping_add(decoded.imm_i) & !1;
                self.set_x(decoded.rd, next_pc);
                next_pc = target;
            }
            Opcode::Branch => {
                let cond = BranchCond::from_funct3(decoded.funct3)
                    .map_err(|_| Trap::IllegalInstruction { pc, source: DecodeError::IllegalFunct3 { opcode: decoded.opcode, funct3: decoded.funct3 as u32 } })?;
                if cond.taken(self.x(decoded.rs1), self.x(decoded.rs2)) {
                    next_pc = pc.wrapping_add(decoded.imm_b);
                }
            }
            Opcode::Load => {
                let addr = self.x(decoded.rs1).wrapping_add(decoded.imm_i);
                let value = self
                    .load(addr, decoded.funct3)
                    .map_err(|source| Trap::OutOfRangeAccess { pc, source })?;
                self.set_x(decoded.rd, value);
            }
            Opcode::Store => {
                let addr = self.x(decoded.rs1).wrapping_add(decoded.imm_s);
                self.store(addr, decoded.funct3, self.x(decoded.rs2))
                    .map_err(|source| Trap::OutOfRangeAccess { pc, source })?;
            }
            Opcode::Imm => {
                let op = ArithOp::from_funct3(decoded.funct3)
                    .map_err(|_| Trap::IllegalInstruction { pc, source: DecodeError::IllegalFunct3 { opcode: decoded.opcode, funct3: decoded.funct3 as u32 } })?;
                let result = alu(op, self.x(decoded.rs1), decoded.imm_i, decoded.alt());
                self.set_x(decoded.rd, result);
            }
            Opcode::Op => {
                let op = ArithOp::from_funct3(decoded.funct3)
                    .map_err(|_| Trap::IllegalInstruction { pc, source: DecodeError::IllegalFunct3 { opcode: decoded.opcode, funct3: decoded.funct3 as u32 } })?;
                let result = alu(op, self.x(decoded.rs1), self.x(decoded.rs2), decoded.alt());
                self.set_x(decoded.rd, result);
            }
            Opcode::Misc => {
                // FENCE and friends: no caches or reordering to flush.
            }
            Opcode::System => {
                self.execute_system(pc, &decoded)?;
            }
        }

        if self.break_on_self_jump && next_pc == pc && decoded.opcode != Opcode::Misc {
            return Err(Trap::SelfJump(pc));
        }

        self.set_pc(next_pc);
        self.instret += 1;
        Ok(())
    }

    fn execute_system(&mut self, pc: u32, decoded: &Decoded) -> Result<(), Trap> {
        match decoded.imm_i {
            0 => {
                // ecall
                let args = SyscallArgs {
                    number: self.x(17), // a7
                    a0: self.x(10),
                    a1: self.x(11),
                    a2: self.x(12),
                    a3: self.x(13),
                    a4: self.x(14),
                    a5: self.x(15),
                };
                match syscall::dispatch(args, &mut self.memory, &mut self.host) {
                    Ok(SyscallOutcome::Return(value)) => {
                        self.set_x(10, value);
                        Ok(())
                    }
                    Ok(SyscallOutcome::Exit(code)) => Err(Trap::GuestExit(code)),
                    Err(source) => Err(Trap::UnimplementedSyscall { pc, source }),
                }
            }
            1 => Err(Trap::Breakpoint(pc)), // ebreak
            _ => Err(Trap::IllegalInstruction {
                pc,
                source: DecodeError::IllegalFunct3 {
                    opcode: Opcode::System,
                    funct3: decoded.funct3 as u32,
                },
            }),
        }
    }

    fn load(&mut self, addr: u32, funct3: u8) -> Result<u32, MemoryError> {
        Ok(match funct3 {
            0b000 => crate::decode::sign_extend(self.memory.read(addr as i64, 1)?[0] as u32, 8),
            0b001 => {
                let bytes = self.memory.read(addr as i64, 2)?;
                crate::decode::sign_extend(u16::from_le_bytes([bytes[0], bytes[1]]) as u32, 16)
            }
            0b010 => self.memory.read_u32(addr as i64)?,
            0b100 => self.memory.read(addr as i64, 1)?[0] as u32,
            0b101 => {
                let bytes = self.memory.read(addr as i64, 2)?;
                u16::from_le_bytes([bytes[0], bytes[1]]) as u32
            }
            _ => self.memory.read_u32(addr as i64)?,
        })
    }

    fn store(&mut self, addr: u32, funct3: u8, value: u32) -> Result<(), MemoryError> {
        match funct3 {
            0b000 => self.memory.write(addr as i64, &value.to_le_bytes()[..1]),
            0b001 => self.memory.write(addr as i64, &value.to_le_bytes()[..2]),
            _ => self.memory.write(addr as i64, &value.to_le_bytes()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hart_with_program(words: &[u32]) -> Hart {
        let mut memory = Memory::new();
        for (i, word) in words.iter().enumerate() {
            memory.write((i as i64) * 4, &word.to_le_bytes()).unwrap();
        }
        Hart::new(memory)
    }

    #[test]
    fn addi_sets_destination_register() {
        // addi x1, x0, 5
        let mut hart = hart_with_program(&[0x0050_0093]);
        hart.step().unwrap();
        assert_eq!(hart.x(1), 5);
        assert_eq!(hart.pc(), 4);
    }

    #[test]
    fn beq_taken_branches() {
        // beq x1, x0, +8 (x1 reads 0 on a fresh hart, so the branch is taken)
        let mut hart = hart_with_program(&[0x0000_8463]);
        hart.step().unwrap();
        assert_eq!(hart.pc(), 8);
    }

    #[test]
    fn beq_not_taken_falls_through() {
        // addi x1, x0, 1 ; beq x1, x0, +8
        let mut hart = hart_with_program(&[0x0010_0093, 0x0000_8463]);
        hart.step().unwrap();
        hart.step().unwrap();
        assert_eq!(hart.pc(), 8);
    }

    #[test]
    fn lw_round_trips_through_store() {
        // addi x1, x0, 0x100 (base addr)
        // addi x2, x0, 42
        // sw x2, 0(x1)
        // lw x3, 0(x1)
        let program = [
            0x1000_0093u32, // addi x1, x0, 0x100
            0x02a0_0113u32, // addi x2, x0, 42
            0x0020_a023u32, // sw x2, 0(x1)
            0x0000_a183u32, // lw x3, 0(x1)
        ];
        let mut hart = hart_with_program(&program);
        for _ in 0..4 {
            hart.step().unwrap();
        }
        assert_eq!(hart.x(3), 42);
    }

    #[test]
    fn lb_sign_extends_negative_byte() {
        // addi x1, x0, 0x100
        // addi x2, x0, -1  (0xfff << 20 = addi x2, x0, -1)
        // sb x2, 0(x1)
        // lb x3, 0(x1)
        let program = [
            0x1000_0093u32,
            0xfff0_0113u32, // addi x2, x0, -1
            0x0020_8023u32, // sb x2, 0(x1)
            0x0000_8183u32, // lb x3, 0(x1)
        ];
        let mut hart = hart_with_program(&program);
        for _ in 0..4 {
            hart.step().unwrap();
        }
        assert_eq!(hart.x(3), 0xffff_ffff);
    }

    #[test]
    fn ecall_write_reaches_stdout() {
        // addi a7, x0, 64   (write)
        // addi a0, x0, 1    (fd = stdout)
        // addi a1, x0, 0x200 (buf addr)
        // addi a2, x0, 0    (len = 0, avoid reading uninitialised memory as a string)
        // ecall
        let program = [
            0x0400_0893u32, // addi a7(x17), x0, 64
            0x0010_0513u32, // addi a0(x10), x0, 1
            0x2000_0593u32, // addi a1(x11), x0, 0x200
            0x0000_0613u32, // addi a2(x12), x0, 0
            0x0000_0073u32, // ecall
        ];
        let mut hart = hart_with_program(&program);
        for _ in 0..5 {
            hart.step().unwrap();
        }
        assert_eq!(hart.x(10), 0);
    }

    #[test]
    fn jal_links_return_address() {
        // jal x1, +16
        let mut hart = hart_with_program(&[0x0100_00ef]);
        hart.step().unwrap();
        assert_eq!(hart.x(1), 4);
        assert_eq!(hart.pc(), 16);
    }

    #[test]
    fn self_jump_is_fatal_when_guard_enabled() {
        // jal x0, 0 (infinite self-loop)
        let mut hart = hart_with_program(&[0x0000_006f]);
        let trap = hart.step().unwrap_err();
        assert!(matches!(trap, Trap::SelfJump(0)));
    }

    #[test]
    fn self_jump_is_allowed_when_guard_disabled() {
        let mut hart = hart_with_program(&[0x0000_006f]).with_self_jump_guard(false);
        hart.step().unwrap();
        assert_eq!(hart.pc(), 0);
    }

    #[test]
    fn ebreak_traps() {
        let mut hart = hart_with_program(&[0x0010_0073]); // ebreak
        let trap = hart.step().unwrap_err();
        assert!(matches!(trap, Trap::Breakpoint(0)));
    }

    #[test]
    fn illegal_opcode_traps() {
        let mut hart = hart_with_program(&[0x0000_007f]); // opcode 0x7f, illegal
        let trap = hart.step().unwrap_err();
        assert!(matches!(trap, Trap::IllegalInstruction { pc: 0, .. }));
    }
}
