//! Build a [`Hart`] from an ELF file's `PT_LOAD` segments, per
//! `spec.md` §4.7.
//!
//! Unlike a linker, which only cares about named sections, a loader
//! cares about program headers: the `PT_LOAD` segments are exactly
//! what the kernel (or, here, this emulator) maps into the address
//! space before jumping to the entry point.

use elf::abi::{PF_R, PF_W, PT_LOAD};
use elf::endian::AnyEndian;
use elf::ElfBytes;
use thiserror::Error;

use crate::hart::Hart;
use crate::memory::Memory;

/// Initial stack pointer. Chosen to sit at the top of the 32-bit
/// address space with a word of headroom for the zeroed word written
/// there as a minimal argv/envp terminator.
const INITIAL_SP: u32 = 0xffff_fffc;

/// Heap break assigned when a `PT_LOAD` segment with flags exactly
/// `PF_R | PF_W` (the data segment) is found, matching the fixed
/// address the reference guest runtime expects.
const INITIAL_BRK: u32 = 0xc000_0000;

#[derive(Error, Debug)]
pub enum LoaderError {
    #[error("failed to parse ELF file: {0}")]
    Parse(String),
    #[error("failed to read segment data: {0}")]
    Segment(String),
    #[error("failed to write segment into guest memory: {0}")]
    Memory(#[from] crate::memory::MemoryError),
    #[error("failed to write initial stack word: {0}")]
    Register(#[from] crate::register_file::RegisterError),
}

/// Parse `bytes` as an ELF file, map every `PT_LOAD` segment into a
/// fresh [`Hart`], and position it to start execution at the entry
/// point with a minimal stack set up.
pub fn load(bytes: &[u8]) -> Result<Hart, LoaderError> {
    let file = ElfBytes::<AnyEndian>::minimal_parse(bytes)
        .map_err(|e| LoaderError::Parse(e.to_string()))?;

    let mut memory = Memory::new();
    let mut saw_writable_segment = false;

    let segments = file.segments().ok_or_else(|| LoaderError::Parse("no program headers".to_string()))?;
    for header in segments.iter() {
        if header.p_type != PT_LOAD {
            continue;
        }
        let data = file
            .segment_data(&header)
            .map_err(|e| LoaderError::Segment(e.to_string()))?;
        memory.write(header.p_paddr as i64, data)?;

        if header.p_flags == PF_R | PF_W {
            saw_writable_segment = true;
        }
    }

    if saw_writable_segment {
        memory.set_brk(INITIAL_BRK);
    }

    memory.write(INITIAL_SP as i64, &0u32.to_le_bytes())?;

    let mut hart = Hart::new(memory);
    hart.registers_mut().write(2, INITIAL_SP)?; // sp
    hart.registers_mut().write(10, 0)?; // a0
    hart.registers_mut().write(11, 0)?; // a1
    hart.registers_mut().write(12, 0)?; // a2
    hart.set_pc(file.ehdr.e_entry as u32);

    Ok(hart)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A hand-built, minimal 32-bit little-endian ELF with a single
    /// `PT_LOAD` segment containing one `addi x1, x0, 5` instruction,
    /// entry point at the start of that segment.
    fn minimal_elf() -> Vec<u8> {
        let entry: u32 = 0x1000;
        let text: [u8; 4] = 0x0050_0093u32.to_le_bytes();

        let ehsize = 52u16;
        let phentsize = 32u16;
        let phoff = ehsize as u32;
        let phnum = 1u16;

        let mut elf = Vec::new();
        elf.extend_from_slice(b"\x7fELF");
        elf.push(1); // 32-bit
        elf.push(1); // little-endian
        elf.push(1); // EI_VERSION
        elf.extend_from_slice(&[0u8; 9]); // padding
        elf.extend_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
        elf.extend_from_slice(&0xf3u16.to_le_bytes()); // e_machine = EM_RISCV
        elf.extend_from_slice(&1u32.to_le_bytes()); // e_version
        elf.extend_from_slice(&entry.to_le_bytes()); // e_entry
        elf.extend_from_slice(&phoff.to_le_bytes()); // e_phoff
        elf.extend_from_slice(&0u32.to_le_bytes()); // e_shoff
        elf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
        elf.extend_from_slice(&ehsize.to_le_bytes());
        elf.extend_from_slice(&phentsize.to_le_bytes());
        elf.extend_from_slice(&phnum.to_le_bytes());
        elf.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
        elf.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
        elf.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
        assert_eq!(elf.len(), ehsize as usize);

        let data_offset = ehsize as u32 + phentsize as u32;
        elf.extend_from_slice(&PT_LOAD.to_le_bytes()); // p_type
        elf.extend_from_slice(&data_offset.to_le_bytes()); // p_offset
        elf.extend_from_slice(&entry.to_le_bytes()); // p_vaddr
        elf.extend_from_slice(&entry.to_le_bytes()); // p_paddr
        elf.extend_from_slice(&(text.len() as u32).to_le_bytes()); // p_filesz
        elf.extend_from_slice(&(text.len() as u32).to_le_bytes()); // p_memsz
        elf.extend_from_slice(&(elf::abi::PF_R | elf::abi::PF_X).to_le_bytes()); // p_flags
        elf.extend_from_slice(&4u32.to_le_bytes()); // p_align
        assert_eq!(elf.len(), data_offset as usize);

        elf.extend_from_slice(&text);
        elf
    }

    #[test]
    fn loads_entry_point_and_segment_contents() {
        let bytes = minimal_elf();
        let mut hart = load(&bytes).unwrap();
        assert_eq!(hart.pc(), 0x1000);
        hart.step().unwrap();
        assert_eq!(hart.registers().read(1).unwrap(), 5);
    }

    #[test]
    fn stack_pointer_is_initialised_near_top_of_address_space() {
        let bytes = minimal_elf();
        let hart = load(&bytes).unwrap();
        assert_eq!(hart.registers().read(2).unwrap(), INITIAL_SP);
    }

    #[test]
    fn non_writable_only_image_leaves_brk_unset() {
        let bytes = minimal_elf();
        let hart = load(&bytes).unwrap();
        assert_eq!(hart.memory().get_brk(), 0);
    }

    #[test]
    fn garbage_input_is_a_parse_error() {
        let err = load(&[0u8; 16]).unwrap_err();
        assert!(matches!(err, LoaderError::Parse(_)));
    }
}
