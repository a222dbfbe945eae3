//! Minimal ELF64 loader.
//!
//! Just enough to place the kernel: validate the identification bytes,
//! walk the program headers, and report the PT_LOAD segments with their
//! physical placement. Relocation, sections, and symbols are someone
//! else's problem; the kernel is linked to run where it is loaded.

/// Loader-side ELF errors, surfaced as UEFI aborts by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    TooShort,
    BadMagic,
    NotElf64,
    NotLittleEndian,
    NotExecutable,
    WrongMachine,
    BadProgramHeader,
}

/// A PT_LOAD segment to place in memory.
#[derive(Debug, Clone, Copy)]
pub struct LoadSegment {
    /// Offset of the segment data within the file.
    pub file_offset: usize,
    /// Bytes of initialized data.
    pub file_size: usize,
    /// Physical destination address.
    pub phys_addr: u64,
    /// Total in-memory size; the tail past `file_size` is BSS.
    pub mem_size: usize,
}

const EI_NIDENT: usize = 16;
const ELF_MAGIC: &[u8; 4] = b"\x7fELF";
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ET_EXEC: u16 = 2;
const EM_X86_64: u16 = 62;
const PT_LOAD: u32 = 1;

/// Parsed view of an ELF64 executable.
pub struct Elf<'a> {
    data: &'a [u8],
    /// Virtual entry point; equals the physical one for our kernel.
    pub entry: u64,
    phoff: usize,
    phentsize: usize,
    phnum: usize,
}

impl<'a> Elf<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self, ElfError> {
        if data.len() < 64 {
            return Err(ElfError::TooShort);
        }
        if &data[..4] != ELF_MAGIC {
            return Err(ElfError::BadMagic);
        }
        if data[4] != ELFCLASS64 {
            return Err(ElfError::NotElf64);
        }
        if data[5] != ELFDATA2LSB {
            return Err(ElfError::NotLittleEndian);
        }
        if read_u16(data, EI_NIDENT) != ET_EXEC {
            return Err(ElfError::NotExecutable);
        }
        if read_u16(data, EI_NIDENT + 2) != EM_X86_64 {
            return Err(ElfError::WrongMachine);
        }

        let entry = read_u64(data, 24);
        let phoff = read_u64(data, 32) as usize;
        let phentsize = read_u16(data, 54) as usize;
        let phnum = read_u16(data, 56) as usize;

        if phentsize < 56 || phoff + phentsize * phnum > data.len() {
            return Err(ElfError::BadProgramHeader);
        }

        Ok(Self { data, entry, phoff, phentsize, phnum })
    }

    /// Iterate the PT_LOAD segments.
    pub fn load_segments(&self) -> impl Iterator<Item = Result<LoadSegment, ElfError>> + '_ {
        (0..self.phnum).filter_map(move |i| {
            let at = self.phoff + i * self.phentsize;
            let ph = &self.data[at..at + self.phentsize];
            if read_u32(ph, 0) != PT_LOAD {
                return None;
            }
            let seg = LoadSegment {
                file_offset: read_u64(ph, 8) as usize,
                phys_addr: read_u64(ph, 24),
                file_size: read_u64(ph, 32) as usize,
                mem_size: read_u64(ph, 40) as usize,
            };
            if seg.file_offset + seg.file_size > self.data.len() || seg.mem_size < seg.file_size {
                return Some(Err(ElfError::BadProgramHeader));
            }
            Some(Ok(seg))
        })
    }

    /// The initialized bytes of a segment.
    pub fn segment_data(&self, seg: &LoadSegment) -> &'a [u8] {
        &self.data[seg.file_offset..seg.file_offset + seg.file_size]
    }
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(buf[at..at + 2].try_into().unwrap())
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}
