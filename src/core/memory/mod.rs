use std::fs;
use std::io;
use std::io::Read;
use std::path::{Path, PathBuf};
use md5;
use tracing::info;

pub mod bus;

/// Value returned for reads that hit neither a memory area nor a device.
pub const DEFAULT_MEMORY_VALUE: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/*
Physical address space
----------------------
The bus spans a flat 36-bit physical space. Memory areas are placed into it
by their constructor and never overlap; everything else is either claimed by
a device window or reads back as the default (all-ones) value.

All guest memory is little-endian, independent of the host.
*/
pub const PHYS_SPACE_BITS: u32 = 36;

#[inline(always)]
pub fn mem_read<const SIZE: usize>(offset: usize, memory: &[u8]) -> u64 {
    const { assert!(SIZE == 8 || SIZE == 16 || SIZE == 32 || SIZE == 64) }
    let bytes = SIZE >> 3;
    let mut result: u64 = 0;
    for i in 0..bytes {
        result |= (memory[offset + i] as u64) << (i << 3);
    }
    result
}

#[inline(always)]
pub fn mem_write<const SIZE: usize>(offset: usize, value: u64, memory: &mut [u8]) {
    const { assert!(SIZE == 8 || SIZE == 16 || SIZE == 32 || SIZE == 64) }
    let bytes = SIZE >> 3;
    for i in 0..bytes {
        memory[offset + i] = (value >> (i << 3)) as u8;
    }
}

#[derive(Debug, PartialEq)]
pub enum AreaBacking {
    /// Plain RAM/ROM allocated by the simulator.
    Generic,
    /// Area initialized from a file image; written back on save.
    FileMapped(PathBuf),
}

/// One contiguous piece of the physical address space.
pub struct PhysMemArea {
    pub name: String,
    pub start: u64,
    pub writable: bool,
    pub backing: AreaBacking,
    pub data: Vec<u8>,
    pub md5: String,
}

impl PhysMemArea {
    /// Zero-filled RAM of the given size. Both the starting address and the
    /// size must be 4-byte aligned.
    pub fn generic(name: &str, start: u64, size: u64, writable: bool) -> Result<Self, String> {
        Self::check_placement(start, size)?;
        Ok(PhysMemArea {
            name: name.to_string(),
            start,
            writable,
            backing: AreaBacking::Generic,
            data: vec![0; size as usize],
            md5: String::new(),
        })
    }

    /// File-backed area: the size equals the file length. The content is
    /// loaded up front and flushed back by `save` on teardown.
    pub fn fmap(name: &str, start: u64, path: &Path, writable: bool) -> io::Result<Self> {
        let mut file = fs::File::open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;
        Self::check_placement(start, data.len() as u64)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let digest = md5::compute(&data);
        Ok(PhysMemArea {
            name: name.to_string(),
            start,
            writable,
            backing: AreaBacking::FileMapped(path.to_path_buf()),
            data,
            md5: format!("{:X}", digest),
        })
    }

    fn check_placement(start: u64, size: u64) -> Result<(), String> {
        if (start & 3) != 0 {
            return Err(format!("Memory area start {:#011X} is not 4-byte aligned", start));
        }
        if (size & 3) != 0 || size == 0 {
            return Err(format!("Memory area size {:#X} is not a positive multiple of 4", size));
        }
        if start + size > (1 << PHYS_SPACE_BITS) {
            return Err(format!(
                "Memory area [{:#011X}..{:#011X}) exceeds the 36-bit space",
                start,
                start + size
            ));
        }
        Ok(())
    }

    /// Loads a file image at the beginning of the area.
    pub fn load(&mut self, path: &Path) -> io::Result<()> {
        let mut file = fs::File::open(path)?;
        let mut image = Vec::new();
        let n = file.read_to_end(&mut image)?;
        if n > self.data.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("Image is larger than the memory area: {} > {}", n, self.data.len()),
            ));
        }
        self.data[..n].copy_from_slice(&image);
        self.md5 = format!("{:X}", md5::compute(&image));
        info!("Area '{}' loaded {} bytes from {} (MD5 {})", self.name, n, path.display(), self.md5);
        Ok(())
    }

    pub fn fill(&mut self, value: u8) {
        self.data.fill(value);
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        fs::write(path, &self.data)
    }

    #[inline(always)]
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    #[inline(always)]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.start + self.size()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn little_endian_round_trip() {
        let mut mem = vec![0u8; 16];
        mem_write::<32>(0, 0xDEAD_BEEF, &mut mem);
        assert_eq!(mem[0], 0xEF);
        assert_eq!(mem[3], 0xDE);
        assert_eq!(mem_read::<32>(0, &mem), 0xDEAD_BEEF);

        mem_write::<64>(8, 0x0123_4567_89AB_CDEF, &mut mem);
        assert_eq!(mem_read::<64>(8, &mem), 0x0123_4567_89AB_CDEF);
        assert_eq!(mem_read::<16>(8, &mem), 0xCDEF);
        assert_eq!(mem_read::<8>(9, &mem), 0xCD);
    }

    #[test]
    fn generic_area_rejects_misalignment() {
        assert!(PhysMemArea::generic("ram", 0x2, 0x1000, true).is_err());
        assert!(PhysMemArea::generic("ram", 0x0, 0x1001, true).is_err());
        assert!(PhysMemArea::generic("ram", 0x0, 0, true).is_err());
        let area = PhysMemArea::generic("ram", 0x1000, 0x2000, true).unwrap();
        assert_eq!(area.size(), 0x2000);
        assert!(area.contains(0x1000));
        assert!(area.contains(0x2FFF));
        assert!(!area.contains(0x3000));
    }

    #[test]
    fn fill_overwrites_content() {
        let mut area = PhysMemArea::generic("ram", 0, 0x100, true).unwrap();
        area.fill(0xA5);
        assert_eq!(mem_read::<32>(0, &area.data), 0xA5A5_A5A5);
    }
}
