//! Guest Memory
//!
//! The memory service both engines read and write through.
//!
//! # Memory Map
//! Main RAM is physically addressed from 0. The cached (0x80000000) and
//! uncached (0xC0000000) windows mirror it, so translation drops the top two
//! address bits. Exception vectors (0x00000300 and up) therefore live in the
//! same RAM as the program.
//!
//! All accesses are big-endian. Accesses outside RAM fail with
//! [`MemoryError::Unmapped`]; the engines turn that into a guest DSI/ISI.

use thiserror::Error;

/// Cached RAM window base.
pub const RAM_BASE: u32 = 0x8000_0000;
/// Retail console RAM size (24MB).
pub const DEFAULT_RAM_SIZE: u32 = 0x0180_0000;

const PHYSICAL_MASK: u32 = 0x3FFF_FFFF;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    #[error("unmapped {size}-byte access at 0x{address:08X}")]
    Unmapped { address: u32, size: u32 },
}

/// Memory-service interface. Addresses are guest effective addresses.
pub trait GuestMemory {
    fn read_u8(&self, address: u32) -> Result<u8, MemoryError>;
    fn read_u16(&self, address: u32) -> Result<u16, MemoryError>;
    fn read_u32(&self, address: u32) -> Result<u32, MemoryError>;
    fn write_u8(&mut self, address: u32, value: u8) -> Result<(), MemoryError>;
    fn write_u16(&mut self, address: u32, value: u16) -> Result<(), MemoryError>;
    fn write_u32(&mut self, address: u32, value: u32) -> Result<(), MemoryError>;

    /// Copy `bytes` into guest memory starting at `address`.
    fn write_bytes(&mut self, address: u32, bytes: &[u8]) -> Result<(), MemoryError> {
        for (offset, byte) in bytes.iter().enumerate() {
            self.write_u8(address.wrapping_add(offset as u32), *byte)?;
        }
        Ok(())
    }
}

/// Flat big-endian RAM.
pub struct FlatMemory {
    ram: Vec<u8>,
}

impl FlatMemory {
    pub fn new(size: u32) -> Self {
        Self {
            ram: vec![0; size as usize],
        }
    }

    pub fn size(&self) -> u32 {
        self.ram.len() as u32
    }

    #[inline(always)]
    fn translate(&self, address: u32, size: u32) -> Result<usize, MemoryError> {
        let offset = (address & PHYSICAL_MASK) as usize;
        if offset + size as usize <= self.ram.len() {
            Ok(offset)
        } else {
            Err(MemoryError::Unmapped { address, size })
        }
    }
}

impl Default for FlatMemory {
    fn default() -> Self {
        Self::new(DEFAULT_RAM_SIZE)
    }
}

impl GuestMemory for FlatMemory {
    #[inline]
    fn read_u8(&self, address: u32) -> Result<u8, MemoryError> {
        let offset = self.translate(address, 1)?;
        Ok(self.ram[offset])
    }

    #[inline]
    fn read_u16(&self, address: u32) -> Result<u16, MemoryError> {
        let offset = self.translate(address, 2)?;
        Ok(u16::from_be_bytes([self.ram[offset], self.ram[offset + 1]]))
    }

    #[inline]
    fn read_u32(&self, address: u32) -> Result<u32, MemoryError> {
        let offset = self.translate(address, 4)?;
        let bytes: [u8; 4] = [
            self.ram[offset],
            self.ram[offset + 1],
            self.ram[offset + 2],
            self.ram[offset + 3],
        ];
        Ok(u32::from_be_bytes(bytes))
    }

    #[inline]
    fn write_u8(&mut self, address: u32, value: u8) -> Result<(), MemoryError> {
        let offset = self.translate(address, 1)?;
        self.ram[offset] = value;
        Ok(())
    }

    #[inline]
    fn write_u16(&mut self, address: u32, value: u16) -> Result<(), MemoryError> {
        let offset = self.translate(address, 2)?;
        self.ram[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    #[inline]
    fn write_u32(&mut self, address: u32, value: u32) -> Result<(), MemoryError> {
        let offset = self.translate(address, 4)?;
        self.ram[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
        Ok(())
    }

    fn write_bytes(&mut self, address: u32, bytes: &[u8]) -> Result<(), MemoryError> {
        let offset = self.translate(address, bytes.len() as u32)?;
        self.ram[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mirrors_share_ram() {
        let mut memory = FlatMemory::new(0x1000);
        memory.write_u32(0x8000_0100, 0x1234_5678).unwrap();
        assert_eq!(memory.read_u32(0x0000_0100).unwrap(), 0x1234_5678);
        assert_eq!(memory.read_u16(0xC000_0102).unwrap(), 0x5678);
        assert_eq!(memory.read_u8(0x8000_0100).unwrap(), 0x12);
    }

    #[test]
    fn test_out_of_range() {
        let memory = FlatMemory::new(0x1000);
        assert_eq!(
            memory.read_u32(0x8000_0FFE),
            Err(MemoryError::Unmapped { address: 0x8000_0FFE, size: 4 })
        );
    }
}
