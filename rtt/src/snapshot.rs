use crate::{Error, MemoryAccessPort};
use std::ops::Range;

/// Host side mirror of a contiguous range of target memory.
///
/// Byte `i` of the snapshot always corresponds to device address `base + i`. The window is
/// allocated once and never resized; parts of it are refreshed with targeted re-reads.
#[derive(Debug, Clone)]
pub struct Snapshot {
    base: u64,
    bytes: Vec<u8>,
}

impl Snapshot {
    /// Creates a zero-filled window of `len` bytes starting at device address `base`.
    pub fn new(base: u64, len: usize) -> Self {
        Self {
            base,
            bytes: vec![0; len],
        }
    }

    /// Creates a window over already known memory contents.
    pub fn from_bytes(base: u64, bytes: Vec<u8>) -> Self {
        Self { base, bytes }
    }

    /// Device address of the first byte.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of the window in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if the window is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Device address range covered by the window.
    pub fn window(&self) -> Range<u64> {
        self.base..self.base + self.bytes.len() as u64
    }

    /// The whole window.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Translates a device address range into the matching snapshot index range.
    pub fn translate(&self, address: u64, len: usize) -> Result<Range<usize>, Error> {
        let out_of_window = || Error::AddressOutOfWindow { address, len };

        let start = address.checked_sub(self.base).ok_or_else(out_of_window)?;
        let end = start.checked_add(len as u64).ok_or_else(out_of_window)?;

        if end > self.bytes.len() as u64 {
            return Err(out_of_window());
        }

        Ok(start as usize..end as usize)
    }

    /// Device address of the byte at snapshot index `offset`.
    pub fn address_of(&self, offset: usize) -> u64 {
        self.base + offset as u64
    }

    /// Borrows `len` bytes at device address `address`.
    pub fn slice(&self, address: u64, len: usize) -> Result<&[u8], Error> {
        let range = self.translate(address, len)?;
        Ok(&self.bytes[range])
    }

    /// Mutably borrows `len` bytes at device address `address`.
    pub fn slice_mut(&mut self, address: u64, len: usize) -> Result<&mut [u8], Error> {
        let range = self.translate(address, len)?;
        Ok(&mut self.bytes[range])
    }

    /// Re-reads `len` bytes at `address` from the device into the window.
    pub fn refresh<P: MemoryAccessPort + ?Sized>(
        &mut self,
        port: &mut P,
        address: u64,
        len: usize,
    ) -> Result<(), Error> {
        let range = self.translate(address, len)?;
        port.read(address, &mut self.bytes[range])?;
        Ok(())
    }

    /// Re-reads the whole window from the device.
    pub fn refresh_all<P: MemoryAccessPort + ?Sized>(&mut self, port: &mut P) -> Result<(), Error> {
        let base = self.base;
        port.read(base, &mut self.bytes)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn translate_maps_device_addresses() {
        let snapshot = Snapshot::new(0x2000_0000, 0x100);

        assert_eq!(snapshot.translate(0x2000_0000, 16).unwrap(), 0..16);
        assert_eq!(snapshot.translate(0x2000_00f0, 16).unwrap(), 0xf0..0x100);
        assert_eq!(snapshot.translate(0x2000_0100, 0).unwrap(), 0x100..0x100);
    }

    #[test]
    fn translate_rejects_addresses_outside_the_window() {
        let snapshot = Snapshot::new(0x2000_0000, 0x100);

        assert!(matches!(
            snapshot.translate(0x1fff_ffff, 1),
            Err(Error::AddressOutOfWindow {
                address: 0x1fff_ffff,
                len: 1
            })
        ));
        assert!(snapshot.translate(0x2000_00f1, 16).is_err());
        assert!(snapshot.translate(u64::MAX, 2).is_err());
    }
}
