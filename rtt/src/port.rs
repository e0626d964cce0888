//! The memory access capability the RTT engine is built on.
//!
//! Anything that can read and write target memory byte-exactly can carry RTT: a debug probe
//! over SWD, a remote probe server, or an in-memory fake in tests. The engine only ever talks
//! to a [`MemoryAccessPort`], and it only does so from the thread that owns the port.

/// Element size used for a memory transfer.
///
/// Debug probes usually pick the fastest transfer width on their own, which is what
/// [`AccessWidth::Auto`] asks for. The explicit widths exist for registers and peripherals that
/// only tolerate accesses of one particular size.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum AccessWidth {
    /// Let the port pick the transfer width.
    #[default]
    Auto,
    /// Byte accesses.
    U8,
    /// Half-word accesses.
    U16,
    /// Word accesses.
    U32,
}

impl AccessWidth {
    /// Size of one element in bytes, or `None` for [`AccessWidth::Auto`].
    pub fn bytes(self) -> Option<usize> {
        match self {
            AccessWidth::Auto => None,
            AccessWidth::U8 => Some(1),
            AccessWidth::U16 => Some(2),
            AccessWidth::U32 => Some(4),
        }
    }

    /// Checks that a transfer of `len` bytes at `address` is made of whole, aligned elements.
    pub fn check(self, address: u64, len: usize) -> Result<(), PortError> {
        match self.bytes() {
            Some(size) if address % size as u64 != 0 || len % size != 0 => {
                Err(PortError::Unaligned {
                    address,
                    width: size,
                })
            }
            _ => Ok(()),
        }
    }
}

/// Errors reported by a [`MemoryAccessPort`].
#[derive(thiserror::Error, Debug, docsplay::Display)]
pub enum PortError {
    /// The memory access port is not open.
    NotOpen,

    /// Access at {address:#010x} is not aligned to the {width} byte element size.
    Unaligned {
        /// Requested address.
        address: u64,
        /// Element size in bytes.
        width: usize,
    },

    /// Access of {len} bytes at {address:#010x} is outside of target memory.
    OutOfRange {
        /// Requested address.
        address: u64,
        /// Requested length.
        len: usize,
    },

    /// Transport failure: {0}
    Transport(#[from] anyhow::Error),
}

/// Read/write access to the memory of a target.
///
/// Transfers either complete entirely or fail; there is no partial count. Implementations are
/// responsible for their own timeouts, the RTT engine never retries.
pub trait MemoryAccessPort {
    /// Whatever is needed to establish the connection.
    type Params;

    /// Opens a connection to the target.
    fn open(params: &Self::Params) -> Result<Self, PortError>
    where
        Self: Sized;

    /// Closes the connection. Further accesses fail with [`PortError::NotOpen`].
    fn close(&mut self) -> Result<(), PortError>;

    /// Reads `data.len()` bytes starting at `address`.
    fn read_memory(
        &mut self,
        address: u64,
        width: AccessWidth,
        data: &mut [u8],
    ) -> Result<(), PortError>;

    /// Writes `data` starting at `address`.
    fn write_memory(&mut self, address: u64, width: AccessWidth, data: &[u8])
        -> Result<(), PortError>;

    /// Reads the identification code of the target.
    fn identify(&mut self) -> Result<u32, PortError>;

    /// Reads a block of bytes, letting the port pick the transfer width.
    fn read(&mut self, address: u64, data: &mut [u8]) -> Result<(), PortError> {
        self.read_memory(address, AccessWidth::Auto, data)
    }

    /// Writes a block of bytes, letting the port pick the transfer width.
    fn write(&mut self, address: u64, data: &[u8]) -> Result<(), PortError> {
        self.write_memory(address, AccessWidth::Auto, data)
    }

    /// Reads a little-endian 32 bit word.
    fn read_word_32(&mut self, address: u64) -> Result<u32, PortError> {
        let mut word = [0u8; 4];
        self.read_memory(address, AccessWidth::U32, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    /// Writes a little-endian 32 bit word.
    fn write_word_32(&mut self, address: u64, value: u32) -> Result<(), PortError> {
        self.write_memory(address, AccessWidth::U32, &value.to_le_bytes())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn explicit_widths_must_be_aligned() {
        assert!(AccessWidth::U32.check(0x2000_0000, 8).is_ok());
        assert!(AccessWidth::Auto.check(0x2000_0001, 3).is_ok());
        assert!(matches!(
            AccessWidth::U32.check(0x2000_0002, 4),
            Err(PortError::Unaligned { width: 4, .. })
        ));
        assert!(matches!(
            AccessWidth::U16.check(0x2000_0000, 3),
            Err(PortError::Unaligned { width: 2, .. })
        ));
    }

    #[test]
    fn word_access_is_little_endian() {
        let mut target = crate::fake::FakeTarget::new(0x2000_0000, 16);

        target.write_word_32(0x2000_0004, 0x1122_3344).unwrap();
        assert_eq!(target.peek(0x2000_0004, 4), [0x44, 0x33, 0x22, 0x11]);

        target.poke(0x2000_0008, &[0x78, 0x56, 0x34, 0x12]);
        assert_eq!(target.read_word_32(0x2000_0008).unwrap(), 0x1234_5678);
    }

    #[test]
    fn word_access_must_be_aligned() {
        let mut target = crate::fake::FakeTarget::new(0x2000_0000, 16);

        assert!(matches!(
            target.write_word_32(0x2000_0002, 1),
            Err(PortError::Unaligned { width: 4, .. })
        ));
        assert!(matches!(
            target.read_word_32(0x2000_0001),
            Err(PortError::Unaligned { width: 4, .. })
        ));
        assert_eq!(target.peek(0x2000_0000, 8), [0; 8]);
    }

    #[test]
    fn error_messages() {
        let error = PortError::OutOfRange {
            address: 0x2000_4000,
            len: 16,
        };
        assert_eq!(
            error.to_string(),
            "Access of 16 bytes at 0x20004000 is outside of target memory."
        );
    }
}
