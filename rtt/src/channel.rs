use crate::Error;
use scroll::{Pread, LE};
use std::fmt;
use std::ops::Range;

// Channels must follow this data layout when reading/writing memory in order to be compatible
// with the official RTT implementation.
//
// struct Channel {
//     const char *name; // Name of channel, pointer to null-terminated string. Optional.
//     char *buffer; // Pointer to buffer data
//     unsigned int size; // Size of data buffer. The actual capacity is one byte less.
//     unsigned int write; // Offset in data buffer of next byte to write.
//     unsigned int read; // Offset in data buffer of next byte to read.
//     // The low 2 bits of flags are used for blocking/non blocking modes, the rest are ignored.
//     unsigned int flags;
// }

/// One buffer descriptor of the control block, as last read from the target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BufferDescriptor {
    /// Pointer to the null-terminated channel name, 0 if unnamed.
    pub name_ptr: u32,
    /// Pointer to the ring buffer data.
    pub buffer_ptr: u32,
    /// Size of the ring buffer. 0 marks an unused channel slot.
    pub size: u32,
    /// Offset of the next byte to be written.
    pub write: u32,
    /// Offset of the next byte to be read.
    pub read: u32,
    /// Configuration flags.
    pub flags: u32,
}

impl BufferDescriptor {
    /// Size of the descriptor in target memory in bytes.
    pub const SIZE: usize = 24;

    // Offsets of fields in target memory in bytes
    pub(crate) const O_NAME: usize = 0;
    pub(crate) const O_BUFFER_PTR: usize = 4;
    pub(crate) const O_SIZE: usize = 8;
    pub(crate) const O_WRITE: usize = 12;
    pub(crate) const O_READ: usize = 16;
    pub(crate) const O_FLAGS: usize = 20;

    /// Parses a descriptor from the start of `mem`.
    pub fn parse(mem: &[u8]) -> Result<Self, Error> {
        let field = |offset: usize, what: &str| {
            mem.pread_with::<u32>(offset, LE).map_err(|_| {
                Error::ControlBlockCorrupted(format!("buffer descriptor truncated at {what}"))
            })
        };

        Ok(Self {
            name_ptr: field(Self::O_NAME, "name")?,
            buffer_ptr: field(Self::O_BUFFER_PTR, "buffer pointer")?,
            size: field(Self::O_SIZE, "size")?,
            write: field(Self::O_WRITE, "write offset")?,
            read: field(Self::O_READ, "read offset")?,
            flags: field(Self::O_FLAGS, "flags")?,
        })
    }

    /// Returns `true` if the slot carries a buffer.
    pub fn is_present(&self) -> bool {
        self.size > 0
    }

    /// Returns `true` if the ring holds unread bytes.
    pub fn has_data(&self) -> bool {
        self.is_present() && self.read != self.write
    }

    /// Returns `true` if both offsets point inside the buffer.
    pub fn offsets_valid(&self) -> bool {
        self.read < self.size && self.write < self.size
    }

    /// Device address range of the ring buffer data.
    pub fn buffer_range(&self) -> Range<u64> {
        let start = u64::from(self.buffer_ptr);
        start..start + u64::from(self.size)
    }

    /// Number of bytes that can be written without overwriting unread data.
    pub fn available_write_space(&self) -> u32 {
        available_write_space(self.size, self.read, self.write)
    }

    /// Decodes the channel mode from the flags.
    pub fn mode(&self) -> Result<ChannelMode, Error> {
        match self.flags & 0x3 {
            0 => Ok(ChannelMode::NoBlockSkip),
            1 => Ok(ChannelMode::NoBlockTrim),
            2 => Ok(ChannelMode::BlockIfFull),
            _ => Err(Error::ControlBlockCorrupted(String::from(
                "The channel mode flags are invalid",
            ))),
        }
    }
}

/// Free space of a ring buffer of `size` bytes.
///
/// One byte is never used so that a full buffer can be told apart from an empty one
/// (`read == write`), so the result is at most `size - 1`. Offsets outside of the buffer
/// leave no space at all.
pub fn available_write_space(size: u32, read: u32, write: u32) -> u32 {
    if read >= size || write >= size {
        0
    } else if read <= write {
        (size - 1 - write) + read
    } else {
        read - write - 1
    }
}

/// Direction of a channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Target to host.
    Up,
    /// Host to target.
    Down,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Up => f.write_str("up"),
            Direction::Down => f.write_str("down"),
        }
    }
}

/// Specifies what the target does when a channel doesn't have enough buffer space for a
/// complete write.
#[derive(Clone, Copy, Eq, PartialEq, Debug, serde::Serialize, serde::Deserialize)]
#[repr(u32)]
pub enum ChannelMode {
    /// Skip writing the data completely if it doesn't fit in its entirety.
    NoBlockSkip = 0,

    /// Write as much as possible of the data and ignore the rest.
    NoBlockTrim = 1,

    /// Block (spin) if the buffer is full.
    BlockIfFull = 2,
}

/// Description of one channel, as reported by [`Rtt::describe`](crate::Rtt::describe).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Channel number. Up channel `n` and down channel `n` share a number.
    pub number: usize,
    /// Direction of the channel.
    pub direction: Direction,
    /// Channel name, `None` if the target did not name it.
    pub name: Option<String>,
    /// Buffer size in bytes. The usable capacity is one byte less.
    pub size: u32,
    /// Channel mode, `None` if the flags are not a known mode.
    pub mode: Option<ChannelMode>,
}

impl fmt::Display for ChannelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}: {} (buffer size {}",
            self.direction,
            self.number,
            self.name.as_deref().unwrap_or("(no name)"),
            self.size,
        )?;
        match self.mode {
            Some(mode) => write!(f, ", mode {mode:?})"),
            None => write!(f, ")"),
        }
    }
}

/// Copies the unread bytes of a ring out of `data`, the buffer contents.
///
/// Starts at `read` and walks forward, wrapping at the end of `data`, until `write` is reached.
/// Returns the bytes and the new read offset, which equals `write`.
pub fn drain_ring(data: &[u8], read: u32, write: u32) -> (Vec<u8>, u32) {
    let size = data.len() as u32;
    if read >= size || write >= size {
        return (Vec::new(), read);
    }

    let mut read = read;
    let mut out = Vec::with_capacity(data.len());

    while read != write {
        out.push(data[read as usize]);

        read += 1;
        if read >= size {
            // Wrap around to start
            read = 0;
        }
    }

    (out, read)
}

#[cfg(test)]
mod test {
    use super::*;

    fn descriptor_bytes(d: &BufferDescriptor) -> Vec<u8> {
        [d.name_ptr, d.buffer_ptr, d.size, d.write, d.read, d.flags]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect()
    }

    #[test]
    fn parse_descriptor() {
        let expected = BufferDescriptor {
            name_ptr: 0x0800_1234,
            buffer_ptr: 0x2000_0100,
            size: 1024,
            write: 10,
            read: 4,
            flags: 2,
        };

        let parsed = BufferDescriptor::parse(&descriptor_bytes(&expected)).unwrap();
        assert_eq!(parsed, expected);
        assert!(parsed.has_data());
        assert_eq!(parsed.mode().unwrap(), ChannelMode::BlockIfFull);
    }

    #[test]
    fn parse_truncated_descriptor() {
        assert!(matches!(
            BufferDescriptor::parse(&[0; 20]),
            Err(Error::ControlBlockCorrupted(_))
        ));
    }

    #[test]
    fn zero_size_is_absent() {
        let d = BufferDescriptor {
            write: 3,
            read: 1,
            ..Default::default()
        };
        assert!(!d.is_present());
        assert!(!d.has_data());
    }

    #[test]
    fn write_space_reserves_one_byte() {
        assert_eq!(available_write_space(8, 0, 0), 7);
        assert_eq!(available_write_space(8, 3, 3), 7);
        assert_eq!(available_write_space(8, 3, 2), 0);
        assert_eq!(available_write_space(8, 0, 7), 0);
        assert_eq!(available_write_space(8, 6, 2), 3);
        assert_eq!(available_write_space(8, 2, 6), 3);
        assert_eq!(available_write_space(8, 2, 9), 0);
        assert_eq!(available_write_space(0, 0, 0), 0);
    }

    #[test]
    fn write_space_never_reaches_size() {
        for size in 1..16u32 {
            for read in 0..size {
                for write in 0..size {
                    let avail = available_write_space(size, read, write);
                    assert!(avail < size);

                    // Filling all of it must leave write one short of read.
                    let new_write = (write + avail) % size;
                    if avail > 0 {
                        assert_ne!(new_write, read);
                    }
                    assert_eq!(available_write_space(size, read, new_write), 0);
                }
            }
        }
    }

    #[test]
    fn drain_wraps_around() {
        let mut data = [0u8; 8];
        data[6] = b'A';
        data[7] = b'B';
        data[0] = b'C';
        data[1] = b'D';

        let (bytes, read) = drain_ring(&data, 6, 2);
        assert_eq!(bytes, b"ABCD");
        assert_eq!(read, 2);
    }

    #[test]
    fn drain_empty_ring() {
        let (bytes, read) = drain_ring(&[1, 2, 3, 4], 2, 2);
        assert!(bytes.is_empty());
        assert_eq!(read, 2);
    }

    #[test]
    fn describe_line() {
        let info = ChannelInfo {
            number: 1,
            direction: Direction::Up,
            name: Some("SysView".to_string()),
            size: 1024,
            mode: Some(ChannelMode::NoBlockSkip),
        };
        assert_eq!(
            info.to_string(),
            "up 1: SysView (buffer size 1024, mode NoBlockSkip)"
        );
    }
}
