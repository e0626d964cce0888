use crate::channel::*;
use crate::{Error, MemoryAccessPort, Rtt};
use std::cmp::min;

/// How a [`DownWriter`] transfers its shadow buffer to the target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PushMode {
    /// Re-transmit the whole buffer on every write.
    #[default]
    FullBuffer,
    /// Transmit only the bytes written by this call, in one or two segments.
    ModifiedRange,
}

/// Writes into one down (host to target) channel.
///
/// The writer keeps a host side copy of the channel's buffer, fetched from the target on the
/// first write that has something to store. The target only ever moves the read offset of a
/// down channel and never writes into its data, so the copy stays valid for the lifetime of the
/// writer. If a write fails, the copy and the target may disagree; drop the writer and create a
/// new one.
#[derive(Debug)]
pub struct DownWriter {
    channel: usize,
    mode: PushMode,
    shadow: Option<Vec<u8>>,
}

impl DownWriter {
    /// Creates a writer for down channel `channel` that pushes the whole buffer.
    pub fn new(channel: usize) -> Self {
        Self::with_mode(channel, PushMode::default())
    }

    /// Creates a writer for down channel `channel`.
    pub fn with_mode(channel: usize, mode: PushMode) -> Self {
        Self {
            channel,
            mode,
            shadow: None,
        }
    }

    /// Number of the down channel.
    pub fn channel(&self) -> usize {
        self.channel
    }

    /// The host side copy of the channel buffer, if it was fetched already.
    pub fn shadow(&self) -> Option<&[u8]> {
        self.shadow.as_deref()
    }

    /// Moves as many bytes from the front of `data` into the channel as fit and returns how many
    /// were written.
    ///
    /// This never blocks: with a full buffer it returns 0 and leaves `data` untouched, the caller
    /// retries after the target consumed some bytes. The free space is taken from the
    /// descriptors of the last [`RttReader::poll`](crate::RttReader::poll).
    pub fn write<P: MemoryAccessPort + ?Sized>(
        &mut self,
        rtt: &mut Rtt,
        port: &mut P,
        data: &mut Vec<u8>,
    ) -> Result<usize, Error> {
        let descriptor = rtt.down_descriptor(self.channel)?;

        let count = min(descriptor.available_write_space() as usize, data.len());
        if count == 0 {
            return Ok(0);
        }

        let size = descriptor.size as usize;
        let buffer_ptr = u64::from(descriptor.buffer_ptr);

        let shadow = match &mut self.shadow {
            Some(shadow) => shadow,
            None => {
                let mut shadow = vec![0; size];
                port.read(buffer_ptr, &mut shadow)?;
                self.shadow.insert(shadow)
            }
        };

        if shadow.len() != size {
            return Err(Error::ControlBlockCorrupted(format!(
                "down channel {} changed its buffer size from {} to {size}",
                self.channel,
                shadow.len()
            )));
        }

        let start = descriptor.write as usize;
        let mut write = start;
        for byte in data.drain(..count) {
            shadow[write] = byte;

            write += 1;
            if write >= size {
                // Wrap around to start
                write = 0;
            }
        }

        match self.mode {
            PushMode::FullBuffer => port.write(buffer_ptr, shadow)?,
            PushMode::ModifiedRange => {
                let first = min(count, size - start);
                port.write(buffer_ptr + start as u64, &shadow[start..start + first])?;
                if first < count {
                    port.write(buffer_ptr, &shadow[..count - first])?;
                }
            }
        }

        let write = write as u32;
        let address = rtt.field_address(Direction::Down, self.channel, BufferDescriptor::O_WRITE)?;
        port.write_word_32(address, write)?;
        rtt.store_field(
            Direction::Down,
            self.channel,
            BufferDescriptor::O_WRITE,
            write,
        )?;

        tracing::trace!("Down channel {}: wrote {count}", self.channel);
        Ok(count)
    }
}
