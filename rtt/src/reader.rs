use crate::channel::*;
use crate::{Error, MemoryAccessPort, Rtt};
use std::ops::Range;
use std::sync::mpsc;

/// Bytes drained from one up channel during a read cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelData {
    /// Number of the up channel.
    pub channel: usize,
    /// The drained bytes, in the order the target wrote them.
    pub bytes: Vec<u8>,
}

/// Receives the data drained by a [`RttReader`].
///
/// Deliveries happen synchronously on the thread running the read cycle, in ascending channel
/// order, so implementations should return quickly.
pub trait ChannelSink {
    /// Takes the bytes drained from up channel `channel`.
    fn deliver(&mut self, channel: usize, bytes: Vec<u8>);
}

impl ChannelSink for mpsc::Sender<ChannelData> {
    fn deliver(&mut self, channel: usize, bytes: Vec<u8>) {
        if self.send(ChannelData { channel, bytes }).is_err() {
            tracing::trace!("Receiver for channel {channel} is gone, dropping data");
        }
    }
}

impl ChannelSink for Vec<ChannelData> {
    fn deliver(&mut self, channel: usize, bytes: Vec<u8>) {
        self.push(ChannelData { channel, bytes });
    }
}

/// Adapts a closure taking the channel number and the drained bytes into a [`ChannelSink`].
pub struct FnSink<F>(pub F);

impl<F: FnMut(usize, &[u8])> ChannelSink for FnSink<F> {
    fn deliver(&mut self, channel: usize, bytes: Vec<u8>) {
        (self.0)(channel, &bytes)
    }
}

impl<S: ChannelSink + ?Sized> ChannelSink for &mut S {
    fn deliver(&mut self, channel: usize, bytes: Vec<u8>) {
        (**self).deliver(channel, bytes)
    }
}

/// Settings of the read engine.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ReadConfig {
    /// Largest span of target memory fetched in one read cycle. A larger span means the
    /// descriptors are not trustworthy, which happens around a target reset.
    pub sanity_limit: usize,
}

impl Default for ReadConfig {
    fn default() -> Self {
        Self {
            sanity_limit: 64 * 1024,
        }
    }
}

/// Drains the up channels of an [`Rtt`] and hands the data to a [`ChannelSink`].
#[derive(Debug)]
pub struct RttReader<S> {
    sink: S,
    config: ReadConfig,
}

impl<S: ChannelSink> RttReader<S> {
    /// Creates a reader delivering to `sink`, with the default settings.
    pub fn new(sink: S) -> Self {
        Self::with_config(sink, ReadConfig::default())
    }

    /// Creates a reader delivering to `sink`.
    pub fn with_config(sink: S, config: ReadConfig) -> Self {
        Self { sink, config }
    }

    /// The sink data is delivered to.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Mutable access to the sink.
    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Runs one read cycle and returns the number of channels data was delivered for.
    ///
    /// The descriptor table is refreshed in a single access. The buffers of all channels with
    /// unread data are then fetched with one more access covering all of them, and each such
    /// up channel is drained. Its read offset is written back to the target, which is the only
    /// write a read cycle makes.
    pub fn poll<P: MemoryAccessPort + ?Sized>(
        &mut self,
        rtt: &mut Rtt,
        port: &mut P,
    ) -> Result<usize, Error> {
        rtt.refresh_descriptors(port)?;

        let mut pending = Vec::new();
        for (direction, count) in [
            (Direction::Up, rtt.max_up_channels()),
            (Direction::Down, rtt.max_down_channels()),
        ] {
            for number in 0..count {
                let descriptor = rtt.descriptor(direction, number)?;
                if !descriptor.has_data() {
                    continue;
                }
                if !descriptor.offsets_valid() {
                    tracing::warn!(
                        "Skipping {direction} channel {number}: read offset {} / write offset {} for buffer size {}",
                        descriptor.read,
                        descriptor.write,
                        descriptor.size
                    );
                    continue;
                }
                pending.push((direction, number, descriptor));
            }
        }

        let Some(span) = coalesce(pending.iter().map(|(_, _, d)| d.buffer_range())) else {
            return Ok(0);
        };

        let span_len = (span.end - span.start) as usize;
        if span_len > self.config.sanity_limit {
            tracing::error!(
                "Read RTT memory size is insane: {span_len} bytes at {:#010x}",
                span.start
            );
            return Ok(0);
        }

        let window = rtt.snapshot().window();
        if span.start < window.start || span.end > window.end {
            tracing::warn!(
                "RTT buffers at {:#010x}..{:#010x} are outside of the scanned memory, skipping",
                span.start,
                span.end
            );
            return Ok(0);
        }

        // Whole words, as long as the window allows.
        let fetch_len = round_up_to_word(span_len).min((window.end - span.start) as usize);
        rtt.snapshot_mut().refresh(port, span.start, fetch_len)?;

        let mut delivered = 0;
        for (direction, number, descriptor) in pending {
            if direction != Direction::Up {
                continue;
            }

            let bytes = drain_channel(rtt, port, number, &descriptor)?;
            if !bytes.is_empty() {
                tracing::debug!("Channel {number}: read {}", bytes.len());
                self.sink.deliver(number, bytes);
                delivered += 1;
            }
        }

        Ok(delivered)
    }
}

/// Drains up channel `number` from the snapshot and moves its read offset on the target.
fn drain_channel<P: MemoryAccessPort + ?Sized>(
    rtt: &mut Rtt,
    port: &mut P,
    number: usize,
    descriptor: &BufferDescriptor,
) -> Result<Vec<u8>, Error> {
    let data = rtt
        .snapshot()
        .slice(u64::from(descriptor.buffer_ptr), descriptor.size as usize)?;
    let (bytes, read) = drain_ring(data, descriptor.read, descriptor.write);

    if !bytes.is_empty() {
        let address = rtt.field_address(Direction::Up, number, BufferDescriptor::O_READ)?;
        port.write_word_32(address, read)?;
        rtt.store_field(Direction::Up, number, BufferDescriptor::O_READ, read)?;
    }

    Ok(bytes)
}

/// The smallest range covering all of `ranges`, `None` if there are none.
pub fn coalesce(ranges: impl IntoIterator<Item = Range<u64>>) -> Option<Range<u64>> {
    ranges.into_iter().reduce(|acc, range| {
        acc.start.min(range.start)..acc.end.max(range.end)
    })
}

fn round_up_to_word(len: usize) -> usize {
    (len + 3) & !3
}
