use crate::channel::*;
use crate::{Error, MemoryAccessPort, Snapshot};
use scroll::{Pread, LE};

/// Longest channel name read from the target, including the terminator.
const MAX_NAME_LEN: usize = 64;

/// Where to look for the control block.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Start address of the RAM window.
    pub ram_start: u64,
    /// Size of the RAM window in bytes.
    pub ram_size: usize,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            ram_start: 0x2000_0000,
            ram_size: 16 * 1024,
        }
    }
}

/// The RTT interface.
///
/// Use [`Rtt::locate`] to scan a RAM window of the target for the control block. The scanned
/// window is kept as a [`Snapshot`]; every later read cycle refreshes the descriptor table and
/// the ring buffers in place, so all buffers the target announces must live inside that window.
///
/// The timing of when this is called matters: if the host scans before the target has run
/// its RTT initialization, the control block is either missing or reports zero channels, and
/// [`Error::ControlBlockNotFound`] is returned.
#[derive(Debug)]
pub struct Rtt {
    snapshot: Snapshot,

    /// Index of the control block in the snapshot.
    offset: usize,

    max_up_channels: usize,
    max_down_channels: usize,

    /// Channel names, `None` until resolved. Up channels first, like the descriptor table.
    names: Vec<Option<Option<String>>>,
}

// Rtt must follow this data layout when reading/writing memory in order to be compatible with the
// official RTT implementation.
//
// struct ControlBlock {
//     char id[16]; // Used to find/validate the control block.
//     // Maximum number of up (target to host) channels in following array
//     unsigned int max_up_channels;
//     // Maximum number of down (host to target) channels in following array.
//     unsigned int max_down_channels;
//     RttChannel up_channels[max_up_channels]; // Array of up (target to host) channels.
//     RttChannel down_channels[max_down_channels]; // array of down (host to target) channels.
// }
impl Rtt {
    /// The magic string expected to be found at the beginning of the RTT control block.
    pub const RTT_ID: [u8; 16] = *b"SEGGER RTT\0\0\0\0\0\0";

    // Offsets of fields in target memory in bytes
    const O_ID: usize = 0;
    const O_MAX_UP_CHANNELS: usize = 16;
    const O_MAX_DOWN_CHANNELS: usize = 20;
    const O_CHANNEL_ARRAYS: usize = 24;

    /// Reads the configured RAM window and binds to the first control block found in it.
    pub fn locate<P: MemoryAccessPort + ?Sized>(
        port: &mut P,
        config: &ScanConfig,
    ) -> Result<Rtt, Error> {
        tracing::debug!(
            "Scanning {} bytes of RAM at {:#010x}",
            config.ram_size,
            config.ram_start
        );

        let mut snapshot = Snapshot::new(config.ram_start, config.ram_size);
        snapshot.refresh_all(port)?;

        let offset = find_control_block(snapshot.bytes()).ok_or(Error::ControlBlockNotFound)?;
        tracing::debug!("RTT control block at {:#010x}", snapshot.address_of(offset));

        Self::from_snapshot(snapshot, offset)
    }

    /// Binds to a control block at index `offset` of an already filled snapshot.
    pub fn from_snapshot(snapshot: Snapshot, offset: usize) -> Result<Rtt, Error> {
        let mem = snapshot
            .bytes()
            .get(offset..)
            .ok_or(Error::ControlBlockNotFound)?;

        if mem.get(Self::O_ID..Self::O_ID + Self::RTT_ID.len()) != Some(&Self::RTT_ID[..]) {
            return Err(Error::ControlBlockNotFound);
        }

        let read_count = |field: usize| {
            mem.pread_with::<u32>(field, LE)
                .map(|v| v as usize)
                .map_err(|_| Error::ControlBlockNotFound)
        };
        let max_up_channels = read_count(Self::O_MAX_UP_CHANNELS)?;
        let max_down_channels = read_count(Self::O_MAX_DOWN_CHANNELS)?;

        if max_up_channels == 0 || max_down_channels == 0 {
            tracing::debug!(
                "Control block reports {max_up_channels} up and {max_down_channels} down channels"
            );
            return Err(Error::ControlBlockNotFound);
        }

        // *Very* conservative sanity check, most people only use a handful of RTT channels
        if max_up_channels > 255 || max_down_channels > 255 {
            return Err(Error::ControlBlockCorrupted(format!(
                "Unexpected array sizes at {:#010x}: max_up_channels={max_up_channels} max_down_channels={max_down_channels}",
                snapshot.address_of(offset)
            )));
        }

        let table_len =
            Self::O_CHANNEL_ARRAYS + (max_up_channels + max_down_channels) * BufferDescriptor::SIZE;
        if mem.len() < table_len {
            return Err(Error::ControlBlockCorrupted(format!(
                "descriptor table of {table_len} bytes does not fit in the scanned memory"
            )));
        }

        tracing::debug!(
            "Max number of buffers UP: {max_up_channels} and DOWN: {max_down_channels}"
        );

        Ok(Rtt {
            snapshot,
            offset,
            max_up_channels,
            max_down_channels,
            names: vec![None; max_up_channels + max_down_channels],
        })
    }

    /// Returns the memory address of the control block in target memory.
    pub fn ptr(&self) -> u64 {
        self.snapshot.address_of(self.offset)
    }

    /// Number of up channel slots.
    pub fn max_up_channels(&self) -> usize {
        self.max_up_channels
    }

    /// Number of down channel slots.
    pub fn max_down_channels(&self) -> usize {
        self.max_down_channels
    }

    /// Size of the control block including all descriptors.
    pub fn control_block_size(&self) -> usize {
        Self::O_CHANNEL_ARRAYS
            + (self.max_up_channels + self.max_down_channels) * BufferDescriptor::SIZE
    }

    /// The host side copy of the scanned RAM window.
    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub(crate) fn snapshot_mut(&mut self) -> &mut Snapshot {
        &mut self.snapshot
    }

    /// Re-reads the control block and all descriptors in one access.
    pub fn refresh_descriptors<P: MemoryAccessPort + ?Sized>(
        &mut self,
        port: &mut P,
    ) -> Result<(), Error> {
        let ptr = self.ptr();
        let len = self.control_block_size();
        self.snapshot.refresh(port, ptr, len)
    }

    /// Index of a channel in the descriptor table.
    fn table_index(&self, direction: Direction, number: usize) -> Result<usize, Error> {
        match direction {
            Direction::Up if number < self.max_up_channels => Ok(number),
            Direction::Down if number < self.max_down_channels => {
                Ok(self.max_up_channels + number)
            }
            _ => Err(Error::MissingChannel(number)),
        }
    }

    /// Device address of a descriptor field.
    pub(crate) fn field_address(
        &self,
        direction: Direction,
        number: usize,
        field: usize,
    ) -> Result<u64, Error> {
        let index = self.table_index(direction, number)?;
        Ok(self.ptr()
            + (Self::O_CHANNEL_ARRAYS + index * BufferDescriptor::SIZE + field) as u64)
    }

    /// Updates a descriptor field in the snapshot after the host wrote it to the target.
    pub(crate) fn store_field(
        &mut self,
        direction: Direction,
        number: usize,
        field: usize,
        value: u32,
    ) -> Result<(), Error> {
        let address = self.field_address(direction, number, field)?;
        self.snapshot
            .slice_mut(address, 4)?
            .copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// The descriptor of a channel as of the last refresh.
    pub fn descriptor(&self, direction: Direction, number: usize) -> Result<BufferDescriptor, Error> {
        let address = self.field_address(direction, number, 0)?;
        BufferDescriptor::parse(self.snapshot.slice(address, BufferDescriptor::SIZE)?)
    }

    /// The descriptor of up channel `number`.
    pub fn up_descriptor(&self, number: usize) -> Result<BufferDescriptor, Error> {
        self.descriptor(Direction::Up, number)
    }

    /// The descriptor of down channel `number`.
    pub fn down_descriptor(&self, number: usize) -> Result<BufferDescriptor, Error> {
        self.descriptor(Direction::Down, number)
    }

    /// Returns the buffer sizes of up channel `number` and of the down channel with the same
    /// number, in that order.
    pub fn buffer_sizes(&self, number: usize) -> Result<(u32, u32), Error> {
        let up = self.up_descriptor(number)?;
        let down = self.down_descriptor(number)?;
        Ok((up.size, down.size))
    }

    /// Returns the name of a channel, reading it from the target on first use.
    pub fn channel_name<P: MemoryAccessPort + ?Sized>(
        &mut self,
        port: &mut P,
        direction: Direction,
        number: usize,
    ) -> Result<Option<String>, Error> {
        let index = self.table_index(direction, number)?;
        if let Some(name) = &self.names[index] {
            return Ok(name.clone());
        }

        let descriptor = self.descriptor(direction, number)?;
        let name = if descriptor.name_ptr == 0 {
            None
        } else {
            Some(read_c_string(port, u64::from(descriptor.name_ptr))?)
        };

        self.names[index] = Some(name.clone());
        Ok(name)
    }

    /// Lists all channel slots, up channels first, resolving their names.
    pub fn describe<P: MemoryAccessPort + ?Sized>(
        &mut self,
        port: &mut P,
    ) -> Result<Vec<ChannelInfo>, Error> {
        let slots = (0..self.max_up_channels)
            .map(|n| (Direction::Up, n))
            .chain((0..self.max_down_channels).map(|n| (Direction::Down, n)))
            .collect::<Vec<_>>();

        let mut channels = Vec::with_capacity(slots.len());
        for (direction, number) in slots {
            let descriptor = self.descriptor(direction, number)?;
            let name = self.channel_name(port, direction, number)?;

            let info = ChannelInfo {
                number,
                direction,
                name,
                size: descriptor.size,
                mode: descriptor.mode().ok(),
            };
            tracing::info!("{info}");
            channels.push(info);
        }

        Ok(channels)
    }
}

/// Returns the index of the first RTT ID in `mem`, if there is one.
///
/// A match at index 0 is a valid match.
pub fn find_control_block(mem: &[u8]) -> Option<usize> {
    mem.windows(Rtt::RTT_ID.len())
        .position(|window| window == Rtt::RTT_ID)
}

/// Reads a null-terminated string from target memory. Lossy UTF-8 decoding is used.
fn read_c_string<P: MemoryAccessPort + ?Sized>(port: &mut P, ptr: u64) -> Result<String, Error> {
    let mut bytes = [0u8; MAX_NAME_LEN];
    port.read(ptr, &mut bytes)?;

    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    let name = String::from_utf8_lossy(&bytes[..len]).into_owned();
    tracing::trace!("Channel name at {ptr:#010x}: {name:?}");

    Ok(name)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fake::{FakeTarget, TargetLayout};

    #[test]
    fn finds_signature_at_offset() {
        let mut mem = vec![0u8; 256];
        mem[100..116].copy_from_slice(&Rtt::RTT_ID);
        assert_eq!(find_control_block(&mem), Some(100));
    }

    #[test]
    fn finds_signature_at_offset_zero() {
        let mut mem = vec![0u8; 64];
        mem[..16].copy_from_slice(&Rtt::RTT_ID);
        assert_eq!(find_control_block(&mem), Some(0));
    }

    #[test]
    fn signature_must_be_padded_with_zeros() {
        let mut mem = vec![0u8; 64];
        mem[8..24].copy_from_slice(b"SEGGER RTT\0garbg");
        assert_eq!(find_control_block(&mem), None);
    }

    #[test]
    fn locate_without_signature() {
        let mut target = FakeTarget::new(0x2000_0000, 0x1000);
        let result = Rtt::locate(
            &mut target,
            &ScanConfig {
                ram_start: 0x2000_0000,
                ram_size: 0x1000,
            },
        );
        assert!(matches!(result, Err(Error::ControlBlockNotFound)));
    }

    #[test]
    fn locate_rejects_zero_channel_counts() {
        let layout = TargetLayout {
            up: vec![],
            ..TargetLayout::default()
        };
        let (mut target, config) = layout.build();
        assert!(matches!(
            Rtt::locate(&mut target, &config),
            Err(Error::ControlBlockNotFound)
        ));
    }

    #[test]
    fn locate_and_describe() {
        let (mut target, config) = TargetLayout::default().build();
        let mut rtt = Rtt::locate(&mut target, &config).unwrap();

        assert_eq!(rtt.ptr(), TargetLayout::CONTROL_BLOCK);
        assert_eq!(rtt.max_up_channels(), 2);
        assert_eq!(rtt.max_down_channels(), 2);

        let channels = rtt.describe(&mut target).unwrap();
        assert_eq!(channels.len(), 4);
        assert_eq!(channels[0].name.as_deref(), Some("Terminal"));
        assert_eq!(channels[0].direction, Direction::Up);
        assert_eq!(channels[1].name.as_deref(), Some("SysView"));
        assert_eq!(channels[2].direction, Direction::Down);
        assert_eq!(channels[2].number, 0);
        assert_eq!(channels[3].name, None);

        // Names are fetched once.
        let reads = target.read_count();
        rtt.describe(&mut target).unwrap();
        assert_eq!(target.read_count(), reads);
    }

    #[test]
    fn buffer_sizes_pair_up_and_down() {
        let (mut target, config) = TargetLayout::default().build();
        let rtt = Rtt::locate(&mut target, &config).unwrap();

        assert_eq!(rtt.buffer_sizes(0).unwrap(), (256, 16));
        assert_eq!(rtt.buffer_sizes(1).unwrap(), (512, 64));
        assert!(matches!(rtt.buffer_sizes(2), Err(Error::MissingChannel(2))));
    }

    #[test]
    fn corrupted_channel_counts() {
        let mut mem = vec![0u8; 128];
        mem[..16].copy_from_slice(&Rtt::RTT_ID);
        mem[16..20].copy_from_slice(&300u32.to_le_bytes());
        mem[20..24].copy_from_slice(&1u32.to_le_bytes());

        let result = Rtt::from_snapshot(Snapshot::from_bytes(0x2000_0000, mem), 0);
        assert!(matches!(result, Err(Error::ControlBlockCorrupted(_))));
    }

    #[test]
    fn table_must_fit_in_snapshot() {
        let mut mem = vec![0u8; 64];
        mem[..16].copy_from_slice(&Rtt::RTT_ID);
        mem[16..20].copy_from_slice(&2u32.to_le_bytes());
        mem[20..24].copy_from_slice(&2u32.to_le_bytes());

        let result = Rtt::from_snapshot(Snapshot::from_bytes(0x2000_0000, mem), 0);
        assert!(matches!(result, Err(Error::ControlBlockCorrupted(_))));
    }

    #[test]
    fn device_errors_propagate() {
        let (mut target, config) = TargetLayout::default().build();
        target.fail_next_access();
        assert!(matches!(
            Rtt::locate(&mut target, &config),
            Err(Error::DeviceIo(_))
        ));
    }
}
