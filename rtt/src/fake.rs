//! An in-memory target for testing.
//!
//! [`FakeTarget`] implements [`MemoryAccessPort`] over a set of plain byte vectors and records
//! every access, so tests can check both the data the host moves and how many round trips it
//! needs. [`TargetLayout`] builds a target with a ready RTT control block in its RAM and
//! provides the firmware side of the ring buffers.

use crate::{AccessWidth, BufferDescriptor, Direction, MemoryAccessPort, PortError, Rtt, ScanConfig};

#[derive(Debug, Clone)]
struct Region {
    base: u64,
    data: Vec<u8>,
}

impl Region {
    fn range(&self, address: u64, len: usize) -> Option<std::ops::Range<usize>> {
        let start = address.checked_sub(self.base)? as usize;
        let end = start.checked_add(len)?;
        (end <= self.data.len()).then_some(start..end)
    }
}

/// A memory access recorded by [`FakeTarget`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// A read of `len` bytes at the address.
    Read(u64, usize),
    /// A write of `len` bytes at the address.
    Write(u64, usize),
}

/// Target memory made of plain byte vectors.
#[derive(Debug, Clone, Default)]
pub struct FakeTarget {
    regions: Vec<Region>,
    log: Vec<Access>,
    fail_next: bool,
    open: bool,
    id_code: u32,
    control_block: Option<(u64, usize)>,
}

/// Parameters for [`FakeTarget::open`].
#[derive(Debug, Clone)]
pub struct FakeParams {
    /// Base address of the RAM region.
    pub ram_start: u64,
    /// Size of the RAM region.
    pub ram_size: usize,
}

impl FakeTarget {
    /// Creates a target with a single zeroed RAM region.
    pub fn new(ram_start: u64, ram_size: usize) -> Self {
        Self {
            regions: vec![Region {
                base: ram_start,
                data: vec![0; ram_size],
            }],
            open: true,
            id_code: 0x1000_6468,
            ..Default::default()
        }
    }

    /// Adds another zeroed memory region.
    pub fn add_region(&mut self, base: u64, size: usize) {
        self.regions.push(Region {
            base,
            data: vec![0; size],
        });
    }

    /// Makes the next read or write fail with a transport error.
    pub fn fail_next_access(&mut self) {
        self.fail_next = true;
    }

    /// All accesses made through the port so far.
    pub fn accesses(&self) -> &[Access] {
        &self.log
    }

    /// Forgets the recorded accesses.
    pub fn clear_accesses(&mut self) {
        self.log.clear();
    }

    /// Number of reads made through the port.
    pub fn read_count(&self) -> usize {
        self.log
            .iter()
            .filter(|a| matches!(a, Access::Read(..)))
            .count()
    }

    /// Number of writes made through the port.
    pub fn write_count(&self) -> usize {
        self.log
            .iter()
            .filter(|a| matches!(a, Access::Write(..)))
            .count()
    }

    fn region(&self, address: u64, len: usize) -> Option<(usize, std::ops::Range<usize>)> {
        self.regions
            .iter()
            .enumerate()
            .find_map(|(i, r)| r.range(address, len).map(|range| (i, range)))
    }

    /// Reads memory without going through the port.
    pub fn peek(&self, address: u64, len: usize) -> Vec<u8> {
        let (i, range) = self
            .region(address, len)
            .unwrap_or_else(|| panic!("peek outside of memory at {address:#010x}"));
        self.regions[i].data[range].to_vec()
    }

    /// Writes memory without going through the port.
    pub fn poke(&mut self, address: u64, bytes: &[u8]) {
        let (i, range) = self
            .region(address, bytes.len())
            .unwrap_or_else(|| panic!("poke outside of memory at {address:#010x}"));
        self.regions[i].data[range].copy_from_slice(bytes);
    }

    fn peek_u32(&self, address: u64) -> u32 {
        let bytes = self.peek(address, 4);
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    fn poke_u32(&mut self, address: u64, value: u32) {
        self.poke(address, &value.to_le_bytes());
    }

    fn descriptor_address(&self, direction: Direction, number: usize) -> u64 {
        let (ptr, max_up) = self
            .control_block
            .expect("target was not built from a TargetLayout");
        let index = match direction {
            Direction::Up => number,
            Direction::Down => max_up + number,
        };
        ptr + 24 + (index * BufferDescriptor::SIZE) as u64
    }

    /// Reads a descriptor straight from target memory.
    pub fn descriptor(&self, direction: Direction, number: usize) -> BufferDescriptor {
        let address = self.descriptor_address(direction, number);
        BufferDescriptor::parse(&self.peek(address, BufferDescriptor::SIZE))
            .expect("descriptor in range")
    }

    /// Sets the read and write offsets of a channel, as the firmware would.
    pub fn set_offsets(&mut self, direction: Direction, number: usize, read: u32, write: u32) {
        let address = self.descriptor_address(direction, number);
        self.poke_u32(address + 12, write);
        self.poke_u32(address + 16, read);
    }

    /// Firmware side of an up channel: appends `bytes` to the ring and advances the write
    /// offset. Returns how many bytes fit.
    pub fn up_push(&mut self, number: usize, bytes: &[u8]) -> usize {
        let d = self.descriptor(Direction::Up, number);
        let n = (d.available_write_space() as usize).min(bytes.len());

        let mut write = d.write;
        for &b in &bytes[..n] {
            self.poke(u64::from(d.buffer_ptr + write), &[b]);
            write = (write + 1) % d.size;
        }

        let address = self.descriptor_address(Direction::Up, number);
        self.poke_u32(address + 12, write);
        n
    }

    /// Firmware side of a down channel: consumes all unread bytes.
    pub fn down_pop(&mut self, number: usize) -> Vec<u8> {
        let d = self.descriptor(Direction::Down, number);
        let data = self.peek(u64::from(d.buffer_ptr), d.size as usize);
        let (bytes, read) = crate::drain_ring(&data, d.read, d.write);

        let address = self.descriptor_address(Direction::Down, number);
        self.poke_u32(address + 16, read);
        bytes
    }

    fn check(&mut self, address: u64, width: AccessWidth, len: usize) -> Result<(), PortError> {
        if !self.open {
            return Err(PortError::NotOpen);
        }
        if std::mem::take(&mut self.fail_next) {
            return Err(PortError::Transport(anyhow::anyhow!("injected failure")));
        }
        width.check(address, len)
    }
}

impl MemoryAccessPort for FakeTarget {
    type Params = FakeParams;

    fn open(params: &Self::Params) -> Result<Self, PortError> {
        Ok(Self::new(params.ram_start, params.ram_size))
    }

    fn close(&mut self) -> Result<(), PortError> {
        self.open = false;
        Ok(())
    }

    fn read_memory(
        &mut self,
        address: u64,
        width: AccessWidth,
        data: &mut [u8],
    ) -> Result<(), PortError> {
        self.check(address, width, data.len())?;
        let (i, range) = self
            .region(address, data.len())
            .ok_or(PortError::OutOfRange {
                address,
                len: data.len(),
            })?;

        data.copy_from_slice(&self.regions[i].data[range]);
        self.log.push(Access::Read(address, data.len()));
        Ok(())
    }

    fn write_memory(
        &mut self,
        address: u64,
        width: AccessWidth,
        data: &[u8],
    ) -> Result<(), PortError> {
        self.check(address, width, data.len())?;
        let (i, range) = self
            .region(address, data.len())
            .ok_or(PortError::OutOfRange {
                address,
                len: data.len(),
            })?;

        self.regions[i].data[range].copy_from_slice(data);
        self.log.push(Access::Write(address, data.len()));
        Ok(())
    }

    fn identify(&mut self) -> Result<u32, PortError> {
        self.check(0, AccessWidth::Auto, 0)?;
        Ok(self.id_code)
    }
}

/// One channel of a [`TargetLayout`].
#[derive(Debug, Clone)]
pub struct ChannelLayout {
    /// Name stored in flash, if any.
    pub name: Option<&'static str>,
    /// Buffer size. 0 leaves the slot unused.
    pub size: u32,
}

impl ChannelLayout {
    /// A named channel.
    pub fn named(name: &'static str, size: u32) -> Self {
        Self {
            name: Some(name),
            size,
        }
    }

    /// An unnamed channel.
    pub fn unnamed(size: u32) -> Self {
        Self { name: None, size }
    }
}

/// Describes the RTT setup of a [`FakeTarget`].
///
/// RAM is 4 KiB at `0x2000_0000` with the control block at [`TargetLayout::CONTROL_BLOCK`]
/// and the ring buffers packed after it. Names live in a separate flash region.
#[derive(Debug, Clone)]
pub struct TargetLayout {
    /// Up channels.
    pub up: Vec<ChannelLayout>,
    /// Down channels.
    pub down: Vec<ChannelLayout>,
}

impl Default for TargetLayout {
    fn default() -> Self {
        Self {
            up: vec![
                ChannelLayout::named("Terminal", 256),
                ChannelLayout::named("SysView", 512),
            ],
            down: vec![
                ChannelLayout::named("Terminal", 16),
                ChannelLayout::unnamed(64),
            ],
        }
    }
}

impl TargetLayout {
    /// Start of RAM.
    pub const RAM_START: u64 = 0x2000_0000;
    /// Size of RAM.
    pub const RAM_SIZE: usize = 0x1000;
    /// Location of the control block.
    pub const CONTROL_BLOCK: u64 = 0x2000_0400;
    /// Start of flash, where channel names are stored.
    pub const FLASH_START: u64 = 0x0800_0000;

    const BUFFERS_START: u64 = 0x2000_0800;

    /// Builds the target, returning it with a scan configuration covering its RAM.
    pub fn build(&self) -> (FakeTarget, ScanConfig) {
        let mut target = FakeTarget::new(Self::RAM_START, Self::RAM_SIZE);
        target.add_region(Self::FLASH_START, 0x400);
        target.control_block = Some((Self::CONTROL_BLOCK, self.up.len()));

        let mut header = Rtt::RTT_ID.to_vec();
        header.extend_from_slice(&(self.up.len() as u32).to_le_bytes());
        header.extend_from_slice(&(self.down.len() as u32).to_le_bytes());
        target.poke(Self::CONTROL_BLOCK, &header);

        let mut name_ptr = Self::FLASH_START;
        let mut buffer_ptr = Self::BUFFERS_START;
        let mut descriptor = Self::CONTROL_BLOCK + 24;

        for channel in self.up.iter().chain(self.down.iter()) {
            let name = match channel.name {
                Some(name) => {
                    let ptr = name_ptr;
                    let mut bytes = name.as_bytes().to_vec();
                    bytes.push(0);
                    target.poke(ptr, &bytes);
                    name_ptr += bytes.len() as u64;
                    ptr as u32
                }
                None => 0,
            };

            let buffer = if channel.size > 0 {
                let ptr = buffer_ptr;
                buffer_ptr += u64::from(channel.size.next_multiple_of(16));
                ptr as u32
            } else {
                0
            };

            for (i, value) in [name, buffer, channel.size, 0, 0, 0].into_iter().enumerate() {
                target.poke_u32(descriptor + 4 * i as u64, value);
            }
            descriptor += BufferDescriptor::SIZE as u64;
        }

        assert!(
            buffer_ptr <= Self::RAM_START + Self::RAM_SIZE as u64,
            "channel buffers do not fit in RAM"
        );

        let config = ScanConfig {
            ram_start: Self::RAM_START,
            ram_size: Self::RAM_SIZE,
        };
        (target, config)
    }
}
