//! Host side implementation of the RTT (Real-Time Transfer) I/O protocol over any memory access
//! port, plus a TCP relay that tunnels one RTT channel to a SEGGER SystemView client.
//!
//! RTT implements input and output to/from a microcontroller using in-memory ring buffers and
//! memory polling. The host locates the control block by scanning a snapshot of target RAM,
//! then drains up (target to host) channels and fills down (host to target) channels by reading
//! and writing target memory through a [`MemoryAccessPort`].
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::mpsc;
//! use rtt_relay::{DownWriter, MemoryAccessPort, RttReader, Rtt, ScanConfig};
//!
//! fn run<P: MemoryAccessPort>(port: &mut P) -> Result<(), rtt_relay::Error> {
//!     // Scan 16 KiB of RAM for the control block.
//!     let mut rtt = Rtt::locate(port, &ScanConfig::default())?;
//!
//!     for channel in rtt.describe(port)? {
//!         println!("{channel}");
//!     }
//!
//!     let (tx, rx) = mpsc::channel();
//!     let mut reader = RttReader::new(tx);
//!     let mut writer = DownWriter::new(0);
//!
//!     // One read cycle, delivering drained bytes to `rx`.
//!     reader.poll(&mut rtt, port)?;
//!     for data in rx.try_iter() {
//!         println!("channel {}: {:?}", data.channel, data.bytes);
//!     }
//!
//!     // Write to down channel 0, whatever does not fit stays in `pending`.
//!     let mut pending = b"Hello, target!\n".to_vec();
//!     writer.write(&mut rtt, port, &mut pending)?;
//!     Ok(())
//! }
//! ```

mod bridge;
pub use bridge::*;

mod channel;
pub use channel::*;

#[cfg(any(test, feature = "test"))]
pub mod fake;

mod port;
pub use port::*;

mod queue;
pub use queue::*;

mod reader;
pub use reader::*;

mod rtt;
pub use rtt::*;

mod snapshot;
pub use snapshot::*;

mod writer;
pub use writer::*;

/// Error type for RTT and relay operations.
#[derive(thiserror::Error, Debug, docsplay::Display)]
pub enum Error {
    /// RTT control block not found in target memory.
    /// - Make sure RTT is initialized on the target before attaching.
    /// - Make sure the scanned RAM window covers the control block.
    /// - A control block reporting zero up or zero down channels is not initialized yet.
    ControlBlockNotFound,

    /// The control block has been corrupted: {0}
    ControlBlockCorrupted(String),

    /// Error accessing target memory: {0}
    DeviceIo(#[from] PortError),

    /// Address range {address:#010x}+{len} is outside of the scanned memory window.
    AddressOutOfWindow {
        /// Device address of the access.
        address: u64,
        /// Length of the access.
        len: usize,
    },

    /// Channel {0} does not exist.
    MissingChannel(usize),

    /// Received a hello message of {received} bytes, expected 32.
    HandshakeMismatch {
        /// Number of bytes the client sent.
        received: usize,
    },

    /// Socket error: {0}
    Socket(#[from] std::io::Error),

    /// Relay queue is full: {requested} bytes offered, {free} bytes free.
    QueueFull {
        /// Number of bytes offered.
        requested: usize,
        /// Free space left in the queue.
        free: usize,
    },
}
