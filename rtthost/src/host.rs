//! The poll loop: the only code touching the target once RTT is located.

use anyhow::Result;
use rtt_relay::{
    Bridge, ChannelData, DownWriter, MemoryAccessPort, PushMode, ReadConfig, Rtt, RttReader,
};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::time::Instant;

/// Console input the host holds while the target does not consume it. Beyond this the stdin
/// thread is left blocked on its channel.
const MAX_CONSOLE_BACKLOG: usize = 64 * 1024;

/// Channel assignment and behavior of a [`Host`].
#[derive(Debug, Clone)]
pub struct HostOptions {
    /// Channel shown on the console.
    pub console_channel: usize,
    /// Channel tunneled through the bridge, if any.
    pub bridge_channel: Option<usize>,
    pub read: ReadConfig,
    pub push_mode: PushMode,
    pub show_cycle_time: bool,
}

/// Moves data between the target, the console and the bridge.
pub struct Host<W> {
    rtt: Rtt,
    reader: RttReader<Vec<ChannelData>>,
    console: Option<DownWriter>,
    /// Writer of the bridged channel. `None` if it is the console channel, which then carries
    /// the client data after the console input.
    bridged: Option<DownWriter>,
    /// Console input not yet accepted by the target.
    console_pending: Vec<u8>,
    /// Client data not yet accepted by the target. Refilled from the bridge once empty.
    bridge_pending: Vec<u8>,
    out: W,
    options: HostOptions,
}

impl<W: Write> Host<W> {
    /// Creates the host for a located control block, writing console output to `out`.
    ///
    /// Down channels that do not exist on the target are not written.
    pub fn new(rtt: Rtt, out: W, options: HostOptions) -> Self {
        let down_writer = |channel: usize| {
            if channel < rtt.max_down_channels() {
                Some(DownWriter::with_mode(channel, options.push_mode))
            } else {
                tracing::warn!("Down channel {channel} does not exist, input is ignored");
                None
            }
        };

        let console = down_writer(options.console_channel);
        let bridged = options
            .bridge_channel
            .filter(|&channel| channel != options.console_channel)
            .and_then(down_writer);

        Self {
            reader: RttReader::with_config(Vec::new(), options.read.clone()),
            rtt,
            console,
            bridged,
            console_pending: Vec::new(),
            bridge_pending: Vec::new(),
            out,
            options,
        }
    }

    /// The RTT interface.
    pub fn rtt(&self) -> &Rtt {
        &self.rtt
    }

    fn shares_channel(&self) -> bool {
        self.options.bridge_channel == Some(self.options.console_channel)
    }

    /// Collects console input from `rx` without blocking, as much as the backlog has room for.
    fn receive_input(&self, rx: &Receiver<Vec<u8>>) -> Option<Vec<u8>> {
        let room = MAX_CONSOLE_BACKLOG.saturating_sub(self.console_pending.len());

        let mut bytes = Vec::new();
        while bytes.len() < room {
            match rx.try_recv() {
                Ok(chunk) => bytes.extend(chunk),
                Err(_) => break,
            }
        }
        (!bytes.is_empty()).then_some(bytes)
    }

    /// Runs one cycle. `input` is console input received since the last cycle.
    pub fn cycle<P: MemoryAccessPort + ?Sized>(
        &mut self,
        port: &mut P,
        input: Option<Vec<u8>>,
        bridge: Option<&Bridge>,
    ) -> Result<()> {
        let start = Instant::now();

        self.reader.poll(&mut self.rtt, port)?;

        let mut to_bridge = Vec::new();
        for data in self.reader.sink_mut().drain(..) {
            if data.channel == self.options.console_channel {
                self.out.write_all(&data.bytes)?;
                self.out.flush()?;
            }
            if Some(data.channel) == self.options.bridge_channel {
                to_bridge.extend_from_slice(&data.bytes);
            }
        }

        if let Some(input) = input {
            self.console_pending.extend(input);
        }

        if let Some(console) = &mut self.console {
            if !self.console_pending.is_empty() {
                console.write(&mut self.rtt, port, &mut self.console_pending)?;
            }
        }

        if let Some(bridge) = bridge {
            // Whatever the target does not take stays in the bridge queue, which is bounded.
            if self.bridge_pending.is_empty() {
                self.bridge_pending = bridge.drain_to_device();
            }

            let writer = if self.shares_channel() {
                self.console.as_mut()
            } else {
                self.bridged.as_mut()
            };
            if let Some(writer) = writer {
                if !self.bridge_pending.is_empty() {
                    writer.write(&mut self.rtt, port, &mut self.bridge_pending)?;
                }
            }

            bridge.offer_from_device(&to_bridge);
        }

        if self.options.show_cycle_time {
            tracing::info!("Cycle time: {:?}", start.elapsed());
        }

        Ok(())
    }

    /// Cycles until `stop` is set or the target fails.
    pub fn run<P: MemoryAccessPort + ?Sized>(
        &mut self,
        port: &mut P,
        stop: &AtomicBool,
        input: Option<&Receiver<Vec<u8>>>,
        bridge: Option<&Bridge>,
    ) -> Result<()> {
        while !stop.load(Ordering::Relaxed) {
            let received = input.and_then(|rx| self.receive_input(rx));

            self.cycle(port, received, bridge)?;
        }

        Ok(())
    }
}
