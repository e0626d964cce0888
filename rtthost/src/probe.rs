use probe_rs::probe::list::Lister;
use probe_rs::probe::DebugProbeInfo;
use probe_rs::{config::TargetSelector, Core, MemoryInterface, Permissions, Session};
use rtt_relay::{AccessWidth, MemoryAccessPort, PortError};

/// Which probe and target to attach to.
#[derive(Debug, Clone)]
pub struct ProbeParams {
    /// Index into the list of connected probes.
    pub probe: usize,
    /// Target chip, auto-detected if `None`.
    pub chip: Option<String>,
    /// Address of the device identification register.
    pub idcode_address: u64,
}

/// Target memory access through a probe-rs debug session, always on core 0.
pub struct ProbeRsPort {
    session: Option<Session>,
    idcode_address: u64,
}

fn transport(err: impl Into<anyhow::Error>) -> PortError {
    PortError::Transport(err.into())
}

impl ProbeRsPort {
    fn core(&mut self) -> Result<Core<'_>, PortError> {
        let session = self.session.as_mut().ok_or(PortError::NotOpen)?;
        session.core(0).map_err(transport)
    }
}

impl MemoryAccessPort for ProbeRsPort {
    type Params = ProbeParams;

    fn open(params: &ProbeParams) -> Result<Self, PortError> {
        let probes = Lister::new().list_all();

        if probes.is_empty() {
            return Err(transport(anyhow::anyhow!(
                "No debug probes available. Make sure your probe is plugged in, supported and up-to-date."
            )));
        }

        let Some(info) = probes.get(params.probe) else {
            list_probes(std::io::stderr(), &probes);
            return Err(transport(anyhow::anyhow!(
                "Probe {} does not exist.",
                params.probe
            )));
        };

        let probe = info.open().map_err(transport)?;

        let target_selector = params
            .chip
            .clone()
            .map(TargetSelector::Unspecified)
            .unwrap_or(TargetSelector::Auto);

        let session = match probe.attach(target_selector, Permissions::default()) {
            Ok(session) => session,
            Err(err) => {
                if params.chip.is_none() {
                    if let probe_rs::Error::ChipNotFound(_) = err {
                        tracing::warn!("Use '--chip' to specify the target chip type manually");
                    }
                }
                return Err(transport(err));
            }
        };

        tracing::info!("Attached to {}", session.target().name);

        Ok(Self {
            session: Some(session),
            idcode_address: params.idcode_address,
        })
    }

    fn close(&mut self) -> Result<(), PortError> {
        self.session = None;
        Ok(())
    }

    fn read_memory(
        &mut self,
        address: u64,
        width: AccessWidth,
        data: &mut [u8],
    ) -> Result<(), PortError> {
        width.check(address, data.len())?;
        let mut core = self.core()?;

        match width {
            AccessWidth::Auto => core.read(address, data),
            AccessWidth::U8 => core.read_8(address, data),
            AccessWidth::U16 => {
                let mut halves = vec![0u16; data.len() / 2];
                core.read_16(address, &mut halves).map(|()| {
                    for (chunk, half) in data.chunks_exact_mut(2).zip(halves) {
                        chunk.copy_from_slice(&half.to_le_bytes());
                    }
                })
            }
            AccessWidth::U32 => {
                let mut words = vec![0u32; data.len() / 4];
                core.read_32(address, &mut words).map(|()| {
                    for (chunk, word) in data.chunks_exact_mut(4).zip(words) {
                        chunk.copy_from_slice(&word.to_le_bytes());
                    }
                })
            }
        }
        .map_err(transport)
    }

    fn write_memory(
        &mut self,
        address: u64,
        width: AccessWidth,
        data: &[u8],
    ) -> Result<(), PortError> {
        width.check(address, data.len())?;
        let mut core = self.core()?;

        match width {
            AccessWidth::Auto => core.write(address, data),
            AccessWidth::U8 => core.write_8(address, data),
            AccessWidth::U16 => {
                let halves = data
                    .chunks_exact(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect::<Vec<_>>();
                core.write_16(address, &halves)
            }
            AccessWidth::U32 => {
                let words = data
                    .chunks_exact(4)
                    .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect::<Vec<_>>();
                core.write_32(address, &words)
            }
        }
        .map_err(transport)
    }

    fn identify(&mut self) -> Result<u32, PortError> {
        let address = self.idcode_address;
        self.core()?.read_word_32(address).map_err(transport)
    }
}

/// Prints the connected probes, numbered for `--probe`.
pub fn list_probes(mut stream: impl std::io::Write, probes: &[DebugProbeInfo]) {
    // Nothing sensible to do if the listing itself cannot be printed.
    let _ = writeln!(stream, "Available probes:");

    for (i, probe) in probes.iter().enumerate() {
        let _ = writeln!(
            stream,
            "  {}: {} {}",
            i,
            probe.identifier,
            probe
                .serial_number
                .as_deref()
                .unwrap_or("(no serial number)")
        );
    }
}

/// Lists all connected probes.
pub fn available_probes() -> Vec<DebugProbeInfo> {
    Lister::new().list_all()
}
