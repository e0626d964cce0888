//! TCP relay between one RTT channel and a SEGGER SystemView client.
//!
//! The bridge listens on a port in its own thread and serves one client at a time. After the
//! SystemView hello exchange the socket is a transparent byte tunnel: bytes the poll loop
//! drained from the target are offered with [`Bridge::offer_from_device`] and sent to the
//! client, bytes from the client are collected for [`Bridge::drain_to_device`]. The bridge
//! itself never touches the target.

use crate::{Error, RelayQueue};
use serde::{Deserialize, Serialize};
use std::io::{self, ErrorKind, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Size of the hello messages exchanged when a client connects.
pub const HELLO_SIZE: usize = 32;

/// How long the acceptor sleeps when no client is waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// SystemView version announced in the server hello.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemViewVersion {
    /// Major version.
    pub major: u8,
    /// Printed with two digits.
    pub minor: u8,
    /// Printed with two digits.
    pub revision: u8,
}

impl Default for SystemViewVersion {
    fn default() -> Self {
        Self {
            major: 3,
            minor: 10,
            revision: 0,
        }
    }
}

/// The server hello: an identification string padded with zeroes.
pub fn server_hello(version: SystemViewVersion) -> [u8; HELLO_SIZE] {
    let SystemViewVersion {
        major,
        minor,
        revision,
    } = version;
    let id = format!("SEGGER SystemView V{major}.{minor:02}.{revision:02}");

    let mut hello = [0; HELLO_SIZE];
    let len = id.len().min(HELLO_SIZE);
    hello[..len].copy_from_slice(&id.as_bytes()[..len]);
    hello
}

/// Configuration of a [`Bridge`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Address to listen on.
    pub address: IpAddr,
    /// Port to listen on. 0 picks a free port.
    pub port: u16,
    /// Largest block sent to the client in one write.
    pub chunk_size: usize,
    /// How long the session waits for target data before checking the socket, in milliseconds.
    pub dequeue_timeout_ms: u64,
    /// How long a new client has to send its hello, in milliseconds.
    pub handshake_timeout_ms: u64,
    /// Limit for each relay queue in bytes, `None` for no limit.
    pub queue_capacity: Option<usize>,
    /// Version announced to the client.
    pub systemview_version: SystemViewVersion,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 19111,
            chunk_size: 1400,
            dequeue_timeout_ms: 10,
            handshake_timeout_ms: 1000,
            queue_capacity: Some(1024 * 1024),
            systemview_version: SystemViewVersion::default(),
        }
    }
}

impl BridgeConfig {
    fn dequeue_timeout(&self) -> Duration {
        Duration::from_millis(self.dequeue_timeout_ms)
    }

    fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms.max(1))
    }

    fn queue(&self) -> RelayQueue {
        match self.queue_capacity {
            Some(capacity) => RelayQueue::with_capacity(capacity),
            None => RelayQueue::new(),
        }
    }
}

/// State shared between the bridge handle and its thread.
#[derive(Debug)]
struct Shared {
    device_to_host: RelayQueue,
    host_to_device: RelayQueue,
    connected: AtomicBool,
}

/// Handle to a running bridge.
#[derive(Debug)]
pub struct Bridge {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    thread: Option<JoinHandle<()>>,
}

impl Bridge {
    /// Binds the listening socket and starts the bridge thread.
    ///
    /// The thread runs until `stop` is set, including while it waits for a client.
    pub fn spawn(config: BridgeConfig, stop: Arc<AtomicBool>) -> Result<Self, Error> {
        let listener = TcpListener::bind((config.address, config.port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            device_to_host: config.queue(),
            host_to_device: config.queue(),
            connected: AtomicBool::new(false),
        });

        let thread = thread::Builder::new().name("rtt-bridge".to_string()).spawn({
            let shared = shared.clone();
            move || accept_loop(listener, &config, &shared, &stop)
        })?;

        tracing::info!("Bridge listening on {local_addr}");

        Ok(Self {
            shared,
            local_addr,
            thread: Some(thread),
        })
    }

    /// Address the bridge is listening on.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns `true` while a client is connected and past the hello exchange.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Queues bytes drained from the target for the client.
    ///
    /// Without a client the bytes are dropped, nothing is buffered for a later connection.
    pub fn offer_from_device(&self, data: &[u8]) {
        if data.is_empty() || !self.is_connected() {
            return;
        }

        if let Err(e) = self.shared.device_to_host.push_bulk(data) {
            tracing::warn!("Dropping target data for the bridge client: {e}");
        }
    }

    /// Takes all bytes the client sent since the last call.
    pub fn drain_to_device(&self) -> Vec<u8> {
        self.shared.host_to_device.take_all()
    }

    /// Number of bytes from the client waiting for [`Bridge::drain_to_device`].
    pub fn pending_to_device(&self) -> usize {
        self.shared.host_to_device.len_approx()
    }

    /// Number of target bytes not yet sent to the client.
    pub fn pending_to_host(&self) -> usize {
        self.shared.device_to_host.len_approx()
    }

    /// Waits for the bridge thread to finish. Set the stop flag first.
    pub fn join(mut self) -> Result<(), Error> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| Error::Socket(io::Error::other("the bridge thread panicked"))),
            None => Ok(()),
        }
    }
}

fn accept_loop(listener: TcpListener, config: &BridgeConfig, shared: &Shared, stop: &AtomicBool) {
    while !stop.load(Ordering::Relaxed) {
        let (mut stream, addr) = match listener.accept() {
            Ok(connection) => connection,
            // No connection yet
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                thread::sleep(POLL_INTERVAL);
                continue;
            }
            Err(e) => {
                tracing::error!("Failed to accept a bridge connection: {e}");
                thread::sleep(POLL_INTERVAL);
                continue;
            }
        };

        tracing::info!("Bridge client connected from {addr}");

        if let Err(e) = handshake(&mut stream, config) {
            tracing::warn!("Dropping bridge client {addr}: {e}");
            continue;
        }

        // Target data queued before this client arrived is stale.
        shared.device_to_host.clear();
        shared.connected.store(true, Ordering::Release);

        let result = relay(&mut stream, config, shared, stop);
        shared.connected.store(false, Ordering::Release);

        match result {
            Ok(()) => tracing::info!("Bridge client {addr} disconnected"),
            Err(e) => tracing::warn!("Bridge connection to {addr} dropped: {e}"),
        }
    }

    tracing::debug!("Bridge stopped");
}

/// Exchanges the hello messages on a freshly accepted connection and leaves the socket in
/// non-blocking mode.
fn handshake(stream: &mut TcpStream, config: &BridgeConfig) -> Result<(), Error> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(config.handshake_timeout()))?;

    let mut hello = [0; HELLO_SIZE];
    let mut received = 0;
    while received < HELLO_SIZE {
        match stream.read(&mut hello[received..]) {
            Ok(0) => return Err(Error::HandshakeMismatch { received }),
            Ok(n) => received += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                return Err(Error::HandshakeMismatch { received });
            }
            Err(e) => return Err(e.into()),
        }
    }

    stream.write_all(&server_hello(config.systemview_version))?;

    stream.set_read_timeout(None)?;
    stream.set_nonblocking(true)?;
    Ok(())
}

/// Moves bytes in both directions until the client disconnects or `stop` is set.
fn relay(
    stream: &mut TcpStream,
    config: &BridgeConfig,
    shared: &Shared,
    stop: &AtomicBool,
) -> Result<(), Error> {
    let mut buffer = vec![0; config.chunk_size.max(1)];

    while !stop.load(Ordering::Relaxed) {
        let chunk = shared
            .device_to_host
            .pop_bulk_timeout(config.chunk_size.max(1), config.dequeue_timeout());
        if !chunk.is_empty() {
            write_fully(stream, &chunk, stop)?;
        }

        match stream.read(&mut buffer) {
            // Peer closed the connection
            Ok(0) => return Ok(()),
            Ok(n) => {
                if let Err(e) = shared.host_to_device.push_bulk(&buffer[..n]) {
                    tracing::warn!("Dropping client data for the target: {e}");
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Writes all of `data` to a non-blocking socket. Gives up silently once `stop` is set.
fn write_fully(stream: &mut TcpStream, mut data: &[u8], stop: &AtomicBool) -> io::Result<()> {
    while !data.is_empty() {
        match stream.write(data) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => data = &data[n..],
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if stop.load(Ordering::Relaxed) {
                    return Ok(());
                }
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Instant;

    fn local_config() -> BridgeConfig {
        BridgeConfig {
            address: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            ..Default::default()
        }
    }

    fn wait_for(mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn hello_message() {
        let hello = server_hello(SystemViewVersion::default());
        assert_eq!(&hello[..26], b"SEGGER SystemView V3.10.00");
        assert!(hello[26..].iter().all(|&b| b == 0));
    }

    #[test]
    fn hello_message_other_version() {
        let hello = server_hello(SystemViewVersion {
            major: 3,
            minor: 2,
            revision: 14,
        });
        assert_eq!(&hello[..25], b"SEGGER SystemView V3.02.1");
        assert_eq!(&hello[25..27], b"4\0");
    }

    #[test]
    fn major_version_is_not_padded() {
        let hello = server_hello(SystemViewVersion {
            major: 10,
            minor: 1,
            revision: 2,
        });
        assert_eq!(&hello[..27], b"SEGGER SystemView V10.01.02");
        assert_eq!(hello[27], 0);
    }

    #[test]
    fn stale_data_is_purged_on_connect() {
        let stop = Arc::new(AtomicBool::new(false));
        let bridge = Bridge::spawn(local_config(), stop.clone()).unwrap();

        // Left over from an earlier session.
        bridge.shared.device_to_host.push_bulk(b"stale").unwrap();

        let mut client = TcpStream::connect(bridge.local_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        client.write_all(&[0; HELLO_SIZE]).unwrap();
        let mut hello = [0; HELLO_SIZE];
        client.read_exact(&mut hello).unwrap();

        wait_for(|| bridge.is_connected());
        bridge.offer_from_device(b"fresh");

        let mut data = [0; 5];
        client.read_exact(&mut data).unwrap();
        assert_eq!(&data, b"fresh");

        stop.store(true, Ordering::Relaxed);
        bridge.join().unwrap();
    }
}
