use rtt_relay::{server_hello, Bridge, BridgeConfig, SystemViewVersion, HELLO_SIZE};
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn spawn_bridge() -> (Bridge, Arc<AtomicBool>) {
    let stop = Arc::new(AtomicBool::new(false));
    let config = BridgeConfig {
        address: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        handshake_timeout_ms: 500,
        ..Default::default()
    };
    let bridge = Bridge::spawn(config, stop.clone()).unwrap();
    (bridge, stop)
}

fn connect(bridge: &Bridge) -> TcpStream {
    let client = TcpStream::connect(bridge.local_addr()).unwrap();
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    client
}

fn wait_for(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out");
        thread::sleep(Duration::from_millis(5));
    }
}

fn shutdown(bridge: Bridge, stop: Arc<AtomicBool>) {
    stop.store(true, Ordering::Relaxed);
    bridge.join().unwrap();
}

#[test]
fn handshake_returns_server_hello() {
    let (bridge, stop) = spawn_bridge();
    let mut client = connect(&bridge);

    client.write_all(&[0x55; HELLO_SIZE]).unwrap();
    let mut hello = [0; HELLO_SIZE];
    client.read_exact(&mut hello).unwrap();

    assert_eq!(hello, server_hello(SystemViewVersion::default()));
    wait_for(|| bridge.is_connected());

    shutdown(bridge, stop);
}

#[test]
fn short_hello_is_rejected() {
    let (bridge, stop) = spawn_bridge();
    let mut client = connect(&bridge);

    client.write_all(&[0; 10]).unwrap();
    client.shutdown(Shutdown::Write).unwrap();

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).unwrap();
    assert!(reply.is_empty());
    assert!(!bridge.is_connected());

    shutdown(bridge, stop);
}

#[test]
fn silent_client_times_out() {
    let (bridge, stop) = spawn_bridge();
    let mut client = connect(&bridge);

    let mut reply = Vec::new();
    client.read_to_end(&mut reply).unwrap();
    assert!(reply.is_empty());

    shutdown(bridge, stop);
}

#[test]
fn offers_are_dropped_without_client() {
    let (bridge, stop) = spawn_bridge();

    bridge.offer_from_device(b"nobody listens");
    assert_eq!(bridge.pending_to_host(), 0);

    shutdown(bridge, stop);
}

#[test]
fn relays_both_directions() {
    let (bridge, stop) = spawn_bridge();
    let mut client = connect(&bridge);

    client.write_all(&[0; HELLO_SIZE]).unwrap();
    let mut hello = [0; HELLO_SIZE];
    client.read_exact(&mut hello).unwrap();
    wait_for(|| bridge.is_connected());

    bridge.offer_from_device(b"telemetry");
    let mut data = [0; 9];
    client.read_exact(&mut data).unwrap();
    assert_eq!(&data, b"telemetry");

    client.write_all(b"command").unwrap();
    wait_for(|| bridge.pending_to_device() == 7);
    assert_eq!(bridge.drain_to_device(), b"command");
    assert!(bridge.drain_to_device().is_empty());

    shutdown(bridge, stop);
}

#[test]
fn large_blocks_arrive_in_order() {
    let (bridge, stop) = spawn_bridge();
    let mut client = connect(&bridge);

    client.write_all(&[0; HELLO_SIZE]).unwrap();
    let mut hello = [0; HELLO_SIZE];
    client.read_exact(&mut hello).unwrap();
    wait_for(|| bridge.is_connected());

    let payload = (0..10_000u32).map(|i| i as u8).collect::<Vec<_>>();
    bridge.offer_from_device(&payload);

    let mut received = vec![0; payload.len()];
    client.read_exact(&mut received).unwrap();
    assert_eq!(received, payload);

    shutdown(bridge, stop);
}

#[test]
fn accepts_next_client_after_disconnect() {
    let (bridge, stop) = spawn_bridge();

    for _ in 0..2 {
        let mut client = connect(&bridge);
        client.write_all(&[0; HELLO_SIZE]).unwrap();
        let mut hello = [0; HELLO_SIZE];
        client.read_exact(&mut hello).unwrap();
        wait_for(|| bridge.is_connected());

        drop(client);
        wait_for(|| !bridge.is_connected());
    }

    bridge.offer_from_device(b"after");
    assert_eq!(bridge.pending_to_host(), 0);

    shutdown(bridge, stop);
}

#[test]
fn stop_flag_ends_connected_session() {
    let (bridge, stop) = spawn_bridge();
    let mut client = connect(&bridge);

    client.write_all(&[0; HELLO_SIZE]).unwrap();
    let mut hello = [0; HELLO_SIZE];
    client.read_exact(&mut hello).unwrap();
    wait_for(|| bridge.is_connected());

    shutdown(bridge, stop);

    // The bridge closed its end.
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).unwrap();
    assert!(rest.is_empty());
}
