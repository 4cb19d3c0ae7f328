//! End-to-end tests over a pair of devices wired through the in-memory
//! tunnel and bind implementations.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;

use tunguard::crypto::x25519;
use tunguard::device::Device;
use tunguard::net::mem::{MemBind, MemNetwork};
use tunguard::tunnel::{MemTun, MemTunHandle};

const PORT_A: u16 = 51820;
const PORT_B: u16 = 51821;

/// Build a minimal IPv4 packet with the given addresses and total size
fn ipv4_packet(src: [u8; 4], dst: [u8; 4], total_len: usize, fill: u8) -> Vec<u8> {
    assert!(total_len >= 20);
    let mut p = vec![fill; total_len];
    p[0] = 0x45;
    p[1] = 0;
    p[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    p[4..12].fill(0);
    p[12..16].copy_from_slice(&src);
    p[16..20].copy_from_slice(&dst);
    p
}

struct TestNode {
    device: Arc<Device<MemTun, MemBind>>,
    host: MemTunHandle,
}

/// Stand up one configured device via a set transcript
async fn make_node(
    network: &Arc<MemNetwork>,
    name: &str,
    port: u16,
    private: [u8; 32],
    peer_public: [u8; 32],
    peer_allowed: &str,
    peer_endpoint: Option<u16>,
) -> TestNode {
    let (tun, host) = MemTun::new(name, 1420);
    let device = Device::new(tun, network.bind());

    let mut transcript = format!(
        "private_key={}\nlisten_port={port}\npublic_key={}\nallowed_ip={peer_allowed}\n",
        hex::encode(private),
        hex::encode(peer_public),
    );
    if let Some(ep_port) = peer_endpoint {
        transcript.push_str(&format!("endpoint=127.0.0.1:{ep_port}\n"));
    }
    device.uapi_set(&transcript).await.expect("valid transcript");
    device.up().await.expect("device comes up");

    TestNode { device, host }
}

/// The S1 topology: A(10.0.0.1) <-> B(10.0.0.2), A knows B's endpoint
async fn make_pair(network: &Arc<MemNetwork>) -> (TestNode, TestNode) {
    let (a_priv, a_pub) = x25519::generate_keypair();
    let (b_priv, b_pub) = x25519::generate_keypair();

    let a = make_node(
        network,
        "tun-a",
        PORT_A,
        a_priv,
        b_pub,
        "10.0.0.2/32",
        Some(PORT_B),
    )
    .await;
    let b = make_node(network, "tun-b", PORT_B, b_priv, a_pub, "10.0.0.1/32", None).await;
    (a, b)
}

async fn expect_frame(host: &mut MemTunHandle) -> Vec<u8> {
    timeout(Duration::from_secs(5), host.recv())
        .await
        .expect("frame within deadline")
        .expect("tunnel still open")
}

/// Parse a uapi get dump into device lines plus per-peer blocks so
/// comparisons survive peer iteration order
fn normalize_get(dump: &str) -> (Vec<String>, BTreeMap<String, Vec<String>>) {
    let mut device_lines = Vec::new();
    let mut peers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut current: Option<String> = None;

    for line in dump.lines() {
        if let Some(key) = line.strip_prefix("public_key=") {
            current = Some(key.to_string());
            peers.insert(key.to_string(), Vec::new());
            continue;
        }
        match &current {
            None => device_lines.push(line.to_string()),
            Some(key) => peers.get_mut(key).expect("block open").push(line.to_string()),
        }
    }
    (device_lines, peers)
}

#[tokio::test]
async fn baseline_roundtrip() {
    let network = MemNetwork::new();
    let (a, mut b) = make_pair(&network).await;

    // ping-sized frame from A's host to B's address
    let ping = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2], 84, 0xAB);
    a.host.inject(&ping);

    let delivered = expect_frame(&mut b.host).await;
    assert_eq!(delivered, ping, "frame must arrive unaltered");

    // and the reply comes back over the session B learned by roaming
    let pong = ipv4_packet([10, 0, 0, 2], [10, 0, 0, 1], 84, 0xCD);
    b.host.inject(&pong);

    let mut a = a;
    let delivered = expect_frame(&mut a.host).await;
    assert_eq!(delivered, pong);

    a.device.close().await;
    b.device.close().await;
}

#[tokio::test]
async fn frames_keep_their_order() {
    let network = MemNetwork::new();
    let (a, mut b) = make_pair(&network).await;

    let frames: Vec<Vec<u8>> = (0..30u8)
        .map(|i| ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2], 64 + i as usize, i))
        .collect();
    for frame in &frames {
        a.host.inject(frame);
    }

    for expected in &frames {
        let got = expect_frame(&mut b.host).await;
        assert_eq!(&got, expected, "delivery must preserve injection order");
    }

    a.device.close().await;
    b.device.close().await;
}

#[tokio::test]
async fn replayed_transport_packets_are_dropped() {
    let network = MemNetwork::new();
    network.tap(PORT_B);
    let (a, mut b) = make_pair(&network).await;

    let ping = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2], 84, 0x11);
    a.host.inject(&ping);
    let delivered = expect_frame(&mut b.host).await;
    assert_eq!(delivered, ping);

    // find the captured data packet: type 4 and big enough to hold the
    // padded 84-byte frame
    let captured = network
        .tapped(PORT_B)
        .into_iter()
        .find(|(data, _)| data.first() == Some(&4) && data.len() > 100)
        .expect("data packet was captured");

    for _ in 0..100 {
        network.inject(PORT_B, captured.0.clone(), captured.1);
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(
        b.host.try_recv().is_none(),
        "replayed copies must not reach the tunnel"
    );

    a.device.close().await;
    b.device.close().await;
}

#[tokio::test]
async fn disallowed_inner_source_is_dropped() {
    let network = MemNetwork::new();
    let (a, mut b) = make_pair(&network).await;

    // establish the session with a legitimate frame first
    let ping = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2], 84, 0x22);
    a.host.inject(&ping);
    let _ = expect_frame(&mut b.host).await;

    let before = b.device.uapi_get();

    // same destination, but an inner source B never authorized for A
    let forged = ipv4_packet([10, 0, 0, 99], [10, 0, 0, 2], 84, 0x33);
    a.host.inject(&forged);
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(b.host.try_recv().is_none(), "forged source must be dropped");

    let after = b.device.uapi_get();
    let rx = |dump: &str| {
        dump.lines()
            .find(|l| l.starts_with("rx_bytes="))
            .map(|l| l.to_string())
    };
    assert_eq!(rx(&before), rx(&after), "rx counter must not move");

    a.device.close().await;
    b.device.close().await;
}

#[tokio::test]
async fn set_transcripts_are_idempotent() {
    let network = MemNetwork::new();
    let (tun, _host) = MemTun::new("tun-cfg", 1420);
    let device = Device::new(tun, network.bind());

    let (private, _) = x25519::generate_keypair();
    let (_, peer_pub) = x25519::generate_keypair();
    let transcript = format!(
        "private_key={}\nlisten_port=0\npublic_key={}\n\
         allowed_ip=10.1.0.0/16\nallowed_ip=10.2.0.2/32\n\
         persistent_keepalive_interval=25\nendpoint=192.0.2.10:7777\n",
        hex::encode(private),
        hex::encode(peer_pub),
    );

    device.uapi_set(&transcript).await.unwrap();
    let first = normalize_get(&device.uapi_get());

    device.uapi_set(&transcript).await.unwrap();
    let second = normalize_get(&device.uapi_get());
    assert_eq!(first, second, "applying the same transcript twice is a no-op");

    // a get dump replayed through set (with replace_peers) changes nothing
    let feedback = format!("replace_peers=true\n{}", device.uapi_get());
    device.uapi_set(&feedback).await.unwrap();
    let third = normalize_get(&device.uapi_get());
    assert_eq!(first, third, "get output must round-trip through set");

    device.close().await;
}

#[tokio::test]
async fn unknown_set_keys_report_invalid() {
    let network = MemNetwork::new();
    let (tun, _host) = MemTun::new("tun-err", 1420);
    let device = Device::new(tun, network.bind());

    let err = device
        .uapi_set("definitely_not_a_key=1\n")
        .await
        .expect_err("unknown key must fail");
    assert_eq!(err.errno, -22);

    // peers configured before the bad line stay configured
    let (private, _) = x25519::generate_keypair();
    let (_, peer_pub) = x25519::generate_keypair();
    let transcript = format!(
        "private_key={}\npublic_key={}\nallowed_ip=10.0.0.2/32\nbogus=true\n",
        hex::encode(private),
        hex::encode(peer_pub),
    );
    let err = device.uapi_set(&transcript).await.expect_err("bogus key");
    assert_eq!(err.errno, -22);
    assert_eq!(device.peer_count(), 1, "partial configuration is retained");

    device.close().await;
}

#[tokio::test]
async fn removed_peer_stops_routing() {
    let network = MemNetwork::new();
    let (a, mut b) = make_pair(&network).await;

    let ping = ipv4_packet([10, 0, 0, 1], [10, 0, 0, 2], 84, 0x44);
    a.host.inject(&ping);
    let _ = expect_frame(&mut b.host).await;

    // drop the peer from A; its frames must no longer leave the device
    let peer_pub = {
        let dump = a.device.uapi_get();
        dump.lines()
            .find_map(|l| l.strip_prefix("public_key="))
            .expect("one peer configured")
            .to_string()
    };
    a.device
        .uapi_set(&format!("public_key={peer_pub}\nremove=true\n"))
        .await
        .unwrap();
    assert_eq!(a.device.peer_count(), 0);

    a.host.inject(&ping);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(b.host.try_recv().is_none());

    a.device.close().await;
    b.device.close().await;
}
