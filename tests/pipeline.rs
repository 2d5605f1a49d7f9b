// FLOWLINE — END-TO-END PIPELINE SCENARIOS
// Full three-tier runs over the sim NIC driver and the host compute engine:
// inject frames, watch them leave (or not), then shut down and audit the
// pools. Each test brings up its own supervisor from a small TOML config.

use std::sync::Arc;
use std::time::{Duration, Instant};

use flowline::config::{parse_pipeline, SystemConfig};
use flowline::engines::host::HostComputeDevice;
use flowline::engines::DeviceRegistry;
use flowline::nic::SimNic;
use flowline::offload::device::{ComputeContext, ComputeDevice, SharedDevice};
use flowline::stats::aggregate;
use flowline::worker::supervisor::{LaunchOptions, Supervisor};

fn sys_config(with_coproc: bool) -> SystemConfig {
    let coproc = if with_coproc {
        "\n[[threads.coproc]]\ncore = 2\ndevice = \"host\"\n"
    } else {
        ""
    };
    SystemConfig::parse(&format!(
        r#"
        num_ports = 2

        [system]
        IO_BATCH_SIZE = 32
        COMP_BATCH_SIZE = 32
        IO_DESC_PER_HWRXQ = 4096
        BATCHPOOL_SIZE = 256
        TASKPOOL_SIZE = 64
        COPROC_PPDEPTH = 16
        IO_RXQ_LENGTH = 64

        [[threads.io]]
        core = 0
        rxqs = [[0, 0], [1, 0]]

        [[threads.comp]]
        core = 1
        {coproc}"#
    ))
    .expect("test config parses")
}

struct Rig {
    sup: Supervisor,
    nic: Arc<SimNic>,
    device: Option<Arc<HostComputeDevice>>,
}

fn launch(pipeline: &str, with_coproc: bool, preserve_latency: bool) -> Rig {
    let cfg = sys_config(with_coproc);
    let params = cfg.params();
    let pipe = parse_pipeline(pipeline).expect("pipeline parses");
    let nic = Arc::new(SimNic::new(cfg.num_ports, params.num_rxq_per_port));

    let mut devices = DeviceRegistry::new();
    let device = if with_coproc {
        let dev = Arc::new(HostComputeDevice::new(4));
        dev.register_kernel(
            flowline::elements::ipsec_hmac::KERNEL_NAME,
            flowline::elements::ipsec_hmac::hmac_sha1_host_kernel,
        );
        let shared: SharedDevice = dev.clone();
        devices.insert(shared);
        Some(dev)
    } else {
        None
    };

    let sup = Supervisor::launch(
        &cfg,
        pipe,
        nic.clone(),
        &devices,
        LaunchOptions { preserve_latency },
    )
    .expect("supervisor launches");
    Rig { sup, nic, device }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

fn assert_pools_full(sup: &Supervisor) {
    for (name, occupancy, capacity) in sup.pool_occupancy() {
        assert_eq!(occupancy, capacity, "pool {name} leaked {} objects", capacity - occupancy);
    }
}

fn eth_frame(dst_last: u8, len: usize, tag: u8) -> Vec<u8> {
    let mut f = vec![tag; len];
    f[..6].copy_from_slice(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, dst_last]);
    f[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, 0]);
    f[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
    f
}

/// ESP-style frame: ETH + IP with the tunnel index in the destination
/// address, payload, and a zeroed 20-byte digest slot at the tail.
fn esp_frame(flow: u16, len: usize, seq: u32) -> Vec<u8> {
    assert!(len >= 64);
    let mut f = eth_frame(0x01, len, 0x5A);
    f[30..34].copy_from_slice(&[10, 0, (flow >> 8) as u8, (flow & 0xFF) as u8]);
    f[40..44].copy_from_slice(&seq.to_le_bytes());
    for b in &mut f[len - 20..] {
        *b = 0;
    }
    f
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[test]
fn discard_pipeline_drops_all_and_leaks_nothing() {
    let mut rig = launch("fi :: FromInput(0); d :: Discard(); fi -> d", false, false);
    for i in 0..1000u32 {
        rig.nic.push_rx_frame(0, 0, eth_frame((i % 4) as u8, 64, i as u8));
    }
    assert!(
        wait_until(Duration::from_secs(5), || {
            aggregate(rig.sup.stats()).sw_drop >= 1000
        }),
        "all 1000 packets must be counted as drops"
    );
    assert_eq!(rig.nic.tx_count(0), 0);
    assert_eq!(rig.nic.tx_count(1), 0);
    rig.sup.shutdown();
    assert_pools_full(&rig.sup);
}

#[test]
fn l2_forward_transmits_unchanged_on_port_1() {
    let mut rig = launch(
        "fi :: FromInput(0); fwd :: L2Forward(); out :: ToOutput(); fi -> fwd -> out",
        false,
        false,
    );
    let frames: Vec<Vec<u8>> = (0..1000).map(|i| eth_frame(0x01, 64 + (i % 8) * 16, i as u8)).collect();
    for f in &frames {
        rig.nic.push_rx_frame(0, 0, f.clone());
    }
    assert!(
        wait_until(Duration::from_secs(5), || rig.nic.tx_count(1) >= 1000),
        "all 1000 frames must reach TX port 1 (got {})",
        rig.nic.tx_count(1)
    );
    let sent = rig.nic.drain_tx(1);
    assert_eq!(sent.len(), 1000);
    for (i, f) in sent.iter().enumerate() {
        assert_eq!(f, &frames[i], "payload changed in flight at {i}");
    }
    assert_eq!(rig.nic.tx_count(0), 0);
    rig.sup.shutdown();
    assert_pools_full(&rig.sup);
}

const HMAC_PIPELINE: &str = "fi :: FromInput(0); fl :: IPsecFlowLookup(); \
                             auth :: IPsecAuthHMACSHA1(); out :: ToOutput(0); \
                             fi -> fl -> auth -> out";

#[test]
fn hmac_offload_is_bit_identical_to_cpu_path() {
    // Flow ids stride across the whole 1024-entry tunnel table, with the
    // last frame pinned to the boundary index.
    let frames: Vec<Vec<u8>> = (0..256u16)
        .map(|k| {
            let flow = if k == 255 { 1023 } else { k * 4 };
            esp_frame(flow, 96 + (k as usize % 5) * 8, k as u32)
        })
        .collect();

    // Offload path, strict completion order.
    let mut rig = launch(HMAC_PIPELINE, true, true);
    for f in &frames {
        rig.nic.push_rx_frame(0, 0, f.clone());
    }
    assert!(
        wait_until(Duration::from_secs(5), || rig.nic.tx_count(0) >= 256),
        "offload path must transmit all frames (got {})",
        rig.nic.tx_count(0)
    );
    let offloaded = rig.nic.drain_tx(0);
    let stats = aggregate(rig.sup.stats());
    assert!(stats.offloaded > 0, "the offload path must actually have been used");
    rig.sup.shutdown();
    assert_pools_full(&rig.sup);

    // CPU path: same frames, no coprocessor configured.
    let mut rig = launch(HMAC_PIPELINE, false, false);
    for f in &frames {
        rig.nic.push_rx_frame(0, 0, f.clone());
    }
    assert!(wait_until(Duration::from_secs(5), || rig.nic.tx_count(0) >= 256));
    let cpu = rig.nic.drain_tx(0);
    rig.sup.shutdown();

    assert_eq!(offloaded.len(), cpu.len());
    for (i, (a, b)) in offloaded.iter().zip(cpu.iter()).enumerate() {
        assert_eq!(a, b, "offload and cpu outputs differ at frame {i}");
    }
    // And the digests are real: non-zero tail.
    for f in &cpu {
        assert!(f[f.len() - 20..].iter().any(|&b| b != 0), "digest slot left empty");
    }
}

#[test]
fn offload_backpressure_drops_bounded_and_preserves_order() {
    let mut rig = launch(HMAC_PIPELINE, true, true);
    let device = rig.device.as_ref().unwrap().clone();

    // Starve the device: hold every context. The coprocessor worker may be
    // holding one transiently, so retry until all are captured.
    let mut held: Vec<Box<dyn ComputeContext>> = Vec::new();
    while held.len() < device.context_count() {
        match device.get_available_context() {
            Some(ctx) => held.push(ctx),
            None => std::thread::sleep(Duration::from_millis(1)),
        }
    }

    // Enough traffic to exhaust the in-flight window (PPDEPTH tasks) and
    // push the bounded requeue policy into dropping.
    for seq in 0..2000u32 {
        rig.nic.push_rx_frame(0, 0, esp_frame(7, 96, seq));
    }
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(rig.nic.tx_count(0), 0, "nothing may pass while the device is starved");
    let retry_drops: u64 = rig
        .sup
        .stats()
        .iter()
        .map(|s| s.offload_retry_drops.load(std::sync::atomic::Ordering::Relaxed))
        .sum();
    assert!(retry_drops > 0, "bounded retries must have started dropping");

    // Resume the device; the tail drains.
    for ctx in held {
        device.release_context(ctx);
    }
    assert!(
        wait_until(Duration::from_secs(5), || {
            let s = aggregate(rig.sup.stats());
            s.completed > 0 && rig.nic.tx_count(0) > 0
        }),
        "device resume must drain the queued tail"
    );
    // Quiesce, then verify ordering of whatever survived.
    let mut last = rig.nic.tx_count(0);
    assert!(wait_until(Duration::from_secs(2), || {
        let now = rig.nic.tx_count(0);
        let stable = now == last;
        last = now;
        stable
    }));
    let sent = rig.nic.drain_tx(0);
    assert!(!sent.is_empty());
    assert!(sent.len() < 2000, "the starvation window must have cost something");
    let mut prev: Option<u32> = None;
    for f in &sent {
        let seq = u32::from_le_bytes(f[40..44].try_into().unwrap());
        if let Some(p) = prev {
            assert!(seq > p, "reordered under preserve-latency: {seq} after {p}");
        }
        prev = Some(seq);
    }
    rig.sup.shutdown();
    assert_pools_full(&rig.sup);
}

#[test]
fn graceful_shutdown_under_load_returns_every_pool_object() {
    let mut rig = launch(
        "fi :: FromInput(0); fwd :: L2Forward(); out :: ToOutput(); fi -> fwd -> out",
        false,
        false,
    );
    for i in 0..5000u32 {
        rig.nic.push_rx_frame(0, 0, eth_frame(0x01, 64, i as u8));
    }
    // Give the pipeline a head start, then pull the plug mid-stream.
    std::thread::sleep(Duration::from_millis(30));
    rig.sup.shutdown();
    // Whatever was in flight either transmitted or dropped; every pool
    // object is home again.
    assert_pools_full(&rig.sup);
    let transmitted = rig.nic.drain_tx(1).len() as u64;
    let stats = aggregate(rig.sup.stats());
    assert!(transmitted <= 5000);
    assert_eq!(stats.sent, transmitted);
}
