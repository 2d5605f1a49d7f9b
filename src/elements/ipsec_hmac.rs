// FLOWLINE — IPSEC HMAC-SHA1 AUTH ELEMENT
// Appends the HMAC-SHA1 trailer over the authenticated span of an
// ESP-encapsulated frame. The per-tunnel key table is derived once per
// process, copied into node-local storage per node, uploaded to the compute
// device at offload init, and read per thread after that. With a bound
// device the element returns Pending and the executor ships whole batches;
// without one it authenticates on the CPU with the same keys, bit-identical.
//
// Frame layout (offsets from the start of the frame):
//   [0..14) ethernet  [14..34) ip  [34..len-20) authenticated span
//   [len-20..len) HMAC-SHA1 digest slot

use std::sync::OnceLock;

use hkdf::Hkdf;
use ring::hmac;
use sha2::Sha256;

use crate::element::{Action, Caps, Element, ElementContext, Offloadable, OffloadInitFn};
use crate::engine::nls::NodeLocalStorage;
use crate::engines::host::HostKernelIo;
use crate::offload::datablock::{self, DatablockSpec, Roi, ANNO_WIRE_SIZE};
use crate::offload::device::{ComputeDevice, DevBufId, KernelArg, KernelRef};
use crate::packet::{Anno, Packet};
use crate::{Error, Result};

pub const HMAC_KEY_SIZE: usize = 64;
pub const SHA1_DIGEST_LEN: usize = 20;
pub const DEFAULT_NUM_TUNNELS: usize = 1024;

const AUTH_SPAN_OFFSET: u16 = 34;
const NLS_FLOWS: &str = "hmac_flows";
const NLS_FLOWS_DEV: &str = "hmac_flows_dev";
pub const KERNEL_NAME: &str = "ipsec_hmac_sha1";

/// Authenticated span in, digest slot out, plus the annotation table the
/// kernel needs for the tunnel lookup.
static DATABLOCKS: &[DatablockSpec] = &[
    DatablockSpec {
        name: "ipsec_auth_span",
        roi_in: Roi::SpanToTrail { offset: AUTH_SPAN_OFFSET, trail: SHA1_DIGEST_LEN as u16 },
        roi_out: Roi::TrailSlot { trail: SHA1_DIGEST_LEN as u16, len: SHA1_DIGEST_LEN as u16 },
    },
    DatablockSpec { name: "ipsec_anno", roi_in: Roi::Annotations, roi_out: Roi::None },
];

/// Process-wide key table, built once at global init and frozen before any
/// traffic. Per-node copies live in node-local storage.
static KEY_TABLE: OnceLock<Box<[u8]>> = OnceLock::new();

fn derive_key_table(num_tunnels: usize, master: &[u8]) -> Box<[u8]> {
    let hk = Hkdf::<Sha256>::new(Some(b"flowline-ipsec-hmac".as_slice()), master);
    let mut table = vec![0u8; num_tunnels * HMAC_KEY_SIZE];
    for (idx, chunk) in table.chunks_mut(HMAC_KEY_SIZE).enumerate() {
        let info = (idx as u32).to_le_bytes();
        hk.expand(&info, chunk).expect("okm length fits hkdf limit");
    }
    table.into_boxed_slice()
}

pub struct IpsecAuthHmacSha1 {
    num_tunnels: usize,
    master_secret: Vec<u8>,
    /// Per-thread HMAC keys, built from node-local storage at init.
    keys: Vec<hmac::Key>,
    offload_bound: bool,
    kernel: KernelRef,
    kernel_args: Vec<KernelArg>,
    workgroup: u32,
}

impl IpsecAuthHmacSha1 {
    pub fn new() -> Self {
        IpsecAuthHmacSha1 {
            num_tunnels: DEFAULT_NUM_TUNNELS,
            master_secret: b"flowline-master-secret".to_vec(),
            keys: Vec::new(),
            offload_bound: false,
            kernel: KernelRef(0),
            kernel_args: Vec::new(),
            workgroup: 64,
        }
    }

    fn auth_one(&self, pkt: &mut Packet, flow: usize) {
        let span = Roi::SpanToTrail { offset: AUTH_SPAN_OFFSET, trail: SHA1_DIGEST_LEN as u16 };
        let (o, l) = span.resolve(pkt).expect("caller validated length");
        let tag = hmac::sign(&self.keys[flow], &pkt.data()[o..o + l]);
        let at = pkt.len() - SHA1_DIGEST_LEN;
        pkt.data_mut()[at..].copy_from_slice(&tag.as_ref()[..SHA1_DIGEST_LEN]);
    }
}

impl Element for IpsecAuthHmacSha1 {
    fn class_name(&self) -> &'static str {
        "IPsecAuthHMACSHA1"
    }

    fn port_count(&self) -> (usize, usize) {
        (1, 1)
    }

    fn caps(&self) -> Caps {
        Caps { offloadable: true, ..Caps::default() }
    }

    fn configure(&mut self, _ctx: &ElementContext, args: &[String]) -> Result<()> {
        for arg in args {
            match arg.split_once('=') {
                Some(("tunnels", v)) => {
                    self.num_tunnels = v.parse().map_err(|_| {
                        Error::ConfigInvalid(format!("IPsecAuthHMACSHA1: bad tunnels={v:?}"))
                    })?;
                    if self.num_tunnels == 0 {
                        return Err(Error::ConfigInvalid(
                            "IPsecAuthHMACSHA1: tunnels must be > 0".into(),
                        ));
                    }
                }
                Some(("secret", v)) => self.master_secret = v.as_bytes().to_vec(),
                _ => {
                    return Err(Error::ConfigInvalid(format!(
                        "IPsecAuthHMACSHA1: unknown arg {arg:?}"
                    )))
                }
            }
        }
        Ok(())
    }

    fn initialize_global(&mut self) -> Result<()> {
        let n = self.num_tunnels;
        let secret = self.master_secret.clone();
        KEY_TABLE.get_or_init(|| derive_key_table(n, &secret));
        Ok(())
    }

    fn initialize_per_node(&mut self, nls: &NodeLocalStorage) -> Result<()> {
        let table = KEY_TABLE.get().ok_or_else(|| {
            Error::ConfigInvalid("IPsecAuthHMACSHA1: global init did not run".into())
        })?;
        nls.alloc(NLS_FLOWS, table.len())?;
        nls.write(NLS_FLOWS, |buf| buf.copy_from_slice(table))?;
        // Slot for the device-resident copy's handle, filled at offload init.
        nls.alloc(NLS_FLOWS_DEV, 8)?;
        Ok(())
    }

    fn initialize(&mut self, nls: &NodeLocalStorage) -> Result<()> {
        let region = nls.get(NLS_FLOWS).ok_or_else(|| {
            Error::ConfigInvalid("IPsecAuthHMACSHA1: node-local key table missing".into())
        })?;
        let bytes = region.bytes();
        self.keys = bytes
            .chunks(HMAC_KEY_SIZE)
            .take(self.num_tunnels)
            .map(|k| hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, k))
            .collect();
        Ok(())
    }

    fn process(&mut self, _input_port: usize, pkt: &mut Packet) -> Action {
        if self.offload_bound {
            return Action::Pending;
        }
        if !pkt.anno.is_set(Anno::IpsecFlowId) {
            pkt.kill();
            return Action::Drop;
        }
        let flow = pkt.anno.get(Anno::IpsecFlowId) as usize;
        if flow >= self.keys.len()
            || pkt.len() < AUTH_SPAN_OFFSET as usize + SHA1_DIGEST_LEN
        {
            pkt.kill();
            return Action::Drop;
        }
        self.auth_one(pkt, flow);
        Action::Continue(0)
    }

    fn offload(&self) -> Option<&dyn Offloadable> {
        Some(self)
    }

    fn offload_mut(&mut self) -> Option<&mut dyn Offloadable> {
        Some(self)
    }
}

impl Offloadable for IpsecAuthHmacSha1 {
    fn datablocks(&self) -> &'static [DatablockSpec] {
        DATABLOCKS
    }

    fn kernel_name(&self, _device: &str) -> &'static str {
        KERNEL_NAME
    }

    fn desired_workgroup_size(&self, device: &str) -> u32 {
        match device {
            "host" => 64,
            _ => 32,
        }
    }

    fn offload_init_fn(&self) -> Option<OffloadInitFn> {
        Some(Box::new(move |dev: &dyn ComputeDevice, nls: &NodeLocalStorage| {
            let region = nls.get(NLS_FLOWS).ok_or_else(|| {
                Error::ConfigInvalid("IPsecAuthHMACSHA1: node-local key table missing".into())
            })?;
            let bytes = region.bytes();
            let buf = dev.alloc_device_buffer(bytes.len())?;
            dev.write_device_buffer(buf, 0, bytes)?;
            nls.write(NLS_FLOWS_DEV, |slot| {
                slot.copy_from_slice(&(buf.0 as u64).to_le_bytes())
            })?;
            Ok(())
        }))
    }

    fn bind_device(&mut self, dev: &dyn ComputeDevice, nls: &NodeLocalStorage) -> Result<()> {
        let kernel = dev.resolve_kernel(self.kernel_name(dev.name())).ok_or_else(|| {
            Error::ConfigInvalid(format!("device {:?} lacks kernel {KERNEL_NAME:?}", dev.name()))
        })?;
        let slot = nls.get(NLS_FLOWS_DEV).ok_or_else(|| {
            Error::ConfigInvalid("IPsecAuthHMACSHA1: device table handle missing".into())
        })?;
        let id = u64::from_le_bytes(slot.bytes()[..8].try_into().unwrap());
        self.kernel = kernel;
        self.kernel_args = vec![KernelArg::from_dev_buf(DevBufId(id as u32))];
        self.workgroup = self.desired_workgroup_size(dev.name());
        self.offload_bound = true;
        Ok(())
    }

    fn kernel(&self) -> KernelRef {
        self.kernel
    }

    fn kernel_args(&self) -> &[KernelArg] {
        &self.kernel_args
    }

    fn postproc(
        &mut self,
        _input_port: usize,
        device_output: Option<&[u8]>,
        pkt: &mut Packet,
    ) -> Action {
        match device_output {
            Some(_) => Action::Continue(0),
            None => {
                // Task failed or the device under-produced; the executor has
                // already killed the packet, we only decide the route.
                debug_assert!(pkt.is_killed());
                Action::Drop
            }
        }
    }
}

// ============================================================================
// HOST KERNEL
// ============================================================================

/// Host-engine kernel. Argument convention (see task staging): one blob
/// offset per datablock in declaration order, then the element args — here
/// [span_blob, anno_blob, key_table_buf].
pub fn hmac_sha1_host_kernel(io: &mut HostKernelIo<'_>) -> std::result::Result<(), &'static str> {
    if io.args.len() < 3 {
        return Err("hmac kernel expects 3 args");
    }
    let span_blob_off = io.args[0].as_u64() as usize;
    let anno_blob_off = io.args[1].as_u64() as usize;
    let table_id = io.args[2].as_u64() as usize;

    let table = io.globals.get(table_id).ok_or("bad key table buffer")?.bytes();
    let num_keys = table.len() / HMAC_KEY_SIZE;

    if span_blob_off > io.input.len() || anno_blob_off > io.input.len() {
        return Err("arg blob out of range");
    }
    let span_view = datablock::unpack_args(&io.input[span_blob_off..], 1)
        .map_err(|_| "bad span arg blob")?;
    let anno_view = datablock::unpack_args(&io.input[anno_blob_off..], 1)
        .map_err(|_| "bad anno arg blob")?;
    let span_b = &span_view.batches[0];
    let anno_b = &anno_view.batches[0];
    if span_b.item_offsets_in.len() != anno_b.item_offsets_in.len() {
        return Err("span/anno item count mismatch");
    }

    for k in 0..span_b.item_offsets_in.len() {
        let in_at = span_b.base_in as usize + span_b.item_offsets_in[k] as usize;
        let in_len = span_b.item_sizes_in[k] as usize;
        let anno_at = anno_b.base_in as usize + anno_b.item_offsets_in[k] as usize;
        if in_at + in_len > io.input.len() || anno_at + ANNO_WIRE_SIZE > io.input.len() {
            return Err("item out of range");
        }

        let anno = datablock::anno_from_wire(&io.input[anno_at..anno_at + ANNO_WIRE_SIZE]);
        let out_at = span_b.base_out as usize + span_b.item_offsets_out[k] as usize;
        let out_len = span_b.item_sizes_out[k] as usize;
        if io.output.len() < out_at + out_len {
            io.output.resize(out_at + out_len, 0);
        }

        if !anno.is_set(Anno::IpsecFlowId) {
            continue; // digest slot stays zeroed
        }
        let flow = anno.get(Anno::IpsecFlowId) as usize;
        if flow >= num_keys {
            continue;
        }
        let key = hmac::Key::new(
            hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            &table[flow * HMAC_KEY_SIZE..(flow + 1) * HMAC_KEY_SIZE],
        );
        let tag = hmac::sign(&key, &io.input[in_at..in_at + in_len]);
        io.output[out_at..out_at + out_len].copy_from_slice(&tag.as_ref()[..out_len]);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn esp_frame(len: usize, fill: u8) -> Packet {
        let mut p = Packet::new();
        p.reset(0, 0, 0);
        p.fill(&vec![fill; len]);
        p
    }

    fn cpu_element() -> IpsecAuthHmacSha1 {
        let mut e = IpsecAuthHmacSha1::new();
        let ctx = ElementContext { node: 0, comp_batch_size: 64, num_tx_ports: 1 };
        e.configure(&ctx, &[]).unwrap();
        e.initialize_global().unwrap();
        let nls = NodeLocalStorage::new(0);
        e.initialize_per_node(&nls).unwrap();
        e.initialize(&nls).unwrap();
        e
    }

    #[test]
    fn cpu_path_writes_reference_digest() {
        let mut e = cpu_element();
        let mut p = esp_frame(120, 0x33);
        p.anno.set(Anno::IpsecFlowId, 7);
        assert_eq!(e.process(0, &mut p), Action::Continue(0));

        let table = KEY_TABLE.get().unwrap();
        let key = hmac::Key::new(
            hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY,
            &table[7 * HMAC_KEY_SIZE..8 * HMAC_KEY_SIZE],
        );
        let expect = hmac::sign(&key, &vec![0x33u8; 120 - 34 - SHA1_DIGEST_LEN]);
        assert_eq!(&p.data()[100..], &expect.as_ref()[..SHA1_DIGEST_LEN]);
    }

    #[test]
    fn missing_flow_annotation_kills() {
        let mut e = cpu_element();
        let mut p = esp_frame(120, 0);
        assert_eq!(e.process(0, &mut p), Action::Drop);
        assert!(p.is_killed());
    }

    #[test]
    fn out_of_range_flow_kills() {
        let mut e = cpu_element();
        let mut p = esp_frame(120, 0);
        p.anno.set(Anno::IpsecFlowId, u32::MAX as u64);
        assert_eq!(e.process(0, &mut p), Action::Drop);
    }

    #[test]
    fn key_derivation_is_deterministic_and_distinct() {
        let a = derive_key_table(4, b"s");
        let b = derive_key_table(4, b"s");
        assert_eq!(a, b);
        assert_ne!(&a[..HMAC_KEY_SIZE], &a[HMAC_KEY_SIZE..2 * HMAC_KEY_SIZE]);
    }
}
