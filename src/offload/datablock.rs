// FLOWLINE — DATABLOCKS
// A datablock maps one logical data stream of a batch into device-friendly
// strides: which bytes of each packet feed the kernel, and where the kernel's
// per-item output lands back in the packet. Elements declare their datablocks
// once; the executor packs them per task.
//
// The host↔device argument blob is the serialized form: one header, then one
// batch_info record per aggregated batch, then the stride arrays. Everything
// is 8-byte aligned; "pointers" are u64 offsets relative to the blob start,
// which keeps the format position-independent across host and device copies.

use bytemuck::{Pod, Zeroable};

use crate::packet::batch::PacketBatch;
use crate::packet::{Annotation, Packet, ANNO_SLOTS};
use crate::{Error, Result};

/// Region of interest: the byte span of a packet a datablock reads or writes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Roi {
    /// Fixed stride: bytes [offset, offset+len) of every packet.
    Fixed { offset: u16, len: u16 },
    /// Variable stride: bytes [offset, pkt.len - trail).
    SpanToTrail { offset: u16, trail: u16 },
    /// Fixed-size slot at the tail: bytes [pkt.len - trail, pkt.len - trail + len).
    TrailSlot { trail: u16, len: u16 },
    /// The packet's annotation table, serialized as ANNO_WIRE_SIZE bytes.
    Annotations,
    /// Stream not present in this direction.
    None,
}

impl Roi {
    /// Fixed item size, or None for variable strides.
    pub fn fixed_size(&self) -> Option<u16> {
        match *self {
            Roi::Fixed { len, .. } => Some(len),
            Roi::TrailSlot { len, .. } => Some(len),
            Roi::Annotations => Some(ANNO_WIRE_SIZE as u16),
            Roi::None => Some(0),
            Roi::SpanToTrail { .. } => None,
        }
    }

    /// Resolve to (offset, len) within a packet. None when the packet is too
    /// short to carry the region.
    pub fn resolve(&self, pkt: &Packet) -> Option<(usize, usize)> {
        let plen = pkt.len();
        match *self {
            Roi::Fixed { offset, len } => {
                let (o, l) = (offset as usize, len as usize);
                (o + l <= plen).then_some((o, l))
            }
            Roi::SpanToTrail { offset, trail } => {
                let (o, t) = (offset as usize, trail as usize);
                (o + t <= plen).then(|| (o, plen - t - o))
            }
            Roi::TrailSlot { trail, len } => {
                let (t, l) = (trail as usize, len as usize);
                (t <= plen && l <= t).then_some((plen - t, l))
            }
            Roi::Annotations => Some((0, ANNO_WIRE_SIZE)),
            Roi::None => Some((0, 0)),
        }
    }
}

/// Element-declared datablock. The same id is reused by every task the
/// element launches.
#[derive(Clone, Copy, Debug)]
pub struct DatablockSpec {
    pub name: &'static str,
    pub roi_in: Roi,
    pub roi_out: Roi,
}

// ============================================================================
// ANNOTATION SERIALIZATION (carried to the kernel by value)
// ============================================================================

/// Wire size of one annotation table: the value slots plus the validity word.
pub const ANNO_WIRE_SIZE: usize = (ANNO_SLOTS + 1) * 8;

pub fn anno_to_wire(anno: &Annotation, out: &mut [u8]) {
    debug_assert!(out.len() >= ANNO_WIRE_SIZE);
    let mut valid: u64 = 0;
    for slot in 0..ANNO_SLOTS {
        // Pull raw values straight through the public accessors so the wire
        // form is independent of the in-memory layout.
        let id = slot_id(slot);
        out[slot * 8..slot * 8 + 8].copy_from_slice(&anno.get(id).to_le_bytes());
        if anno.is_set(id) {
            valid |= 1 << slot;
        }
    }
    out[ANNO_SLOTS * 8..ANNO_WIRE_SIZE].copy_from_slice(&valid.to_le_bytes());
}

pub fn anno_from_wire(bytes: &[u8]) -> Annotation {
    debug_assert!(bytes.len() >= ANNO_WIRE_SIZE);
    let mut anno = Annotation::EMPTY;
    let valid = u64::from_le_bytes(bytes[ANNO_SLOTS * 8..ANNO_WIRE_SIZE].try_into().unwrap());
    for slot in 0..ANNO_SLOTS {
        if valid & (1 << slot) != 0 {
            let v = u64::from_le_bytes(bytes[slot * 8..slot * 8 + 8].try_into().unwrap());
            anno.set(slot_id(slot), v);
        }
    }
    anno
}

fn slot_id(slot: usize) -> crate::packet::Anno {
    use crate::packet::Anno::*;
    match slot {
        0 => SourcePort,
        1 => Timestamp,
        2 => BatchId,
        3 => IfaceOut,
        4 => IpsecFlowId,
        _ => IpsecIv,
    }
}

// ============================================================================
// PER-TASK LAYOUT (host side of the packed streams)
// ============================================================================

/// Concrete placement of one datablock's items inside a task buffer region.
#[derive(Clone, Debug, Default)]
pub struct PackedLayout {
    pub base: u64,
    pub item_count: u32,
    /// Per-item sizes; for fixed strides every entry equals the stride.
    pub item_sizes: Vec<u16>,
    /// Per-item offsets relative to `base`.
    pub item_offsets: Vec<u32>,
    pub total_bytes: usize,
}

#[inline]
fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Pack the input ROI of every live packet into `buf`, appending at the
/// current end. Packets too short for the ROI are killed by the caller via
/// the returned miss list.
pub fn pack_input(
    spec: &DatablockSpec,
    batch: &PacketBatch,
    buf: &mut Vec<u8>,
    too_short: &mut Vec<usize>,
) -> PackedLayout {
    let base = align8(buf.len());
    buf.resize(base, 0);
    let mut layout = PackedLayout { base: base as u64, ..Default::default() };

    for idx in batch.live_indices() {
        let pkt = batch.pkt(idx).expect("live slot holds packet");
        let off = buf.len() - base;
        match spec.roi_in {
            Roi::Annotations => {
                buf.resize(buf.len() + ANNO_WIRE_SIZE, 0);
                let dst = buf.len() - ANNO_WIRE_SIZE;
                anno_to_wire(&pkt.anno, &mut buf[dst..]);
                layout.item_sizes.push(ANNO_WIRE_SIZE as u16);
            }
            Roi::None => {
                layout.item_sizes.push(0);
            }
            roi => match roi.resolve(pkt) {
                Some((o, l)) => {
                    buf.extend_from_slice(&pkt.data()[o..o + l]);
                    layout.item_sizes.push(l as u16);
                }
                None => {
                    too_short.push(idx);
                    layout.item_sizes.push(0);
                }
            },
        }
        layout.item_offsets.push(off as u32);
        layout.item_count += 1;
        let pad = align8(buf.len());
        buf.resize(pad, 0);
    }
    layout.total_bytes = buf.len() - base;
    layout
}

/// Compute the output-side layout for the live packets (sizes and offsets in
/// the device output region) without touching packet bytes.
pub fn plan_output(spec: &DatablockSpec, batch: &PacketBatch, base: u64) -> PackedLayout {
    let mut layout = PackedLayout { base, ..Default::default() };
    let mut cursor = 0usize;
    for idx in batch.live_indices() {
        let pkt = batch.pkt(idx).expect("live slot holds packet");
        let len = match spec.roi_out {
            Roi::None => 0,
            Roi::Annotations => ANNO_WIRE_SIZE,
            roi => roi.resolve(pkt).map(|(_, l)| l).unwrap_or(0),
        };
        layout.item_offsets.push(cursor as u32);
        layout.item_sizes.push(len as u16);
        layout.item_count += 1;
        cursor = align8(cursor + len);
    }
    layout.total_bytes = cursor;
    layout
}

/// Write one item's device output back into its packet. Returns false when
/// the packet no longer carries the ROI (caller kills it).
pub fn unpack_output_item(spec: &DatablockSpec, pkt: &mut Packet, item: &[u8]) -> bool {
    match spec.roi_out {
        Roi::None => true,
        Roi::Annotations => {
            if item.len() < ANNO_WIRE_SIZE {
                return false;
            }
            pkt.anno = anno_from_wire(item);
            true
        }
        roi => match roi.resolve(pkt) {
            Some((o, l)) if item.len() >= l => {
                pkt.data_mut()[o..o + l].copy_from_slice(&item[..l]);
                true
            }
            _ => false,
        },
    }
}

// ============================================================================
// HOST↔DEVICE ARGUMENT BLOB
// ============================================================================

#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct DbKernelArg {
    pub total_item_count_in: u32,
    pub total_item_count_out: u32,
    pub item_size_in: u16,
    pub item_size_out: u16,
    pub _pad: [u8; 4],
}

/// One aggregated batch inside a task. Array "pointers" are u64 offsets
/// relative to the blob start; stride arrays are u16 (sizes) and u32
/// (offsets) as on the original wire.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct DbBatchInfo {
    pub buffer_bases_in: u64,
    pub buffer_bases_out: u64,
    pub item_count_in: u32,
    pub item_count_out: u32,
    pub item_sizes_in: u64,
    pub item_sizes_out: u64,
    pub item_offsets_in: u64,
    pub item_offsets_out: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgBatchView {
    pub base_in: u64,
    pub base_out: u64,
    pub item_sizes_in: Vec<u16>,
    pub item_sizes_out: Vec<u16>,
    pub item_offsets_in: Vec<u32>,
    pub item_offsets_out: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArgView {
    pub item_size_in: Option<u16>,
    pub item_size_out: Option<u16>,
    pub total_in: u32,
    pub total_out: u32,
    pub batches: Vec<ArgBatchView>,
}

fn put_u16s(blob: &mut Vec<u8>, vals: &[u16]) -> u64 {
    let at = align8(blob.len());
    blob.resize(at, 0);
    for v in vals {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    at as u64
}

fn put_u32s(blob: &mut Vec<u8>, vals: &[u32]) -> u64 {
    let at = align8(blob.len());
    blob.resize(at, 0);
    for v in vals {
        blob.extend_from_slice(&v.to_le_bytes());
    }
    at as u64
}

/// Serialize the kernel argument blob for one datablock across `batches`.
pub fn pack_args(spec: &DatablockSpec, batches: &[(&PackedLayout, &PackedLayout)]) -> Vec<u8> {
    let mut blob = Vec::with_capacity(256);
    let total_in: u32 = batches.iter().map(|(i, _)| i.item_count).sum();
    let total_out: u32 = batches.iter().map(|(_, o)| o.item_count).sum();
    let header = DbKernelArg {
        total_item_count_in: total_in,
        total_item_count_out: total_out,
        item_size_in: spec.roi_in.fixed_size().unwrap_or(0),
        item_size_out: spec.roi_out.fixed_size().unwrap_or(0),
        _pad: [0; 4],
    };
    blob.extend_from_slice(bytemuck::bytes_of(&header));

    // Records first, arrays after; patch the offsets once known.
    let records_at = align8(blob.len());
    blob.resize(records_at + batches.len() * std::mem::size_of::<DbBatchInfo>(), 0);

    for (bi, (lin, lout)) in batches.iter().enumerate() {
        let sizes_in = put_u16s(&mut blob, &lin.item_sizes);
        let sizes_out = put_u16s(&mut blob, &lout.item_sizes);
        let offs_in = put_u32s(&mut blob, &lin.item_offsets);
        let offs_out = put_u32s(&mut blob, &lout.item_offsets);
        let rec = DbBatchInfo {
            buffer_bases_in: lin.base,
            buffer_bases_out: lout.base,
            item_count_in: lin.item_count,
            item_count_out: lout.item_count,
            item_sizes_in: sizes_in,
            item_sizes_out: sizes_out,
            item_offsets_in: offs_in,
            item_offsets_out: offs_out,
        };
        let at = records_at + bi * std::mem::size_of::<DbBatchInfo>();
        blob[at..at + std::mem::size_of::<DbBatchInfo>()]
            .copy_from_slice(bytemuck::bytes_of(&rec));
    }
    blob
}

fn read_u16s(blob: &[u8], at: u64, n: u32) -> Result<Vec<u16>> {
    let at = at as usize;
    let end = at + n as usize * 2;
    if end > blob.len() {
        return Err(Error::MalformedPacket("datablock arg blob truncated"));
    }
    Ok(blob[at..end]
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect())
}

fn read_u32s(blob: &[u8], at: u64, n: u32) -> Result<Vec<u32>> {
    let at = at as usize;
    let end = at + n as usize * 4;
    if end > blob.len() {
        return Err(Error::MalformedPacket("datablock arg blob truncated"));
    }
    Ok(blob[at..end]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Parse an argument blob. Inverse of `pack_args`.
pub fn unpack_args(blob: &[u8], num_batches: usize) -> Result<ArgView> {
    let hsize = std::mem::size_of::<DbKernelArg>();
    if blob.len() < hsize {
        return Err(Error::MalformedPacket("datablock arg blob too short"));
    }
    // Unaligned reads: blob slices arrive at arbitrary offsets inside the
    // task's input region.
    let header: DbKernelArg = bytemuck::pod_read_unaligned(&blob[..hsize]);
    let rsize = std::mem::size_of::<DbBatchInfo>();
    let records_at = align8(hsize);
    if blob.len() < records_at + num_batches * rsize {
        return Err(Error::MalformedPacket("datablock arg blob missing records"));
    }

    let mut batches = Vec::with_capacity(num_batches);
    for bi in 0..num_batches {
        let at = records_at + bi * rsize;
        let rec: DbBatchInfo = bytemuck::pod_read_unaligned(&blob[at..at + rsize]);
        batches.push(ArgBatchView {
            base_in: rec.buffer_bases_in,
            base_out: rec.buffer_bases_out,
            item_sizes_in: read_u16s(blob, rec.item_sizes_in, rec.item_count_in)?,
            item_sizes_out: read_u16s(blob, rec.item_sizes_out, rec.item_count_out)?,
            item_offsets_in: read_u32s(blob, rec.item_offsets_in, rec.item_count_in)?,
            item_offsets_out: read_u32s(blob, rec.item_offsets_out, rec.item_count_out)?,
        });
    }
    Ok(ArgView {
        item_size_in: (header.item_size_in != 0).then_some(header.item_size_in),
        item_size_out: (header.item_size_out != 0).then_some(header.item_size_out),
        total_in: header.total_item_count_in,
        total_out: header.total_item_count_out,
        batches,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Anno;

    fn batch_of(lens: &[usize]) -> PacketBatch {
        let mut b = PacketBatch::new();
        for (i, &l) in lens.iter().enumerate() {
            let mut p = Box::new(Packet::new());
            p.reset(0, 0, 0);
            let bytes: Vec<u8> = (0..l).map(|j| (i * 31 + j) as u8).collect();
            assert!(p.fill(&bytes));
            b.push(p);
        }
        b
    }

    #[test]
    fn roi_resolution() {
        let mut p = Packet::new();
        p.reset(0, 0, 0);
        p.fill(&[0u8; 100]);
        assert_eq!(Roi::Fixed { offset: 14, len: 20 }.resolve(&p), Some((14, 20)));
        assert_eq!(Roi::SpanToTrail { offset: 14, trail: 20 }.resolve(&p), Some((14, 66)));
        assert_eq!(Roi::TrailSlot { trail: 20, len: 20 }.resolve(&p), Some((80, 20)));
        assert_eq!(Roi::Fixed { offset: 90, len: 20 }.resolve(&p), None);
    }

    #[test]
    fn anno_wire_round_trip() {
        let mut a = Annotation::EMPTY;
        a.set(Anno::IpsecFlowId, 7);
        a.set(Anno::Timestamp, 0xDEAD_BEEF);
        let mut wire = [0u8; ANNO_WIRE_SIZE];
        anno_to_wire(&a, &mut wire);
        let back = anno_from_wire(&wire);
        assert!(back.is_set(Anno::IpsecFlowId));
        assert_eq!(back.get(Anno::IpsecFlowId), 7);
        assert_eq!(back.get(Anno::Timestamp), 0xDEAD_BEEF);
        assert!(!back.is_set(Anno::IfaceOut));
    }

    #[test]
    fn pack_unpack_variable_stride_round_trip() {
        let spec = DatablockSpec {
            name: "auth_span",
            roi_in: Roi::SpanToTrail { offset: 14, trail: 20 },
            roi_out: Roi::TrailSlot { trail: 20, len: 20 },
        };
        let batch = batch_of(&[100, 64, 250, 40]);
        let mut buf = Vec::new();
        let mut misses = Vec::new();
        let lin = pack_input(&spec, &batch, &mut buf, &mut misses);
        assert!(misses.is_empty());
        assert_eq!(lin.item_count, 4);
        assert_eq!(lin.item_sizes, vec![66, 30, 216, 6]);

        // Every packed item matches the packet bytes it came from.
        for (k, idx) in batch.live_indices().enumerate() {
            let pkt = batch.pkt(idx).unwrap();
            let (o, l) = spec.roi_in.resolve(pkt).unwrap();
            let at = lin.base as usize + lin.item_offsets[k] as usize;
            assert_eq!(&buf[at..at + l], &pkt.data()[o..o + l]);
        }

        let lout = plan_output(&spec, &batch, 0);
        assert_eq!(lout.item_sizes, vec![20, 20, 20, 20]);

        let blob = pack_args(&spec, &[(&lin, &lout)]);
        let view = unpack_args(&blob, 1).unwrap();
        assert_eq!(view.total_in, 4);
        assert_eq!(view.total_out, 4);
        assert_eq!(view.item_size_in, None);
        assert_eq!(view.item_size_out, Some(20));
        assert_eq!(view.batches[0].item_sizes_in, lin.item_sizes);
        assert_eq!(view.batches[0].item_offsets_in, lin.item_offsets);
        assert_eq!(view.batches[0].item_offsets_out, lout.item_offsets);
    }

    #[test]
    fn pack_reports_too_short_packets() {
        let spec = DatablockSpec {
            name: "auth_span",
            roi_in: Roi::SpanToTrail { offset: 14, trail: 20 },
            roi_out: Roi::None,
        };
        let batch = batch_of(&[100, 8, 60]);
        let mut buf = Vec::new();
        let mut misses = Vec::new();
        let _ = pack_input(&spec, &batch, &mut buf, &mut misses);
        assert_eq!(misses, vec![1]);
    }

    #[test]
    fn unpack_output_writes_tail_slot() {
        let spec = DatablockSpec {
            name: "digest",
            roi_in: Roi::None,
            roi_out: Roi::TrailSlot { trail: 20, len: 20 },
        };
        let mut batch = batch_of(&[64]);
        let digest = [0xA5u8; 20];
        assert!(unpack_output_item(&spec, batch.pkt_mut(0).unwrap(), &digest));
        assert_eq!(&batch.pkt(0).unwrap().data()[44..64], &digest);
    }

    #[test]
    fn blob_offsets_are_8_byte_aligned() {
        let spec = DatablockSpec {
            name: "x",
            roi_in: Roi::Fixed { offset: 0, len: 10 },
            roi_out: Roi::None,
        };
        let batch = batch_of(&[32, 32, 32]);
        let mut buf = Vec::new();
        let mut misses = Vec::new();
        let lin = pack_input(&spec, &batch, &mut buf, &mut misses);
        for off in &lin.item_offsets {
            assert_eq!(off % 8, 0);
        }
        let lout = plan_output(&spec, &batch, 0);
        let blob = pack_args(&spec, &[(&lin, &lout)]);
        let view = unpack_args(&blob, 1).unwrap();
        assert_eq!(view.item_size_in, Some(10));
    }
}
