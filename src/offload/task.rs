// FLOWLINE — OFFLOAD TASKS
// One task = one accelerator work item: the originating element, the batch
// it captured, the packed datablock streams, and the kernel call data. Tasks
// are pool objects; the computation worker stages them, the coprocessor
// worker runs them, the completion ring carries them home with a status
// byte. The task owns the batch for the whole round trip — nothing else may
// touch those packets until postproc has run.

use crate::offload::datablock::{self, DatablockSpec, PackedLayout, Roi};
use crate::offload::device::{KernelArg, KernelRef, ResourceParam};
use crate::packet::batch::PacketBatch;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskStatus {
    Staged,
    Ok,
    DeviceError,
}

/// Placement of one datablock inside the task's input/output regions.
#[derive(Clone, Debug)]
pub struct PackedDb {
    pub spec_idx: usize,
    pub blob_off: usize,
    pub blob_len: usize,
    pub layout_in: PackedLayout,
    pub layout_out: PackedLayout,
}

pub struct OffloadTask {
    pub element: u32,
    pub input_port: usize,
    pub comp_worker: u32,
    /// Per-element submission sequence, for preserve-latency ordering.
    pub seq: u64,
    pub status: TaskStatus,
    pub batch: Option<Box<PacketBatch>>,
    /// Staged host input: per datablock, [arg blob][item data].
    pub input: Vec<u8>,
    /// Device output copied back by the coprocessor worker. May be shorter
    /// than `output_expected` when the device under-produced.
    pub output: Vec<u8>,
    pub output_expected: usize,
    pub dbs: Vec<PackedDb>,
    pub args: Vec<KernelArg>,
    pub kernel: KernelRef,
    pub res: ResourceParam,
}

impl OffloadTask {
    pub fn new() -> Self {
        OffloadTask {
            element: u32::MAX,
            input_port: 0,
            comp_worker: u32::MAX,
            seq: 0,
            status: TaskStatus::Staged,
            batch: None,
            input: Vec::new(),
            output: Vec::new(),
            output_expected: 0,
            dbs: Vec::new(),
            args: Vec::new(),
            kernel: KernelRef(0),
            res: ResourceParam::default(),
        }
    }

    /// Recycle for the pool. The batch must already have been taken back.
    pub fn reset(&mut self) {
        debug_assert!(self.batch.is_none());
        self.element = u32::MAX;
        self.input_port = 0;
        self.comp_worker = u32::MAX;
        self.seq = 0;
        self.status = TaskStatus::Staged;
        self.input.clear();
        self.output.clear();
        self.output_expected = 0;
        self.dbs.clear();
        self.args.clear();
    }
}

impl Default for OffloadTask {
    fn default() -> Self {
        OffloadTask::new()
    }
}

/// Live-slot mask of packets that cannot carry every declared ROI. The
/// executor kills those before staging; a task never ships a partial item.
pub fn roi_miss_mask(specs: &[DatablockSpec], batch: &PacketBatch) -> u64 {
    let mut mask = 0u64;
    for idx in batch.live_indices() {
        let pkt = batch.pkt(idx).expect("live slot holds packet");
        for spec in specs {
            if spec.roi_in.resolve(pkt).is_none()
                || (spec.roi_out != Roi::None && spec.roi_out.resolve(pkt).is_none())
            {
                mask |= 1u64 << idx;
                break;
            }
        }
    }
    mask
}

#[inline]
fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Pack every declared datablock of `batch` into the task and attach the
/// batch. The caller has already removed ROI misses and dead packets.
///
/// Kernel argument convention: one u64 blob-offset argument per datablock,
/// in declaration order, then the element's own arguments.
pub fn stage(
    task: &mut OffloadTask,
    mut batch: Box<PacketBatch>,
    element: u32,
    input_port: usize,
    comp_worker: u32,
    seq: u64,
    specs: &[DatablockSpec],
    kernel: KernelRef,
    elem_args: &[KernelArg],
    workgroup_size: u32,
) {
    task.element = element;
    task.input_port = input_port;
    task.comp_worker = comp_worker;
    task.seq = seq;
    task.status = TaskStatus::Staged;
    task.input.clear();
    task.output.clear();
    task.dbs.clear();
    task.args.clear();
    task.kernel = kernel;

    let live = batch.live_count() as u32;
    let mut out_cursor = 0usize;
    let mut misses = Vec::new();

    for (spec_idx, spec) in specs.iter().enumerate() {
        let layout_in = datablock::pack_input(spec, &batch, &mut task.input, &mut misses);
        debug_assert!(misses.is_empty(), "roi misses must be culled before staging");
        let layout_out = datablock::plan_output(spec, &batch, out_cursor as u64);
        out_cursor = align8(out_cursor + layout_out.total_bytes);

        let blob = datablock::pack_args(spec, &[(&layout_in, &layout_out)]);
        let blob_off = align8(task.input.len());
        task.input.resize(blob_off, 0);
        task.input.extend_from_slice(&blob);

        task.args.push(KernelArg::from_u64(blob_off as u64));
        task.dbs.push(PackedDb {
            spec_idx,
            blob_off,
            blob_len: blob.len(),
            layout_in,
            layout_out,
        });
    }
    task.args.extend_from_slice(elem_args);
    task.output_expected = out_cursor;
    task.res = ResourceParam { num_items: live, num_batches: 1, workgroup_size };

    batch.offload_started();
    task.batch = Some(batch);
}

/// Per-item view of one datablock's device output. `None` when the device
/// under-produced and this item's slot is absent or truncated.
pub fn output_item<'a>(task: &'a OffloadTask, db: &PackedDb, item_idx: usize) -> Option<&'a [u8]> {
    let off = db.layout_out.base as usize + *db.layout_out.item_offsets.get(item_idx)? as usize;
    let len = *db.layout_out.item_sizes.get(item_idx)? as usize;
    if off + len > task.output.len() {
        return None;
    }
    Some(&task.output[off..off + len])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    fn batch_of(lens: &[usize]) -> Box<PacketBatch> {
        let mut b = Box::new(PacketBatch::new());
        for &l in lens {
            let mut p = Box::new(Packet::new());
            p.reset(0, 0, 0);
            p.fill(&vec![0x5A; l]);
            b.push(p);
        }
        b
    }

    const SPECS: &[DatablockSpec] = &[
        DatablockSpec {
            name: "span",
            roi_in: Roi::SpanToTrail { offset: 14, trail: 20 },
            roi_out: Roi::TrailSlot { trail: 20, len: 20 },
        },
        DatablockSpec { name: "anno", roi_in: Roi::Annotations, roi_out: Roi::None },
    ];

    #[test]
    fn roi_miss_mask_flags_short_packets() {
        let batch = batch_of(&[100, 20, 64]);
        let mask = roi_miss_mask(SPECS, &batch);
        assert_eq!(mask, 0b010);
    }

    #[test]
    fn stage_packs_all_datablocks() {
        let batch = batch_of(&[100, 64]);
        let mut task = OffloadTask::new();
        stage(&mut task, batch, 3, 0, 1, 42, SPECS, KernelRef(5), &[KernelArg::from_u64(9)], 64);

        assert_eq!(task.element, 3);
        assert_eq!(task.seq, 42);
        assert_eq!(task.dbs.len(), 2);
        // One blob-offset arg per datablock, then the element arg.
        assert_eq!(task.args.len(), 3);
        assert_eq!(task.args[2].as_u64(), 9);
        assert_eq!(task.res.num_items, 2);
        assert_eq!(task.res.workgroup_size, 64);
        assert_eq!(task.batch.as_ref().unwrap().pending_offloads(), 1);

        // The embedded blobs parse back.
        let db0 = &task.dbs[0];
        let view =
            datablock::unpack_args(&task.input[db0.blob_off..db0.blob_off + db0.blob_len], 1)
                .unwrap();
        assert_eq!(view.total_in, 2);
        assert_eq!(view.batches[0].item_sizes_in, vec![66, 30]);
    }

    #[test]
    fn output_item_handles_underproduction() {
        let batch = batch_of(&[100, 64]);
        let mut task = OffloadTask::new();
        stage(&mut task, batch, 0, 0, 0, 0, SPECS, KernelRef(0), &[], 32);
        // Device produced only the first 20-byte digest.
        task.output = vec![0xEE; 20];
        let db0 = task.dbs[0].clone();
        assert!(output_item(&task, &db0, 0).is_some());
        assert!(output_item(&task, &db0, 1).is_none());
    }
}
