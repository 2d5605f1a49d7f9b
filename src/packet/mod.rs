// FLOWLINE — PACKET + ANNOTATIONS
// One pool-allocated buffer per in-flight packet: headroom + payload plus
// the metadata the pipeline needs (source port, arrival timestamp, kill
// flag, annotation table). Ownership moves by Box between workers; the pool
// gets the Box back on TX or drop.

pub mod batch;

pub use batch::PacketBatch;

use crate::{MAX_PACKET_SIZE, PACKET_HEADROOM};

// ============================================================================
// ANNOTATIONS
// ============================================================================

/// Annotation slots. Fixed arity; a u16 validity map covers all of them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Anno {
    SourcePort = 0,
    Timestamp = 1,
    BatchId = 2,
    IfaceOut = 3,
    IpsecFlowId = 4,
    IpsecIv = 5,
}

pub const ANNO_SLOTS: usize = 6;
const _: () = assert!(ANNO_SLOTS <= 16);

/// Fixed-arity id → u64 table with per-slot validity. Setting an already-set
/// slot overwrites silently. Carried across offload by value and re-merged
/// on completion.
#[derive(Clone, Copy, Default, Debug)]
#[repr(C)]
pub struct Annotation {
    values: [u64; ANNO_SLOTS],
    valid: u16,
}

impl Annotation {
    pub const EMPTY: Self = Annotation { values: [0; ANNO_SLOTS], valid: 0 };

    #[inline(always)]
    pub fn set(&mut self, id: Anno, value: u64) {
        self.values[id as usize] = value;
        self.valid |= 1 << (id as u16);
    }

    #[inline(always)]
    pub fn is_set(&self, id: Anno) -> bool {
        self.valid & (1 << (id as u16)) != 0
    }

    /// Value of the slot; 0 when unset. Pair with `is_set` when the
    /// distinction matters.
    #[inline(always)]
    pub fn get(&self, id: Anno) -> u64 {
        self.values[id as usize]
    }

    #[inline(always)]
    pub fn clear(&mut self) {
        self.valid = 0;
    }
}

// ============================================================================
// PACKET
// ============================================================================

#[repr(C)]
pub struct Packet {
    buf: [u8; PACKET_HEADROOM + MAX_PACKET_SIZE],
    len: u16,
    source_port: u16,
    source_queue: u16,
    killed: bool,
    arrival_ns: u64,
    pub anno: Annotation,
}

impl Packet {
    pub fn new() -> Self {
        Packet {
            buf: [0; PACKET_HEADROOM + MAX_PACKET_SIZE],
            len: 0,
            source_port: 0,
            source_queue: 0,
            killed: false,
            arrival_ns: 0,
            anno: Annotation::EMPTY,
        }
    }

    /// Recycle for a fresh frame. Called by the I/O worker on RX fill.
    pub fn reset(&mut self, source_port: u16, source_queue: u16, arrival_ns: u64) {
        self.len = 0;
        self.source_port = source_port;
        self.source_queue = source_queue;
        self.killed = false;
        self.arrival_ns = arrival_ns;
        self.anno.clear();
        self.anno.set(Anno::SourcePort, source_port as u64);
        self.anno.set(Anno::Timestamp, arrival_ns);
    }

    /// Copy a frame into the payload region. Oversized frames are rejected;
    /// the caller counts them as invalid.
    pub fn fill(&mut self, frame: &[u8]) -> bool {
        if frame.len() > MAX_PACKET_SIZE {
            return false;
        }
        self.buf[PACKET_HEADROOM..PACKET_HEADROOM + frame.len()].copy_from_slice(frame);
        self.len = frame.len() as u16;
        true
    }

    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.buf[PACKET_HEADROOM..PACKET_HEADROOM + self.len as usize]
    }

    #[inline(always)]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[PACKET_HEADROOM..PACKET_HEADROOM + self.len as usize]
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline(always)]
    pub fn source_port(&self) -> u16 {
        self.source_port
    }

    #[inline(always)]
    pub fn source_queue(&self) -> u16 {
        self.source_queue
    }

    #[inline(always)]
    pub fn arrival_ns(&self) -> u64 {
        self.arrival_ns
    }

    /// Mark dead. Dead packets are elided from port pushes and returned to
    /// the pool at batch retirement.
    #[inline(always)]
    pub fn kill(&mut self) {
        self.killed = true;
    }

    #[inline(always)]
    pub fn is_killed(&self) -> bool {
        self.killed
    }
}

impl Default for Packet {
    fn default() -> Self {
        Packet::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotation_set_get_overwrite() {
        let mut a = Annotation::EMPTY;
        assert!(!a.is_set(Anno::IpsecFlowId));
        a.set(Anno::IpsecFlowId, 7);
        assert!(a.is_set(Anno::IpsecFlowId));
        assert_eq!(a.get(Anno::IpsecFlowId), 7);
        a.set(Anno::IpsecFlowId, 13);
        assert_eq!(a.get(Anno::IpsecFlowId), 13);
        assert!(!a.is_set(Anno::IfaceOut));
    }

    #[test]
    fn reset_seeds_port_and_timestamp() {
        let mut p = Packet::new();
        p.reset(3, 1, 12345);
        assert_eq!(p.anno.get(Anno::SourcePort), 3);
        assert_eq!(p.anno.get(Anno::Timestamp), 12345);
        assert!(!p.is_killed());
        p.kill();
        assert!(p.is_killed());
    }

    #[test]
    fn fill_bounds() {
        let mut p = Packet::new();
        p.reset(0, 0, 0);
        assert!(p.fill(&[0xAB; 64]));
        assert_eq!(p.len(), 64);
        assert_eq!(p.data()[0], 0xAB);
        assert!(!p.fill(&[0; MAX_PACKET_SIZE + 1]));
    }
}
