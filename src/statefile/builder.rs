//! # State-File Builder
//!
//! During prepare the state file is assembled in memory before being written
//! anywhere. The builder keeps the data as a chain of buffers rather than
//! one contiguous allocation so the same chain can be streamed to the state
//! file and handed to the WAL as the segments of a single logical PREPARE
//! record, without a copy in between.
//!
//! Each appended block is padded to a MAX_ALIGN multiple; the reader
//! accounts for this by stepping in aligned units.

use zerocopy::IntoBytes;

use crate::config::max_align;
use crate::statefile::{RecordHeader, StateFileHeader, CRC_SIZE};
use crate::rmgr::{RmId, RM_END_ID};
use crate::types::{RelFileId, Xid};

/// Minimum allocation for a chain buffer; keeps small appends from
/// producing a long chain of tiny segments.
const MIN_CHAIN_BUF: usize = 512;

pub struct StateFileBuilder {
    chain: Vec<Vec<u8>>,
    /// Unused capacity in the current tail buffer.
    bytes_free: usize,
    /// Total padded bytes across the chain.
    total_len: u32,
}

impl StateFileBuilder {
    pub fn new() -> Self {
        Self {
            chain: Vec::new(),
            bytes_free: 0,
            total_len: 0,
        }
    }

    /// Append a block, padding it to a MAX_ALIGN multiple. The data is
    /// copied; the caller is free to reuse its buffer.
    pub fn append(&mut self, data: &[u8]) {
        let padded = max_align(data.len());

        if padded > self.bytes_free {
            let capacity = padded.max(MIN_CHAIN_BUF);
            self.chain.push(Vec::with_capacity(capacity));
            self.bytes_free = capacity;
        }

        let tail = self.chain.last_mut().expect("chain has a tail after push");
        tail.extend_from_slice(data);
        tail.resize(tail.len() + (padded - data.len()), 0);

        self.bytes_free -= padded;
        self.total_len += padded as u32;
    }

    /// Lay down the fixed header and the three leading arrays. The header's
    /// `total_len` is left zero; [`finish`](Self::finish) patches it once
    /// every record has been registered.
    pub fn start(
        &mut self,
        header: &StateFileHeader,
        children: &[Xid],
        commit_drops: &[RelFileId],
        abort_drops: &[RelFileId],
    ) {
        debug_assert!(self.chain.is_empty());
        debug_assert_eq!(header.total_len, 0);
        debug_assert_eq!(header.nsubxacts as usize, children.len());
        debug_assert_eq!(header.ncommitrels as usize, commit_drops.len());
        debug_assert_eq!(header.nabortrels as usize, abort_drops.len());

        self.append(header.as_bytes());
        if !children.is_empty() {
            self.append(children.as_bytes());
        }
        if !commit_drops.is_empty() {
            self.append(commit_drops.as_bytes());
        }
        if !abort_drops.is_empty() {
            self.append(abort_drops.as_bytes());
        }
    }

    /// Append one resource-manager record: header, then payload.
    pub fn register_record(&mut self, rmid: RmId, info: u16, payload: &[u8]) {
        let record = RecordHeader {
            len: payload.len() as u32,
            rmid,
            info,
        };
        self.append(record.as_bytes());
        if !payload.is_empty() {
            self.append(payload);
        }
    }

    /// Append the end sentinel and patch the header's `total_len` to the
    /// final file length, leaving room for the trailing CRC.
    pub fn finish(&mut self) {
        self.register_record(RM_END_ID, 0, &[]);

        let total = self.total_len + CRC_SIZE as u32;
        let head = self
            .chain
            .first_mut()
            .expect("finish called on an empty chain");
        head[4..8].copy_from_slice(&total.to_ne_bytes());
    }

    /// Total padded data bytes currently in the chain (excluding the CRC).
    pub fn total_len(&self) -> u32 {
        self.total_len
    }

    /// The chain segments, for streaming to the state file and the WAL.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.chain.iter().map(|buf| buf.as_slice())
    }
}

impl Default for StateFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GID_SIZE, MAX_ALIGN, STATE_FILE_MAGIC};

    fn header(nsubxacts: u32) -> StateFileHeader {
        StateFileHeader {
            magic: STATE_FILE_MAGIC,
            total_len: 0,
            xid: 7,
            database: 1,
            owner: 2,
            nsubxacts,
            ncommitrels: 0,
            nabortrels: 0,
            gid: [0u8; GID_SIZE],
        }
    }

    fn collect(builder: &StateFileBuilder) -> Vec<u8> {
        let mut out = Vec::new();
        for segment in builder.segments() {
            out.extend_from_slice(segment);
        }
        out
    }

    #[test]
    fn append_pads_to_maxalign() {
        let mut builder = StateFileBuilder::new();

        builder.append(&[1, 2, 3]);

        assert_eq!(builder.total_len(), MAX_ALIGN as u32);
        let bytes = collect(&builder);
        assert_eq!(&bytes[..3], &[1, 2, 3]);
        assert!(bytes[3..MAX_ALIGN].iter().all(|&b| b == 0));
    }

    #[test]
    fn oversized_append_starts_a_new_buffer() {
        let mut builder = StateFileBuilder::new();
        builder.append(&[0xAA; 16]);

        let big = vec![0xBB; MIN_CHAIN_BUF * 2];
        builder.append(&big);

        assert_eq!(builder.chain.len(), 2);
        assert_eq!(builder.total_len(), (16 + MIN_CHAIN_BUF * 2) as u32);
    }

    #[test]
    fn small_appends_share_one_buffer() {
        let mut builder = StateFileBuilder::new();

        for _ in 0..8 {
            builder.append(&[1, 2, 3, 4]);
        }

        assert_eq!(builder.chain.len(), 1);
        assert_eq!(builder.total_len(), 8 * MAX_ALIGN as u32);
    }

    #[test]
    fn finish_patches_total_len_with_crc_room() {
        let mut builder = StateFileBuilder::new();
        builder.start(&header(0), &[], &[], &[]);

        builder.finish();

        let bytes = collect(&builder);
        let patched = u32::from_ne_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(patched, builder.total_len() + CRC_SIZE as u32);
        assert_eq!(patched as usize, bytes.len() + CRC_SIZE);
    }

    #[test]
    fn record_payload_starts_on_aligned_offset() {
        let mut builder = StateFileBuilder::new();
        builder.start(&header(0), &[], &[], &[]);

        builder.register_record(1, 0, b"abc");
        builder.finish();

        let bytes = collect(&builder);
        let header_len = max_align(size_of::<StateFileHeader>());
        let record_start = header_len + max_align(size_of::<RecordHeader>());
        assert_eq!(&bytes[record_start..record_start + 3], b"abc");
        assert_eq!(record_start % MAX_ALIGN, 0);
    }
}
