// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The task wire format.
//!
//! Primitives are little-endian fixed-width; variable-length byte strings are
//! length-prefixed with a 64-bit count. The same `wire` function drives both
//! directions through the [`Archive`] trait: the output archive reads fields
//! into the byte stream, the input archive writes the byte stream back into
//! fields. Bulk payloads never enter the byte stream; they travel as
//! [`DataTransfer`] records alongside it.

use crate::types::NodeId;
use bitflags::bitflags;
use smallvec::SmallVec;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DataTransferFlags: u32 {
        /// The receiver reads the payload from the sender.
        const RECEIVER_READ = 1 << 0;
        /// The receiver writes its output into the buffer.
        const RECEIVER_WRITE = 1 << 1;
        /// After the transfer, the sender owns freeing the buffer.
        const FREE_DATA = 1 << 2;
    }
}

/// Describes one bulk buffer accompanying a serialized task.
///
/// `data` is a raw address in the *sending* process; it is meaningful to the
/// transport (which moves the bytes) and never dereferenced by a receiver.
/// The invariants of §"unsafe data transfers" live here: the buffer must
/// outlive the transfer future, and only the direction named by `flags` may
/// be performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DataTransfer {
    pub flags: DataTransferFlags,
    pub data: u64,
    pub size: u64,
    pub node_id: NodeId,
}

// === impl DataTransfer ===

impl DataTransfer {
    /// A record pointing at `len` bytes starting at `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr..ptr+len` must stay valid and unmoved until the transfer built
    /// from this record completes.
    pub unsafe fn new(flags: DataTransferFlags, ptr: *const u8, len: usize) -> Self {
        Self {
            flags,
            data: ptr as u64,
            size: len as u64,
            node_id: 0,
        }
    }

    /// The empty record deserializers start from.
    pub const fn null() -> Self {
        Self {
            flags: DataTransferFlags::empty(),
            data: 0,
            size: 0,
            node_id: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.data == 0
    }

    /// Borrow the described buffer for reading.
    ///
    /// # Safety
    ///
    /// Only valid in the process that produced the record, while the buffer
    /// is alive, and only for `RECEIVER_READ` records.
    pub unsafe fn as_slice(&self) -> &[u8] {
        // Safety: forwarded to the caller.
        unsafe { core::slice::from_raw_parts(self.data as *const u8, self.size as usize) }
    }

    /// Borrow the described buffer for writing.
    ///
    /// # Safety
    ///
    /// Only valid in the process that produced the record, while the buffer
    /// is alive, and only for `RECEIVER_WRITE` records.
    #[expect(clippy::mut_from_ref, reason = "record describes externally owned memory")]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        // Safety: forwarded to the caller.
        unsafe { core::slice::from_raw_parts_mut(self.data as *mut u8, self.size as usize) }
    }
}

/// Field-visitor over the wire format, implemented by both archives so one
/// `wire` function per type serves save and load.
pub trait Archive {
    /// `true` when fields are being filled from the wire.
    fn is_loading(&self) -> bool;

    fn u8(&mut self, v: &mut u8);
    fn u32(&mut self, v: &mut u32);
    fn u64(&mut self, v: &mut u64);
    /// Fixed-width raw bytes, no length prefix.
    fn raw(&mut self, data: &mut [u8]);
    /// Length-prefixed byte string.
    fn bytes(&mut self, v: &mut Vec<u8>);
    /// A bulk-transfer record. Out: appended to the record list. In: the
    /// next pending record is consumed.
    fn xfer(&mut self, rec: &mut DataTransfer);

    fn string(&mut self, v: &mut String) {
        let mut buf = core::mem::take(v).into_bytes();
        self.bytes(&mut buf);
        *v = String::from_utf8_lossy(&buf).into_owned();
    }
}

/// A type with a wire representation.
pub trait WireSerialize {
    fn wire<A: Archive>(&mut self, ar: &mut A);
}

/// Everything `save_start`/`save_end` produced for one task: the ordered
/// bulk records plus the trailing metadata blob.
#[derive(Debug, Default)]
pub struct XferSet {
    pub records: SmallVec<[DataTransfer; 2]>,
    pub meta: Vec<u8>,
}

impl XferSet {
    /// Whether this set fits in a small-message RPC (no bulk records).
    pub fn is_small(&self) -> bool {
        self.records.is_empty()
    }
}

/// Serializes tasks for the wire.
#[derive(Debug)]
pub struct BinaryOutputArchive {
    node_id: NodeId,
    records: SmallVec<[DataTransfer; 2]>,
    meta: Vec<u8>,
}

// === impl BinaryOutputArchive ===

impl BinaryOutputArchive {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            records: SmallVec::new(),
            meta: Vec::new(),
        }
    }

    pub fn finish(self) -> XferSet {
        XferSet {
            records: self.records,
            meta: self.meta,
        }
    }
}

impl Archive for BinaryOutputArchive {
    fn is_loading(&self) -> bool {
        false
    }

    fn u8(&mut self, v: &mut u8) {
        self.meta.push(*v);
    }

    fn u32(&mut self, v: &mut u32) {
        self.meta.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: &mut u64) {
        self.meta.extend_from_slice(&v.to_le_bytes());
    }

    fn raw(&mut self, data: &mut [u8]) {
        self.meta.extend_from_slice(data);
    }

    fn bytes(&mut self, v: &mut Vec<u8>) {
        let mut len = v.len() as u64;
        self.u64(&mut len);
        self.meta.extend_from_slice(v);
    }

    fn xfer(&mut self, rec: &mut DataTransfer) {
        rec.node_id = self.node_id;
        self.records.push(*rec);
    }
}

/// Deserializes tasks from the wire.
///
/// Truncated input never panics; reads past the end zero-fill and set a
/// sticky error the caller surfaces as a protocol error.
#[derive(Debug)]
pub struct BinaryInputArchive<'a> {
    records: &'a [DataTransfer],
    next_record: usize,
    meta: &'a [u8],
    cursor: usize,
    truncated: bool,
}

// === impl BinaryInputArchive ===

impl<'a> BinaryInputArchive<'a> {
    pub fn new(records: &'a [DataTransfer], meta: &'a [u8]) -> Self {
        Self {
            records,
            next_record: 0,
            meta,
            cursor: 0,
            truncated: false,
        }
    }

    /// A metadata-only archive (small-message replies).
    pub fn from_meta(meta: &'a [u8]) -> Self {
        Self::new(&[], meta)
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.cursor.checked_add(len)?;
        if end > self.meta.len() {
            self.truncated = true;
            return None;
        }
        let out = &self.meta[self.cursor..end];
        self.cursor = end;
        Some(out)
    }
}

impl Archive for BinaryInputArchive<'_> {
    fn is_loading(&self) -> bool {
        true
    }

    fn u8(&mut self, v: &mut u8) {
        *v = self.take(1).map(|b| b[0]).unwrap_or_default();
    }

    fn u32(&mut self, v: &mut u32) {
        *v = self
            .take(4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
            .unwrap_or_default();
    }

    fn u64(&mut self, v: &mut u64) {
        *v = self
            .take(8)
            .map(|b| u64::from_le_bytes(b.try_into().unwrap()))
            .unwrap_or_default();
    }

    fn raw(&mut self, data: &mut [u8]) {
        match self.take(data.len()) {
            Some(src) => data.copy_from_slice(src),
            None => data.fill(0),
        }
    }

    fn bytes(&mut self, v: &mut Vec<u8>) {
        let mut len = 0_u64;
        self.u64(&mut len);
        v.clear();
        if let Some(src) = self.take(len as usize) {
            v.extend_from_slice(src);
        }
    }

    fn xfer(&mut self, rec: &mut DataTransfer) {
        if let Some(next) = self.records.get(self.next_record) {
            *rec = *next;
            self.next_record += 1;
        } else {
            self.truncated = true;
            *rec = DataTransfer::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitives_round_trip() {
        let mut out = BinaryOutputArchive::new(1);
        out.u8(&mut 7);
        out.u32(&mut 0x1234_5678);
        out.u64(&mut (u64::MAX - 1));
        out.string(&mut "strata".to_string());
        let set = out.finish();
        assert!(set.is_small());

        let mut ar = BinaryInputArchive::from_meta(&set.meta);
        let (mut a, mut b, mut c, mut s) = (0_u8, 0_u32, 0_u64, String::new());
        ar.u8(&mut a);
        ar.u32(&mut b);
        ar.u64(&mut c);
        ar.string(&mut s);
        assert!(!ar.is_truncated());
        assert_eq!((a, b, c, s.as_str()), (7, 0x1234_5678, u64::MAX - 1, "strata"));
    }

    #[test]
    fn byte_strings_are_length_prefixed() {
        let mut out = BinaryOutputArchive::new(1);
        out.bytes(&mut vec![1, 2, 3]);
        let set = out.finish();
        assert_eq!(&set.meta[..8], &3_u64.to_le_bytes());
        assert_eq!(&set.meta[8..], &[1, 2, 3]);
    }

    #[test]
    fn truncated_input_is_sticky_not_fatal() {
        let mut ar = BinaryInputArchive::from_meta(&[1, 2]);
        let mut v = 0_u32;
        ar.u32(&mut v);
        assert_eq!(v, 0);
        assert!(ar.is_truncated());
    }

    #[test]
    fn xfer_records_bypass_the_byte_stream() {
        let payload = [0x0a_u8; 16];
        let mut out = BinaryOutputArchive::new(3);
        // Safety: `payload` outlives the archive.
        let mut rec = unsafe {
            DataTransfer::new(DataTransferFlags::RECEIVER_READ, payload.as_ptr(), payload.len())
        };
        out.xfer(&mut rec);
        out.u32(&mut 9);
        let set = out.finish();
        assert!(!set.is_small());
        assert_eq!(set.records.len(), 1);
        assert_eq!(set.records[0].node_id, 3);
        assert_eq!(set.meta.len(), 4);

        let mut ar = BinaryInputArchive::new(&set.records, &set.meta);
        let mut rec2 = rec;
        ar.xfer(&mut rec2);
        assert_eq!(rec2.size, 16);
    }
}
