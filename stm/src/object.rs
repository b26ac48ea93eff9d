// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Object layout and the embedder's view on it.
//!
//! Every object starts with an 8 byte header followed by its payload:
//!
//! ```text
//! | size: u32 | flags: u16 | tag: u16 | payload ... |
//! ```
//!
//! `size` is the total size including the header, `flags` is owned by the
//! engine and `tag` is free for the embedder (the default [`SlotModel`] uses it
//! as the number of leading reference slots).

use std::fmt;

pub const HEADER_SIZE: usize = 8;
pub const WORD: usize = 8;
pub const MIN_OBJECT_SIZE: usize = 16;

/// Set on committed objects; cleared by the first write barrier of a transaction
pub(crate) const FLAG_WRITE_BARRIER: u16 = 1 << 0;

/// The young object has a pre-allocated old-space address
pub(crate) const FLAG_HAS_SHADOW: u16 = 1 << 1;

/// The nursery slot was moved; the first payload word holds the new address
pub(crate) const FLAG_FORWARDED: u16 = 1 << 2;

/// Major collection mark bit, only ever set in the sharing segment's copy
pub(crate) const FLAG_VISITED: u16 = 1 << 3;

/// A permanent logical heap address. The null reference is address zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ObjRef(u64);

impl ObjRef {
    pub const NULL: ObjRef = ObjRef(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn addr(self) -> u64 {
        self.0
    }

    pub(crate) fn from_addr(addr: u64) -> Self {
        Self(addr)
    }

    /// Address of the payload byte at `offset`
    pub(crate) fn field_addr(self, offset: usize) -> u64 {
        self.0 + (HEADER_SIZE + offset) as u64
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjRef({:#x})", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub size: u32,
    pub flags: u16,
    pub tag: u16,
}

impl Header {
    pub(crate) fn new(size: usize, tag: u16) -> Self {
        Self {
            size: size as u32,
            flags: 0,
            tag,
        }
    }

    pub fn decode(bytes: &[u8]) -> Self {
        let mut size = [0u8; 4];
        size.copy_from_slice(&bytes[0..4]);
        Self {
            size: u32::from_le_bytes(size),
            flags: u16::from_le_bytes([bytes[4], bytes[5]]),
            tag: u16::from_le_bytes([bytes[6], bytes[7]]),
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..4].copy_from_slice(&self.size.to_le_bytes());
        out[4..6].copy_from_slice(&self.flags.to_le_bytes());
        out[6..8].copy_from_slice(&self.tag.to_le_bytes());
        out
    }

    pub fn has(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}

/// Rounds a requested allocation size to the engine's granularity
pub(crate) fn round_size(size: usize) -> usize {
    let size = size.max(MIN_OBJECT_SIZE);
    (size + WORD - 1) & !(WORD - 1)
}

/// A borrowed copy of an object's bytes, header included.
pub struct ObjectView<'a> {
    obj: ObjRef,
    bytes: &'a [u8],
}

impl<'a> ObjectView<'a> {
    pub(crate) fn new(obj: ObjRef, bytes: &'a [u8]) -> Self {
        Self { obj, bytes }
    }

    pub fn obj(&self) -> ObjRef {
        self.obj
    }

    pub fn header(&self) -> Header {
        Header::decode(self.bytes)
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_SIZE..]
    }

    /// Reads the little endian word at payload `offset`
    pub fn word(&self, offset: usize) -> u64 {
        read_word(self.payload(), offset)
    }
}

pub(crate) fn read_word(bytes: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; WORD];
    word.copy_from_slice(&bytes[offset..offset + WORD]);
    u64::from_le_bytes(word)
}

/// Callbacks the embedding runtime provides so the collectors can walk objects.
pub trait ObjectModel: Send + Sync {
    /// Total size of the object in bytes, header included
    fn size_of(&self, header: &Header) -> usize;

    /// Calls `visit` with the payload offset of every reference slot
    fn trace(&self, obj: &ObjectView<'_>, visit: &mut dyn FnMut(usize));
}

/// Default object model: the header tag counts the leading reference slots
/// of the payload, everything after them is raw data.
#[derive(Debug, Default, Clone, Copy)]
pub struct SlotModel;

impl ObjectModel for SlotModel {
    fn size_of(&self, header: &Header) -> usize {
        header.size as usize
    }

    fn trace(&self, obj: &ObjectView<'_>, visit: &mut dyn FnMut(usize)) {
        let slots = (obj.header().tag as usize).min(obj.payload().len() / WORD);
        for slot in 0..slots {
            visit(slot * WORD);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encoding() {
        let header = Header {
            size: 48,
            flags: FLAG_WRITE_BARRIER | FLAG_HAS_SHADOW,
            tag: 3,
        };
        let decoded = Header::decode(&header.encode());
        assert_eq!(decoded, header);
        assert!(decoded.has(FLAG_HAS_SHADOW));
        assert!(!decoded.has(FLAG_FORWARDED));
    }

    #[test]
    fn test_round_size() {
        assert_eq!(round_size(1), MIN_OBJECT_SIZE);
        assert_eq!(round_size(16), 16);
        assert_eq!(round_size(17), 24);
        assert_eq!(round_size(64), 64);
    }

    #[test]
    fn test_slot_model_trace() {
        let mut bytes = vec![0u8; 40];
        bytes[..HEADER_SIZE].copy_from_slice(&Header::new(40, 2).encode());
        let view = ObjectView::new(ObjRef::from_addr(0x1000), &bytes);

        let mut slots = Vec::new();
        SlotModel.trace(&view, &mut |offset| slots.push(offset));
        assert_eq!(slots, vec![0, 8]);
        assert_eq!(SlotModel.size_of(&view.header()), 40);
    }
}
