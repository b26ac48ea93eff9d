// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Segments and Pages
//!
//! Every segment is a full view of the logical heap. The heap is divided into pages
//! and each segment tracks each page as either
//! - [`PageStatus::Inaccessible`]: never touched, or released,
//! - [`PageStatus::ReadOnly`]: reads go to the sharing segment's copy,
//! - [`PageStatus::Accessible`]: the segment owns a private copy.
//!
//! All heap accesses are explicit, access-checked operations. Touching a page that is
//! not accessible enough raises a fault, which privatizes the page: a donor copy is
//! taken from another segment (or the sharing segment) and the commit log is replayed
//! backwards until the copy reflects the faulting segment's own revision.

use crate::{
    object::{Header, ObjRef, HEADER_SIZE, WORD},
    segment::SHARING,
    Engine, Event,
};
#[cfg(feature = "verbose")]
use log::*;
use parking_lot::MutexGuard;
use std::ops::Range;
use zeroize::Zeroize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageStatus {
    Inaccessible,
    ReadOnly,
    Accessible,
}

/// Where an address lives in the logical heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Null,
    Nursery(usize),
    Old,
    Outside,
}

/// A part of an address range that lies within a single page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Chunk {
    pub page: usize,
    /// offset inside the page
    pub offset: usize,
    /// offset inside the accessed range
    pub start: usize,
    pub len: usize,
}

/// Address space layout: the null page, one nursery per segment, then old space.
#[derive(Debug, Clone)]
pub struct HeapLayout {
    page_size: usize,
    num_pages: usize,
    nursery_pages: usize,
    num_segments: usize,
}

impl HeapLayout {
    pub fn new(page_size: usize, num_pages: usize, nursery_pages: usize, num_segments: usize) -> Self {
        Self {
            page_size,
            num_pages,
            nursery_pages,
            num_segments,
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    pub fn page_of(&self, addr: u64) -> usize {
        (addr / self.page_size as u64) as usize
    }

    pub fn page_offset(&self, addr: u64) -> usize {
        (addr % self.page_size as u64) as usize
    }

    /// The addresses covered by `page`
    pub fn page_range(&self, page: usize) -> Range<u64> {
        let start = (page * self.page_size) as u64;
        start..start + self.page_size as u64
    }

    /// Nursery of segment `seg` (segments are numbered from 1)
    pub fn nursery_range(&self, seg: usize) -> Range<u64> {
        debug_assert!(seg >= 1 && seg <= self.num_segments);
        let start = ((1 + (seg - 1) * self.nursery_pages) * self.page_size) as u64;
        start..start + (self.nursery_pages * self.page_size) as u64
    }

    pub fn old_range(&self) -> Range<u64> {
        let start = ((1 + self.num_segments * self.nursery_pages) * self.page_size) as u64;
        start..(self.num_pages * self.page_size) as u64
    }

    /// Pages touched by the address range
    pub fn pages_of(&self, range: Range<u64>) -> Range<usize> {
        if range.is_empty() {
            return 0..0;
        }
        self.page_of(range.start)..self.page_of(range.end - 1) + 1
    }

    pub fn region(&self, addr: u64) -> Region {
        let page = self.page_of(addr);
        if page == 0 {
            Region::Null
        } else if page >= self.num_pages {
            Region::Outside
        } else if page < 1 + self.num_segments * self.nursery_pages {
            Region::Nursery(1 + (page - 1) / self.nursery_pages)
        } else {
            Region::Old
        }
    }

    pub fn is_old(&self, addr: u64) -> bool {
        self.region(addr) == Region::Old
    }

    pub fn in_nursery(&self, seg: usize, addr: u64) -> bool {
        self.region(addr) == Region::Nursery(seg)
    }

    /// Splits an address range at page boundaries
    pub(crate) fn chunks(&self, addr: u64, len: usize) -> impl Iterator<Item = Chunk> {
        let page_size = self.page_size;
        let mut done = 0;
        std::iter::from_fn(move || {
            if done >= len {
                return None;
            }
            let at = addr + done as u64;
            let offset = (at % page_size as u64) as usize;
            let chunk = Chunk {
                page: (at / page_size as u64) as usize,
                offset,
                start: done,
                len: (page_size - offset).min(len - done),
            };
            done += chunk.len;
            Some(chunk)
        })
    }
}

/// Status and private copies of every page, as seen by one segment.
pub(crate) struct PageTable {
    page_size: usize,
    status: Vec<PageStatus>,
    data: Vec<Option<Box<[u8]>>>,
}

impl PageTable {
    pub fn new(num_pages: usize, page_size: usize) -> Self {
        Self {
            page_size,
            status: vec![PageStatus::Inaccessible; num_pages],
            data: (0..num_pages).map(|_| None).collect(),
        }
    }

    pub fn status(&self, page: usize) -> PageStatus {
        self.status[page]
    }

    /// Installs a private copy of the page
    pub fn mark_accessible(&mut self, page: usize, buf: Box<[u8]>) {
        debug_assert_eq!(buf.len(), self.page_size);
        self.release(page);
        self.data[page] = Some(buf);
        self.status[page] = PageStatus::Accessible;
    }

    /// Exposes the sharing segment's copy of the page for reading
    pub fn mark_readonly(&mut self, page: usize) {
        self.release(page);
        self.status[page] = PageStatus::ReadOnly;
    }

    pub fn mark_inaccessible(&mut self, page: usize) {
        self.release(page);
        self.status[page] = PageStatus::Inaccessible;
    }

    fn release(&mut self, page: usize) {
        if let Some(mut buf) = self.data[page].take() {
            buf[..].zeroize();
        }
    }

    pub fn data(&self, page: usize) -> Option<&[u8]> {
        self.data[page].as_deref()
    }

    /// Returns the private copy, allocating a zeroed one if needed. Only used for the
    /// sharing segment, whose pages are always accessible.
    pub fn zeroed(&mut self, page: usize) -> &mut [u8] {
        let page_size = self.page_size;
        self.status[page] = PageStatus::Accessible;
        self.data[page].get_or_insert_with(|| vec![0; page_size].into_boxed_slice())
    }

    /// Copies out of an accessible page. Returns `false`, if the page has no private copy.
    pub fn read(&self, page: usize, offset: usize, out: &mut [u8]) -> bool {
        match &self.data[page] {
            Some(buf) => {
                out.copy_from_slice(&buf[offset..offset + out.len()]);
                true
            }
            None => false,
        }
    }

    /// Copies into an accessible page. Returns `false`, if the page has no private copy.
    pub fn write(&mut self, page: usize, offset: usize, src: &[u8]) -> bool {
        match &mut self.data[page] {
            Some(buf) => {
                buf[offset..offset + src.len()].copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    /// Zeroes a range of an accessible page
    pub fn clear(&mut self, page: usize, offset: usize, len: usize) {
        if let Some(buf) = &mut self.data[page] {
            buf[offset..offset + len].zeroize();
        }
    }

    pub fn accessible_pages(&self) -> impl Iterator<Item = usize> + '_ {
        self.status
            .iter()
            .enumerate()
            .filter(|(_, status)| **status == PageStatus::Accessible)
            .map(|(page, _)| page)
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        for buf in self.data.iter_mut().flatten() {
            buf[..].zeroize();
        }
    }
}

impl Engine {
    /// Returns the status of `page` as seen by segment `seg`
    pub fn page_status(&self, seg: usize, page: usize) -> PageStatus {
        self.segments[seg].pages.lock().status(page)
    }

    fn check_access(&self, seg: usize, addr: u64, len: usize) {
        debug_assert!(seg != SHARING);
        let last = addr + len.max(1) as u64 - 1;
        for at in [addr, last] {
            match self.layout.region(at) {
                Region::Old => {}
                Region::Nursery(owner) if owner == seg => {}
                Region::Nursery(owner) => {
                    panic!("segment {} accessed {:#x} in the nursery of segment {}", seg, at, owner)
                }
                Region::Null | Region::Outside => panic!("segment {} accessed {:#x} outside the heap", seg, at),
            }
        }
    }

    /// Reads heap bytes as seen by segment `seg`, faulting pages in as needed
    pub(crate) fn read_bytes(&self, seg: usize, addr: u64, out: &mut [u8]) {
        self.check_access(seg, addr, out.len());

        for chunk in self.layout.chunks(addr, out.len()) {
            let dst = &mut out[chunk.start..chunk.start + chunk.len];
            loop {
                let pages = self.segments[seg].pages.lock();
                if pages.read(chunk.page, chunk.offset, dst) {
                    break;
                }
                let status = pages.status(chunk.page);
                drop(pages);

                if status == PageStatus::ReadOnly {
                    let mut shared = self.segments[SHARING].pages.lock();
                    let pages = self.segments[seg].pages.lock();
                    if pages.status(chunk.page) == PageStatus::ReadOnly {
                        dst.copy_from_slice(&shared.zeroed(chunk.page)[chunk.offset..chunk.offset + chunk.len]);
                        break;
                    }
                    // invalidated by a commit in the meantime
                    continue;
                }
                self.handle_fault(seg, chunk.page, false);
            }
        }
    }

    /// Writes heap bytes into segment `seg`, privatizing pages as needed
    pub(crate) fn write_bytes(&self, seg: usize, addr: u64, src: &[u8]) {
        self.check_access(seg, addr, src.len());

        for chunk in self.layout.chunks(addr, src.len()) {
            let bytes = &src[chunk.start..chunk.start + chunk.len];
            loop {
                if self.segments[seg].pages.lock().write(chunk.page, chunk.offset, bytes) {
                    break;
                }
                self.handle_fault(seg, chunk.page, true);
            }
        }
    }

    /// Makes every page of the address range private to `seg`
    pub(crate) fn privatize(&self, seg: usize, addr: u64, len: usize) {
        self.check_access(seg, addr, len);
        for page in self.layout.pages_of(addr..addr + len as u64) {
            if self.segments[seg].pages.lock().status(page) != PageStatus::Accessible {
                self.handle_fault(seg, page, true);
            }
        }
    }

    pub(crate) fn read_header(&self, seg: usize, obj: ObjRef) -> Header {
        let mut bytes = [0u8; HEADER_SIZE];
        self.read_bytes(seg, obj.addr(), &mut bytes);
        Header::decode(&bytes)
    }

    pub(crate) fn write_header(&self, seg: usize, obj: ObjRef, header: Header) {
        self.write_bytes(seg, obj.addr(), &header.encode());
    }

    pub(crate) fn read_word(&self, seg: usize, addr: u64) -> u64 {
        let mut bytes = [0u8; WORD];
        self.read_bytes(seg, addr, &mut bytes);
        u64::from_le_bytes(bytes)
    }

    pub(crate) fn write_word(&self, seg: usize, addr: u64, value: u64) {
        self.write_bytes(seg, addr, &value.to_le_bytes());
    }

    /// Reads committed bytes straight from the sharing segment
    pub(crate) fn read_committed(&self, addr: u64, out: &mut [u8]) {
        let mut shared = self.segments[SHARING].pages.lock();
        for chunk in self.layout.chunks(addr, out.len()) {
            let page = shared.zeroed(chunk.page);
            out[chunk.start..chunk.start + chunk.len].copy_from_slice(&page[chunk.offset..chunk.offset + chunk.len]);
        }
    }

    /// Overwrites committed bytes in the sharing segment. Only the major collector does
    /// this, while every other segment is paused.
    pub(crate) fn write_committed(&self, addr: u64, src: &[u8]) {
        let mut shared = self.segments[SHARING].pages.lock();
        for chunk in self.layout.chunks(addr, src.len()) {
            let page = shared.zeroed(chunk.page);
            page[chunk.offset..chunk.offset + chunk.len].copy_from_slice(&src[chunk.start..chunk.start + chunk.len]);
        }
    }

    /// Reads a whole object as seen by `seg`
    pub(crate) fn read_object(&self, seg: usize, obj: ObjRef) -> Vec<u8> {
        let header = self.read_header(seg, obj);
        let mut bytes = vec![0u8; self.model.size_of(&header)];
        self.read_bytes(seg, obj.addr(), &mut bytes);
        bytes
    }

    /// Resolves an access to a page that is not accessible enough.
    ///
    /// A read fault of a segment that is up to date with the commit log just exposes the
    /// sharing segment's copy. Every other fault builds a private copy reflecting the
    /// segment's own revision:
    ///
    /// 1. lock the privatization locks of all segments, in increasing order
    /// 2. pick a donor: the private copy with the smallest revision not older than
    ///    ours, or else the sharing segment at the head of the log
    /// 3. undo the donor's uncommitted writes, using its modified list
    /// 4. undo every commit between the donor's revision and ours, newest first
    pub(crate) fn handle_fault(&self, seg: usize, page: usize, is_write: bool) {
        debug_assert!(seg != SHARING);
        let segment = &self.segments[seg];

        if !is_write {
            // the head only moves while the sharing segment is locked
            let _shared = self.segments[SHARING].pages.lock();
            let mut pages = segment.pages.lock();
            if pages.status(page) != PageStatus::Inaccessible {
                return;
            }
            if segment.revision() == self.log.head() {
                pages.mark_readonly(page);
                #[cfg(feature = "verbose")]
                trace!("FAULT({}): PAGE ({}) READ ONLY", seg, page);
                return;
            }
        }

        let mut guards: Vec<MutexGuard<'_, PageTable>> = self.segments.iter().map(|s| s.pages.lock()).collect();
        if guards[seg].status(page) == PageStatus::Accessible {
            return;
        }

        let target = segment.revision();
        let range = self.layout.page_range(page);

        let donor = (1..guards.len())
            .filter(|&num| num != seg && guards[num].status(page) == PageStatus::Accessible)
            .map(|num| (num, self.segments[num].revision()))
            .filter(|&(_, revision)| revision >= target)
            .min_by_key(|&(_, revision)| revision);

        let donated: Option<(Box<[u8]>, u64)> = donor.and_then(|(num, revision)| {
            let mut copy: Box<[u8]> = guards[num].data(page)?.into();
            self.segments[num].modified.read().undo_page(&range, &mut copy);
            Some((copy, revision))
        });
        let (mut copy, from) = match donated {
            Some(donated) => donated,
            None => (guards[SHARING].zeroed(page).as_ref().into(), self.log.head()),
        };

        let undone = self.log.undo_page(target, from, &range, &mut copy);
        guards[seg].mark_accessible(page, copy);
        drop(guards);

        #[cfg(feature = "verbose")]
        trace!(
            "FAULT({}): PAGE ({}) PRIVATIZED FROM ({:?}) REVISION ({}) -> ({}), UNDONE ({})",
            seg,
            page,
            donor.map(|(num, _)| num).unwrap_or(SHARING),
            from,
            target,
            undone
        );
        self.emit(seg, Event::PageFault { page, is_write, undone });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> HeapLayout {
        HeapLayout::new(256, 64, 4, 2)
    }

    #[test]
    fn test_regions() {
        let layout = layout();
        assert_eq!(layout.region(0), Region::Null);
        assert_eq!(layout.region(256), Region::Nursery(1));
        assert_eq!(layout.region(256 * 5), Region::Nursery(2));
        assert_eq!(layout.region(256 * 9), Region::Old);
        assert_eq!(layout.region(256 * 64), Region::Outside);
        assert_eq!(layout.nursery_range(2), 256 * 5..256 * 9);
        assert_eq!(layout.old_range(), 256 * 9..256 * 64);
        assert!(layout.in_nursery(1, 300));
        assert!(!layout.in_nursery(2, 300));
    }

    #[test]
    fn test_chunks() {
        let layout = layout();
        let chunks: Vec<Chunk> = layout.chunks(250, 300).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0], Chunk { page: 0, offset: 250, start: 0, len: 6 });
        assert_eq!(chunks[1], Chunk { page: 1, offset: 0, start: 6, len: 256 });
        assert_eq!(chunks[2], Chunk { page: 2, offset: 0, start: 262, len: 38 });
        assert_eq!(layout.pages_of(250..550), 0..3);
    }

    #[test]
    fn test_page_table_status() {
        let mut table = PageTable::new(4, 16);
        assert_eq!(table.status(1), PageStatus::Inaccessible);

        let mut out = [0u8; 4];
        assert!(!table.read(1, 0, &mut out));

        table.mark_accessible(1, vec![7; 16].into_boxed_slice());
        assert!(table.read(1, 4, &mut out));
        assert_eq!(out, [7; 4]);
        assert!(table.write(1, 0, &[1, 2]));
        assert_eq!(&table.data(1).map(|d| d[..3].to_vec()).unwrap_or_default(), &[1, 2, 7]);

        table.mark_readonly(1);
        assert_eq!(table.status(1), PageStatus::ReadOnly);
        assert!(table.data(1).is_none());

        table.mark_inaccessible(1);
        assert_eq!(table.accessible_pages().count(), 0);
        assert_eq!(table.zeroed(3), &[0; 16]);
        assert_eq!(table.accessible_pages().collect::<Vec<_>>(), vec![3]);
    }
}
