//! Zero-copy multi-chunk byte sequences.
//!
//! Protocol frames are assembled from pieces that already live in separate
//! buffers (metadata, headers, payload). [`SequenceBuilder`] collects those
//! pieces without copying them and [`Sequence`] presents them as one logical
//! byte range. Slicing a sequence and reading it through [`bytes::Buf`] both
//! share the original buffers.
//!
//! ```ignore
//! use bytes::Bytes;
//! use pulsebee_client::SequenceBuilder;
//!
//! let mut builder = SequenceBuilder::new();
//! builder.append(Bytes::from_static(b"payload"));
//! builder.prepend(Bytes::from_static(b"header:"));
//! let sequence = builder.build();
//!
//! assert_eq!(sequence.len(), 14);
//! assert_eq!(sequence.to_bytes(), Bytes::from_static(b"header:payload"));
//! ```

use std::{
    collections::VecDeque,
    ops::{Bound, RangeBounds},
    sync::Arc,
};

use bytes::{Buf, Bytes, BytesMut};

/// Collects chunks at either end in O(1).
///
/// Empty chunks are skipped; they contribute nothing to the sequence.
#[derive(Debug, Clone, Default)]
pub struct SequenceBuilder {
    chunks: VecDeque<Bytes>,
}

impl SequenceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prepend(&mut self, chunk: impl Into<Bytes>) -> &mut Self {
        let chunk = chunk.into();
        if !chunk.is_empty() {
            self.chunks.push_front(chunk);
        }
        self
    }

    pub fn append(&mut self, chunk: impl Into<Bytes>) -> &mut Self {
        let chunk = chunk.into();
        if !chunk.is_empty() {
            self.chunks.push_back(chunk);
        }
        self
    }

    /// Appends every chunk of an already built sequence, sharing its buffers.
    pub fn append_sequence(&mut self, sequence: &Sequence) -> &mut Self {
        self.chunks.extend(sequence.chunks().cloned());
        self
    }

    /// Total byte length. Walks the chunk list.
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Snapshot of the current chunks. The builder stays usable.
    pub fn build(&self) -> Sequence {
        let mut running_index = 0;
        let segments = self
            .chunks
            .iter()
            .map(|bytes| {
                let segment = Segment {
                    running_index,
                    bytes: bytes.clone(),
                };
                running_index += bytes.len();
                segment
            })
            .collect::<Vec<_>>();

        Sequence {
            segments: segments.into(),
            len: running_index,
        }
    }
}

#[derive(Debug, Clone)]
struct Segment {
    /// Offset of the first byte of this segment within the sequence.
    running_index: usize,
    bytes: Bytes,
}

impl Segment {
    fn end(&self) -> usize {
        self.running_index + self.bytes.len()
    }
}

/// Immutable view over one or more shared byte chunks.
///
/// Cloning is cheap: segments live behind an `Arc` and chunks are `Bytes`.
#[derive(Debug, Clone)]
pub struct Sequence {
    segments: Arc<[Segment]>,
    len: usize,
}

impl Default for Sequence {
    fn default() -> Self {
        Self {
            segments: Arc::from(Vec::new()),
            len: 0,
        }
    }
}

impl Sequence {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Bytes> + '_ {
        self.segments.iter().map(|segment| &segment.bytes)
    }

    /// Index of the segment containing `offset`, for `offset < len`.
    fn locate(&self, offset: usize) -> usize {
        self.segments.partition_point(|segment| segment.end() <= offset)
    }

    /// Sub-range of the sequence sharing the same buffers.
    ///
    /// Bounds past the end are clamped to the sequence length.
    pub fn slice(&self, range: impl RangeBounds<usize>) -> Sequence {
        let start = match range.start_bound() {
            Bound::Included(&n) => n,
            Bound::Excluded(&n) => n.saturating_add(1),
            Bound::Unbounded => 0,
        }
        .min(self.len);
        let end = match range.end_bound() {
            Bound::Included(&n) => n.saturating_add(1),
            Bound::Excluded(&n) => n,
            Bound::Unbounded => self.len,
        }
        .clamp(start, self.len);

        if start == end {
            return Sequence::default();
        }

        let mut builder = SequenceBuilder::new();
        for segment in &self.segments[self.locate(start)..] {
            if segment.running_index >= end {
                break;
            }
            let from = start.saturating_sub(segment.running_index);
            let to = (end - segment.running_index).min(segment.bytes.len());
            builder.append(segment.bytes.slice(from..to));
        }
        builder.build()
    }

    /// Contiguous copy of the sequence; zero-copy when there is a single segment.
    pub fn to_bytes(&self) -> Bytes {
        match self.segments.len() {
            0 => Bytes::new(),
            1 => self.segments[0].bytes.clone(),
            _ => {
                let mut buf = BytesMut::with_capacity(self.len);
                for segment in self.segments.iter() {
                    buf.extend_from_slice(&segment.bytes);
                }
                buf.freeze()
            }
        }
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.to_bytes().to_vec()
    }

    /// Cursor implementing [`Buf`] over the sequence.
    pub fn reader(&self) -> SequenceReader {
        SequenceReader {
            sequence: self.clone(),
            segment: 0,
            offset: 0,
            remaining: self.len,
        }
    }
}

impl PartialEq for Sequence {
    /// Content equality, independent of chunk boundaries.
    fn eq(&self, other: &Self) -> bool {
        if self.len != other.len {
            return false;
        }
        let mut left = self.reader();
        let mut right = other.reader();
        while left.has_remaining() {
            let n = left.chunk().len().min(right.chunk().len());
            if left.chunk()[..n] != right.chunk()[..n] {
                return false;
            }
            left.advance(n);
            right.advance(n);
        }
        true
    }
}

impl Eq for Sequence {}

impl From<Bytes> for Sequence {
    fn from(bytes: Bytes) -> Self {
        let mut builder = SequenceBuilder::new();
        builder.append(bytes);
        builder.build()
    }
}

impl From<Vec<u8>> for Sequence {
    fn from(bytes: Vec<u8>) -> Self {
        Bytes::from(bytes).into()
    }
}

impl From<&'static [u8]> for Sequence {
    fn from(bytes: &'static [u8]) -> Self {
        Bytes::from_static(bytes).into()
    }
}

impl From<&'static str> for Sequence {
    fn from(text: &'static str) -> Self {
        Bytes::from_static(text.as_bytes()).into()
    }
}

impl From<String> for Sequence {
    fn from(text: String) -> Self {
        Bytes::from(text).into()
    }
}

impl From<SequenceBuilder> for Sequence {
    fn from(builder: SequenceBuilder) -> Self {
        builder.build()
    }
}

/// [`Buf`] cursor over a [`Sequence`].
#[derive(Debug, Clone)]
pub struct SequenceReader {
    sequence: Sequence,
    segment: usize,
    offset: usize,
    remaining: usize,
}

impl Buf for SequenceReader {
    fn remaining(&self) -> usize {
        self.remaining
    }

    fn chunk(&self) -> &[u8] {
        match self.sequence.segments.get(self.segment) {
            Some(segment) => &segment.bytes[self.offset..],
            None => &[],
        }
    }

    /// Advancing past the end stops at the end.
    fn advance(&mut self, cnt: usize) {
        let mut cnt = cnt.min(self.remaining);
        while cnt > 0 {
            let Some(segment) = self.sequence.segments.get(self.segment) else {
                break;
            };
            let available = segment.bytes.len() - self.offset;
            if cnt < available {
                self.offset += cnt;
                self.remaining -= cnt;
                return;
            }
            cnt -= available;
            self.remaining -= available;
            self.segment += 1;
            self.offset = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_chunks() -> Sequence {
        let mut builder = SequenceBuilder::new();
        builder
            .append(Bytes::from_static(b"world"))
            .append(Bytes::from_static(b"!"))
            .prepend(Bytes::from_static(b"hello "));
        builder.build()
    }

    #[test]
    fn test_builder_orders_prepend_and_append() {
        let sequence = three_chunks();
        assert_eq!(sequence.len(), 12);
        assert_eq!(sequence.segment_count(), 3);
        assert_eq!(sequence.to_bytes(), Bytes::from_static(b"hello world!"));
    }

    #[test]
    fn test_builder_len_and_empty_chunks() {
        let mut builder = SequenceBuilder::new();
        assert!(builder.is_empty());
        builder.append(Bytes::new()).append(Bytes::from_static(b"abc"));
        assert_eq!(builder.len(), 3);
        assert_eq!(builder.chunk_count(), 1);
    }

    #[test]
    fn test_build_is_a_snapshot() {
        let mut builder = SequenceBuilder::new();
        builder.append(Bytes::from_static(b"one"));
        let first = builder.build();
        builder.append(Bytes::from_static(b"two"));

        assert_eq!(first.len(), 3);
        assert_eq!(builder.build().len(), 6);
    }

    #[test]
    fn test_slice_across_segments_shares_buffers() {
        let sequence = three_chunks();
        let original = sequence.chunks().next().unwrap().as_ptr() as usize;

        let slice = sequence.slice(4..8);
        assert_eq!(slice.to_vec(), b"o wo");
        assert_eq!(slice.segment_count(), 2);
        // first sliced chunk points into the original buffer
        assert_eq!(
            slice.chunks().next().unwrap().as_ptr() as usize,
            original + 4
        );
    }

    #[test]
    fn test_slice_bounds_are_clamped() {
        let sequence = three_chunks();
        assert_eq!(sequence.slice(6..).to_vec(), b"world!");
        assert_eq!(sequence.slice(..=4).to_vec(), b"hello");
        assert_eq!(sequence.slice(10..100).to_vec(), b"d!");
        assert!(sequence.slice(50..).is_empty());
        assert!(sequence.slice(3..3).is_empty());
    }

    #[test]
    fn test_single_segment_to_bytes_is_zero_copy() {
        let bytes = Bytes::from_static(b"payload");
        let sequence = Sequence::from(bytes.clone());
        assert_eq!(sequence.to_bytes().as_ptr(), bytes.as_ptr());
    }

    #[test]
    fn test_reader_walks_all_segments() {
        let mut reader = three_chunks().reader();
        assert_eq!(reader.remaining(), 12);
        assert_eq!(reader.chunk(), b"hello ");

        reader.advance(8);
        assert_eq!(reader.chunk(), b"rld");
        assert_eq!(reader.remaining(), 4);

        let mut rest = vec![0u8; 4];
        reader.copy_to_slice(&mut rest);
        assert_eq!(rest, b"rld!");
        assert!(!reader.has_remaining());
        assert!(reader.chunk().is_empty());
    }

    #[test]
    fn test_equality_ignores_chunk_boundaries() {
        let contiguous = Sequence::from("hello world!");
        assert_eq!(three_chunks(), contiguous);
        assert_ne!(three_chunks(), Sequence::from("hello world?"));
        assert_ne!(three_chunks(), Sequence::from("hello"));
    }

    #[test]
    fn test_append_sequence() {
        let mut builder = SequenceBuilder::new();
        builder.append(Bytes::from_static(b">> "));
        builder.append_sequence(&three_chunks());
        assert_eq!(builder.build().to_vec(), b">> hello world!");
        assert_eq!(builder.chunk_count(), 4);
    }
}
