//! Fixed-size chunking of record slices.

use crate::record::DetectionRecord;
use std::num::NonZeroUsize;

/// A borrowed run of consecutive records, numbered from 1 within its batch.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub sequence: usize,
    pub records: &'a [DetectionRecord],
}

impl<'a> Chunk<'a> {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Lazy iterator over the chunks of a slice. Cloning restarts from the
/// clone's position.
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    inner: std::slice::Chunks<'a, DetectionRecord>,
    next_sequence: usize,
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let records = self.inner.next()?;
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        Some(Chunk { sequence, records })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl ExactSizeIterator for Chunks<'_> {}

/// Split `records` into chunks of `chunk_size`; only the last may be shorter.
pub fn chunk(records: &[DetectionRecord], chunk_size: NonZeroUsize) -> Chunks<'_> {
    Chunks {
        inner: records.chunks(chunk_size.get()),
        next_sequence: 1,
    }
}

/// Number of chunks `chunk` yields for `len` records.
pub fn chunk_count(len: usize, chunk_size: NonZeroUsize) -> usize {
    len.div_ceil(chunk_size.get())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::sample_record;

    fn records(n: usize) -> Vec<DetectionRecord> {
        (0..n).map(|i| sample_record("clip.mp4", i as f64)).collect()
    }

    fn size(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn test_chunk_sizes() {
        let records = records(250);
        let chunks: Vec<_> = chunk(&records, size(100)).collect();

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.len(), chunk_count(250, size(100)));
        assert_eq!(
            chunks.iter().map(|c| c.len()).collect::<Vec<_>>(),
            vec![100, 100, 50]
        );
        assert_eq!(
            chunks.iter().map(|c| c.sequence).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_exact_multiple() {
        let records = records(6);
        let chunks: Vec<_> = chunk(&records, size(3)).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[1].len(), 3);
    }

    #[test]
    fn test_order_preserved_and_restartable() {
        let records = records(7);
        let chunks = chunk(&records, size(2));

        let first: Vec<_> = chunks
            .clone()
            .flat_map(|c| c.records.iter().map(|r| r.detection_id))
            .collect();
        let second: Vec<_> = chunks
            .flat_map(|c| c.records.iter().map(|r| r.detection_id))
            .collect();
        let expected: Vec<_> = records.iter().map(|r| r.detection_id).collect();

        assert_eq!(first, expected);
        assert_eq!(second, expected);
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(chunk(&[], size(10)).count(), 0);
        assert_eq!(chunk_count(0, size(10)), 0);
    }
}
