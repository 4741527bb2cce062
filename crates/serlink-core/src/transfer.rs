//! Chunk partitioning for a single upload.

use bytes::Bytes;

/// One file upload in progress.
///
/// Chunk `i` covers bytes `[i * chunk_size, min((i + 1) * chunk_size, len))`
/// of the source buffer. Every chunk is full-sized except possibly the last.
/// Chunks are zero-copy slices of the original buffer.
#[derive(Debug, Clone)]
pub struct Transfer {
    data: Bytes,
    chunk_size: usize,
    next: usize,
    generation: u64,
}

impl Transfer {
    /// Partition `data` into `chunk_size` pieces.
    ///
    /// `generation` tags every query belonging to this upload so results for
    /// an older, abandoned upload can be recognised.
    pub fn new(data: Bytes, chunk_size: usize, generation: u64) -> Self {
        Self { data, chunk_size: chunk_size.max(1), next: 0, generation }
    }

    /// Total length in bytes.
    pub fn total_len(&self) -> usize {
        self.data.len()
    }

    /// Number of chunks.
    pub fn chunk_count(&self) -> usize {
        self.data.len().div_ceil(self.chunk_size)
    }

    /// Chunk at `index`, or `None` past the end.
    pub fn chunk(&self, index: usize) -> Option<Bytes> {
        let start = index.checked_mul(self.chunk_size)?;
        if start >= self.data.len() {
            return None;
        }
        let end = (start + self.chunk_size).min(self.data.len());
        Some(self.data.slice(start..end))
    }

    /// Length of every chunk, in order.
    pub fn chunk_sizes(&self) -> Vec<usize> {
        (0..self.chunk_count()).filter_map(|index| self.chunk(index)).map(|c| c.len()).collect()
    }

    /// Index of the chunk awaiting acknowledgment (or next to send).
    pub fn next_index(&self) -> usize {
        self.next
    }

    /// Bytes acknowledged so far.
    pub fn acknowledged(&self) -> usize {
        (self.next * self.chunk_size).min(self.data.len())
    }

    /// Mark the current chunk acknowledged and move on.
    ///
    /// Returns `true` once every chunk has been acknowledged.
    pub fn advance(&mut self) -> bool {
        self.next += 1;
        self.is_complete()
    }

    /// Whether every chunk has been acknowledged.
    pub fn is_complete(&self) -> bool {
        self.next >= self.chunk_count()
    }

    /// Upload generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}
