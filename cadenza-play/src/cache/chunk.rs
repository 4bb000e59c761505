//! Cached sample blocks and the backing-file sample encoding

/// Chunk identity: `byte_offset / block_size`
pub type ChunkId = u64;

/// Bytes per stored sample (i16, little-endian)
pub const SAMPLE_SIZE: usize = 2;

/// Immutable block of samples read from the backing file
///
/// Shared as `Arc<Chunk>`; eviction only drops the cache's reference, so a
/// reader holding a chunk keeps its data alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    id: ChunkId,
    first_sample: u64,
    data: Vec<i16>,
}

impl Chunk {
    pub fn new(id: ChunkId, first_sample: u64, data: Vec<i16>) -> Self {
        Self {
            id,
            first_sample,
            data,
        }
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    /// Index of `samples()[0]` in the whole sample stream
    pub fn first_sample(&self) -> u64 {
        self.first_sample
    }

    /// One past the last sample index held by this chunk
    pub fn end_sample(&self) -> u64 {
        self.first_sample + self.data.len() as u64
    }

    pub fn samples(&self) -> &[i16] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Sample at absolute stream index, if this chunk holds it
    pub fn sample_at(&self, index: u64) -> Option<i16> {
        index
            .checked_sub(self.first_sample)
            .and_then(|offset| self.data.get(offset as usize))
            .copied()
    }
}

/// Encode samples for the backing file
pub fn encode_samples(samples: &[i16]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * SAMPLE_SIZE);
    for sample in samples {
        bytes.extend_from_slice(&sample.to_le_bytes());
    }
    bytes
}

/// Decode backing-file bytes; a trailing odd byte is ignored
pub fn decode_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(SAMPLE_SIZE)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}
