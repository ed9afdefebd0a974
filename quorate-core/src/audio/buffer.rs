//! Per-device capture buffers and the chunk type handed to sessions.

use std::collections::VecDeque;

/// Bounded ring of the most recent samples from one device.
///
/// Continuously overwritten while the engine is idle so that speech at the
/// instant the trigger key goes down is not lost. Stored as whole callback
/// blocks; eviction trims the oldest block partially when needed so the
/// buffered duration never exceeds the configured capacity.
#[derive(Debug)]
pub struct PrerollRing {
    blocks: VecDeque<Vec<f32>>,
    total: usize,
    capacity: usize,
}

impl PrerollRing {
    /// `capacity` is in samples (`preroll_seconds * sample_rate`).
    pub fn new(capacity: usize) -> Self {
        Self {
            blocks: VecDeque::new(),
            total: 0,
            capacity,
        }
    }

    /// Append a callback block, evicting the oldest samples past capacity.
    pub fn push_block(&mut self, block: &[f32]) {
        if self.capacity == 0 || block.is_empty() {
            return;
        }
        if block.len() >= self.capacity {
            self.blocks.clear();
            self.blocks
                .push_back(block[block.len() - self.capacity..].to_vec());
            self.total = self.capacity;
            return;
        }

        self.blocks.push_back(block.to_vec());
        self.total += block.len();

        while self.total > self.capacity {
            let excess = self.total - self.capacity;
            let front_len = self.blocks.front().map(Vec::len).unwrap_or(0);
            if front_len <= excess {
                self.blocks.pop_front();
                self.total -= front_len;
            } else {
                if let Some(front) = self.blocks.front_mut() {
                    front.drain(..excess);
                }
                self.total -= excess;
            }
        }
    }

    /// Copy the buffered samples in chronological order, leaving them in place.
    ///
    /// The ring keeps filling after a snapshot — recording start copies the
    /// pre-roll, it does not consume it.
    pub fn snapshot(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.total);
        for block in &self.blocks {
            out.extend_from_slice(block);
        }
        out
    }

    pub fn len_samples(&self) -> usize {
        self.total
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Growing per-device sample accumulator, active only while recording.
#[derive(Debug, Default)]
pub struct ChunkBuilder {
    blocks: Vec<Vec<f32>>,
    total: usize,
}

impl ChunkBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from a pre-roll snapshot at recording start.
    pub fn seed(&mut self, samples: Vec<f32>) {
        self.total = samples.len();
        self.blocks = if samples.is_empty() {
            Vec::new()
        } else {
            vec![samples]
        };
    }

    pub fn push_block(&mut self, block: &[f32]) {
        if block.is_empty() {
            return;
        }
        self.total += block.len();
        self.blocks.push(block.to_vec());
    }

    pub fn len_samples(&self) -> usize {
        self.total
    }

    /// Drop `n` samples from the end, working backwards through blocks.
    pub fn trim_trailing(&mut self, n: usize) {
        let mut remaining = n.min(self.total);
        self.total -= remaining;
        while remaining > 0 {
            let Some(last) = self.blocks.last_mut() else {
                break;
            };
            if last.len() <= remaining {
                remaining -= last.len();
                self.blocks.pop();
            } else {
                let keep = last.len() - remaining;
                last.truncate(keep);
                remaining = 0;
            }
        }
    }

    /// Concatenate and reset, returning the accumulated samples.
    pub fn take(&mut self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.total);
        for block in self.blocks.drain(..) {
            out.extend_from_slice(&block);
        }
        self.total = 0;
        out
    }
}

/// One contiguous recorded segment across all devices.
///
/// Tracks are kept in device registration order so downstream fan-out and
/// logging are deterministic. All tracks cover the same time window.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    sample_rate: u32,
    tracks: Vec<(String, Vec<f32>)>,
}

impl AudioChunk {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            tracks: Vec::new(),
        }
    }

    pub fn push_track(&mut self, device: impl Into<String>, samples: Vec<f32>) {
        self.tracks.push((device.into(), samples));
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Device/samples pairs in registration order.
    pub fn tracks(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.tracks.iter().map(|(d, s)| (d.as_str(), s.as_slice()))
    }

    /// True when no device produced samples.
    pub fn is_empty(&self) -> bool {
        self.tracks.iter().all(|(_, s)| s.is_empty())
    }

    /// Duration of the longest track in seconds.
    pub fn duration_secs(&self) -> f64 {
        let longest = self.tracks.iter().map(|(_, s)| s.len()).max().unwrap_or(0);
        longest as f64 / self.sample_rate as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preroll_keeps_most_recent_samples_within_capacity() {
        let mut ring = PrerollRing::new(8);
        ring.push_block(&[1.0, 2.0, 3.0, 4.0]);
        ring.push_block(&[5.0, 6.0, 7.0, 8.0]);
        assert_eq!(ring.len_samples(), 8);

        // Pushing three more evicts the three oldest.
        ring.push_block(&[9.0, 10.0, 11.0]);
        assert_eq!(ring.len_samples(), 8);
        assert_eq!(
            ring.snapshot(),
            vec![4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0]
        );
    }

    #[test]
    fn preroll_never_exceeds_capacity() {
        let mut ring = PrerollRing::new(10);
        for i in 0..50 {
            ring.push_block(&vec![i as f32; 3]);
            assert!(ring.len_samples() <= ring.capacity());
        }
    }

    #[test]
    fn preroll_oversized_block_keeps_tail() {
        let mut ring = PrerollRing::new(4);
        let block: Vec<f32> = (0..10).map(|i| i as f32).collect();
        ring.push_block(&block);
        assert_eq!(ring.snapshot(), vec![6.0, 7.0, 8.0, 9.0]);
    }

    #[test]
    fn preroll_snapshot_does_not_consume() {
        let mut ring = PrerollRing::new(8);
        ring.push_block(&[1.0, 2.0]);
        let first = ring.snapshot();
        let second = ring.snapshot();
        assert_eq!(first, second);
        assert_eq!(ring.len_samples(), 2);
    }

    #[test]
    fn builder_trim_trailing_spans_blocks() {
        let mut builder = ChunkBuilder::new();
        builder.push_block(&[1.0, 2.0, 3.0]);
        builder.push_block(&[4.0, 5.0]);
        builder.trim_trailing(3);
        assert_eq!(builder.len_samples(), 2);
        assert_eq!(builder.take(), vec![1.0, 2.0]);
    }

    #[test]
    fn builder_trim_more_than_contents_empties() {
        let mut builder = ChunkBuilder::new();
        builder.push_block(&[1.0, 2.0]);
        builder.trim_trailing(10);
        assert_eq!(builder.len_samples(), 0);
        assert!(builder.take().is_empty());
    }

    #[test]
    fn builder_take_resets() {
        let mut builder = ChunkBuilder::new();
        builder.seed(vec![0.5; 4]);
        builder.push_block(&[0.25; 2]);
        assert_eq!(builder.take().len(), 6);
        assert_eq!(builder.len_samples(), 0);
        assert!(builder.take().is_empty());
    }

    #[test]
    fn chunk_empty_when_all_tracks_empty() {
        let mut chunk = AudioChunk::new(16_000);
        chunk.push_track("desk", vec![]);
        chunk.push_track("lapel", vec![]);
        assert!(chunk.is_empty());

        chunk.push_track("boom", vec![0.1]);
        assert!(!chunk.is_empty());
    }

    #[test]
    fn chunk_duration_uses_longest_track() {
        let mut chunk = AudioChunk::new(16_000);
        chunk.push_track("desk", vec![0.0; 16_000]);
        chunk.push_track("lapel", vec![0.0; 8_000]);
        approx::assert_relative_eq!(chunk.duration_secs(), 1.0);
    }
}
