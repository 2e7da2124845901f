//! Bloom filter for fast negative lookups
//!
//! Admission filter consulted before the primary index: a "no" answer is
//! definitive, a "yes" may be a false positive. Sized from an expected item
//! count and a target false-positive rate.

/// Bloom filter over byte-string items
pub struct BloomFilter {
    /// Packed bit array, 64 bits per word
    words: Vec<u64>,

    /// Number of bits (m)
    num_bits: u64,

    /// Number of probes per item (k)
    num_hashes: u32,
}

impl BloomFilter {
    /// Create a filter sized for `expected_items` entries at the target
    /// `false_positive_rate`.
    ///
    /// Derivation:
    /// - m = ceil(-n * ln(p) / ln(2)^2) bits
    /// - k = round((m / n) * ln(2)) probes
    pub fn new(expected_items: usize, false_positive_rate: f64) -> Self {
        let n = expected_items.max(1) as f64;
        let p = false_positive_rate.clamp(f64::MIN_POSITIVE, 0.5);

        let ln2 = std::f64::consts::LN_2;
        let num_bits = (-n * p.ln() / (ln2 * ln2)).ceil().max(64.0) as u64;
        let num_hashes = ((num_bits as f64 / n) * ln2).round().max(1.0) as u32;

        let num_words = ((num_bits + 63) / 64) as usize;
        Self {
            words: vec![0u64; num_words],
            num_bits,
            num_hashes,
        }
    }

    /// Insert an item. There is no removal.
    pub fn add(&mut self, item: &[u8]) {
        let (h1, h2) = Self::base_hashes(item);
        for i in 0..self.num_hashes {
            self.set_bit(self.probe(h1, h2, i));
        }
    }

    /// Check whether an item might have been inserted. False positives are
    /// possible, false negatives are not.
    pub fn might_contain(&self, item: &[u8]) -> bool {
        let (h1, h2) = Self::base_hashes(item);
        (0..self.num_hashes).all(|i| self.get_bit(self.probe(h1, h2, i)))
    }

    /// Number of probes per item (for diagnostics)
    pub fn num_hashes(&self) -> u32 {
        self.num_hashes
    }

    /// Number of bits in the filter (for diagnostics)
    pub fn num_bits(&self) -> u64 {
        self.num_bits
    }

    // Internal helpers

    /// Double-hashing base pair: crc32 of the item and crc32 of the item
    /// reversed. The pair must stay stable across versions, since the filter
    /// is rebuilt from the same ids on every startup.
    fn base_hashes(item: &[u8]) -> (u64, u64) {
        let h1 = crc32fast::hash(item) as u64;
        let reversed: Vec<u8> = item.iter().rev().copied().collect();
        let h2 = crc32fast::hash(&reversed) as u64;
        (h1, h2)
    }

    /// The i-th probe position: (h1 + i * h2) mod m
    fn probe(&self, h1: u64, h2: u64, i: u32) -> u64 {
        h1.wrapping_add((i as u64).wrapping_mul(h2)) % self.num_bits
    }

    fn set_bit(&mut self, pos: u64) {
        self.words[(pos / 64) as usize] |= 1u64 << (pos % 64);
    }

    fn get_bit(&self, pos: u64) -> bool {
        self.words[(pos / 64) as usize] & (1u64 << (pos % 64)) != 0
    }
}
