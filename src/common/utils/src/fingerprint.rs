//! Stable 64-bit XXH3 hashing.
//!
//! `std::hash::DefaultHasher` is not guaranteed to be stable across Rust
//! releases, and fingerprints end up in server-side view names, so they must
//! not change between builds.

use xxhash_rust::xxh3::Xxh3;

pub struct Fingerprinter {
    state: Xxh3,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self { state: Xxh3::new() }
    }

    pub fn write(&mut self, bytes: &[u8]) -> &mut Self {
        self.state.update(bytes);
        self
    }

    /// Writes a length-prefixed string so that ("ab", "c") and ("a", "bc")
    /// hash differently.
    pub fn write_str(&mut self, value: &str) -> &mut Self {
        self.write(&(value.len() as u64).to_le_bytes());
        self.write(value.as_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.write(&value.to_le_bytes())
    }

    pub fn write_f64(&mut self, value: f64) -> &mut Self {
        // -0.0 and 0.0 describe the same buffer distance
        let normalized = if value == 0.0 { 0.0 } else { value };
        self.write(&normalized.to_bits().to_le_bytes())
    }

    pub fn finish(&self) -> u64 {
        self.state.digest()
    }

    pub fn finish_hex(&self) -> String {
        format!("{:016x}", self.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streaming_matches_one_shot_xxh3() {
        let mut fp = Fingerprinter::new();
        fp.write(b"lay").write(b"er");
        assert_eq!(fp.finish(), xxhash_rust::xxh3::xxh3_64(b"layer"));
        assert_eq!(fp.finish(), fp.finish());
    }

    #[test]
    fn length_prefix_separates_fields() {
        let mut left = Fingerprinter::new();
        left.write_str("ab").write_str("c");
        let mut right = Fingerprinter::new();
        right.write_str("a").write_str("bc");
        assert_ne!(left.finish(), right.finish());
    }

    #[test]
    fn signed_zero_is_normalized() {
        let mut pos = Fingerprinter::new();
        pos.write_f64(0.0);
        let mut neg = Fingerprinter::new();
        neg.write_f64(-0.0);
        assert_eq!(pos.finish(), neg.finish());
        assert_eq!(pos.finish_hex().len(), 16);
    }
}
