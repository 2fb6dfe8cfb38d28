use serde::{Deserialize, Serialize};

use crate::error::{DbError, DbResult};

/// Number of column positions covered by a single container.
pub const CONTAINER_WIDTH: u32 = 1 << 16;

/// Maximum cardinality stored in the array representation.
pub const ARRAY_MAX_SIZE: usize = 4096;

/// Number of 64-bit words in the bitmap representation.
const BITMAP_WORDS: usize = (CONTAINER_WIDTH as usize) / 64;

/// Compressed bitset over up to 65,536 consecutive positions.
///
/// Small sets are kept as a sorted array of 16-bit offsets; once the
/// cardinality crosses `ARRAY_MAX_SIZE` the container switches to a fixed
/// 8 KiB bitmap. The cached cardinality makes `count` O(1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Container {
    repr: Repr,
    n: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Repr {
    /// Sorted, deduplicated offsets.
    Array(Vec<u16>),
    /// Fixed-width bitset, always `BITMAP_WORDS` words long.
    Bitmap(Vec<u64>),
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl Container {
    pub fn new() -> Self {
        Self {
            repr: Repr::Array(Vec::new()),
            n: 0,
        }
    }

    /// Build a container from offsets already sorted ascending with no
    /// duplicates. Used by bulk import and by operator compaction.
    pub fn from_sorted(offsets: Vec<u16>) -> Self {
        let n = offsets.len() as u32;
        if offsets.len() > ARRAY_MAX_SIZE {
            let mut words = vec![0u64; BITMAP_WORDS];
            for off in offsets {
                words[off as usize / 64] |= 1 << (off % 64);
            }
            Self {
                repr: Repr::Bitmap(words),
                n,
            }
        } else {
            Self {
                repr: Repr::Array(offsets),
                n,
            }
        }
    }

    pub fn count(&self) -> u32 {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// True when backed by the array representation.
    pub fn is_array(&self) -> bool {
        matches!(self.repr, Repr::Array(_))
    }

    fn check_position(pos: u32) -> DbResult<u16> {
        if pos >= CONTAINER_WIDTH {
            return Err(DbError::InvalidPosition(pos as u64));
        }
        Ok(pos as u16)
    }

    /// Set a bit. Returns true if the bit was not already set.
    pub fn set(&mut self, pos: u32) -> DbResult<bool> {
        let off = Self::check_position(pos)?;
        let changed = match &mut self.repr {
            Repr::Array(offsets) => match offsets.binary_search(&off) {
                Ok(_) => false,
                Err(i) => {
                    // The 4097th bit forces the bitmap representation.
                    if offsets.len() >= ARRAY_MAX_SIZE {
                        self.to_bitmap();
                        return self.set(pos);
                    }
                    offsets.insert(i, off);
                    true
                }
            },
            Repr::Bitmap(words) => {
                let w = &mut words[off as usize / 64];
                let mask = 1u64 << (off % 64);
                let was = *w & mask != 0;
                *w |= mask;
                !was
            }
        };
        if changed {
            self.n += 1;
        }
        Ok(changed)
    }

    /// Clear a bit. Returns true if the bit was set.
    pub fn clear(&mut self, pos: u32) -> DbResult<bool> {
        let off = Self::check_position(pos)?;
        let changed = match &mut self.repr {
            Repr::Array(offsets) => match offsets.binary_search(&off) {
                Ok(i) => {
                    offsets.remove(i);
                    true
                }
                Err(_) => false,
            },
            Repr::Bitmap(words) => {
                let w = &mut words[off as usize / 64];
                let mask = 1u64 << (off % 64);
                let was = *w & mask != 0;
                *w &= !mask;
                was
            }
        };
        if changed {
            self.n -= 1;
            // Fall back to the array representation at the threshold.
            if self.n as usize == ARRAY_MAX_SIZE && !self.is_array() {
                self.to_array();
            }
        }
        Ok(changed)
    }

    pub fn contains(&self, pos: u32) -> bool {
        if pos >= CONTAINER_WIDTH {
            return false;
        }
        let off = pos as u16;
        match &self.repr {
            Repr::Array(offsets) => offsets.binary_search(&off).is_ok(),
            Repr::Bitmap(words) => words[off as usize / 64] & (1 << (off % 64)) != 0,
        }
    }

    fn to_bitmap(&mut self) {
        if let Repr::Array(offsets) = &self.repr {
            let mut words = vec![0u64; BITMAP_WORDS];
            for &off in offsets {
                words[off as usize / 64] |= 1 << (off % 64);
            }
            self.repr = Repr::Bitmap(words);
        }
    }

    fn to_array(&mut self) {
        if let Repr::Bitmap(words) = &self.repr {
            let mut offsets = Vec::with_capacity(self.n as usize);
            for (i, &word) in words.iter().enumerate() {
                let mut w = word;
                while w != 0 {
                    let bit = w.trailing_zeros();
                    offsets.push((i * 64) as u16 + bit as u16);
                    w &= w - 1;
                }
            }
            self.repr = Repr::Array(offsets);
        }
    }

    /// Intersection. The output representation follows the predicted
    /// cardinality: an array operand bounds the result to an array.
    pub fn and(&self, other: &Container) -> Container {
        match (&self.repr, &other.repr) {
            (Repr::Array(a), Repr::Array(b)) => {
                let mut out = Vec::new();
                let (mut i, mut j) = (0, 0);
                while i < a.len() && j < b.len() {
                    match a[i].cmp(&b[j]) {
                        std::cmp::Ordering::Less => i += 1,
                        std::cmp::Ordering::Greater => j += 1,
                        std::cmp::Ordering::Equal => {
                            out.push(a[i]);
                            i += 1;
                            j += 1;
                        }
                    }
                }
                Container::from_sorted(out)
            }
            (Repr::Array(a), Repr::Bitmap(_)) => {
                let out = a.iter().copied().filter(|&off| other.contains(off as u32)).collect();
                Container::from_sorted(out)
            }
            (Repr::Bitmap(_), Repr::Array(b)) => {
                let out = b.iter().copied().filter(|&off| self.contains(off as u32)).collect();
                Container::from_sorted(out)
            }
            (Repr::Bitmap(a), Repr::Bitmap(b)) => {
                let words: Vec<u64> = a.iter().zip(b.iter()).map(|(x, y)| x & y).collect();
                Container::from_words(words)
            }
        }
    }

    /// Union.
    pub fn or(&self, other: &Container) -> Container {
        match (&self.repr, &other.repr) {
            (Repr::Array(a), Repr::Array(b)) => {
                let mut out = Vec::with_capacity(a.len() + b.len());
                let (mut i, mut j) = (0, 0);
                while i < a.len() && j < b.len() {
                    match a[i].cmp(&b[j]) {
                        std::cmp::Ordering::Less => {
                            out.push(a[i]);
                            i += 1;
                        }
                        std::cmp::Ordering::Greater => {
                            out.push(b[j]);
                            j += 1;
                        }
                        std::cmp::Ordering::Equal => {
                            out.push(a[i]);
                            i += 1;
                            j += 1;
                        }
                    }
                }
                out.extend_from_slice(&a[i..]);
                out.extend_from_slice(&b[j..]);
                Container::from_sorted(out)
            }
            (Repr::Array(a), Repr::Bitmap(words)) | (Repr::Bitmap(words), Repr::Array(a)) => {
                let mut words = words.clone();
                for &off in a {
                    words[off as usize / 64] |= 1 << (off % 64);
                }
                Container::from_words(words)
            }
            (Repr::Bitmap(a), Repr::Bitmap(b)) => {
                let words: Vec<u64> = a.iter().zip(b.iter()).map(|(x, y)| x | y).collect();
                Container::from_words(words)
            }
        }
    }

    /// Difference: positions in `self` and not in `other`.
    pub fn and_not(&self, other: &Container) -> Container {
        match (&self.repr, &other.repr) {
            (Repr::Array(a), _) => {
                let out = a.iter().copied().filter(|&off| !other.contains(off as u32)).collect();
                Container::from_sorted(out)
            }
            (Repr::Bitmap(a), Repr::Array(b)) => {
                let mut words = a.clone();
                for &off in b {
                    words[off as usize / 64] &= !(1 << (off % 64));
                }
                Container::from_words(words)
            }
            (Repr::Bitmap(a), Repr::Bitmap(b)) => {
                let words: Vec<u64> = a.iter().zip(b.iter()).map(|(x, y)| x & !y).collect();
                Container::from_words(words)
            }
        }
    }

    /// Build from raw bitmap words, compacting to an array below threshold.
    fn from_words(words: Vec<u64>) -> Container {
        let n: u32 = words.iter().map(|w| w.count_ones()).sum();
        let mut c = Container {
            repr: Repr::Bitmap(words),
            n,
        };
        if n as usize <= ARRAY_MAX_SIZE {
            c.to_array();
        }
        c
    }

    /// Ascending iteration over set positions.
    pub fn iter(&self) -> ContainerIter<'_> {
        ContainerIter {
            container: self,
            idx: 0,
            word: match &self.repr {
                Repr::Bitmap(words) => words[0],
                Repr::Array(_) => 0,
            },
        }
    }

    /// Representation tag for the on-disk entry table.
    pub fn kind(&self) -> u8 {
        match self.repr {
            Repr::Array(_) => 0,
            Repr::Bitmap(_) => 1,
        }
    }

    /// Raw payload for a fixed-size container slot. Array containers fill a
    /// prefix of the slot; bitmap containers fill it entirely.
    pub fn slot_bytes(&self) -> Vec<u8> {
        match &self.repr {
            Repr::Array(offsets) => {
                let mut buf = Vec::with_capacity(offsets.len() * 2);
                for off in offsets {
                    buf.extend_from_slice(&off.to_le_bytes());
                }
                buf
            }
            Repr::Bitmap(words) => {
                let mut buf = Vec::with_capacity(words.len() * 8);
                for w in words {
                    buf.extend_from_slice(&w.to_le_bytes());
                }
                buf
            }
        }
    }

    /// Rebuild a container from an on-disk slot. The cardinality comes from
    /// the entry table and is validated against the payload.
    pub fn from_slot_bytes(kind: u8, n: u32, bytes: &[u8]) -> DbResult<Container> {
        match kind {
            0 => {
                if bytes.len() != n as usize * 2 {
                    return Err(DbError::CorruptFragment(format!(
                        "array container payload length {} does not match cardinality {}",
                        bytes.len(),
                        n
                    )));
                }
                let mut offsets = Vec::with_capacity(n as usize);
                for chunk in bytes.chunks_exact(2) {
                    offsets.push(u16::from_le_bytes([chunk[0], chunk[1]]));
                }
                if offsets.windows(2).any(|w| w[0] >= w[1]) {
                    return Err(DbError::CorruptFragment(
                        "array container offsets out of order".to_string(),
                    ));
                }
                Ok(Container {
                    repr: Repr::Array(offsets),
                    n,
                })
            }
            1 => {
                if bytes.len() != BITMAP_WORDS * 8 {
                    return Err(DbError::CorruptFragment(format!(
                        "bitmap container payload length {}",
                        bytes.len()
                    )));
                }
                let mut words = Vec::with_capacity(BITMAP_WORDS);
                for chunk in bytes.chunks_exact(8) {
                    words.push(u64::from_le_bytes(chunk.try_into().unwrap()));
                }
                let popcount: u32 = words.iter().map(|w| w.count_ones()).sum();
                if popcount != n {
                    return Err(DbError::CorruptFragment(format!(
                        "bitmap container popcount {} does not match cardinality {}",
                        popcount, n
                    )));
                }
                Ok(Container {
                    repr: Repr::Bitmap(words),
                    n,
                })
            }
            k => Err(DbError::CorruptFragment(format!("unknown container kind {}", k))),
        }
    }
}

/// Restartable pull-style iterator over the positions of one container.
pub struct ContainerIter<'a> {
    container: &'a Container,
    idx: usize,
    word: u64,
}

impl Iterator for ContainerIter<'_> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        match &self.container.repr {
            Repr::Array(offsets) => {
                let off = *offsets.get(self.idx)?;
                self.idx += 1;
                Some(off)
            }
            Repr::Bitmap(words) => {
                while self.word == 0 {
                    self.idx += 1;
                    if self.idx >= words.len() {
                        return None;
                    }
                    self.word = words[self.idx];
                }
                let bit = self.word.trailing_zeros();
                self.word &= self.word - 1;
                Some((self.idx * 64) as u16 + bit as u16)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_contains() {
        let mut c = Container::new();
        assert!(c.set(100).unwrap());
        assert!(!c.set(100).unwrap());
        assert!(c.contains(100));
        assert_eq!(c.count(), 1);

        assert!(c.clear(100).unwrap());
        assert!(!c.clear(100).unwrap());
        assert!(!c.contains(100));
        assert_eq!(c.count(), 0);
    }

    #[test]
    fn test_out_of_range_position() {
        let mut c = Container::new();
        assert!(matches!(c.set(65536), Err(DbError::InvalidPosition(65536))));
        assert!(matches!(c.clear(70000), Err(DbError::InvalidPosition(_))));
        assert!(!c.contains(65536));
    }

    #[test]
    fn test_array_to_bitmap_conversion() {
        let mut c = Container::new();
        for pos in 0..ARRAY_MAX_SIZE as u32 {
            c.set(pos * 2).unwrap();
        }
        assert!(c.is_array());
        assert_eq!(c.count(), 4096);

        // The 4097th bit crosses the threshold.
        c.set(60000).unwrap();
        assert!(!c.is_array());
        assert_eq!(c.count(), 4097);
        assert!(c.contains(60000));
        assert!(c.contains(0));

        // Dropping back to the threshold converts back.
        c.clear(60000).unwrap();
        assert!(c.is_array());
        assert_eq!(c.count(), 4096);
    }

    #[test]
    fn test_representation_equivalence() {
        let positions: Vec<u32> = (0..5000).map(|i| i * 13 % 65536).collect();
        let mut big = Container::new();
        for &p in &positions {
            big.set(p).unwrap();
        }
        assert!(!big.is_array());

        let mut small = Container::new();
        for &p in &positions[..100] {
            small.set(p).unwrap();
        }
        assert!(small.is_array());

        // Mixed-representation operators agree with membership tests.
        let and = big.and(&small);
        for &p in &positions[..100] {
            assert!(and.contains(p));
        }
        assert_eq!(and.count(), small.count());

        let or = big.or(&small);
        assert_eq!(or.count(), big.count());

        let diff = big.and_not(&small);
        assert_eq!(diff.count(), big.count() - small.count());
    }

    #[test]
    fn test_operator_output_representation() {
        let mut a = Container::new();
        let mut b = Container::new();
        for i in 0..6000u32 {
            a.set(i).unwrap();
            b.set(i + 3000).unwrap();
        }
        assert!(!a.is_array());
        assert!(!b.is_array());

        // 3000-element intersection compacts to an array.
        let and = a.and(&b);
        assert_eq!(and.count(), 3000);
        assert!(and.is_array());

        // 9000-element union stays a bitmap.
        let or = a.or(&b);
        assert_eq!(or.count(), 9000);
        assert!(!or.is_array());
    }

    #[test]
    fn test_iter_ascending() {
        let mut c = Container::new();
        for p in [9u32, 3, 65535, 0, 1024] {
            c.set(p).unwrap();
        }
        let got: Vec<u16> = c.iter().collect();
        assert_eq!(got, vec![0, 3, 9, 1024, 65535]);

        // Bitmap representation iterates in the same order.
        for p in 0..5000u32 {
            c.set(p * 3 % 65536).unwrap();
        }
        let got: Vec<u16> = c.iter().collect();
        let mut sorted = got.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(got, sorted);
    }

    #[test]
    fn test_slot_round_trip() {
        let mut array = Container::new();
        for p in [1u32, 5, 77, 1000] {
            array.set(p).unwrap();
        }
        let back =
            Container::from_slot_bytes(array.kind(), array.count(), &array.slot_bytes()).unwrap();
        assert_eq!(array, back);

        let mut bitmap = Container::new();
        for p in 0..5000u32 {
            bitmap.set(p).unwrap();
        }
        let back =
            Container::from_slot_bytes(bitmap.kind(), bitmap.count(), &bitmap.slot_bytes()).unwrap();
        assert_eq!(bitmap, back);
    }

    #[test]
    fn test_corrupt_slot_rejected() {
        let mut c = Container::new();
        c.set(1).unwrap();
        c.set(2).unwrap();
        let bytes = c.slot_bytes();
        assert!(Container::from_slot_bytes(0, 3, &bytes).is_err());
        assert!(Container::from_slot_bytes(7, 2, &bytes).is_err());
    }
}
