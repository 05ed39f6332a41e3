use std::cmp::Reverse;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::Rng;

use crate::bitmap::{bitmask, lowbit_pos};
use crate::boundary::{BoundaryIndex, ByteKeyIndex, IntKeyIndex};
use crate::byte_key::ByteKey;
use crate::error::FilterError;
use crate::infix_store::{
    BASE_IMPLICIT_SIZE, ELEM_COUNT_BIT_COUNT, InfixStore, SCALE_IMPLICIT_SHIFT, SCALE_SHIFT,
    SIZE_GRADE_BIT_COUNT, SIZE_GRADE_SEP, SIZE_SCALAR_COUNT, Scales, TARGET_SIZE,
};
use crate::interval::{extract_partial_key, shared_ignore_implicit};

/// DIVA range filter over variable-width byte-string keys.
pub type Diva = DivaFilter<ByteKeyIndex>;
/// Int-optimized DIVA range filter over fixed 8-byte big-endian keys.
pub type DivaInt = DivaFilter<IntKeyIndex>;

const DEFAULT_LOAD_FACTOR_ALT: f32 = 0.95;

#[derive(Default, Debug)]
struct StreamState {
    left_key: Option<Vec<u8>>,
    pending: Vec<Vec<u8>>,
    max_len: u32,
}

/// Range filter engine: an ordered index of boundary keys, each owning a
/// compact infix store of the keys inserted into its interval. Point and
/// range queries have no false negatives; false positives are bounded by
/// the infix size.
#[derive(Debug)]
pub struct DivaFilter<I: BoundaryIndex> {
    index: I,
    scales: Scales,
    rng: StdRng,
    rng_seed: u32,
    load_factor: f32,
    load_factor_alt: f32,
    stream: StreamState,
}

impl<I: BoundaryIndex> DivaFilter<I> {
    /// Empty filter with no boundary keys. A bulk load (possibly of an
    /// empty iterator) must run before `insert`/`delete`, since those
    /// assume the sentinel boundaries exist.
    pub fn new(infix_size: u32, rng_seed: u32, load_factor: f32) -> Self {
        // the extraction window must fit one 8-byte read
        debug_assert!((1..=46).contains(&infix_size));
        Self {
            index: I::new(),
            scales: Scales::new(infix_size, load_factor, DEFAULT_LOAD_FACTOR_ALT),
            rng: StdRng::seed_from_u64(rng_seed as u64),
            rng_seed,
            load_factor,
            load_factor_alt: DEFAULT_LOAD_FACTOR_ALT,
            stream: StreamState::default(),
        }
    }

    /// Bulk-load from sorted fixed-width integer keys, encoded big-endian
    /// at `key_len` bytes. Both sentinels are inserted up front.
    pub fn new_fixed_width(
        infix_size: u32,
        keys: impl IntoIterator<Item = u64>,
        key_len: u32,
        rng_seed: u32,
        load_factor: f32,
    ) -> Result<Self, FilterError> {
        debug_assert!(key_len <= 8);
        let mut filter = Self::new(infix_size, rng_seed, load_factor);
        filter.add_boundary(&vec![0x00; key_len as usize]);
        filter.add_boundary(&vec![0xFF; key_len as usize]);
        let encoded: Vec<Vec<u8>> = keys
            .into_iter()
            .map(|k| k.to_be_bytes()[..key_len as usize].to_vec())
            .collect();
        filter.bulk_load_sorted(&encoded)?;
        Ok(filter)
    }

    /// Bulk-load from sorted byte-string keys. The min sentinel is
    /// inserted before loading, the max sentinel (of the longest observed
    /// key length) after.
    pub fn new_variable_width<K: AsRef<[u8]>>(
        infix_size: u32,
        keys: impl IntoIterator<Item = K>,
        rng_seed: u32,
        load_factor: f32,
    ) -> Result<Self, FilterError> {
        let mut filter = Self::new(infix_size, rng_seed, load_factor);
        filter.add_boundary(&[0x00; 8]);
        let encoded: Vec<Vec<u8>> = keys.into_iter().map(|k| k.as_ref().to_vec()).collect();
        let max_len = encoded.iter().map(|k| k.len()).max().unwrap_or(8);
        filter.bulk_load_sorted(&encoded)?;
        filter.add_boundary(&vec![0xFF; max_len]);
        Ok(filter)
    }

    fn add_boundary(&mut self, key: &[u8]) {
        let store = InfixStore::with_capacity(&self.scales, SIZE_GRADE_SEP);
        self.index.put(key, store);
    }

    /// Group-at-a-time load of a sorted, strictly increasing key list.
    /// Every `TARGET_SIZE`-th key becomes a boundary; the keys between two
    /// consecutive boundaries are packed into the left boundary's store.
    fn bulk_load_sorted(&mut self, keys: &[Vec<u8>]) -> Result<(), FilterError> {
        for w in keys.windows(2) {
            if w[0] >= w[1] {
                return Err(FilterError::UnsortedKeys);
            }
        }
        let n = keys.len();
        if n == 0 {
            return Ok(());
        }
        let group = TARGET_SIZE as usize;
        let mut b = 0usize;
        while b + group < n {
            self.put_group(&keys[b], &keys[b + group], &keys[b + 1..b + group], true);
            b += group;
        }
        if b == n - 1 {
            self.add_boundary(&keys[b]);
        } else {
            self.put_group(&keys[b], &keys[n - 1], &keys[b + 1..n - 1], false);
            self.add_boundary(&keys[n - 1]);
        }
        Ok(())
    }

    fn put_group<K: AsRef<[u8]>>(&mut self, left: &[u8], right: &[u8], interior: &[K], full: bool) {
        let lk = ByteKey::new(left);
        let rk = ByteKey::new(right);
        let (shared, ignore, implicit_size) = shared_ignore_implicit(lk, rk);
        let infix_size = self.scales.infix_size;
        let prev_implicit =
            extract_partial_key(lk, shared, ignore, implicit_size, infix_size, 0) >> infix_size;
        let next_implicit =
            extract_partial_key(rk, shared, ignore, implicit_size, infix_size, 1) >> infix_size;
        let total_implicit = (next_implicit - prev_implicit + 1) as u32;

        let mut infix_list = Vec::with_capacity(interior.len());
        for key in interior {
            let kk = ByteKey::new(key.as_ref());
            let extraction = extract_partial_key(
                kk,
                shared,
                ignore,
                implicit_size,
                infix_size,
                kk.get_bit(shared),
            );
            infix_list.push((extraction | 1) - (prev_implicit << infix_size));
        }

        let size_grade = if full {
            SIZE_GRADE_SEP
        } else {
            self.scales.grade_for_len(infix_list.len() as u64)
        };
        let mut store = InfixStore::with_capacity(&self.scales, size_grade);
        store.load_list(&self.scales, &infix_list, total_implicit);
        self.index.put(left, store);
    }

    // -- streaming bulk load --

    /// Feed one key of a sorted stream. Keys buffer into groups of
    /// `TARGET_SIZE - 1`; each group flushes into a store when the next
    /// boundary key arrives.
    pub fn bulk_load_stream(&mut self, key: &[u8]) -> Result<(), FilterError> {
        let prior = self.stream.pending.last().or(self.stream.left_key.as_ref());
        if let Some(prior) = prior {
            if key <= &prior[..] {
                return Err(FilterError::UnsortedKeys);
            }
        }
        if self.stream.left_key.is_none() {
            self.stream.left_key = Some(key.to_vec());
            self.stream.max_len = key.len() as u32;
            return Ok(());
        }
        self.stream.max_len = self.stream.max_len.max(key.len() as u32);
        if self.stream.pending.len() < TARGET_SIZE as usize - 1 {
            self.stream.pending.push(key.to_vec());
            return Ok(());
        }

        let Some(left) = self.stream.left_key.take() else {
            return Ok(());
        };
        let pending = std::mem::take(&mut self.stream.pending);
        self.put_group(&left, key, &pending, true);
        self.stream.left_key = Some(key.to_vec());
        Ok(())
    }

    pub fn bulk_load_stream_u64(&mut self, key: u64) -> Result<(), FilterError> {
        self.bulk_load_stream(&key.to_be_bytes())
    }

    /// Finish a streaming bulk load: insert the sentinels, flush the
    /// pending partial group, and promote the last fed key to a boundary.
    pub fn bulk_load_stream_finish(&mut self) {
        let Some(left) = self.stream.left_key.take() else {
            return;
        };
        let max_len = self.stream.max_len.max(1) as usize;
        self.add_boundary(&vec![0x00; max_len]);
        self.add_boundary(&vec![0xFF; max_len]);

        let mut pending = std::mem::take(&mut self.stream.pending);
        if let Some(right) = pending.pop() {
            self.put_group(&left, &right, &pending, false);
            self.add_boundary(&right);
        } else if self.index.get(&left).is_none() {
            // a lone trailing key that never became a boundary
            self.add_boundary(&left);
        }
        self.stream.max_len = 0;
    }

    // -- mutation --

    /// Insert a key. One in `TARGET_SIZE` inserts promotes the key to a
    /// new boundary and splits its interval; the rest go into the owning
    /// interval's store.
    pub fn insert(&mut self, key: &[u8]) {
        debug_assert!(!self.index.is_empty(), "bulk-load before inserting");
        if self.index.is_empty() {
            return;
        }
        if self.rng.gen_range(0..TARGET_SIZE) == 0 {
            self.insert_split(key);
        } else {
            self.insert_simple(key);
        }
    }

    pub fn insert_u64(&mut self, key: u64) {
        self.insert(&key.to_be_bytes());
    }

    /// Owned copies of the two boundary keys bracketing `key`: the owner
    /// boundary (`<= key`) and its successor (`> key`).
    fn neighbors(&self, key: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let (next_key, _) = self.index.ceiling(key)?;
        if next_key == key {
            let prev_key = key.to_vec();
            let next_key = self.index.after(key)?.0.to_vec();
            Some((prev_key, next_key))
        } else {
            let next_key = next_key.to_vec();
            let prev_key = self.index.before(key)?.0.to_vec();
            Some((prev_key, next_key))
        }
    }

    fn insert_simple(&mut self, key: &[u8]) {
        let Some((prev_key, next_key)) = self.neighbors(key) else {
            return;
        };
        debug_assert!(prev_key.as_slice() <= key && key < next_key.as_slice());
        let pk = ByteKey::new(&prev_key);
        let nk = ByteKey::new(&next_key);
        let k = ByteKey::new(key);
        let (shared, ignore, implicit_size) = shared_ignore_implicit(pk, nk);
        let infix_size = self.scales.infix_size;

        let extraction =
            extract_partial_key(k, shared, ignore, implicit_size, infix_size, k.get_bit(shared));
        let next_implicit =
            extract_partial_key(nk, shared, ignore, implicit_size, infix_size, 1) >> infix_size;
        let prev_implicit =
            extract_partial_key(pk, shared, ignore, implicit_size, infix_size, 0) >> infix_size;
        let total_implicit = (next_implicit - prev_implicit + 1) as u32;
        let insertee = (extraction | 1) - (prev_implicit << infix_size);

        let scales = &self.scales;
        if let Some(store) = self.index.store_mut(&prev_key) {
            store.insert_raw(scales, insertee, total_implicit);
        }
    }

    /// Promote `key` to a boundary: partition the owning store's infix
    /// list around it, re-extract both halves under the two finer
    /// intervals, and install the two new stores. If the split point
    /// aliases a stored short infix, the new boundary is truncated to that
    /// infix's precision and flagged partial.
    fn insert_split(&mut self, key: &[u8]) {
        let Some((prev_key, next_key)) = self.neighbors(key) else {
            return;
        };
        debug_assert!(prev_key.as_slice() <= key && key < next_key.as_slice());
        let infix_size = self.scales.infix_size;

        let (infix_list, store_partial, store_invalid_bits, divert) =
            match self.index.get(&prev_key) {
                None => return,
                Some(store) => {
                    let divert = store.is_partial()
                        && ByteKey::new(&prev_key)
                            .is_prefix_of(&ByteKey::new(key), store.invalid_bits());
                    if divert {
                        (Vec::new(), false, 0, true)
                    } else {
                        (
                            store.get_infix_list(&self.scales),
                            store.is_partial(),
                            store.invalid_bits(),
                            false,
                        )
                    }
                }
            };
        if divert {
            // cannot split through an existing partial boundary
            return self.insert_simple(key);
        }

        let pk = ByteKey::new(&prev_key);
        let nk = ByteKey::new(&next_key);
        let k = ByteKey::new(key);
        let (shared, ignore, implicit_size) = shared_ignore_implicit(pk, nk);
        let mut extraction =
            extract_partial_key(k, shared, ignore, implicit_size, infix_size, k.get_bit(shared));
        let prev_extraction = extract_partial_key(pk, shared, ignore, implicit_size, infix_size, 0);
        let next_extraction = extract_partial_key(nk, shared, ignore, implicit_size, infix_size, 1);
        let separator = (extraction | 1) - (prev_extraction & (bitmask(implicit_size) << infix_size));

        let infix_count = infix_list.len();
        let mut sep_l: i64 = -1;
        let mut sep_r: i64 = infix_count as i64;
        while sep_r - sep_l > 1 {
            let mid = (sep_l + sep_r) / 2;
            let value = infix_list[mid as usize];
            let stripped = value - (value & value.wrapping_neg());
            if stripped <= separator - 1 {
                sep_l = mid;
            } else {
                sep_r = mid;
            }
        }
        let mut split_pos = sep_r as usize;
        let mut zero_pos: i64 = -1;
        let mut i = sep_l;
        while i >= 0 && (infix_list[i as usize] >> infix_size) == (separator >> infix_size) {
            let value = infix_list[i as usize];
            let mask = ((value & value.wrapping_neg()) << 1).wrapping_sub(1);
            if (value | mask) == (separator | mask) {
                split_pos = i as usize;
                zero_pos = (shared + ignore + implicit_size + infix_size) as i64
                    - lowbit_pos(value) as i64
                    - 1;
            }
            i -= 1;
        }

        // truncate the boundary when it would alias an existing short infix
        let mut edited_key = key.to_vec();
        if zero_pos != -1 && edited_key.len() as i64 > (zero_pos - 1) / 8 {
            let byte = ((zero_pos - 1) / 8) as usize;
            edited_key[byte] &= !(bitmask((7 - ((zero_pos - 1) % 8)) as u32) as u8);
            edited_key.truncate(byte + 1);
        }
        let ek = ByteKey::new(&edited_key);
        if zero_pos != -1 {
            extraction =
                extract_partial_key(ek, shared, ignore, implicit_size, infix_size, ek.get_bit(shared));
        }

        // the two sub-intervals share everything up to the word holding the
        // old shared prefix, so restrict the re-scan to that word onward
        let shared_word_byte = ((shared / 64) * 8) as usize;
        let pk_sub = pk.suffix(shared_word_byte);
        let ek_sub = ek.suffix(shared_word_byte);
        let nk_sub = nk.suffix(shared_word_byte);

        let (shared_lt, ignore_lt, implicit_size_lt) = {
            let (s, i, l) = shared_ignore_implicit(pk_sub, ek_sub);
            (s + (shared_word_byte * 8) as u32, i, l)
        };
        let shamt_lt =
            (shared_lt + ignore_lt + implicit_size_lt) as i64 - (shared + ignore + implicit_size) as i64;
        debug_assert!(shamt_lt >= 0);
        let shamt_lt = shamt_lt as u32;
        let prev_extraction_lt =
            extract_partial_key(pk, shared_lt, ignore_lt, implicit_size_lt, infix_size, 0);
        let extraction_lt =
            extract_partial_key(ek, shared_lt, ignore_lt, implicit_size_lt, infix_size, 1);
        let left_start = pk.bits_at(shared + ignore + implicit_size, shamt_lt) << infix_size;
        let left_end = (((extraction >> infix_size) - (prev_extraction >> infix_size))
            << (infix_size + shamt_lt))
            | (ek.bits_at(shared + ignore + implicit_size, shamt_lt) << infix_size);
        let total_implicit_lt =
            ((extraction_lt >> infix_size) - (prev_extraction_lt >> infix_size) + 1) as u32;

        let (shared_gt, ignore_gt, implicit_size_gt) = {
            let (s, i, l) = shared_ignore_implicit(ek_sub, nk_sub);
            (s + (shared_word_byte * 8) as u32, i, l)
        };
        let shamt_gt =
            (shared_gt + ignore_gt + implicit_size_gt) as i64 - (shared + ignore + implicit_size) as i64;
        debug_assert!(shamt_gt >= 0);
        let shamt_gt = shamt_gt as u32;
        let extraction_gt =
            extract_partial_key(ek, shared_gt, ignore_gt, implicit_size_gt, infix_size, 0);
        let next_extraction_gt =
            extract_partial_key(nk, shared_gt, ignore_gt, implicit_size_gt, infix_size, 1);
        let right_start = (((extraction >> infix_size) - (prev_extraction >> infix_size))
            << (infix_size + shamt_gt))
            | (ek.bits_at(shared + ignore + implicit_size, shamt_gt) << infix_size);
        let right_end = (((next_extraction >> infix_size) - (prev_extraction >> infix_size))
            << (infix_size + shamt_gt))
            | (nk.bits_at(shared + ignore + implicit_size, shamt_gt) << infix_size);
        let total_implicit_gt =
            ((next_extraction_gt >> infix_size) - (extraction_gt >> infix_size) + 1) as u32;

        if zero_pos != -1 && zero_pos as u64 <= shared_lt.max(shared_gt) as u64 {
            return self.insert_simple(key);
        }

        let (left_len, left_expanded) = expanded_infix_list_len(
            &infix_list[..split_pos],
            implicit_size,
            shamt_lt,
            left_start,
            left_end,
            infix_size,
        );
        let left_list = update_infix_list(
            &infix_list[..split_pos],
            shamt_lt,
            left_start,
            left_end,
            left_len,
            left_expanded,
            infix_size,
        );
        let (right_len, right_expanded) = expanded_infix_list_len(
            &infix_list[split_pos..],
            implicit_size,
            shamt_gt,
            right_start,
            right_end,
            infix_size,
        );
        let right_list = update_infix_list(
            &infix_list[split_pos..],
            shamt_gt,
            right_start,
            right_end,
            right_len,
            right_expanded,
            infix_size,
        );

        let mut store_lt = InfixStore::allocate_with_list(&self.scales, &left_list, total_implicit_lt);
        store_lt.set_invalid_bits(store_invalid_bits);
        store_lt.set_partial(store_partial);
        let skip = (zero_pos != -1) as usize;
        let mut store_gt =
            InfixStore::allocate_with_list(&self.scales, &right_list[skip..], total_implicit_gt);

        self.index.put(&prev_key, store_lt);
        if zero_pos != -1 {
            // keep the promoted key queryable despite the truncation
            let key_extraction =
                extract_partial_key(k, shared_gt, ignore_gt, implicit_size_gt, infix_size, 0);
            store_gt.insert_raw(
                &self.scales,
                (key_extraction & bitmask(infix_size)) | 1,
                total_implicit_gt,
            );
            store_gt.set_invalid_bits((7 - ((zero_pos - 1) % 8)) as u32);
            store_gt.set_partial(true);
            self.index.put(&edited_key, store_gt);
        } else {
            self.index.put(key, store_gt);
        }
    }

    /// Delete a key. Deleting a boundary key, or the key a partial
    /// boundary was truncated from, merges its two intervals back into
    /// one. Deleting a key that is not present is an input violation and
    /// leaves the filter untouched.
    pub fn delete(&mut self, key: &[u8]) -> Result<(), FilterError> {
        if self.index.is_empty() {
            return Err(FilterError::EmptyFilter);
        }
        if !self.point_query(key) {
            return Err(FilterError::KeyNotFound);
        }

        let (next_is_key, next_partial) = match self.index.ceiling(key) {
            Some((next_key, store)) => (next_key == key, store.is_partial()),
            None => return Err(FilterError::KeyNotFound),
        };
        if next_is_key && !next_partial {
            let middle = key.to_vec();
            return self.delete_merge(&middle);
        }

        let Some((prev_key, next_key)) = self.neighbors(key) else {
            return Err(FilterError::KeyNotFound);
        };
        let pk = ByteKey::new(&prev_key);
        let nk = ByteKey::new(&next_key);
        let k = ByteKey::new(key);
        let (shared, ignore, implicit_size) = shared_ignore_implicit(pk, nk);
        let infix_size = self.scales.infix_size;

        let extraction =
            extract_partial_key(k, shared, ignore, implicit_size, infix_size, k.get_bit(shared));
        let next_implicit =
            extract_partial_key(nk, shared, ignore, implicit_size, infix_size, 1) >> infix_size;
        let prev_implicit =
            extract_partial_key(pk, shared, ignore, implicit_size, infix_size, 0) >> infix_size;
        let total_implicit = (next_implicit - prev_implicit + 1) as u32;
        let deletee = (extraction | 1) - (prev_implicit << infix_size);

        let must_merge = match self.index.get(&prev_key) {
            None => return Err(FilterError::KeyNotFound),
            Some(store) => {
                store.is_partial() && {
                    let longest_match = store.longest_matching_infix_size(&self.scales, deletee);
                    longest_match == 0
                        || 8 * prev_key.len() as u32 - store.invalid_bits()
                            > shared + ignore + implicit_size + longest_match - 1
                }
            }
        };
        if must_merge {
            // the deletion would invalidate the partial boundary itself
            return self.delete_merge(&prev_key);
        }

        let scales = &self.scales;
        match self.index.store_mut(&prev_key) {
            Some(store) => {
                store.delete_raw(scales, deletee, total_implicit);
                Ok(())
            }
            None => Err(FilterError::KeyNotFound),
        }
    }

    pub fn delete_u64(&mut self, key: u64) -> Result<(), FilterError> {
        self.delete(&key.to_be_bytes())
    }

    /// Remove the boundary `middle_key` and rebuild its two adjacent
    /// stores as one store over the widened interval, recovering each
    /// partial key's dropped prefix bits along the way.
    fn delete_merge(&mut self, middle_key: &[u8]) -> Result<(), FilterError> {
        let left_key = match self.index.before(middle_key) {
            Some((k, _)) => k.to_vec(),
            None => return Err(FilterError::KeyNotFound),
        };
        let right_key = match self.index.after(middle_key) {
            Some((k, _)) => k.to_vec(),
            None => return Err(FilterError::KeyNotFound),
        };
        let lk = ByteKey::new(&left_key);
        let mk = ByteKey::new(middle_key);
        let rk = ByteKey::new(&right_key);
        let (shared, ignore, implicit_size) = shared_ignore_implicit(lk, rk);
        let infix_size = self.scales.infix_size;

        let (mut infix_list, left_elem_count, left_partial, left_invalid_bits) = {
            let (Some(store_l), Some(store_r)) =
                (self.index.get(&left_key), self.index.get(middle_key))
            else {
                return Err(FilterError::KeyNotFound);
            };
            let mut list = store_l.get_infix_list(&self.scales);
            let left_elem_count = list.len();
            list.extend(store_r.get_infix_list(&self.scales));
            (list, left_elem_count, store_l.is_partial(), store_l.invalid_bits())
        };
        update_infix_list_delete(
            &self.scales,
            shared,
            ignore,
            implicit_size,
            lk,
            mk,
            &mut infix_list[..left_elem_count],
        );
        update_infix_list_delete(
            &self.scales,
            shared,
            ignore,
            implicit_size,
            mk,
            rk,
            &mut infix_list[left_elem_count..],
        );
        let implicit =
            extract_partial_key(lk, shared, ignore, implicit_size, infix_size, 0) >> infix_size;
        for value in infix_list.iter_mut() {
            *value -= implicit << infix_size;
        }

        self.index.remove(middle_key);

        let left_extraction = extract_partial_key(lk, shared, ignore, implicit_size, infix_size, 0);
        let right_extraction = extract_partial_key(rk, shared, ignore, implicit_size, infix_size, 1);
        let total_implicit =
            ((right_extraction >> infix_size) - (left_extraction >> infix_size) + 1) as u32;

        let mut store = InfixStore::allocate_with_list(&self.scales, &infix_list, total_implicit);
        store.set_partial(left_partial);
        store.set_invalid_bits(left_invalid_bits);
        self.index.put(&left_key, store);
        Ok(())
    }

    // -- queries --

    pub fn point_query(&self, key: &[u8]) -> bool {
        let Some((next_key, _)) = self.index.ceiling(key) else {
            return false;
        };
        if next_key == key {
            return true;
        }
        let Some((prev_key, store)) = self.index.before(key) else {
            return false;
        };
        if store.is_partial()
            && ByteKey::new(prev_key).is_prefix_of(&ByteKey::new(key), store.invalid_bits())
        {
            return true;
        }

        let pk = ByteKey::new(prev_key);
        let nk = ByteKey::new(next_key);
        let k = ByteKey::new(key);
        let (shared, ignore, implicit_size) = shared_ignore_implicit(pk, nk);
        let infix_size = self.scales.infix_size;
        let extraction =
            extract_partial_key(k, shared, ignore, implicit_size, infix_size, k.get_bit(shared));
        let prev_implicit =
            extract_partial_key(pk, shared, ignore, implicit_size, infix_size, 0) >> infix_size;
        let query_key = extraction - (prev_implicit << infix_size);
        store.point_contains(&self.scales, query_key)
    }

    pub fn point_query_u64(&self, key: u64) -> bool {
        self.point_query(&key.to_be_bytes())
    }

    pub fn range_query(&self, l: &[u8], r: &[u8]) -> bool {
        debug_assert!(l <= r);
        let Some((next_key, _)) = self.index.ceiling(l) else {
            return false;
        };
        if next_key <= r {
            // a boundary key lies inside the query range
            return true;
        }
        let Some((prev_key, store)) = self.index.before(l) else {
            return false;
        };
        if store.is_partial()
            && ByteKey::new(prev_key).is_prefix_of(&ByteKey::new(l), store.invalid_bits())
        {
            return true;
        }

        let pk = ByteKey::new(prev_key);
        let nk = ByteKey::new(next_key);
        let lk = ByteKey::new(l);
        let rk = ByteKey::new(r);
        let (shared, ignore, implicit_size) = shared_ignore_implicit(pk, nk);
        let infix_size = self.scales.infix_size;
        let l_extraction =
            extract_partial_key(lk, shared, ignore, implicit_size, infix_size, lk.get_bit(shared));
        let r_extraction =
            extract_partial_key(rk, shared, ignore, implicit_size, infix_size, rk.get_bit(shared));
        let prev_implicit =
            extract_partial_key(pk, shared, ignore, implicit_size, infix_size, 0) >> infix_size;
        let l_val = (l_extraction | 1) - (prev_implicit << infix_size);
        let r_val = (r_extraction | 1) - (prev_implicit << infix_size);
        store.range_contains(&self.scales, l_val, r_val)
    }

    pub fn range_query_u64(&self, l: u64, r: u64) -> bool {
        self.range_query(&l.to_be_bytes(), &r.to_be_bytes())
    }

    // -- maintenance --

    /// Shrink the explicit representation of every store to
    /// `new_infix_size` bits. Monotone: can only add false positives.
    pub fn shrink_infix_size(&mut self, new_infix_size: u32) {
        debug_assert!(0 < new_infix_size && new_infix_size <= self.scales.infix_size);
        let scales = &self.scales;
        self.index
            .for_each_store_mut(|store| store.shrink_infix_size(scales, new_infix_size));
        self.scales.infix_size = new_infix_size;
    }

    pub fn infix_size(&self) -> u32 {
        self.scales.infix_size
    }

    pub fn boundary_count(&self) -> usize {
        self.index.len()
    }

    /// Serialized footprint in bytes, including all boundary keys and
    /// store buffers.
    pub fn size(&self) -> usize {
        // version byte, six u32 constants, two f32s, infix size and seed,
        // and the two status-layout constants
        let mut res = 1 + 6 * 4 + 2 * 4 + 2 * 4 + 2 * 4;
        let scales = &self.scales;
        self.index.for_each(|key, store| {
            let rounded_key_len = key.len().div_ceil(8) * 8;
            res += 4 + rounded_key_len + 4;
            res += Scales::word_count(scales.scaled_size(store.size_grade()), scales.infix_size) * 8;
        });
        res + 4
    }

    // -- serialization --

    /// Append the flat little-endian dump of the filter to `out` and
    /// return the number of bytes written.
    pub fn serialize(&self, out: &mut Vec<u8>) -> usize {
        let start = out.len();
        out.push(I::INT_OPTIMIZED as u8);
        for constant in [
            TARGET_SIZE,
            BASE_IMPLICIT_SIZE,
            SCALE_SHIFT,
            SCALE_IMPLICIT_SHIFT,
            SIZE_SCALAR_COUNT as u32,
            SIZE_GRADE_SEP,
        ] {
            out.extend_from_slice(&constant.to_le_bytes());
        }
        out.extend_from_slice(&self.load_factor.to_le_bytes());
        out.extend_from_slice(&self.load_factor_alt.to_le_bytes());
        out.extend_from_slice(&self.scales.infix_size.to_le_bytes());
        out.extend_from_slice(&self.rng_seed.to_le_bytes());
        out.extend_from_slice(&SIZE_GRADE_BIT_COUNT.to_le_bytes());
        out.extend_from_slice(&ELEM_COUNT_BIT_COUNT.to_le_bytes());

        let scales = &self.scales;
        self.index.for_each(|key, store| {
            out.extend_from_slice(&(key.len() as u32).to_le_bytes());
            out.extend_from_slice(key);
            let rounded_key_len = key.len().div_ceil(8) * 8;
            out.resize(out.len() + rounded_key_len - key.len(), 0);
            out.extend_from_slice(&store.status.to_le_bytes());
            let word_count =
                Scales::word_count(scales.scaled_size(store.size_grade()), scales.infix_size);
            for &word in &store.data[..word_count] {
                out.extend_from_slice(&word.to_le_bytes());
            }
        });
        out.extend_from_slice(&u32::MAX.to_le_bytes());
        out.len() - start
    }

    /// Parse a `serialize` dump. The metadata header must match this
    /// build's constants exactly.
    pub fn deserialize(buf: &[u8]) -> Result<Self, FilterError> {
        let mut reader = Reader::new(buf);
        if reader.u8()? != I::INT_OPTIMIZED as u8 {
            return Err(FilterError::MetadataMismatch);
        }
        for expected in [
            TARGET_SIZE,
            BASE_IMPLICIT_SIZE,
            SCALE_SHIFT,
            SCALE_IMPLICIT_SHIFT,
            SIZE_SCALAR_COUNT as u32,
            SIZE_GRADE_SEP,
        ] {
            if reader.u32()? != expected {
                return Err(FilterError::MetadataMismatch);
            }
        }
        let load_factor = reader.f32()?;
        let load_factor_alt = reader.f32()?;
        let infix_size = reader.u32()?;
        let rng_seed = reader.u32()?;
        if reader.u32()? != SIZE_GRADE_BIT_COUNT || reader.u32()? != ELEM_COUNT_BIT_COUNT {
            return Err(FilterError::MetadataMismatch);
        }
        if infix_size == 0 || infix_size > 56 {
            return Err(FilterError::MalformedBuffer);
        }

        let mut filter = Self {
            index: I::new(),
            scales: Scales::new(infix_size, load_factor, load_factor_alt),
            rng: StdRng::seed_from_u64(rng_seed as u64),
            rng_seed,
            load_factor,
            load_factor_alt,
            stream: StreamState::default(),
        };
        loop {
            let key_len = reader.u32()? as usize;
            if key_len == u32::MAX as usize {
                break;
            }
            if I::INT_OPTIMIZED && key_len > 8 {
                return Err(FilterError::MalformedBuffer);
            }
            let rounded_key_len = key_len.div_ceil(8) * 8;
            let key = reader.bytes(rounded_key_len)?[..key_len].to_vec();
            let status = reader.u32()?;
            let size_grade = (status >> ELEM_COUNT_BIT_COUNT) & bitmask(SIZE_GRADE_BIT_COUNT) as u32;
            if size_grade as usize >= SIZE_SCALAR_COUNT {
                return Err(FilterError::MalformedBuffer);
            }
            let word_count =
                Scales::word_count(filter.scales.scaled_size(size_grade), infix_size);
            let mut data = Vec::with_capacity(word_count);
            for _ in 0..word_count {
                data.push(reader.u64()?);
            }
            filter.index.put(&key, InfixStore::from_raw(status, data));
        }
        Ok(filter)
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], FilterError> {
        if self.pos + n > self.buf.len() {
            return Err(FilterError::MalformedBuffer);
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, FilterError> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, FilterError> {
        let bytes = self.bytes(4)?;
        let arr: [u8; 4] = bytes.try_into().map_err(|_| FilterError::MalformedBuffer)?;
        Ok(u32::from_le_bytes(arr))
    }

    fn u64(&mut self) -> Result<u64, FilterError> {
        let bytes = self.bytes(8)?;
        let arr: [u8; 8] = bytes.try_into().map_err(|_| FilterError::MalformedBuffer)?;
        Ok(u64::from_le_bytes(arr))
    }

    fn f32(&mut self) -> Result<f32, FilterError> {
        let bytes = self.bytes(4)?;
        let arr: [u8; 4] = bytes.try_into().map_err(|_| FilterError::MalformedBuffer)?;
        Ok(f32::from_le_bytes(arr))
    }
}

/// Length of a split half's infix list after expansion: an infix whose
/// unary length marker would shift out of the explicit region no longer
/// distinguishes implicit positions, so it fans out over every implicit in
/// its covered range.
fn expanded_infix_list_len(
    list: &[u64],
    implicit_size: u32,
    shamt: u32,
    lower_lim: u64,
    upper_lim: u64,
    infix_size: u32,
) -> (usize, bool) {
    let mut actual_len = list.len();
    let mut expanded = false;
    let lower_implicit_lim = lower_lim >> infix_size;
    let upper_implicit_lim = upper_lim >> infix_size;
    for &value in list {
        let new_lowbit_position = lowbit_pos(value) + shamt;
        debug_assert!(implicit_size + infix_size > new_lowbit_position);
        if new_lowbit_position >= infix_size {
            let implicit_part = (value << shamt) >> infix_size;
            let start = implicit_part - (implicit_part & implicit_part.wrapping_neg());
            let end = implicit_part | (implicit_part - 1);
            actual_len += (end.min(upper_implicit_lim) - start.max(lower_implicit_lim)) as usize;
            expanded = true;
        }
    }
    (actual_len, expanded)
}

/// Rebase a split half's infix list onto its finer interval: shift each
/// infix by the added precision and renormalize to the new lower limit,
/// enumerating the infixes that lost their length marker.
fn update_infix_list(
    list: &[u64],
    shamt: u32,
    lower_lim: u64,
    upper_lim: u64,
    res_len: usize,
    expanded: bool,
    infix_size: u32,
) -> Vec<u64> {
    if !expanded {
        return list.iter().map(|&value| (value << shamt) - lower_lim).collect();
    }

    let mut res = Vec::with_capacity(res_len);
    let lower_implicit_lim = lower_lim >> infix_size;
    let upper_implicit_lim = upper_lim >> infix_size;
    for &value in list {
        let shifted = value << shamt;
        let implicit_part = shifted >> infix_size;
        let explicit_part = shifted & bitmask(infix_size);
        if explicit_part == 0 {
            debug_assert!(implicit_part > 0);
            let start = implicit_part - (implicit_part & implicit_part.wrapping_neg());
            let end = implicit_part | (implicit_part - 1);
            for j in start.max(lower_implicit_lim)..=end.min(upper_implicit_lim) {
                res.push(((j - lower_implicit_lim) << infix_size) | (1 << (infix_size - 1)));
            }
        } else {
            res.push(shifted - lower_lim);
        }
    }
    debug_assert_eq!(res.len(), res_len);

    res.sort_by_key(|&value| {
        let lowbit = value & value.wrapping_neg();
        (value - lowbit, Reverse(lowbit))
    });
    res
}

/// Rebase one side's infix list onto the merged interval: undo the old
/// interval's projection by re-inserting the boundary's dropped prefix
/// bits, the old difference bit and the old ignore run, then re-pack the
/// remaining explicit bits with the unary tail bit re-homed.
fn update_infix_list_delete(
    sc: &Scales,
    shared: u32,
    ignore: u32,
    implicit_size: u32,
    left_key: ByteKey<'_>,
    right_key: ByteKey<'_>,
    infix_list: &mut [u64],
) {
    let infix_size = sc.infix_size;
    let shared_word_byte = ((shared / 64) * 8) as usize;
    let (old_shared, old_ignore, old_implicit_size) = {
        let (s, i, l) = shared_ignore_implicit(
            left_key.suffix(shared_word_byte),
            right_key.suffix(shared_word_byte),
        );
        (s + (shared_word_byte * 8) as u32, i, l)
    };

    let old_left_implicit =
        extract_partial_key(left_key, old_shared, old_ignore, old_implicit_size, infix_size, 0)
            >> infix_size;
    let old_width = old_implicit_size + infix_size;
    let new_width = implicit_size + infix_size;

    if old_shared == shared {
        for entry in infix_list.iter_mut() {
            let mut value = *entry + (old_left_implicit << infix_size);
            let old_diff_bit = value >> (old_width - 1);
            value &= bitmask(old_width - 1);
            value = if new_width > old_width {
                value << (new_width - old_width)
            } else {
                (value >> (old_width - new_width)) | (value & 1)
            };

            let mut recovered_bit_cnt = 1u32;
            let mut recovered = old_diff_bit << (new_width - recovered_bit_cnt);
            let recovery_bits = (old_ignore - ignore).min(new_width - recovered_bit_cnt);
            recovered_bit_cnt += recovery_bits;
            recovered |= ((1u64 << recovery_bits).wrapping_sub(1 ^ old_diff_bit)
                & bitmask(recovery_bits))
                << (new_width - recovered_bit_cnt);
            if recovered_bit_cnt < new_width {
                recovered |= value >> (recovered_bit_cnt - 1);
                recovered |= ((lowbit_pos(value)) < recovered_bit_cnt - 1) as u64;
            } else {
                recovered |= 1;
            }
            debug_assert!(recovered_bit_cnt <= new_width);
            *entry = recovered;
        }
    } else {
        for entry in infix_list.iter_mut() {
            let mut value = *entry + (old_left_implicit << infix_size);
            let old_diff_bit = value >> (old_width - 1);
            value &= bitmask(old_width - 1);
            value = if new_width > old_width {
                value << (new_width - old_width)
            } else {
                (value >> (old_width - new_width)) | (value & 1)
            };

            let mut recovered_bit_cnt = 1u32;
            let mut recovered = left_key.get_bit(shared) << (new_width - recovered_bit_cnt);
            let recovery_bits = (old_shared - shared - ignore - 1).min(new_width - recovered_bit_cnt);
            recovered_bit_cnt += recovery_bits;
            recovered |= left_key.bits_at(shared + ignore + 1, recovery_bits)
                << (new_width - recovered_bit_cnt);
            if recovered_bit_cnt < new_width {
                recovered |= old_diff_bit << (new_width - recovered_bit_cnt - 1);
                let recovery_bits = (old_ignore + 1).min(new_width - recovered_bit_cnt);
                recovered_bit_cnt += recovery_bits;
                if recovery_bits > 1 {
                    recovered |= ((1u64 << (recovery_bits - 1)).wrapping_sub(1 ^ old_diff_bit)
                        & bitmask(recovery_bits - 1))
                        << (new_width - recovered_bit_cnt);
                }
            }
            if recovered_bit_cnt < new_width {
                recovered |= value >> (recovered_bit_cnt - 1);
                recovered |= ((lowbit_pos(value)) < recovered_bit_cnt - 1) as u64;
            } else {
                recovered |= 1;
            }
            debug_assert!(recovered_bit_cnt <= new_width);
            *entry = recovered;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_gen::{generate_byte_strings_seeded, generate_uniform_u64_seeded};

    const BOUNDARY_A: u64 = 0x1111_1111_1111_1111;
    const BOUNDARY_B: u64 = 0x2222_2222_2222_2222;

    fn interpolated(i: u64) -> u64 {
        ((BOUNDARY_A as u128 * i as u128 + BOUNDARY_B as u128 * (100 - i) as u128) / 100) as u64
    }

    /// Empty filter with the two scenario boundaries installed directly.
    fn two_boundary_filter(infix_size: u32) -> DivaInt {
        let mut filter = DivaInt::new(infix_size, 1, 0.95);
        filter.add_boundary(&BOUNDARY_A.to_be_bytes());
        filter.add_boundary(&BOUNDARY_B.to_be_bytes());
        filter
    }

    fn sorted_unique_u64(count: usize, seed: u64) -> Vec<u64> {
        let mut keys = generate_uniform_u64_seeded(count * 2, seed);
        keys.sort_unstable();
        keys.dedup();
        keys.truncate(count);
        assert_eq!(keys.len(), count);
        keys
    }

    /// Interpolated inserts between the boundaries 0x11111111 and
    /// 0x22222222 (8-byte big-endian keys with four leading zero bytes).
    fn interpolated32(i: u64) -> u64 {
        (0x1111_1111 * i + 0x2222_2222 * (100 - i)) / 100
    }

    /// Exact-layout oracle for the interpolated-inserts interval. The pair
    /// (0x11111111, 0x22222222) shares a 34-bit prefix followed by one
    /// uninformative bit, keeps the base 10-bit implicit size, and projects
    /// the left boundary to implicit 34; the implicit range spans 547
    /// positions. A key's interval-relative partial key is therefore pure
    /// bit arithmetic on the integer.
    fn project32(key: u64) -> (u32, u64) {
        let implicit = ((key >> 19) - 546) as u32;
        let explicit = ((key >> 14) & 0x1F) | 1;
        (implicit, explicit)
    }

    /// Home slot under the grade-55 size scalar (1/0.95 in 15-bit fixed
    /// point, 34492) and the implicit scalar for a 547-wide range
    /// (1024/547 in 15-bit fixed point, 61342).
    fn home32(implicit: u32) -> u32 {
        ((implicit as u64 * 34492 * 61342) >> 30) as u32
    }

    #[test]
    fn test_interpolated_inserts() {
        let mut filter = DivaInt::new(5, 1, 0.95);
        for boundary in [0x1111_1111u64, 0x2222_2222, 0x3333_3333, 0x4444_4444] {
            filter.add_boundary(&boundary.to_be_bytes());
        }

        for i in 1..100 {
            filter.insert_simple(&interpolated32(i).to_be_bytes());
        }
        {
            let store = filter.index.get(&0x1111_1111u64.to_be_bytes()).unwrap();
            assert_eq!(store.elem_count(), 99);
            store.verify(&filter.scales);
        }

        // the rest of the scenario: one key per neighboring interval
        filter.insert_simple(&0x2000_0000u64.to_be_bytes());
        filter.insert_simple(&0x4000_7777u64.to_be_bytes());

        // expected layout: the 100 partial keys have pairwise distinct
        // implicit parts whose home slots never collide, so each one sits
        // exactly at its home with its own runend
        let mut scenario_keys: Vec<u64> = (1..100).map(interpolated32).collect();
        scenario_keys.push(0x2000_0000);
        let mut expected: Vec<(u32, u64)> = scenario_keys.iter().map(|&k| project32(k)).collect();
        expected.sort_unstable();
        let occupieds_pos: Vec<u32> = expected.iter().map(|&(implicit, _)| implicit).collect();
        let checks: Vec<(u32, u64)> = expected
            .iter()
            .map(|&(implicit, value)| (home32(implicit), value))
            .collect();
        for pair in occupieds_pos.windows(2) {
            assert!(pair[0] < pair[1], "implicit parts must be distinct");
        }
        for pair in checks.windows(2) {
            assert!(pair[0].0 < pair[1].0, "home slots must be distinct");
        }

        // bit-for-bit dump of the store between 0x11111111 and 0x22222222
        let store = filter.index.get(&0x1111_1111u64.to_be_bytes()).unwrap();
        assert_eq!(store.elem_count() as usize, checks.len());
        let mut ind = 0usize;
        for i in 0..TARGET_SIZE {
            if ind < occupieds_pos.len() && i == occupieds_pos[ind] {
                assert!(store.occupied_bit(i), "occupied bit {} missing", i);
                ind += 1;
            } else {
                assert!(!store.occupied_bit(i), "stray occupied bit {}", i);
            }
        }
        let total_size = filter.scales.scaled_size(store.size_grade());
        let mut ind = 0usize;
        let mut runend_count = 0usize;
        for i in 0..total_size {
            if ind < checks.len() && i == checks[ind].0 {
                assert_eq!(store.slot(&filter.scales, i), checks[ind].1, "slot {} value", i);
                assert!(store.runend_bit(i), "runend bit {} missing", i);
                runend_count += 1;
                ind += 1;
            } else {
                assert_eq!(store.slot(&filter.scales, i), 0, "slot {} should be empty", i);
                assert!(!store.runend_bit(i), "stray runend bit {}", i);
            }
        }
        assert_eq!(runend_count, occupieds_pos.len());

        for &key in &scenario_keys {
            assert!(filter.point_query_u64(key), "key {:#x} missing", key);
        }
        assert!(filter.point_query_u64(0x4000_7777));
        // the boundaries themselves answer positively
        assert!(filter.point_query_u64(0x1111_1111));
        assert!(filter.point_query_u64(0x2222_2222));
    }

    #[test]
    fn test_split_creates_partial_boundary() {
        let mut filter = two_boundary_filter(5);
        for i in 1..100 {
            filter.insert_simple(&interpolated(i).to_be_bytes());
        }
        let split_key = interpolated(30) + (8 << 16);
        filter.insert_split(&split_key.to_be_bytes());

        assert_eq!(filter.boundary_count(), 3);
        let boundary_a = BOUNDARY_A.to_be_bytes();
        let boundary_b = BOUNDARY_B.to_be_bytes();
        let mut partial_seen = false;
        filter.index.for_each(|key, store| {
            if key != boundary_a.as_slice() && key != boundary_b.as_slice() {
                assert!(store.is_partial());
                assert!(store.invalid_bits() < 8);
                partial_seen = true;
            }
        });
        assert!(partial_seen);
        assert!(filter.point_query_u64(split_key));
        // the pre-split keys all survive the redistribution
        for i in 1..100 {
            assert!(filter.point_query_u64(interpolated(i)), "key {} lost by split", i);
        }
    }

    #[test]
    fn test_delete_all_empties_the_store() {
        let mut filter = two_boundary_filter(5);
        let mut keys: Vec<u64> = (1..100).map(interpolated).collect();
        for &key in &keys {
            filter.insert_simple(&key.to_be_bytes());
        }

        // delete everything in a seeded shuffle
        let mut rng = StdRng::seed_from_u64(17);
        for i in (1..keys.len()).rev() {
            let j = rng.gen_range(0..=i);
            keys.swap(i, j);
        }
        for &key in &keys {
            filter.delete_u64(key).unwrap();
        }

        assert_eq!(filter.boundary_count(), 2);
        for &key in &keys {
            assert!(!filter.point_query_u64(key), "key {:#x} still present", key);
        }
        assert!(filter.point_query_u64(BOUNDARY_A));
        assert!(filter.point_query_u64(BOUNDARY_B));
    }

    #[test]
    fn test_delete_around_partial_boundary() {
        let mut filter = two_boundary_filter(5);
        let mut keys: Vec<u64> = (1..100).map(interpolated).collect();
        for &key in &keys {
            filter.insert_simple(&key.to_be_bytes());
        }
        let split_key = interpolated(30) + (8 << 16);
        filter.insert_split(&split_key.to_be_bytes());

        // delete the original keys in a seeded shuffle; the split key stays
        let mut rng = StdRng::seed_from_u64(18);
        for i in (1..keys.len()).rev() {
            let j = rng.gen_range(0..=i);
            keys.swap(i, j);
        }
        for &key in &keys {
            filter.delete_u64(key).unwrap();
        }

        assert!(filter.boundary_count() == 2 || filter.boundary_count() == 3);
        assert!(filter.point_query_u64(BOUNDARY_A));
        assert!(filter.point_query_u64(BOUNDARY_B));
        // the surviving split key must still answer positively
        assert!(filter.point_query_u64(split_key));
        // the key the split boundary was truncated from aliases it
        assert!(filter.point_query_u64(interpolated(30)));
        // everything else is gone
        for i in 1..100 {
            if i != 30 {
                assert!(
                    !filter.point_query_u64(interpolated(i)),
                    "key {} still present",
                    i
                );
            }
        }
    }

    #[test]
    fn test_bulk_load_boundary_placement() {
        let keys = sorted_unique_u64(1300, 4);
        let filter = DivaInt::new_fixed_width(6, keys.iter().copied(), 8, 1, 0.95).unwrap();

        // min sentinel, keys[0], keys[1024], keys[1299], max sentinel
        assert_eq!(filter.boundary_count(), 5);
        let mut boundaries = Vec::new();
        filter.index.for_each(|key, _| boundaries.push(key.to_vec()));
        assert_eq!(boundaries[0], vec![0x00; 8]);
        assert_eq!(boundaries[1], keys[0].to_be_bytes());
        assert_eq!(boundaries[2], keys[1024].to_be_bytes());
        assert_eq!(boundaries[3], keys[1299].to_be_bytes());
        assert_eq!(boundaries[4], vec![0xFF; 8]);

        for &key in &keys {
            assert!(filter.point_query_u64(key));
        }
    }

    #[test]
    fn test_bulk_load_rejects_unsorted() {
        let err = DivaInt::new_fixed_width(6, [5u64, 3, 9], 8, 1, 0.95).unwrap_err();
        assert_eq!(err, FilterError::UnsortedKeys);
        let err = DivaInt::new_fixed_width(6, [5u64, 5, 9], 8, 1, 0.95).unwrap_err();
        assert_eq!(err, FilterError::UnsortedKeys);
    }

    #[test]
    fn test_no_false_negatives_after_mixed_inserts() {
        let keys = sorted_unique_u64(5000, 11);
        let mut filter = DivaInt::new_fixed_width(8, keys.iter().copied(), 8, 7, 0.95).unwrap();

        let mut extra = generate_uniform_u64_seeded(2000, 12);
        extra.sort_unstable();
        extra.dedup();
        for &key in &extra {
            filter.insert_u64(key);
        }
        for &key in keys.iter().chain(&extra) {
            assert!(filter.point_query_u64(key), "false negative on {:#x}", key);
        }
    }

    #[test]
    fn test_bulk_load_equivalent_to_incremental_on_members() {
        let keys = sorted_unique_u64(3000, 21);
        let bulk = DivaInt::new_fixed_width(7, keys.iter().copied(), 8, 5, 0.95).unwrap();

        let mut incremental = DivaInt::new_fixed_width(7, [], 8, 5, 0.95).unwrap();
        for &key in &keys {
            incremental.insert_u64(key);
        }
        for &key in &keys {
            assert!(bulk.point_query_u64(key));
            assert!(incremental.point_query_u64(key));
            assert!(bulk.range_query_u64(key, key.saturating_add(100)));
            assert!(incremental.range_query_u64(key, key.saturating_add(100)));
        }
    }

    #[test]
    fn test_correlated_range_queries() {
        let keys = sorted_unique_u64(10_000, 31);
        let filter = DivaInt::new_fixed_width(8, keys.iter().copied(), 8, 9, 0.95).unwrap();

        let mut rng = StdRng::seed_from_u64(32);
        for _ in 0..100_000 {
            let l = keys[rng.gen_range(0..keys.len())];
            let r = l.saturating_add(rng.gen_range(0..1 << 20));
            assert!(filter.range_query_u64(l, r));
        }
    }

    #[test]
    fn test_range_query_between_keys() {
        // keys far apart: ranges strictly between members can answer no
        let keys: Vec<u64> = (1..=100).map(|i| i << 40).collect();
        let filter = DivaInt::new_fixed_width(9, keys.iter().copied(), 8, 2, 0.95).unwrap();
        for &key in &keys {
            assert!(filter.range_query_u64(key, key + (1 << 20)));
            assert!(filter.range_query_u64(key - (1 << 20), key));
        }
        let mut empty_hits = 0;
        for &key in &keys[..keys.len() - 1] {
            // a narrow range in the dead middle of the gap
            let l = key + (1 << 39);
            if filter.range_query_u64(l, l + (1 << 10)) {
                empty_hits += 1;
            }
        }
        // false positives are allowed but must be rare
        assert!(empty_hits < 20, "too many range false positives: {}", empty_hits);
    }

    #[test]
    fn test_delete_reinsert_keeps_members() {
        let keys = sorted_unique_u64(2000, 41);
        let mut filter = DivaInt::new_fixed_width(7, keys.iter().copied(), 8, 3, 0.95).unwrap();

        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..500 {
            let key = keys[rng.gen_range(0..keys.len())];
            filter.delete_u64(key).unwrap();
            filter.insert_u64(key);
        }
        for &key in &keys {
            assert!(filter.point_query_u64(key), "false negative on {:#x}", key);
        }
    }

    #[test]
    fn test_delete_absent_key_is_an_error() {
        let keys = sorted_unique_u64(100, 51);
        let mut filter = DivaInt::new_fixed_width(8, keys.iter().copied(), 8, 3, 0.95).unwrap();
        let mut absent = 0xDEAD_BEEF_0000_1234u64;
        while keys.binary_search(&absent).is_ok() || filter.point_query_u64(absent) {
            absent = absent.wrapping_add(0x9E37_79B9);
        }
        assert_eq!(filter.delete_u64(absent), Err(FilterError::KeyNotFound));
        for &key in &keys {
            assert!(filter.point_query_u64(key));
        }
    }

    #[test]
    fn test_mutating_empty_filter_is_an_error() {
        let mut filter = DivaInt::new(8, 1, 0.95);
        assert_eq!(filter.delete_u64(42), Err(FilterError::EmptyFilter));
        assert!(!filter.point_query_u64(42));
        assert!(!filter.range_query_u64(1, 100));
    }

    #[test]
    fn test_shrink_preserves_positive_answers() {
        let mut filter = two_boundary_filter(8);
        for i in 1..100 {
            filter.insert_simple(&interpolated(i).to_be_bytes());
        }
        let probes: Vec<u64> = (0..2000)
            .map(|i| BOUNDARY_A + (i as u64) * ((BOUNDARY_B - BOUNDARY_A) / 2000))
            .collect();
        let before: Vec<bool> = probes.iter().map(|&p| filter.point_query_u64(p)).collect();

        filter.shrink_infix_size(6);
        assert_eq!(filter.infix_size(), 6);
        for i in 1..100 {
            assert!(filter.point_query_u64(interpolated(i)), "key {} lost by shrink", i);
        }
        for (&probe, &was_positive) in probes.iter().zip(&before) {
            if was_positive {
                assert!(filter.point_query_u64(probe), "shrink flipped {:#x} to negative", probe);
            }
        }
    }

    #[test]
    fn test_false_positive_rate_tracks_infix_size() {
        for infix_size in [5u32, 8, 11] {
            let keys = sorted_unique_u64(100_000, 61);
            let filter =
                DivaInt::new_fixed_width(infix_size, keys.iter().copied(), 8, 1, 0.95).unwrap();

            // enough probes that sampling noise is small against the
            // +/-20% acceptance band even at the thinnest rate
            let probes = generate_uniform_u64_seeded(400_000, 62);
            let mut false_positives = 0usize;
            let mut probe_count = 0usize;
            for &probe in &probes {
                if keys.binary_search(&probe).is_ok() {
                    continue;
                }
                probe_count += 1;
                false_positives += filter.point_query_u64(probe) as usize;
            }
            let rate = false_positives as f64 / probe_count as f64;
            let bound = 2f64.powi(1 - infix_size as i32);
            assert!(
                rate <= bound * 1.2,
                "fpr {} above the +20% band for infix size {} (bound {})",
                rate,
                infix_size,
                bound
            );
            assert!(
                rate >= bound * 0.8,
                "fpr {} below the -20% band for infix size {} (bound {})",
                rate,
                infix_size,
                bound
            );
        }
    }

    #[test]
    fn test_serialize_round_trip() {
        let keys = sorted_unique_u64(3000, 71);
        let mut filter = DivaInt::new_fixed_width(8, keys.iter().copied(), 8, 13, 0.95).unwrap();
        let mut extra = generate_uniform_u64_seeded(500, 72);
        extra.sort_unstable();
        extra.dedup();
        for &key in &extra {
            filter.insert_u64(key);
        }

        let mut blob = Vec::new();
        let written = filter.serialize(&mut blob);
        assert_eq!(written, blob.len());
        assert_eq!(written, filter.size());

        let restored = DivaInt::deserialize(&blob).unwrap();
        assert_eq!(restored.boundary_count(), filter.boundary_count());
        let probes = generate_uniform_u64_seeded(20_000, 73);
        for &probe in keys.iter().chain(&extra).chain(&probes) {
            assert_eq!(
                filter.point_query_u64(probe),
                restored.point_query_u64(probe),
                "point mismatch on {:#x}",
                probe
            );
            assert_eq!(
                filter.range_query_u64(probe, probe.saturating_add(1 << 16)),
                restored.range_query_u64(probe, probe.saturating_add(1 << 16)),
                "range mismatch on {:#x}",
                probe
            );
        }
    }

    #[test]
    fn test_deserialize_rejects_mismatched_metadata() {
        let keys = sorted_unique_u64(100, 81);
        let filter = DivaInt::new_fixed_width(8, keys.iter().copied(), 8, 1, 0.95).unwrap();
        let mut blob = Vec::new();
        filter.serialize(&mut blob);

        // wrong version byte for the index flavor
        assert_eq!(Diva::deserialize(&blob).unwrap_err(), FilterError::MetadataMismatch);

        let mut tampered = blob.clone();
        tampered[1] ^= 0xFF; // corrupt infix_store_target_size
        assert_eq!(
            DivaInt::deserialize(&tampered).unwrap_err(),
            FilterError::MetadataMismatch
        );

        let truncated = &blob[..blob.len() / 2];
        assert!(DivaInt::deserialize(truncated).is_err());
    }

    #[test]
    fn test_streaming_bulk_load_matches_batch() {
        let keys = sorted_unique_u64(2600, 91);
        let batch = DivaInt::new_fixed_width(7, keys.iter().copied(), 8, 5, 0.95).unwrap();

        let mut streamed = DivaInt::new(7, 5, 0.95);
        for &key in &keys {
            streamed.bulk_load_stream_u64(key).unwrap();
        }
        streamed.bulk_load_stream_finish();

        for &key in &keys {
            assert!(streamed.point_query_u64(key), "false negative on {:#x}", key);
            assert!(batch.point_query_u64(key));
        }
    }

    #[test]
    fn test_streaming_rejects_unsorted() {
        let mut filter = DivaInt::new(7, 5, 0.95);
        filter.bulk_load_stream_u64(100).unwrap();
        filter.bulk_load_stream_u64(200).unwrap();
        assert_eq!(filter.bulk_load_stream_u64(150), Err(FilterError::UnsortedKeys));
    }

    #[test]
    fn test_variable_width_keys() {
        let mut keys = generate_byte_strings_seeded(3000, 4, 12, 101);
        keys.sort();
        keys.dedup();
        let mut filter = Diva::new_variable_width(6, keys.iter(), 3, 0.95).unwrap();

        for key in &keys {
            assert!(filter.point_query(key), "false negative on {:02x?}", key);
        }
        // range anchored at a member always hits
        for key in keys.iter().take(500) {
            let mut upper = key.clone();
            upper.push(0xFF);
            assert!(filter.range_query(key, &upper));
        }

        let extra = generate_byte_strings_seeded(500, 4, 12, 102);
        for key in &extra {
            filter.insert(key);
        }
        for key in keys.iter().chain(&extra) {
            assert!(filter.point_query(key), "false negative on {:02x?}", key);
        }

        // delete a slice of the original keys, the rest must survive
        for key in keys.iter().take(300) {
            filter.delete(key).unwrap();
        }
        for key in keys.iter().skip(300) {
            assert!(filter.point_query(key), "false negative on {:02x?}", key);
        }
    }

    #[test]
    fn test_variable_width_empty_bulk_load_allows_inserts() {
        let filter = Diva::new_variable_width(6, Vec::<Vec<u8>>::new(), 3, 0.95);
        let mut filter = filter.unwrap();
        assert_eq!(filter.boundary_count(), 2);
        filter.insert(b"hello");
        filter.insert(b"world");
        assert!(filter.point_query(b"hello"));
        assert!(filter.point_query(b"world"));
    }

    #[test]
    fn test_size_accounting() {
        let keys = sorted_unique_u64(1300, 111);
        let filter = DivaInt::new_fixed_width(6, keys.iter().copied(), 8, 1, 0.95).unwrap();
        let mut blob = Vec::new();
        let written = filter.serialize(&mut blob);
        assert_eq!(filter.size(), written);
    }
}
