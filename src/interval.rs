use crate::bitmap::bitmask;
use crate::byte_key::ByteKey;
use crate::infix_store::BASE_IMPLICIT_SIZE;

/// Compute the interval descriptor for two adjacent boundary keys
/// `key_1 < key_2`: the shared prefix length in bits, the run of
/// uninformative bits right after the first difference (key_1 = 1,
/// key_2 = 0), and the implicit size to use for the interval. The implicit
/// size is bumped by one bit when the 10-bit projected range covers less
/// than half of the implicit space.
pub fn shared_ignore_implicit(key_1: ByteKey<'_>, key_2: ByteKey<'_>) -> (u32, u32, u32) {
    let word_limit = (key_1.len().max(key_2.len()) / 8 + 2) as u32;

    let mut share = 0u32;
    let mut ind = 0u32;
    loop {
        let read_1 = key_1.word_at(ind * 8);
        let read_2 = key_2.word_at(ind * 8);
        let delta = (read_1 ^ read_2).leading_zeros();
        share += delta;
        ind += 1;
        if delta < 64 || ind > word_limit {
            debug_assert!(delta < 64, "boundary keys must differ");
            break;
        }
    }

    ind -= 1;
    let mut ignore = 0u32;
    loop {
        let read_1 = key_1.word_at(ind * 8);
        let read_2 = key_2.word_at(ind * 8);
        let offset = if ind > share / 64 { 0 } else { share % 64 + 1 };
        let delta = ((!read_1 | read_2) & bitmask(64 - offset)).leading_zeros();
        ignore += delta - offset;
        ind += 1;
        if delta < 64 || ind > word_limit {
            break;
        }
    }

    let implicit_1 = key_1.bits_at(share + ignore + 1, BASE_IMPLICIT_SIZE - 1);
    let implicit_2 =
        (1u64 << (BASE_IMPLICIT_SIZE - 1)) | key_2.bits_at(share + ignore + 1, BASE_IMPLICIT_SIZE - 1);
    let implicit_size = BASE_IMPLICIT_SIZE
        + (2 * (implicit_2 - implicit_1 + 1) < (1u64 << BASE_IMPLICIT_SIZE)) as u32;

    (share, ignore, implicit_size)
}

/// Extract the partial key of `key` relative to an interval descriptor:
/// `msb` in the top position, followed by `implicit_size - 1 + infix_size`
/// bits of `key` starting at bit `shared + ignore + 1`.
#[inline]
pub fn extract_partial_key(
    key: ByteKey<'_>,
    shared: u32,
    ignore: u32,
    implicit_size: u32,
    infix_size: u32,
    msb: u64,
) -> u64 {
    let real_diff_pos = shared + ignore;
    let mut res = key.word_at(real_diff_pos / 8);
    res >>= 63 - (implicit_size - 1) - infix_size - real_diff_pos % 8;
    res &= bitmask(implicit_size - 1 + infix_size);
    res | (msb << (implicit_size - 1 + infix_size))
}
