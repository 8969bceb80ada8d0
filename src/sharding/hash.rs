//! The routing hash stored in `entity_id_hash`.
//!
//! This function must never change: rows already written carry its output,
//! and a different function would silently move them to other shards.

const C1: u32 = 0xcc9e_2d51;
const C2: u32 = 0x1b87_3593;

/// MurmurHash3 (x86, 32-bit, seed 0) of the UTF-8 bytes of `key`, as a signed value.
///
/// The output spreads evenly over the whole `i32` domain, so contiguous
/// ranges of that domain hold comparable shares of the entities.
pub fn entity_id_hash(key: &str) -> i32 {
    murmur3_32(key.as_bytes(), 0) as i32
}

fn murmur3_32(data: &[u8], seed: u32) -> u32 {
    let mut h = seed;
    let mut chunks = data.chunks_exact(4);

    for chunk in &mut chunks {
        let k = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        h ^= mix_k(k);
        h = h.rotate_left(13);
        h = h.wrapping_mul(5).wrapping_add(0xe654_6b64);
    }

    let tail = chunks.remainder();
    if !tail.is_empty() {
        let mut k = 0u32;
        for (i, byte) in tail.iter().enumerate() {
            k |= (*byte as u32) << (8 * i);
        }
        h ^= mix_k(k);
    }

    h ^= data.len() as u32;
    fmix(h)
}

fn mix_k(k: u32) -> u32 {
    k.wrapping_mul(C1).rotate_left(15).wrapping_mul(C2)
}

fn fmix(mut h: u32) -> u32 {
    h ^= h >> 16;
    h = h.wrapping_mul(0x85eb_ca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2_ae35);
    h ^= h >> 16;
    h
}
