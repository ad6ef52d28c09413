//! MD5-based key hash: the first four digest bytes, little endian.

use md5::{Digest, Md5};

pub fn hash(key: &[u8]) -> u32 {
    let digest = Md5::digest(key);
    u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]])
}
