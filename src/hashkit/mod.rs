//! Key hash functions.
//!
//! Every function maps arbitrary key bytes to a 32-bit value. The exact
//! outputs are load-bearing: ketama placement must agree with
//! libmemcached-era deployments, so the historical quirks (the 15-bit
//! `crc32` variant, `fnv1a_64` running in 32-bit arithmetic) are kept.

mod crc;
mod fnv;
mod hsieh;
mod jenkins;
mod md5;
mod murmur;
mod oat;

use serde::Deserialize;

/// Selectable key hash algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashType {
    OneAtATime,
    Md5,
    Crc16,
    Crc32,
    Crc32a,
    #[serde(rename = "fnv1_64")]
    Fnv1_64,
    #[serde(rename = "fnv1a_64")]
    Fnv1a64,
    #[serde(rename = "fnv1_32")]
    Fnv1_32,
    #[serde(rename = "fnv1a_32")]
    Fnv1a32,
    Hsieh,
    Murmur,
    Jenkins,
}

impl HashType {
    /// Hash `key` with this algorithm.
    pub fn hash(self, key: &[u8]) -> u32 {
        match self {
            HashType::OneAtATime => oat::hash(key),
            HashType::Md5 => md5::hash(key),
            HashType::Crc16 => crc::crc16(key),
            HashType::Crc32 => crc::crc32(key),
            HashType::Crc32a => crc::crc32a(key),
            HashType::Fnv1_64 => fnv::fnv1_64(key),
            HashType::Fnv1a64 => fnv::fnv1a_64(key),
            HashType::Fnv1_32 => fnv::fnv1_32(key),
            HashType::Fnv1a32 => fnv::fnv1a_32(key),
            HashType::Hsieh => hsieh::hash(key),
            HashType::Murmur => murmur::hash(key),
            HashType::Jenkins => jenkins::hash(key),
        }
    }
}
