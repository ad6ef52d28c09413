//! Ketama consistent hashing, libmemcached-compatible.
//!
//! Each live server contributes points in proportion to its weight
//! share: MD5 over `"<name>-<k>"` yields 16 bytes, read as four
//! little-endian 32-bit point values.

use super::{BuildSlot, Continuum, ContinuumPoint};
use md5::{Digest, Md5};

const POINTS_PER_SERVER: u32 = 160;
const POINTS_PER_HASH: u32 = 4;

pub(super) fn build(slots: &[BuildSlot<'_>]) -> Continuum {
    let nlive = slots.iter().filter(|s| s.live).count() as u32;
    let total_weight: u64 = slots
        .iter()
        .filter(|s| s.live)
        .map(|s| s.weight as u64)
        .sum();

    let mut points = Vec::with_capacity((nlive * POINTS_PER_SERVER) as usize);
    if nlive > 0 && total_weight > 0 {
        for (idx, slot) in slots.iter().enumerate() {
            if !slot.live {
                continue;
            }
            let pct = slot.weight as f32 / total_weight as f32;
            // Round down to a whole number of hash steps; the epsilon
            // keeps equal-weight pools at exactly 160 points each.
            let steps = pct * (POINTS_PER_SERVER / POINTS_PER_HASH) as f32 * nlive as f32;
            let per_server = (steps + 1e-7).floor() as u32 * POINTS_PER_HASH;

            for k in 0..per_server / POINTS_PER_HASH {
                let digest = Md5::digest(format!("{}-{}", slot.name, k).as_bytes());
                for align in 0..POINTS_PER_HASH as usize {
                    let at = align * 4;
                    points.push(ContinuumPoint {
                        server: idx as u32,
                        value: u32::from_le_bytes([
                            digest[at],
                            digest[at + 1],
                            digest[at + 2],
                            digest[at + 3],
                        ]),
                    });
                }
            }
        }
    }
    points.sort_unstable_by_key(|p| (p.value, p.server));

    Continuum {
        points,
        nserver: slots.len() as u32,
    }
}

/// Smallest point with `value >= hash`, wrapping to the first point.
pub(super) fn dispatch(points: &[ContinuumPoint], hash: u32) -> u32 {
    let at = points.partition_point(|p| p.value < hash);
    points[if at == points.len() { 0 } else { at }].server
}
