//! Modulo distribution: one slot per server, live and dead.
//!
//! Keeping dead slots in the modulus means an ejection does not remap
//! the entire keyspace; keys owned by a dead slot fail fast instead.

use super::{BuildSlot, Continuum, ContinuumPoint};

pub(super) fn build(slots: &[BuildSlot<'_>]) -> Continuum {
    let points = (0..slots.len() as u32)
        .map(|idx| ContinuumPoint {
            server: idx,
            value: idx,
        })
        .collect();
    Continuum {
        points,
        nserver: slots.len() as u32,
    }
}

pub(super) fn dispatch(points: &[ContinuumPoint], nserver: u32, hash: u32) -> u32 {
    points[(hash % nserver) as usize].server
}
