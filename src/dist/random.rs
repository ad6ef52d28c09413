//! Random distribution: a uniform pick over live servers, key ignored.

use super::{BuildSlot, Continuum, ContinuumPoint};
use rand::Rng;
use rand_xoshiro::Xoshiro256PlusPlus;

pub(super) fn build(slots: &[BuildSlot<'_>]) -> Continuum {
    let points = slots
        .iter()
        .enumerate()
        .filter(|(_, s)| s.live)
        .map(|(idx, _)| ContinuumPoint {
            server: idx as u32,
            value: 0,
        })
        .collect();
    Continuum {
        points,
        nserver: slots.len() as u32,
    }
}

pub(super) fn dispatch(points: &[ContinuumPoint], rng: &mut Xoshiro256PlusPlus) -> u32 {
    points[rng.random_range(0..points.len())].server
}
