//! Key distribution: the continuum mapping hash values to server slots.
//!
//! A [`Continuum`] is an immutable value owned by its pool. Rebuilds
//! produce a whole new value which the pool swaps in at a safe point;
//! lookups never observe a partial build.

mod ketama;
mod modula;
mod random;

use rand_xoshiro::Xoshiro256PlusPlus;
use serde::Deserialize;

/// Selectable distribution algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistType {
    Ketama,
    Modula,
    Random,
}

/// One continuum entry: a hash value owned by a server slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContinuumPoint {
    pub server: u32,
    pub value: u32,
}

/// Per-slot inputs to a continuum build.
#[derive(Debug, Clone)]
pub struct BuildSlot<'a> {
    /// Identity the points are derived from (ketama).
    pub name: &'a str,
    pub weight: u32,
    pub live: bool,
}

/// The key-hash to server-slot mapping for one pool.
///
/// `nserver` counts server slots, live and dead, and is fixed per build;
/// modula reduces hashes modulo this count. The number of points is a
/// separate quantity (ketama emits many points per slot, random emits
/// one per live slot).
#[derive(Debug, Clone, Default)]
pub struct Continuum {
    points: Vec<ContinuumPoint>,
    nserver: u32,
}

impl Continuum {
    /// Build a continuum for `slots` under the given distribution.
    pub fn build(dist: DistType, slots: &[BuildSlot<'_>]) -> Continuum {
        match dist {
            DistType::Ketama => ketama::build(slots),
            DistType::Modula => modula::build(slots),
            DistType::Random => random::build(slots),
        }
    }

    /// Map a key hash to a server slot.
    ///
    /// Returns `None` only when the continuum is empty. The caller is
    /// responsible for the liveness check on the returned slot.
    pub fn dispatch(
        &self,
        dist: DistType,
        hash: u32,
        rng: &mut Xoshiro256PlusPlus,
    ) -> Option<u32> {
        if self.points.is_empty() {
            return None;
        }
        match dist {
            DistType::Ketama => Some(ketama::dispatch(&self.points, hash)),
            DistType::Modula => Some(modula::dispatch(&self.points, self.nserver, hash)),
            DistType::Random => Some(random::dispatch(&self.points, rng)),
        }
    }

    /// Number of continuum points.
    pub fn npoints(&self) -> usize {
        self.points.len()
    }

    /// Number of server slots the continuum was built over, live and dead.
    pub fn nserver(&self) -> u32 {
        self.nserver
    }

    /// All points, sorted ascending by hash value.
    pub fn points(&self) -> &[ContinuumPoint] {
        &self.points
    }
}
