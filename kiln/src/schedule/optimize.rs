//! Bounded re-placement of buffers after greedy scheduling
//!
//! Greedy first-fit only sees the buffers that are live at the moment it
//! allocates, so it can leave holes that a placement with full knowledge of
//! every lifetime would avoid.  This module re-packs each scratch memory kind
//! offline: buffers are placed one at a time at the lowest offset that
//! doesn't collide with any already-placed buffer whose lifetime overlaps,
//! trying several placement orders until the time budget runs out.
use super::{Buffer, Schedule, verify::find_conflict};
use crate::graph::MemoryKind;
use enum_map::EnumMap;
use log::{info, warn};
use rand::{SeedableRng, rngs::StdRng, seq::SliceRandom};
use std::time::{Duration, Instant};
use strum::IntoEnumIterator;

/// Places buffers in the given order, returning offsets and the high-water
/// mark
fn place(buffers: &[Buffer], order: &[usize]) -> (Vec<usize>, usize) {
    let mut offsets = vec![0; buffers.len()];
    let mut placed: Vec<usize> = Vec::with_capacity(buffers.len());
    let mut high = 0;
    for &i in order {
        let b = &buffers[i];
        let mut blocked: Vec<(usize, usize)> = placed
            .iter()
            .filter(|&&j| buffers[j].lifetime_overlaps(b))
            .map(|&j| (offsets[j], offsets[j] + buffers[j].alloc.size))
            .collect();
        blocked.sort_unstable();

        let mut offset = 0;
        for (start, end) in blocked {
            if offset + b.alloc.size <= start {
                break;
            }
            offset = offset.max(end);
        }
        offsets[i] = offset;
        high = high.max(offset + b.alloc.size);
        placed.push(i);
    }
    (offsets, high)
}

/// Tries to lower the high-water mark of every scratch memory kind
///
/// The budget is split evenly between the kinds with buffers to place.
/// Within its share, each kind always tries largest buffers first and
/// longest-lived first, then seeded random shuffles until its share runs
/// out.  A zero budget does nothing.
/// The best placement for a kind is only kept if it fits that kind's
/// capacity, passes the overlap check, and strictly lowers its high-water
/// mark; otherwise the greedy placement is left untouched.  Persistent kinds
/// are never modified.
///
/// Returns `true` if anything changed.
pub fn optimize(
    schedule: &mut Schedule,
    capacities: &EnumMap<MemoryKind, Option<usize>>,
    budget: Duration,
    seed: u64,
) -> bool {
    if budget.is_zero() {
        return false;
    }
    let start = Instant::now();
    let mut rng = StdRng::seed_from_u64(seed);
    let mut changed = false;

    let kinds: Vec<(MemoryKind, Vec<Buffer>)> = MemoryKind::iter()
        .filter(|k| !k.is_persistent())
        .map(|k| (k, schedule.buffers_of(k).copied().collect::<Vec<_>>()))
        .filter(|(_, b)| b.len() >= 2)
        .collect();
    let slices = kinds.len() as u32;

    for (slot, (kind, buffers)) in kinds.into_iter().enumerate() {
        // Each kind gets an equal share of the budget
        let deadline = start + budget * (slot as u32 + 1) / slices;
        let greedy = schedule.max_usage[kind];
        let mut best: Option<(Vec<usize>, usize)> = None;
        let mut attempts = 0;

        let mut order: Vec<usize> = (0..buffers.len()).collect();
        while attempts < 2 || Instant::now() < deadline {
            match attempts {
                0 => order.sort_by_key(|&i| {
                    (std::cmp::Reverse(buffers[i].alloc.size), buffers[i].first)
                }),
                1 => order.sort_by_key(|&i| {
                    let b = &buffers[i];
                    (std::cmp::Reverse(b.last - b.first), b.first)
                }),
                _ => order.shuffle(&mut rng),
            }
            attempts += 1;
            let (offsets, high) = place(&buffers, &order);
            if best.as_ref().is_none_or(|(_, h)| high < *h) {
                best = Some((offsets, high));
            }
        }

        let Some((offsets, high)) = best else {
            continue;
        };
        let fits = capacities[kind].is_none_or(|c| high <= c);
        if high >= greedy || !fits {
            warn!(
                "{kind} memory: no better placement than {greedy} bytes \
                 after {attempts} attempts"
            );
            continue;
        }
        let mut candidate = buffers;
        for (b, o) in candidate.iter_mut().zip(offsets) {
            b.alloc.offset = o;
        }
        if find_conflict(&candidate).is_some() {
            warn!("rejecting invalid placement for {kind} memory");
            continue;
        }
        info!(
            "{kind} memory: re-placement lowered usage from {greedy} to \
             {high} bytes after {attempts} attempts"
        );
        for b in candidate {
            schedule.buffers.insert(b.port, b);
        }
        changed = true;
    }
    if changed {
        schedule.recompute_max_usage();
    }
    changed
}
