//! Zone placement planning for new units.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

/// Pick a zone for each of `count` new units.
///
/// Each unit goes to the eligible zone with the fewest members so far
/// (counting units already planned in this call); ties go to the zone listed
/// first. Zones in `avoided` are skipped unless every zone is avoided, in
/// which case all zones are used. Returns an empty plan when `zones` is empty.
pub fn plan_placements<K>(
    count: usize,
    zones: &[K],
    current: &HashMap<K, usize>,
    avoided: &HashSet<K>,
) -> Vec<K>
where
    K: Clone + Eq + Hash,
{
    if zones.is_empty() {
        return Vec::new();
    }

    let mut eligible: Vec<&K> = zones.iter().filter(|z| !avoided.contains(*z)).collect();
    if eligible.is_empty() {
        eligible = zones.iter().collect();
    }

    let mut counts: Vec<usize> = eligible
        .iter()
        .map(|z| current.get(*z).copied().unwrap_or(0))
        .collect();

    let mut plan = Vec::with_capacity(count);
    for _ in 0..count {
        let (idx, _) = counts
            .iter()
            .enumerate()
            .min_by_key(|(i, c)| (**c, *i))
            .unwrap_or((0, &0));
        counts[idx] += 1;
        plan.push(eligible[idx].clone());
    }

    plan
}
