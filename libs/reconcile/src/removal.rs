//! Ordering helpers for choosing which units to remove on shrink.

/// Index of the most recently created candidate.
pub fn newest_first<T, F>(candidates: &[T], creation_seq: F) -> Option<usize>
where
    F: Fn(&T) -> u64,
{
    candidates
        .iter()
        .enumerate()
        .max_by_key(|&(_, c)| creation_seq(c))
        .map(|(i, _)| i)
}

/// Index of the oldest candidate.
pub fn oldest_first<T, F>(candidates: &[T], creation_seq: F) -> Option<usize>
where
    F: Fn(&T) -> u64,
{
    candidates
        .iter()
        .enumerate()
        .min_by_key(|&(_, c)| creation_seq(c))
        .map(|(i, _)| i)
}

/// Repeatedly apply `choose` to the remaining candidates to pick `count`
/// of them, in the order chosen.
///
/// `choose` returns an index into the slice it is given. Selection stops
/// early if it returns `None` or an out-of-range index.
pub fn select_for_removal<T, F>(mut candidates: Vec<T>, count: usize, mut choose: F) -> Vec<T>
where
    F: FnMut(&[T]) -> Option<usize>,
{
    let mut chosen = Vec::with_capacity(count.min(candidates.len()));
    while chosen.len() < count && !candidates.is_empty() {
        match choose(&candidates) {
            Some(idx) if idx < candidates.len() => chosen.push(candidates.remove(idx)),
            _ => break,
        }
    }
    chosen
}
