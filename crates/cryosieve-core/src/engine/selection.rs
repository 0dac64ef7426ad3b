use super::config::BalanceStrategy;
use std::collections::BTreeMap;

/// Number of particles kept out of `size` at the given retention ratio.
///
/// Halves round to the nearest even count.
pub fn retained_count(ratio: f64, size: usize) -> usize {
    ((ratio * size as f64).round_ties_even() as usize).min(size)
}

/// Retained count per half-set after applying the balance strategy.
pub fn retained_counts(
    sizes: &BTreeMap<u32, usize>,
    ratio: f64,
    balance: BalanceStrategy,
) -> BTreeMap<u32, usize> {
    let counts = sizes
        .iter()
        .map(|(&id, &size)| (id, retained_count(ratio, size)));
    match balance {
        BalanceStrategy::Clamp => {
            let counts: Vec<_> = counts.collect();
            let floor = counts.iter().map(|&(_, c)| c).min().unwrap_or(0);
            counts.into_iter().map(|(id, _)| (id, floor)).collect()
        }
        BalanceStrategy::None | BalanceStrategy::Resample { .. } => counts.collect(),
    }
}

/// Positions of `scores` sorted by ascending score.
///
/// The sort is stable, so equal scores keep their original order. NaN scores
/// sort after every number.
pub fn ascending_order(scores: &[f64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));
    order
}

/// Positions of the `count` lowest scores, best first.
pub fn select_lowest(scores: &[f64], count: usize) -> Vec<usize> {
    let mut order = ascending_order(scores);
    order.truncate(count);
    order
}
