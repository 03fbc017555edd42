//! Upstream selection
//!
//! Selection is weighted random within the best priority group: upstreams
//! are grouped by priority, groups are tried in ascending priority order,
//! and the first group with positive total weight gets a weighted draw. If
//! every group has zero total weight there is nothing to select.
//!
//! After the first pick, failover walks a retry queue of the remaining
//! candidates ordered by ascending priority, then descending weight.

use rand::Rng;

use crate::health::RuntimeUpstream;


/// Pick one upstream from the candidates, or `None` when no priority group
/// has positive total weight.
pub fn select(candidates: &[RuntimeUpstream]) -> Option<&RuntimeUpstream> {
    select_with(candidates, |total| {
        rand::thread_rng().gen_range(0.0..total)
    })
}

/// Deterministic core of [`select`]: `draw` maps a group's total weight to a
/// point in `[0, total)`.
pub fn select_with(
    candidates: &[RuntimeUpstream],
    mut draw: impl FnMut(f64) -> f64,
) -> Option<&RuntimeUpstream> {
    let mut priorities: Vec<u32> = candidates.iter().map(|u| u.config.priority).collect();
    priorities.sort_unstable();
    priorities.dedup();

    for priority in priorities {
        let group: Vec<&RuntimeUpstream> = candidates
            .iter()
            .filter(|u| u.config.priority == priority)
            .collect();

        let total: f64 = group.iter().map(|u| u.config.weight).sum();
        if !(total > 0.0) {
            continue;
        }

        let mut point = draw(total);
        for upstream in &group {
            point -= upstream.config.weight;
            if point <= 0.0 {
                return Some(upstream);
            }
        }
        // Floating-point drift can leave a sliver above zero; the draw was
        // still inside this group, so the last member takes it.
        return group.last().copied();
    }

    None
}

/// Order the remaining candidates for failover: ascending priority, then
/// descending weight. `first_pick` is excluded.
pub fn retry_queue<'a>(
    candidates: &'a [RuntimeUpstream],
    first_pick: &RuntimeUpstream,
) -> Vec<&'a RuntimeUpstream> {
    let mut queue: Vec<&RuntimeUpstream> = candidates
        .iter()
        .filter(|u| u.config.target != first_pick.config.target)
        .collect();

    queue.sort_by(|a, b| {
        a.config
            .priority
            .cmp(&b.config.priority)
            .then_with(|| {
                b.config
                    .weight
                    .partial_cmp(&a.config.weight)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
    });

    queue
}
