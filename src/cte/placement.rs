//! Chunk placement and eviction ordering.
//!
//! Placement ranks compatible targets by `score_weight * free` and prefers
//! the winner. Eviction picks the lowest-score blob; ties break to the
//! least recently used, then to the largest.

use std::time::Instant;

use crate::bdev::BdevType;

/// Candidate target view for one placement decision.
#[derive(Debug, Clone)]
pub struct PlacementCandidate {
    pub index: usize,
    pub kind: BdevType,
    pub free: u64,
}

/// Pick the target for a new chunk of `size` bytes. `policy` restricts the
/// device class when the tag carries one.
pub fn choose_target(
    candidates: &[PlacementCandidate],
    policy: Option<BdevType>,
    size: u64,
) -> Option<usize> {
    candidates
        .iter()
        .filter(|c| policy.map_or(true, |p| c.kind == p))
        .filter(|c| c.free >= size)
        .max_by(|a, b| {
            let score_a = a.kind.score_weight() * a.free as f64;
            let score_b = b.kind.score_weight() * b.free as f64;
            score_a.total_cmp(&score_b)
        })
        .map(|c| c.index)
}

/// Device class a blob's score maps onto, best available first.
pub fn desired_kinds(score: f32) -> [BdevType; 3] {
    if score >= 0.66 {
        [BdevType::Ram, BdevType::Nvme, BdevType::File]
    } else if score >= 0.33 {
        [BdevType::Nvme, BdevType::Ram, BdevType::File]
    } else {
        [BdevType::File, BdevType::Nvme, BdevType::Ram]
    }
}

/// Eviction candidate view.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub tag: String,
    pub blob: String,
    pub score: f32,
    pub last_access: Instant,
    pub size: u64,
}

/// Order: lowest score, then least recently used, then largest.
pub fn choose_victim(candidates: &[EvictionCandidate]) -> Option<&EvictionCandidate> {
    candidates.iter().min_by(|a, b| {
        a.score
            .total_cmp(&b.score)
            .then(a.last_access.cmp(&b.last_access))
            .then(b.size.cmp(&a.size))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn placement_prefers_fast_and_empty() {
        let candidates = vec![
            PlacementCandidate {
                index: 0,
                kind: BdevType::File,
                free: 1000,
            },
            PlacementCandidate {
                index: 1,
                kind: BdevType::Ram,
                free: 900,
            },
        ];
        assert_eq!(choose_target(&candidates, None, 100), Some(1));
    }

    #[test]
    fn placement_honors_policy_and_space() {
        let candidates = vec![
            PlacementCandidate {
                index: 0,
                kind: BdevType::Ram,
                free: 50,
            },
            PlacementCandidate {
                index: 1,
                kind: BdevType::File,
                free: 1000,
            },
        ];
        assert_eq!(choose_target(&candidates, Some(BdevType::Ram), 100), None);
        assert_eq!(choose_target(&candidates, None, 100), Some(1));
    }

    #[test]
    fn eviction_orders_score_then_lru_then_size() {
        let now = Instant::now();
        let old = now - Duration::from_secs(60);
        let candidates = vec![
            EvictionCandidate {
                tag: "t".into(),
                blob: "high".into(),
                score: 0.9,
                last_access: old,
                size: 10,
            },
            EvictionCandidate {
                tag: "t".into(),
                blob: "low_recent_small".into(),
                score: 0.1,
                last_access: now,
                size: 10,
            },
            EvictionCandidate {
                tag: "t".into(),
                blob: "low_old_small".into(),
                score: 0.1,
                last_access: old,
                size: 10,
            },
            EvictionCandidate {
                tag: "t".into(),
                blob: "low_old_large".into(),
                score: 0.1,
                last_access: old,
                size: 99,
            },
        ];
        // Same score: older wins; same age: larger wins.
        assert_eq!(choose_victim(&candidates).unwrap().blob, "low_old_large");
    }
}
