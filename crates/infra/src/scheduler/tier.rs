//! Cadence-based tier scheduling.

use flightwork_core::Tier;

use crate::queue::TierFilter;

/// Per-tier cadences: tier `i` is due on every `cadences[i]`-th cycle.
///
/// Tier 0 is due on every cycle whatever its configured cadence. Tiers past
/// the end of the list share the cadence of the last configured tier. Due
/// tiers are derived from a cycle counter, not wall-clock timestamps, so
/// there is no drift and no per-tier state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierSchedule {
    cadences: Vec<u32>,
}

impl TierSchedule {
    /// `cadences[i]` is the cadence of tier `i`; zero cadences are treated as 1.
    pub fn new(cadences: Vec<u32>) -> Self {
        let cadences = cadences.into_iter().map(|c| c.max(1)).collect();
        Self { cadences }
    }

    /// Schedule for queues without tiers: everything is due every cycle.
    pub fn untiered() -> Self {
        Self {
            cadences: Vec::new(),
        }
    }

    pub fn is_tiered(&self) -> bool {
        !self.cadences.is_empty()
    }

    pub fn cadences(&self) -> &[u32] {
        &self.cadences
    }

    pub fn cadence_of(&self, tier: Tier) -> u32 {
        if tier.is_urgent() {
            return 1;
        }
        let idx = usize::from(tier.value()).min(self.cadences.len().saturating_sub(1));
        self.cadences.get(idx).copied().unwrap_or(1)
    }

    pub fn is_due(&self, tier: Tier, cycle: u64) -> bool {
        tier.is_urgent() || cycle % u64::from(self.cadence_of(tier)) == 0
    }

    /// Claim filter for cycle number `cycle`.
    pub fn filter_for_cycle(&self, cycle: u64) -> TierFilter {
        if !self.is_tiered() {
            return TierFilter::Any;
        }

        let last = self.cadences.len() - 1;
        let tiers = (0..self.cadences.len())
            .filter_map(|i| u8::try_from(i).ok().map(Tier))
            .filter(|t| self.is_due(*t, cycle))
            .collect::<Vec<_>>();

        let overflow_from = u8::try_from(last)
            .ok()
            .filter(|l| self.is_due(Tier(*l), cycle))
            .and_then(|l| l.checked_add(1))
            .map(Tier);

        TierFilter::Due {
            tiers,
            overflow_from,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> TierSchedule {
        TierSchedule::new(vec![1, 2, 5, 10, 20])
    }

    #[test]
    fn urgent_tier_is_always_due() {
        let s = TierSchedule::new(vec![7, 3]);
        for cycle in 0..50 {
            assert!(s.is_due(Tier(0), cycle));
        }
    }

    #[test]
    fn tiers_follow_their_cadence() {
        let s = schedule();
        assert!(s.is_due(Tier(1), 4));
        assert!(!s.is_due(Tier(1), 3));
        assert!(s.is_due(Tier(4), 40));
        assert!(!s.is_due(Tier(4), 30));
    }

    #[test]
    fn tiers_past_the_list_share_the_last_cadence() {
        let s = schedule();
        assert_eq!(s.cadence_of(Tier(9)), 20);
        assert!(s.is_due(Tier(9), 20));
        assert!(!s.is_due(Tier(9), 10));
    }

    #[test]
    fn filter_lists_due_tiers() {
        let s = schedule();

        match s.filter_for_cycle(10) {
            TierFilter::Due {
                tiers,
                overflow_from,
            } => {
                assert_eq!(tiers, vec![Tier(0), Tier(1), Tier(2), Tier(3)]);
                assert_eq!(overflow_from, None);
            }
            other => panic!("unexpected filter {other:?}"),
        }

        match s.filter_for_cycle(0) {
            TierFilter::Due {
                tiers,
                overflow_from,
            } => {
                assert_eq!(tiers.len(), 5);
                assert_eq!(overflow_from, Some(Tier(5)));
            }
            other => panic!("unexpected filter {other:?}"),
        }

        match s.filter_for_cycle(7) {
            TierFilter::Due { tiers, .. } => assert_eq!(tiers, vec![Tier(0)]),
            other => panic!("unexpected filter {other:?}"),
        }
    }

    #[test]
    fn untiered_schedule_claims_everything() {
        assert_eq!(TierSchedule::untiered().filter_for_cycle(3), TierFilter::Any);
    }
}
