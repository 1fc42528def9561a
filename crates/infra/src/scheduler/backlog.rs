//! Backlog-aware batch sizing.

/// Outcome of classifying the pending count at cycle start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacklogDecision {
    pub backlogged: bool,
    /// Factor applied to the base batch size for this cycle only
    pub multiplier: u32,
}

/// Decides whether the queue is backlogged and how hard to push.
///
/// Stateless: the decision depends only on the count it is given, so once a
/// backlog drains below the threshold the next cycle is back at baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BacklogClassifier {
    threshold: u64,
    multiplier: u32,
}

impl BacklogClassifier {
    pub fn new(threshold: u64, multiplier: u32) -> Self {
        Self {
            threshold,
            multiplier: multiplier.max(1),
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn decide(&self, pending: u64) -> BacklogDecision {
        if pending > self.threshold {
            BacklogDecision {
                backlogged: true,
                multiplier: self.multiplier,
            }
        } else {
            BacklogDecision {
                backlogged: false,
                multiplier: 1,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn escalates_only_above_threshold() {
        let classifier = BacklogClassifier::new(100, 2);

        assert_eq!(classifier.decide(0).multiplier, 1);
        assert_eq!(classifier.decide(100).multiplier, 1);
        assert!(!classifier.decide(100).backlogged);

        let decision = classifier.decide(101);
        assert!(decision.backlogged);
        assert_eq!(decision.multiplier, 2);
    }

    #[test]
    fn multiplier_is_never_below_one() {
        let classifier = BacklogClassifier::new(10, 0);
        assert_eq!(classifier.decide(1_000).multiplier, 1);
    }

    proptest! {
        /// Property: the decision is a pure function of the count, so an
        /// escalation reverts as soon as the count is back under threshold.
        #[test]
        fn escalation_is_reversible(
            threshold in 0u64..1_000,
            multiplier in 2u32..11,
            counts in prop::collection::vec(0u64..2_000, 1..30),
        ) {
            let classifier = BacklogClassifier::new(threshold, multiplier);
            for pending in counts {
                let decision = classifier.decide(pending);
                if pending > threshold {
                    prop_assert!(decision.multiplier > 1);
                } else {
                    prop_assert_eq!(decision.multiplier, 1);
                }
                prop_assert_eq!(decision, classifier.decide(pending));
            }
        }
    }
}
