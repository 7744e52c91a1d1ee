//! Phase-specific progress detection between consecutive snapshots.

use crate::core::metrics::{MetricsSnapshot, keys};
use crate::core::types::Phase;

/// One monotonic-improvement predicate over named counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rule {
    /// The counter should grow.
    Increase(&'static str),
    /// The counter should shrink.
    Decrease(&'static str),
    /// The counter should shrink while `total` stays the same.
    DecreaseWithTotal {
        key: &'static str,
        total: &'static str,
    },
    /// The flag flipped from false to true.
    BecameTrue(&'static str),
}

fn rules(phase: Phase) -> &'static [Rule] {
    match phase {
        Phase::GenerateTests => &[
            Rule::Increase(keys::TESTS_GENERATED),
            Rule::Increase(keys::FILES_CREATED),
        ],
        Phase::Implement => &[
            Rule::Increase(keys::TESTS_PASSING),
            Rule::DecreaseWithTotal {
                key: keys::TESTS_FAILING,
                total: keys::TESTS_TOTAL,
            },
            Rule::Increase(keys::CONSECUTIVE_RUNS),
        ],
        Phase::Improve => &[
            Rule::Decrease(keys::QUALITY_ISSUES),
            Rule::Increase(keys::FILES_MODIFIED),
            Rule::DecreaseWithTotal {
                key: keys::TESTS_FAILING,
                total: keys::TESTS_TOTAL,
            },
        ],
        Phase::Document => &[
            Rule::Increase(keys::DOCS_GENERATED),
            Rule::Increase(keys::FILES_CREATED),
        ],
        Phase::Validate => &[
            Rule::Increase(keys::CHECKS_PASSED),
            Rule::DecreaseWithTotal {
                key: keys::CHECKS_FAILED,
                total: keys::CHECKS_TOTAL,
            },
            Rule::Decrease(keys::BLOCKING_FAILURES),
            Rule::BecameTrue(keys::APPROVED),
        ],
    }
}

/// Phases whose "increase" counters may be compared against zero on the
/// first iteration: anything they create from nothing is progress.
fn has_zero_baseline(phase: Phase) -> bool {
    matches!(phase, Phase::GenerateTests | Phase::Document)
}

/// Return whether `current` shows progress over `previous` for `phase`.
///
/// Without a previous snapshot only zero-baseline phases can claim progress,
/// and only through their `Increase` rules.
pub fn detect_progress(
    phase: Phase,
    current: &MetricsSnapshot,
    previous: Option<&MetricsSnapshot>,
) -> bool {
    let Some(previous) = previous else {
        if !has_zero_baseline(phase) {
            return false;
        }
        return rules(phase).iter().any(|rule| match rule {
            Rule::Increase(key) => current.count(key) > 0,
            _ => false,
        });
    };

    if current.same_values(previous) {
        return false;
    }

    rules(phase).iter().any(|rule| match *rule {
        Rule::Increase(key) => current.count(key) > previous.count(key),
        Rule::Decrease(key) => current.count(key) < previous.count(key),
        Rule::DecreaseWithTotal { key, total } => {
            current.count(key) < previous.count(key) && current.count(total) == previous.count(total)
        }
        Rule::BecameTrue(key) => current.flag(key) && !previous.flag(key),
    })
}
