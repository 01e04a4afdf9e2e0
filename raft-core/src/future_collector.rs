//! Aggregation strategies for collecting the results of several concurrent requests sent to the
//! cluster, such as the per-node acknowledgements gathered while confirming a linearizable read.
//!
//! This generalizes the ad hoc `FuturesUnordered`-based quorum tally used for read-index
//! confirmation into a small set of reusable, independently testable strategies.

use std::collections::BTreeSet;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::watch;
use tokio::time::sleep;

use crate::quorum;
use crate::NodeId;

/// How a batch of futures should be aggregated into a single result.
#[derive(Clone, Debug)]
pub enum CollectStrategy {
    /// Wait for every future to resolve; fails if any of them fails.
    All,

    /// Wait for a simple majority of the futures to succeed.
    Majority,

    /// A joint-consensus variant of [`CollectStrategy::Majority`]: succeeds only once a majority
    /// of `members_old` AND a majority of `members_new` have each independently succeeded.
    JointMajority {
        members_old: BTreeSet<NodeId>,
        members_new: BTreeSet<NodeId>,
    },

    /// Succeed as soon as any single future succeeds.
    AnySuccess,

    /// Succeed once `k` futures have succeeded.
    FirstN(usize),
}

/// Why [`collect`] gave up without satisfying its strategy.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CollectError {
    /// Enough futures have already failed that the strategy can never be satisfied, even if
    /// every future still outstanding were to succeed. Returned without waiting for the
    /// remaining futures or the deadline.
    Insufficient,

    /// `deadline` elapsed before the strategy was satisfied.
    Timeout,

    /// The caller cancelled the aggregate before the strategy was satisfied.
    Cancelled,
}

/// The outcome of collecting a batch of per-member futures.
#[derive(Debug)]
pub struct CollectOutcome<T> {
    /// Results in the same order as the input futures were supplied, `None` where a future
    /// either failed or was never polled to completion because the strategy was already
    /// satisfied (or collection gave up first).
    pub results: Vec<Option<T>>,
    pub satisfied: bool,

    /// Set whenever `satisfied` is `false`, naming why the aggregate gave up.
    pub error: Option<CollectError>,
}

/// Drive `members` (each tagged with the `NodeId` it represents, to support the joint-consensus
/// strategy) to completion according to `strategy`, short-circuiting as soon as the strategy is
/// satisfied, is proven unsatisfiable, `deadline` elapses, or `cancel` is signalled.
///
/// `deadline` bounds the whole aggregate, not any individual future; pass `None` to wait as long
/// as `strategy` needs (callers that already bound each input future with its own per-RPC
/// timeout, e.g. via `tokio::time::timeout`, may still want to pass a deadline here so a member
/// that never resolves its future at all cannot hang the aggregate). `cancel`, if given, is a
/// `watch` channel whose value going `true` cancels the aggregate. Either way, futures still
/// outstanding when `collect` returns are dropped along with the underlying `FuturesUnordered`,
/// which releases any resources they hold (timers, callback-list registrations, and the like).
pub async fn collect<T, F>(
    members: Vec<(NodeId, F)>,
    strategy: CollectStrategy,
    deadline: Option<Duration>,
    mut cancel: Option<watch::Receiver<bool>>,
) -> CollectOutcome<T>
where F: std::future::Future<Output = Option<T>> {
    let total = members.len();
    let mut results: Vec<Option<T>> = (0..total).map(|_| None).collect();

    let (old_members, new_members) = match &strategy {
        CollectStrategy::JointMajority { members_old, members_new } => (Some(members_old.clone()), Some(members_new.clone())),
        _ => (None, None),
    };
    let mut succeeded_old = BTreeSet::new();
    let mut succeeded_new = BTreeSet::new();
    let mut remaining_old = old_members.as_ref().map(BTreeSet::len).unwrap_or(0);
    let mut remaining_new = new_members.as_ref().map(BTreeSet::len).unwrap_or(0);
    let mut success_count = 0usize;
    let mut remaining = total;

    let mut pending: FuturesUnordered<_> =
        members.into_iter().enumerate().map(|(idx, (id, fut))| async move { (idx, id, fut.await) }).collect();

    let sleeper = async {
        match deadline {
            Some(d) => sleep(d).await,
            None => futures::future::pending().await,
        }
    };
    tokio::pin!(sleeper);

    loop {
        if let Some(rx) = cancel.as_ref() {
            if *rx.borrow() {
                return CollectOutcome {
                    results,
                    satisfied: false,
                    error: Some(CollectError::Cancelled),
                };
            }
        }

        tokio::select! {
            biased;

            changed = async {
                match cancel.as_mut() {
                    Some(rx) => rx.changed().await,
                    None => futures::future::pending().await,
                }
            } => {
                // A value change just means "go re-check the flag at the top of the loop"; only
                // an observed `true` actually cancels. If the sender was dropped without ever
                // sending `true`, cancellation is no longer possible; stop polling it so this
                // branch doesn't spin.
                if changed.is_err() {
                    cancel = None;
                }
                continue;
            }

            _ = &mut sleeper => {
                return CollectOutcome { results, satisfied: false, error: Some(CollectError::Timeout) };
            }

            next = pending.next() => {
                let (idx, id, outcome) = match next {
                    Some(item) => item,
                    None => {
                        return CollectOutcome { results, satisfied: false, error: Some(CollectError::Insufficient) };
                    }
                };
                remaining -= 1;

                match outcome {
                    Some(value) => {
                        results[idx] = Some(value);
                        success_count += 1;
                        if old_members.as_ref().map(|s| s.contains(&id)).unwrap_or(false) {
                            succeeded_old.insert(id);
                        }
                        if new_members.as_ref().map(|s| s.contains(&id)).unwrap_or(false) {
                            succeeded_new.insert(id);
                        }
                    }
                    None => {
                        if old_members.as_ref().map(|s| s.contains(&id)).unwrap_or(false) {
                            remaining_old -= 1;
                        }
                        if new_members.as_ref().map(|s| s.contains(&id)).unwrap_or(false) {
                            remaining_new -= 1;
                        }
                    }
                }

                let satisfied = match &strategy {
                    CollectStrategy::All => success_count == total,
                    CollectStrategy::Majority => success_count >= quorum::majority_of(total),
                    CollectStrategy::JointMajority { members_old, members_new } => {
                        succeeded_old.len() >= quorum::majority_of(members_old.len())
                            && succeeded_new.len() >= quorum::majority_of(members_new.len())
                    }
                    CollectStrategy::AnySuccess => success_count >= 1,
                    CollectStrategy::FirstN(k) => success_count >= *k,
                };
                if satisfied {
                    return CollectOutcome { results, satisfied: true, error: None };
                }

                let insufficient = match &strategy {
                    CollectStrategy::All => success_count + remaining < total,
                    CollectStrategy::Majority => success_count + remaining < quorum::majority_of(total),
                    CollectStrategy::JointMajority { members_old, members_new } => {
                        succeeded_old.len() + remaining_old < quorum::majority_of(members_old.len())
                            || succeeded_new.len() + remaining_new < quorum::majority_of(members_new.len())
                    }
                    CollectStrategy::AnySuccess => remaining == 0,
                    CollectStrategy::FirstN(k) => success_count + remaining < *k,
                };
                if insufficient {
                    return CollectOutcome { results, satisfied: false, error: Some(CollectError::Insufficient) };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;

    use super::*;

    async fn ok(_id: NodeId, v: u64) -> Option<u64> {
        Some(v)
    }

    async fn fail(_id: NodeId) -> Option<u64> {
        None
    }

    #[tokio::test]
    async fn all_requires_every_member() {
        let members = vec![(1, ok(1, 10)), (2, ok(2, 20)), (3, ok(3, 30))];
        let out = collect(members, CollectStrategy::All, None, None).await;
        assert!(out.satisfied);
        assert_eq!(out.results, vec![Some(10), Some(20), Some(30)]);
    }

    #[tokio::test]
    async fn majority_short_circuits_before_all_resolve() {
        let members: Vec<(NodeId, _)> = vec![(1, ok(1, 1)), (2, ok(2, 1)), (3, fail(3)), (4, fail(4)), (5, fail(5))];
        let out = collect(members, CollectStrategy::Majority, None, None).await;
        assert!(out.satisfied);
    }

    #[tokio::test]
    async fn majority_reports_insufficient_without_waiting_for_stragglers() {
        // 5 members, majority is 3. Once 3 have failed a majority can never be reached, even
        // though 2 futures are still outstanding (and, in this test, never resolve at all).
        let never = futures::future::pending::<Option<u64>>();
        let members: Vec<(NodeId, _)> = vec![
            (1, fail(1).boxed()),
            (2, fail(2).boxed()),
            (3, fail(3).boxed()),
            (4, never.boxed()),
            (5, futures::future::pending::<Option<u64>>().boxed()),
        ];
        let out = collect(members, CollectStrategy::Majority, None, None).await;
        assert!(!out.satisfied);
        assert_eq!(out.error, Some(CollectError::Insufficient));
    }

    #[tokio::test]
    async fn joint_majority_needs_both_sets() {
        let mut old_set = BTreeSet::new();
        old_set.insert(1);
        old_set.insert(2);
        old_set.insert(3);
        let mut new_set = BTreeSet::new();
        new_set.insert(3);
        new_set.insert(4);
        new_set.insert(5);

        let members = vec![(1, ok(1, 1)), (2, ok(2, 1)), (3, ok(3, 1)), (4, ok(4, 1)), (5, ok(5, 1))];
        let out = collect(
            members,
            CollectStrategy::JointMajority {
                members_old: old_set,
                members_new: new_set,
            },
            None,
            None,
        )
        .await;
        assert!(out.satisfied);
    }

    #[tokio::test]
    async fn joint_majority_insufficient_when_one_side_cannot_reach_quorum() {
        let mut old_set = BTreeSet::new();
        old_set.insert(1);
        old_set.insert(2);
        old_set.insert(3);
        let mut new_set = BTreeSet::new();
        new_set.insert(3);
        new_set.insert(4);
        new_set.insert(5);

        // The new-side majority (3,4,5) can never be reached: 4 and 5 both fail, leaving only
        // node 3 possibly succeeding on the new side.
        let members: Vec<(NodeId, _)> =
            vec![(1, ok(1, 1).boxed()), (2, ok(2, 1).boxed()), (3, ok(3, 1).boxed()), (4, fail(4).boxed()), (5, fail(5).boxed())];
        let out = collect(
            members,
            CollectStrategy::JointMajority {
                members_old: old_set,
                members_new: new_set,
            },
            None,
            None,
        )
        .await;
        assert!(!out.satisfied);
        assert_eq!(out.error, Some(CollectError::Insufficient));
    }

    #[tokio::test]
    async fn any_success_stops_at_first() {
        let members = vec![(1, fail(1)), (2, ok(2, 42))];
        let out = collect(members, CollectStrategy::AnySuccess, None, None).await;
        assert!(out.satisfied);
    }

    #[tokio::test]
    async fn any_success_insufficient_when_all_fail() {
        let members = vec![(1, fail(1)), (2, fail(2))];
        let out = collect(members, CollectStrategy::AnySuccess, None, None).await;
        assert!(!out.satisfied);
        assert_eq!(out.error, Some(CollectError::Insufficient));
    }

    #[tokio::test]
    async fn first_n_counts_successes() {
        let members = vec![(1, ok(1, 1)), (2, fail(2)), (3, ok(3, 3))];
        let out = collect(members, CollectStrategy::FirstN(2), None, None).await;
        assert!(out.satisfied);
    }

    #[tokio::test]
    async fn deadline_elapsing_reports_timeout() {
        let members: Vec<(NodeId, _)> =
            vec![(1, futures::future::pending::<Option<u64>>().boxed()), (2, futures::future::pending::<Option<u64>>().boxed())];
        let out = collect(members, CollectStrategy::All, Some(Duration::from_millis(10)), None).await;
        assert!(!out.satisfied);
        assert_eq!(out.error, Some(CollectError::Timeout));
    }

    #[tokio::test]
    async fn cancellation_stops_the_aggregate() {
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            sleep(Duration::from_millis(5)).await;
            let _ = tx.send(true);
        });

        let members: Vec<(NodeId, _)> =
            vec![(1, futures::future::pending::<Option<u64>>().boxed()), (2, futures::future::pending::<Option<u64>>().boxed())];
        let out = collect(members, CollectStrategy::All, None, Some(rx)).await;
        assert!(!out.satisfied);
        assert_eq!(out.error, Some(CollectError::Cancelled));
    }
}
