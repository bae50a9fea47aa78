use std::collections::BTreeMap;

use tracing::debug;

use crate::geometry::SE3;
use crate::map::Timestamp;
use crate::optimizer::ChainNode;

/// One committed loop correction: the span it solved and the pre-correction
/// poses of the prior-submap interiors it claimed. Read-only once created.
#[derive(Debug, Clone)]
pub struct SubmapRecord {
    pub old_time: Timestamp,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub inner: BTreeMap<Timestamp, SE3>,
}

/// An anchor produced by claiming a prior submap's interior: the interior
/// keyframes leave the solve window and are later re-chained rigidly to the
/// anchor's solved pose.
#[derive(Debug, Clone)]
pub struct ClaimedAnchor {
    /// The prior submap's start keyframe; it stays in the solve.
    pub anchor_time: Timestamp,
    /// The anchor's pose at claim time.
    pub snapshot: SE3,
    /// Claimed interior keyframes with their poses at claim time.
    pub claimed: Vec<(Timestamp, SE3)>,
}

/// Ledger of committed corrections. Records accumulate monotonically; spans
/// are consulted by the scan-window builder (stale-pose fallback) and
/// claimed by later corrections that envelop them.
#[derive(Debug, Default)]
pub struct SubmapLedger {
    records: BTreeMap<Timestamp, SubmapRecord>,
}

impl SubmapLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &SubmapRecord> {
        self.records.values()
    }

    /// `(start_time, end_time)` of every committed correction, for the
    /// builder's association fallback.
    pub fn committed_spans(&self) -> Vec<(Timestamp, Timestamp)> {
        self.records
            .values()
            .map(|r| (r.start_time, r.end_time))
            .collect()
    }

    /// Remove prior-submap interiors from a correction window.
    ///
    /// For every record whose span starts inside the window but before the
    /// current correction's own start, the keyframes strictly inside that
    /// span are dropped from `nodes` (they will be re-chained rigidly), while
    /// the span's start keyframe stays as the anchor. A keyframe lying
    /// exactly on the current correction's start belongs to the newer
    /// correction and is never claimed.
    pub fn claim_inner_spans(
        &self,
        nodes: &mut Vec<ChainNode>,
        correction_start: Timestamp,
    ) -> Vec<ClaimedAnchor> {
        let mut anchors = Vec::new();
        let Some(window_first) = nodes.first().map(|n| n.time) else {
            return anchors;
        };

        for record in self.records.values() {
            if record.start_time < window_first || record.start_time >= correction_start {
                continue;
            }
            let Some(anchor) = nodes.iter().find(|n| n.time == record.start_time) else {
                continue;
            };
            let snapshot = anchor.pose;
            let anchor_time = record.start_time;

            let mut claimed = Vec::new();
            nodes.retain(|node| {
                let interior = node.time > record.start_time
                    && node.time <= record.end_time
                    && node.time < correction_start;
                if interior {
                    claimed.push((node.time, node.pose));
                }
                !interior
            });

            if !claimed.is_empty() {
                debug!(
                    "claimed {} interior keyframes of submap [{}, {}]",
                    claimed.len(),
                    record.start_time,
                    record.end_time
                );
            }
            anchors.push(ClaimedAnchor {
                anchor_time,
                snapshot,
                claimed,
            });
        }
        anchors
    }

    /// Record a committed correction.
    pub fn add_record(
        &mut self,
        old_time: Timestamp,
        start_time: Timestamp,
        end_time: Timestamp,
        inner: BTreeMap<Timestamp, SE3>,
    ) {
        debug!("recording submap [{start_time}, {end_time}] anchored at {old_time}");
        self.records.insert(
            start_time,
            SubmapRecord {
                old_time,
                start_time,
                end_time,
                inner,
            },
        );
    }
}
