//! Nearest-access queries in the (compact address, iseq) plane.
//!
//! The viewer front-end hands in a point in plot coordinates (a compact
//! address on one axis, an instruction-sequence position on the other)
//! and an anisotropy ratio, pixels per byte over pixels per instruction,
//! so that screen distance rather than raw coordinate distance is
//! minimised.
//!
//! Runs are stored in nondecreasing `iseq_start` order, so the search
//! binary-searches to the target's run neighbourhood and walks outward in
//! both directions at once. A direction stops as soon as its iseq
//! distance alone exceeds the best score: the iseq axis is unscaled in
//! the metric, making that distance a lower bound on any score the
//! direction can still produce.

use crate::record::Word;
use crate::viewer::store::{AccessStore, DecodedAccess, StoredRun};
use crate::viewer::remap::PageMap;
use crate::viewer::TraceData;

/// A nearest-access query point.
#[derive(Debug, Clone, Copy)]
pub struct NearestQuery {
    /// Target address in compact coordinates.
    pub compact_addr: Word,
    /// Target position on the instruction timeline.
    pub iseq: u64,
    /// Pixels-per-byte divided by pixels-per-instruction.
    pub addr_scale: f64,
}

/// The winning access with its origin stack.
#[derive(Debug, Clone)]
pub struct AccessHit {
    pub access: DecodedAccess,
    /// Owning call stack, innermost frame replaced by the access's
    /// instruction address.
    pub stack: Vec<Word>,
    /// Anisotropic distance from the query point.
    pub score: f64,
}

impl TraceData {
    /// The single retained access minimising the anisotropic distance to
    /// the query point, or `None` on an empty store.
    pub fn nearest_access(&self, query: NearestQuery) -> Option<AccessHit> {
        let runs = self.store.runs();
        let pivot = runs.partition_point(|run| run.iseq_start < query.iseq);

        let mut best: Option<(f64, usize, usize)> = None;
        let best_score = |best: &Option<(f64, usize, usize)>| {
            best.as_ref().map_or(f64::INFINITY, |&(score, _, _)| score)
        };

        // Forward: runs starting at or after the target iseq.
        for (offset, run) in runs[pivot..].iter().enumerate() {
            let lower_bound = run.iseq_start.saturating_sub(query.iseq) as f64;
            if lower_bound > best_score(&best) {
                break;
            }
            if let Some((score, slot)) = score_run(&self.store, &self.page_map, run, query) {
                if score < best_score(&best) {
                    best = Some((score, pivot + offset, slot));
                }
            }
        }

        // Backward: runs starting before the target iseq.
        for (offset, run) in runs[..pivot].iter().rev().enumerate() {
            let run_last_iseq = run.iseq_start + u64::from(run.n_instrs.max(1)) - 1;
            let lower_bound = query.iseq.saturating_sub(run_last_iseq) as f64;
            if lower_bound > best_score(&best) {
                break;
            }
            if let Some((score, slot)) = score_run(&self.store, &self.page_map, run, query) {
                if score < best_score(&best) {
                    best = Some((score, pivot - 1 - offset, slot));
                }
            }
        }

        let (score, run_index, slot) = best?;
        let run = runs[run_index];
        let access = self.store.access(&run, slot)?;
        Some(AccessHit {
            access,
            stack: self.store.stack_at(&run, access.instr_addr),
            score,
        })
    }
}

impl TraceData {
    /// Instruction address of the latest retained access at or before
    /// `iseq`, or `None` if the timeline starts later. The front-end uses
    /// this to label a click on the time axis.
    pub fn instr_addr_at(&self, iseq: u64) -> Option<Word> {
        let runs = self.store.runs();
        let pivot = runs.partition_point(|run| run.iseq_start <= iseq);
        for run in runs[..pivot].iter().rev() {
            let candidate = (0..self.store.run_slots(run))
                .filter_map(|slot| self.store.access(run, slot))
                .filter(|access| access.iseq <= iseq)
                .max_by_key(|access| access.iseq);
            if let Some(access) = candidate {
                return Some(access.instr_addr);
            }
        }
        None
    }
}

/// Best-scoring live slot of one run. Filtered-away slots decode to
/// `None` and are skipped.
fn score_run(
    store: &AccessStore,
    page_map: &PageMap,
    run: &StoredRun,
    query: NearestQuery,
) -> Option<(f64, usize)> {
    let mut best: Option<(f64, usize)> = None;
    for slot in 0..store.run_slots(run) {
        let Some(access) = store.access(run, slot) else {
            continue;
        };
        let Some(compact) = page_map.to_compact(access.addr) else {
            continue;
        };
        let daddr = compact.abs_diff(query.compact_addr) as f64 * query.addr_scale;
        let diseq = access.iseq.abs_diff(query.iseq) as f64;
        let score = (daddr * daddr + diseq * diseq).sqrt();
        if best.map_or(true, |(b, _)| score < b) {
            best = Some((score, slot));
        }
    }
    best
}
