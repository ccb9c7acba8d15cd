use std::collections::HashMap;

use drummond_core::Signal;

/// An entry candidate with its resolved sector.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub signal: Signal,
    pub sector: Option<String>,
}

/// Rank entry candidates for execution: confidence first, then risk/reward,
/// then sector diversity (fewer already-open positions in the sector wins),
/// with the symbol name as the deterministic final tiebreak.
pub fn rank_candidates(candidates: &mut [Candidate], open_sector_counts: &HashMap<String, usize>) {
    candidates.sort_by(|a, b| {
        b.signal
            .confidence
            .partial_cmp(&a.signal.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| {
                b.signal
                    .rr_ratio
                    .partial_cmp(&a.signal.rr_ratio)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| {
                sector_load(a, open_sector_counts).cmp(&sector_load(b, open_sector_counts))
            })
            .then_with(|| a.signal.symbol.cmp(&b.signal.symbol))
    });
}

fn sector_load(candidate: &Candidate, counts: &HashMap<String, usize>) -> usize {
    candidate
        .sector
        .as_ref()
        .and_then(|s| counts.get(s))
        .copied()
        .unwrap_or(0)
}
