//! Record deduplication by natural identity `(tx_sig, tx_sig_index)`.

use std::collections::HashSet;

use crate::types::FundingRecord;

/// Drop records whose identity was already seen. First occurrence wins and
/// the relative order of survivors is preserved.
pub fn dedupe(records: Vec<FundingRecord>) -> Vec<FundingRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .into_iter()
        .filter(|r| seen.insert((r.tx_sig.clone(), r.tx_sig_index)))
        .collect()
}

/// Merge `fresh` over `existing`, dedupe, and sort newest first.
pub fn merge_newest_first(
    existing: Vec<FundingRecord>,
    fresh: Vec<FundingRecord>,
) -> Vec<FundingRecord> {
    let mut all = fresh;
    all.extend(existing);
    let mut merged = dedupe(all);
    sort_newest_first(&mut merged);
    merged
}

/// Stable sort by descending timestamp.
pub fn sort_newest_first(records: &mut [FundingRecord]) {
    records.sort_by(|a, b| b.ts.cmp(&a.ts));
}
