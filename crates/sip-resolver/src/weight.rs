//! SRV ordering per RFC 2782

use rand::Rng;

use crate::record::SrvData;

/// Sort by ascending priority; inside a priority group draw by weight.
///
/// Records with weight 0 never win a draw against weighted ones and keep
/// their relative input order at the end of their group.
pub fn order_srv<R: Rng + ?Sized>(records: &[SrvData], rng: &mut R) -> Vec<SrvData> {
    let mut sorted: Vec<SrvData> = records.to_vec();
    // Stable sort keeps input order among equal priorities
    sorted.sort_by_key(|r| r.priority);

    let mut result = Vec::with_capacity(sorted.len());
    let mut start = 0;
    while start < sorted.len() {
        let priority = sorted[start].priority;
        let end = sorted[start..]
            .iter()
            .position(|r| r.priority != priority)
            .map(|p| start + p)
            .unwrap_or(sorted.len());
        result.extend(select_by_weight(sorted[start..end].to_vec(), rng));
        start = end;
    }
    result
}

fn select_by_weight<R: Rng + ?Sized>(mut group: Vec<SrvData>, rng: &mut R) -> Vec<SrvData> {
    let mut result = Vec::with_capacity(group.len());
    loop {
        let total: u32 = group.iter().map(|r| u32::from(r.weight)).sum();
        if total == 0 {
            break;
        }
        let pick = rng.gen_range(0..total);
        let mut cumulative = 0u32;
        let idx = group
            .iter()
            .position(|r| {
                cumulative += u32::from(r.weight);
                cumulative > pick
            })
            .unwrap_or(0);
        result.push(group.remove(idx));
    }
    // Only zero-weight records are left
    result.extend(group);
    result
}
