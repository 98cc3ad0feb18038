//! Raw rows → ordered work units.

use std::collections::HashMap;

use crawlbatch_shared::WorkUnit;
use tracing::debug;

/// Group `(key, member)` rows into work units.
///
/// The first row is a header and is dropped. Only rows with exactly two
/// non-empty cells are kept; anything else is skipped without error.
/// Groups keep first-appearance order and members keep encountered order,
/// duplicates included.
pub fn normalize_rows(rows: &[Vec<String>]) -> Vec<WorkUnit> {
    let mut units: Vec<WorkUnit> = Vec::new();
    let mut index_by_key: HashMap<&str, usize> = HashMap::new();
    let mut skipped = 0usize;

    for row in rows.iter().skip(1) {
        let [key, member] = row.as_slice() else {
            skipped += 1;
            continue;
        };
        if key.is_empty() || member.is_empty() {
            skipped += 1;
            continue;
        }

        match index_by_key.get(key.as_str()) {
            Some(&idx) => units[idx].member_ids.push(member.clone()),
            None => {
                let position = units.len();
                index_by_key.insert(key.as_str(), position);
                units.push(WorkUnit {
                    group_key: key.clone(),
                    member_ids: vec![member.clone()],
                    position,
                });
            }
        }
    }

    if skipped > 0 {
        debug!(skipped, "dropped malformed rows");
    }
    debug!(groups = units.len(), "normalized input rows");

    units
}
