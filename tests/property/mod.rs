//! Property-based testing for the snapshot engine
//!
//! Uses proptest to generate random base states and random edits of them,
//! then checks the algebra `synchronize`, `patch`, `trim` and `build_state`
//! must obey. Everything here is pure; no files are touched.

use ::snapsync::*;
use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// What happens to one base file in the target state
#[derive(Debug, Clone)]
pub enum FileEdit {
    Keep,
    Modify { content: u16, later_by: i64 },
    Delete,
    Rename,
}

fn edit_strategy() -> impl Strategy<Value = FileEdit> {
    prop_oneof![
        4 => Just(FileEdit::Keep),
        2 => (1000u16..2000, 1i64..1000).prop_map(|(content, later_by)| FileEdit::Modify { content, later_by }),
        1 => Just(FileEdit::Delete),
        1 => Just(FileEdit::Rename),
    ]
}

/// Base files keyed by path: (content id, mtime seconds)
fn base_strategy() -> impl Strategy<Value = BTreeMap<String, (u16, i64)>> {
    prop::collection::btree_map(
        "[a-c]{1,2}/[a-z]{1,6}\\.txt",
        (0u16..64, 0i64..10_000),
        0..24,
    )
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
}

fn entry(path: &str, content: u16, mtime: i64) -> types::Entry {
    types::Entry::new(path, format!("digest-{}", content), content as u64, at(mtime))
}

fn state(date: i64, files: &BTreeMap<String, (u16, i64)>) -> Snapshot {
    Snapshot::from_entries(
        at(date),
        files
            .iter()
            .map(|(path, (content, mtime))| entry(path, *content, *mtime))
            .collect(),
    )
}

/// Apply edits to the base files, then add brand new ones
///
/// `tag` keeps the new paths of successive generations apart.
fn edited(
    tag: &str,
    base: &BTreeMap<String, (u16, i64)>,
    edits: &[FileEdit],
    added: &[u16],
) -> BTreeMap<String, (u16, i64)> {
    let mut target = BTreeMap::new();
    for (idx, ((path, (content, mtime)), edit)) in base.iter().zip(edits.iter().cycle()).enumerate() {
        match edit {
            FileEdit::Keep => {
                target.insert(path.clone(), (*content, *mtime));
            }
            FileEdit::Modify { content, later_by } => {
                target.insert(path.clone(), (*content, mtime + later_by));
            }
            FileEdit::Delete => {}
            FileEdit::Rename => {
                target.insert(format!("renamed/{}{}.txt", tag, idx), (*content, *mtime));
            }
        }
    }
    for (idx, content) in added.iter().enumerate() {
        target.insert(format!("added/{}{}.txt", tag, idx), (*content, 20_000 + idx as i64));
    }
    target
}

fn comparable(snapshot: &Snapshot) -> Vec<(String, String, u64, DateTime<Utc>)> {
    snapshot
        .entries()
        .iter()
        .map(|e| (e.path.clone(), e.digest.clone(), e.length, e.last_modified))
        .collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_patch_of_diff_reaches_target(
        base in base_strategy(),
        edits in prop::collection::vec(edit_strategy(), 1..8),
        added in prop::collection::vec(2000u16..3000, 0..5),
    ) {
        let before = state(0, &base);
        let after = state(1, &edited("a", &base, &edits, &added));

        let diff = before.synchronize(&after).trim();
        let next = before.patch(&diff);

        prop_assert!(next.is_state());
        prop_assert_eq!(comparable(&next), comparable(&after));
        prop_assert_eq!(next.date, after.date);
    }

    #[test]
    fn prop_patch_is_idempotent(
        base in base_strategy(),
        edits in prop::collection::vec(edit_strategy(), 1..8),
        added in prop::collection::vec(2000u16..3000, 0..5),
    ) {
        let before = state(0, &base);
        let after = state(1, &edited("a", &base, &edits, &added));
        let diff = before.synchronize(&after).trim();

        let once = before.patch(&diff);
        let twice = once.patch(&diff);
        prop_assert_eq!(once, twice);
    }

    #[test]
    fn prop_trim_keeps_only_changes(
        base in base_strategy(),
        edits in prop::collection::vec(edit_strategy(), 1..8),
    ) {
        let before = state(0, &base);
        let after = state(1, &edited("a", &base, &edits, &[]));
        let full = before.synchronize(&after);
        let trimmed = full.trim();

        prop_assert!(trimmed.entries().iter().all(|e| e.action.is_change()));
        prop_assert_eq!(trimmed.stats(), full.stats());
        prop_assert_eq!(trimmed.date, full.date);
        prop_assert_eq!(trimmed.trim(), trimmed.clone());
    }

    #[test]
    fn prop_self_synchronize_is_empty(base in base_strategy()) {
        let snapshot = state(0, &base);
        let diff = snapshot.synchronize(&snapshot);
        prop_assert!(diff.trim().is_empty());
        prop_assert_eq!(diff.len(), snapshot.len());
    }

    #[test]
    fn prop_every_move_source_left_the_target(
        base in base_strategy(),
        edits in prop::collection::vec(edit_strategy(), 1..8),
    ) {
        let before = state(0, &base);
        let after = state(1, &edited("a", &base, &edits, &[]));
        let diff = before.synchronize(&after);

        let mut sources = Vec::new();
        for entry in diff.entries() {
            if let Some(from) = entry.action.move_source() {
                prop_assert!(after.get(from).is_none());
                prop_assert_eq!(&before.get(from).unwrap().digest, &entry.digest);
                sources.push(from.to_string());
            }
        }
        let total = sources.len();
        sources.sort();
        sources.dedup();
        prop_assert_eq!(sources.len(), total);
    }

    #[test]
    fn prop_chain_folds_to_latest_state(
        base in base_strategy(),
        first in prop::collection::vec(edit_strategy(), 1..8),
        second in prop::collection::vec(edit_strategy(), 1..8),
    ) {
        let gen1 = edited("a", &base, &first, &[3000]);
        let gen2 = edited("b", &gen1, &second, &[3001, 3002]);
        let states = [state(10, &base), state(20, &gen1), state(30, &gen2)];

        let mut chain = SnapshotChain::new("/tree");
        for (idx, target) in states.iter().enumerate() {
            let base = chain.build_state(at(idx as i64 * 10 + 5));
            let diff = base.synchronize(target).trim();
            if !diff.is_empty() {
                chain.append(diff);
            }
        }

        let rebuilt = SnapshotChain::from_bytes(&chain.to_bytes().unwrap()).unwrap();
        prop_assert_eq!(comparable(&rebuilt.build_state(at(100))), comparable(&states[2]));
        prop_assert!(rebuilt.build_state(at(0)).is_empty());
    }
}
