use silt::{
    LookupKey, LookupResult, MemTable, MergeContext, MergeOperator, Options, ReadOptions,
    ValueKind, MAX_SEQNO,
};
use std::sync::Arc;
use test_log::test;

fn get(memtable: &MemTable, key: &[u8], snapshot: u64) -> LookupResult {
    let mut merge_context = MergeContext::default();
    let mut tombstone_seq = 0;

    memtable
        .get(
            &LookupKey::new(key, snapshot),
            &mut merge_context,
            &mut tombstone_seq,
            &ReadOptions::default(),
        )
        .expect("get should not fail")
}

fn found(value: &[u8], seqno: u64) -> LookupResult {
    LookupResult::Found {
        value: value.into(),
        seqno,
    }
}

#[test]
fn sequential_insert_point_lookup() -> silt::Result<()> {
    let memtable = MemTable::new(Options::default(), 0);

    for (i, c) in (b'a'..=b'z').enumerate() {
        let seqno = i as u64 + 1;
        memtable.add(
            seqno,
            ValueKind::Value,
            &[c],
            seqno.to_string().as_bytes(),
            false,
            None,
        )?;
    }

    assert_eq!(found(b"1", 1), get(&memtable, b"a", MAX_SEQNO));
    assert_eq!(found(b"26", 26), get(&memtable, b"z", MAX_SEQNO));

    // "z" was written at seqno 26, invisible to snapshot 10
    assert_eq!(LookupResult::NotPresent, get(&memtable, b"z", 10));
    assert_eq!(found(b"10", 10), get(&memtable, b"j", 10));

    assert_eq!(26, memtable.num_entries());
    assert_eq!(1, memtable.first_seqno());

    Ok(())
}

#[test]
fn deletion_shadows_value() -> silt::Result<()> {
    let memtable = MemTable::new(Options::default(), 0);

    memtable.add(5, ValueKind::Value, b"k", b"v1", false, None)?;
    memtable.add(7, ValueKind::Deletion, b"k", b"", false, None)?;

    assert_eq!(
        LookupResult::Deleted { seqno: 7 },
        get(&memtable, b"k", MAX_SEQNO)
    );
    assert_eq!(found(b"v1", 5), get(&memtable, b"k", 6));

    assert_eq!(1, memtable.num_deletes());

    Ok(())
}

struct Concat;

impl MergeOperator for Concat {
    fn full_merge(
        &self,
        _user_key: &[u8],
        existing: Option<&[u8]>,
        operands: &[&[u8]],
    ) -> Option<Vec<u8>> {
        let mut out = existing.map(<[u8]>::to_vec).unwrap_or_default();
        for op in operands {
            out.extend_from_slice(op);
        }
        Some(out)
    }
}

#[test]
fn merge_chain_combines_on_read() -> silt::Result<()> {
    let options = Options::default().merge_operator(Arc::new(Concat));
    let memtable = MemTable::new(options, 0);

    memtable.add(3, ValueKind::Value, b"k", b"A", false, None)?;
    memtable.add(4, ValueKind::Merge, b"k", b"B", false, None)?;
    memtable.add(5, ValueKind::Merge, b"k", b"C", false, None)?;

    assert_eq!(found(b"ABC", 3), get(&memtable, b"k", MAX_SEQNO));

    // At snapshot 4, only the first operand applies
    assert_eq!(found(b"AB", 3), get(&memtable, b"k", 4));

    assert_eq!(
        2,
        memtable.count_successive_merges(&LookupKey::new(b"k", MAX_SEQNO))?
    );

    Ok(())
}

#[test]
fn merge_chain_collects_without_combining() -> silt::Result<()> {
    let options = Options::default().merge_operator(Arc::new(Concat));
    let memtable = MemTable::new(options, 0);

    memtable.add(3, ValueKind::Value, b"k", b"A", false, None)?;
    memtable.add(4, ValueKind::Merge, b"k", b"B", false, None)?;
    memtable.add(5, ValueKind::Merge, b"k", b"C", false, None)?;

    let mut merge_context = MergeContext::default();
    let mut tombstone_seq = 0;
    let read_opts = ReadOptions {
        do_merge: false,
        ..ReadOptions::default()
    };

    let result = memtable
        .get(
            &LookupKey::new(b"k", MAX_SEQNO),
            &mut merge_context,
            &mut tombstone_seq,
            &read_opts,
        )
        .expect("get should not fail");

    // Operands are collected newest-first; the base is kept separately
    assert!(matches!(result, LookupResult::Found { .. }));
    let operands: Vec<&[u8]> = merge_context.operands().iter().map(|op| &**op).collect();
    assert_eq!(vec![b"C".as_slice(), b"B".as_slice()], operands);
    assert_eq!(Some(b"A".as_slice()), merge_context.base());

    Ok(())
}

#[test]
fn merge_without_base_is_in_progress() -> silt::Result<()> {
    let options = Options::default().merge_operator(Arc::new(Concat));
    let memtable = MemTable::new(options, 0);

    memtable.add(4, ValueKind::Merge, b"k", b"B", false, None)?;
    memtable.add(5, ValueKind::Merge, b"k", b"C", false, None)?;

    assert_eq!(
        LookupResult::MergeInProgress,
        get(&memtable, b"k", MAX_SEQNO)
    );

    Ok(())
}

#[test]
fn merge_over_deletion_starts_fresh() -> silt::Result<()> {
    let options = Options::default().merge_operator(Arc::new(Concat));
    let memtable = MemTable::new(options, 0);

    memtable.add(3, ValueKind::Value, b"k", b"old", false, None)?;
    memtable.add(4, ValueKind::Deletion, b"k", b"", false, None)?;
    memtable.add(5, ValueKind::Merge, b"k", b"X", false, None)?;

    // The tombstone cuts off the old value; merge starts from nothing
    assert_eq!(found(b"X", 4), get(&memtable, b"k", MAX_SEQNO));

    Ok(())
}

#[test]
fn merge_over_range_covered_base() -> silt::Result<()> {
    let options = Options::default().merge_operator(Arc::new(Concat));
    let memtable = MemTable::new(options, 0);

    memtable.add(5, ValueKind::Value, b"k", b"A", false, None)?;
    memtable.add(7, ValueKind::RangeDeletion, b"j", b"l", false, None)?;
    memtable.add(10, ValueKind::Merge, b"k", b"B", false, None)?;

    // The base value is range-covered, but the newer operand must still
    // combine over an empty base instead of being dropped
    assert_eq!(found(b"B", 5), get(&memtable, b"k", MAX_SEQNO));

    // Without pending operands the covered entry is a plain deletion
    memtable.add(11, ValueKind::RangeDeletion, b"j", b"l", false, None)?;
    assert!(matches!(
        get(&memtable, b"k", MAX_SEQNO),
        LookupResult::Deleted { .. }
    ));

    Ok(())
}

#[test]
fn iteration_yields_sorted_history() -> silt::Result<()> {
    let memtable = MemTable::new(Options::default(), 0);

    memtable.add(2, ValueKind::Value, b"b", b"2", false, None)?;
    memtable.add(1, ValueKind::Value, b"b", b"1", false, None)?;
    memtable.add(3, ValueKind::Value, b"a", b"3", false, None)?;

    let mut iter = memtable.iter();
    iter.seek_to_first();

    let mut seen = Vec::new();
    while iter.valid() {
        let entry = iter.entry()?;
        seen.push((entry.user_key.to_vec(), entry.seqno));
        iter.next();
    }

    // User keys ascending, and within one key newest first
    assert_eq!(
        vec![
            (b"a".to_vec(), 3),
            (b"b".to_vec(), 2),
            (b"b".to_vec(), 1),
        ],
        seen
    );

    // Backwards from the end
    iter.seek_to_last();
    assert_eq!(1, iter.entry()?.seqno);
    iter.prev();
    assert_eq!(2, iter.entry()?.seqno);
    iter.prev();
    assert_eq!(b"a", iter.entry()?.user_key);
    iter.prev();
    assert!(!iter.valid());

    Ok(())
}
