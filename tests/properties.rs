//! Invariants that must hold regardless of which table or segment
//! they're checked against: slab validity, inode addressing, row
//! accounting, and merge-rule arithmetic.

use tmstat::{ColumnSpec, DataType, MergeRule, Result, Segment, TableHandle};

fn schema() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::key("id", DataType::Unsigned, 8),
        ColumnSpec::new("count", DataType::Unsigned, 8, MergeRule::Sum),
    ]
}

#[test]
fn inode_address_round_trips() {
    use tmstat::inode::InodeAddr;

    assert!(InodeAddr::NULL.is_null());
    assert!(!InodeAddr::NULL.is_leaf());

    let leaf = InodeAddr::leaf(7);
    assert!(!leaf.is_null());
    assert!(leaf.is_leaf());
    assert_eq!(leaf.slab_index(), 7);

    let row = InodeAddr::row(12, 3);
    assert!(!row.is_leaf());
    assert_eq!(row.slab_index(), 12);
    assert_eq!(row.row_index(), 3);
}

#[test]
fn column_offsets_are_packed_without_gaps() -> Result<()> {
    let segment = Segment::create_in_memory()?;
    let table = TableHandle::register(&segment, "packed", false, &schema())?;
    let columns = table.columns();
    let mut expected_offset = 0u16;
    for col in &columns {
        assert_eq!(col.offset, expected_offset);
        expected_offset += col.size;
    }
    assert_eq!(expected_offset, table.row_size());
    Ok(())
}

#[test]
fn row_count_matches_live_rows_after_inserts_and_removals() -> Result<()> {
    let segment = Segment::create_in_memory()?;
    let table = TableHandle::register(&segment, "counted", false, &schema())?;

    let mut handles = Vec::new();
    for i in 0..20u64 {
        let mut row = table.insert()?;
        row.set_u64("id", i)?;
        row.set_u64("count", 1)?;
        handles.push(row);
    }
    assert_eq!(table.row_count(), 20);
    assert_eq!(tmstat::query::scan(&table)?.len(), 20);

    for row in handles.drain(..10) {
        table.remove(row)?;
    }
    assert_eq!(table.row_count(), 10);
    assert_eq!(tmstat::query::scan(&table)?.len(), 10);
    Ok(())
}

#[test]
fn freed_row_slot_is_reused_before_a_new_slab_is_allocated() -> Result<()> {
    let segment = Segment::create_in_memory()?;
    let table = TableHandle::register(&segment, "reuse", false, &schema())?;

    let mut row = table.insert()?;
    row.set_u64("id", 1)?;
    table.remove(row)?;
    assert_eq!(table.row_count(), 0);

    let mut row = table.insert()?;
    row.set_u64("id", 2)?;
    row.preserve();
    drop(row);
    assert_eq!(table.row_count(), 1);

    // Only one slab should ever have been needed for a single live row
    // at a time.
    let inner = segment.inner().lock().unwrap();
    assert_eq!(inner.slabs.len(), 2); // .table's own slab plus this table's one slab
    Ok(())
}

#[test]
fn slab_reuse_survives_a_full_drop_and_refill() -> Result<()> {
    let segment = Segment::create_in_memory()?;
    let table = TableHandle::register(&segment, "churn", false, &schema())?;

    for i in 0..100u64 {
        let mut row = table.insert()?;
        row.set_u64("id", i)?;
        row.set_u64("count", 1)?;
        row.preserve();
        drop(row);
    }
    assert_eq!(table.row_count(), 100);
    let slabs_after_first_pass = segment.inner().lock().unwrap().slabs.len();

    for i in 0..100u64 {
        let mut key = table.pseudo_row();
        key.set_u64("id", i)?;
        let (found, _) = tmstat::query::find_by_key(&table, &key)?;
        table.remove(found.expect("row inserted above should still be there"))?;
    }
    assert_eq!(table.row_count(), 0);

    for i in 100..200u64 {
        let mut row = table.insert()?;
        row.set_u64("id", i)?;
        row.set_u64("count", 1)?;
        row.preserve();
        drop(row);
    }
    assert_eq!(table.row_count(), 100);

    let inner = segment.inner().lock().unwrap();
    assert_eq!(
        inner.slabs.len(),
        slabs_after_first_pass,
        "second pass should reuse the slabs freed by the first, not allocate new ones"
    );
    for slab_index in tmstat::inode::table_slabs(&inner, table.table_id())? {
        let header = inner.validated_header(slab_index, table.table_id())?;
        assert_eq!(header.lines_per_row, tmstat::wire::lines_per_row(table.row_size()));
    }
    Ok(())
}

#[test]
fn outstanding_handles_block_subscriber_refresh() -> Result<()> {
    let private = tempfile::tempdir().unwrap();
    let published = tempfile::tempdir().unwrap();
    let config = tmstat::StoreConfig::single(private.path(), published.path());

    let mut store = tmstat::Store::create(&config, "gated")?;
    let table = store.register_table("t", false, &schema())?;
    let mut row = table.insert()?;
    row.set_u64("id", 1)?;
    row.set_u64("count", 1)?;
    row.preserve();
    drop(row);
    let path = store.publish()?;

    let reader = Segment::open_subscriber(&path)?;
    let reader_table = TableHandle::open(&reader, "t")?;
    let held = tmstat::query::scan(&reader_table)?;
    assert_eq!(held.len(), 1);

    let mut row = table.insert()?;
    row.set_u64("id", 2)?;
    row.set_u64("count", 1)?;
    row.preserve();
    drop(row);

    // A reader still holding weak row handles must not be refreshed
    // out from under itself.
    assert!(!reader.refresh()?);

    drop(held);
    assert!(reader.refresh()?);
    Ok(())
}

#[test]
fn merge_rules_apply_independently_per_column() -> Result<()> {
    let columns = vec![
        ColumnSpec::key("id", DataType::Unsigned, 8),
        ColumnSpec::new("total", DataType::Unsigned, 8, MergeRule::Sum),
        ColumnSpec::new("lowest", DataType::Signed, 8, MergeRule::Min),
        ColumnSpec::new("highest", DataType::Signed, 8, MergeRule::Max),
        ColumnSpec::new("seen", DataType::Hex, 8, MergeRule::Or),
    ];

    let seg_a = Segment::create_in_memory()?;
    let table_a = TableHandle::register(&seg_a, "t", false, &columns)?;
    let mut row = table_a.insert()?;
    row.set_u64("id", 1)?;
    row.set_u64("total", 10)?;
    row.set_i64("lowest", 5)?;
    row.set_i64("highest", 5)?;
    row.set_u64("seen", 0b0001)?;
    row.preserve();
    drop(row);

    let seg_b = Segment::create_in_memory()?;
    let table_b = TableHandle::register(&seg_b, "t", false, &columns)?;
    let mut row = table_b.insert()?;
    row.set_u64("id", 1)?;
    row.set_u64("total", 7)?;
    row.set_i64("lowest", -3)?;
    row.set_i64("highest", 9)?;
    row.set_u64("seen", 0b0110)?;
    row.preserve();
    drop(row);

    let dest = Segment::create_in_memory()?;
    let merged = tmstat::merge::merge_to_file(&[table_a, table_b], &dest, "t", &columns)?;
    let rows = tmstat::query::scan(&merged)?;
    assert_eq!(rows.len(), 1);
    let row = &rows[0];
    assert_eq!(row.get_u64("total")?, 17);
    assert_eq!(row.get_i64("lowest")?, -3);
    assert_eq!(row.get_i64("highest")?, 9);
    assert_eq!(row.get_u64("seen")?, 0b0111);
    Ok(())
}

#[test]
fn min_max_on_non_numeric_columns_compares_bytes_not_integers() -> Result<()> {
    let columns = vec![
        ColumnSpec::key("id", DataType::Unsigned, 8),
        ColumnSpec::new("earliest", DataType::Text, 8, MergeRule::Min),
        ColumnSpec::new("latest", DataType::Text, 8, MergeRule::Max),
    ];

    let seg_a = Segment::create_in_memory()?;
    let table_a = TableHandle::register(&seg_a, "t", false, &columns)?;
    let mut row = table_a.insert()?;
    row.set_u64("id", 1)?;
    row.set_text("earliest", "bravo")?;
    row.set_text("latest", "bravo")?;
    row.preserve();
    drop(row);

    let seg_b = Segment::create_in_memory()?;
    let table_b = TableHandle::register(&seg_b, "t", false, &columns)?;
    let mut row = table_b.insert()?;
    row.set_u64("id", 1)?;
    row.set_text("earliest", "alpha")?;
    row.set_text("latest", "charlie")?;
    row.preserve();
    drop(row);

    let dest = Segment::create_in_memory()?;
    let merged = tmstat::merge::merge_to_file(&[table_a, table_b], &dest, "t", &columns)?;
    let rows = tmstat::query::scan(&merged)?;
    assert_eq!(rows.len(), 1);
    // A little-endian integer read of "alpha\0\0\0" vs "bravo\0\0\0" would
    // pick whichever happens to have the larger low byte; a byte compare
    // picks lexicographically, which is what text columns need.
    assert_eq!(rows[0].get_text("earliest")?, "alpha");
    assert_eq!(rows[0].get_text("latest")?, "charlie");
    Ok(())
}

#[test]
fn linear_scan_and_binary_search_agree_on_sorted_tables() -> Result<()> {
    let seg_a = Segment::create_in_memory()?;
    let table_a = TableHandle::register(&seg_a, "src", false, &schema())?;
    for i in (0..30u64).rev() {
        let mut row = table_a.insert()?;
        row.set_u64("id", i)?;
        row.set_u64("count", 1)?;
        row.preserve();
        drop(row);
    }

    let dest = Segment::create_in_memory()?;
    let merged = tmstat::merge::merge_to_file(&[table_a], &dest, "sorted", &schema())?;
    assert!(merged.is_sorted());

    for i in 0..30u64 {
        let mut key = merged.pseudo_row();
        key.set_u64("id", i)?;
        let (found, plan) = tmstat::query::find_by_key(&merged, &key)?;
        assert_eq!(plan, tmstat::QueryPlan::BinarySearch);
        assert_eq!(found.unwrap().get_u64("id")?, i);
    }

    let mut missing_key = merged.pseudo_row();
    missing_key.set_u64("id", 999)?;
    let (found, _) = tmstat::query::find_by_key(&merged, &missing_key)?;
    assert!(found.is_none());
    Ok(())
}
