//! End-to-end scenarios: a single process writing and reading its own
//! store, a publish/subscribe handoff, and a multi-segment merge.

use tempfile::tempdir;

use tmstat::{ColumnSpec, DataType, MergeRule, Result, Segment, StoreConfig, TableHandle};

fn counters_columns() -> Vec<ColumnSpec> {
    vec![
        ColumnSpec::key("host", DataType::Text, 16),
        ColumnSpec::new("requests", DataType::Unsigned, 8, MergeRule::Sum),
        ColumnSpec::new("errors", DataType::Unsigned, 8, MergeRule::Sum),
        ColumnSpec::new("flags", DataType::Hex, 4, MergeRule::Or),
    ]
}

fn fill_row(row: &mut tmstat::RowHandle, host: &str, requests: u64, errors: u64, flags: u64) -> Result<()> {
    row.set_text("host", host)?;
    row.set_u64("requests", requests)?;
    row.set_u64("errors", errors)?;
    row.set_u64("flags", flags)?;
    row.preserve();
    Ok(())
}

#[test]
fn insert_and_read_back_in_memory() -> Result<()> {
    let segment = Segment::create_in_memory()?;
    let table = TableHandle::register(&segment, "counters", false, &counters_columns())?;

    let mut row = table.insert()?;
    fill_row(&mut row, "web-1", 100, 2, 0b01)?;
    drop(row);

    assert_eq!(table.row_count(), 1);
    let rows = tmstat::query::scan(&table)?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_text("host")?, "web-1");
    assert_eq!(rows[0].get_u64("requests")?, 100);
    Ok(())
}

#[test]
fn removed_row_does_not_reappear() -> Result<()> {
    let segment = Segment::create_in_memory()?;
    let table = TableHandle::register(&segment, "counters", false, &counters_columns())?;

    let mut row = table.insert()?;
    fill_row(&mut row, "web-1", 1, 0, 0)?;
    drop(row);
    assert_eq!(table.row_count(), 1);

    let (found, _) = tmstat::query::find_by_key(&table, &{
        let mut key = table.pseudo_row();
        key.set_text("host", "web-1")?;
        key
    })?;
    let found = found.expect("row should be found before removal");
    table.remove(found)?;
    assert_eq!(table.row_count(), 0);
    assert!(tmstat::query::scan(&table)?.is_empty());
    Ok(())
}

#[test]
fn publish_then_subscribe_sees_rows() -> Result<()> {
    let private = tempdir().unwrap();
    let published = tempdir().unwrap();
    let config = StoreConfig::single(private.path(), published.path());

    let mut store = tmstat::Store::create(&config, "hostcounters")?;
    let table = store.register_table("counters", false, &counters_columns())?;
    let mut row = table.insert()?;
    fill_row(&mut row, "db-1", 7, 1, 0)?;
    drop(row);

    let published_path = store.publish()?;
    assert!(published_path.exists());

    let reader = Segment::open_subscriber(&published_path)?;
    let reader_table = TableHandle::open(&reader, "counters")?;
    let rows = tmstat::query::scan(&reader_table)?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_text("host")?, "db-1");
    assert_eq!(rows[0].get_u64("requests")?, 7);
    Ok(())
}

#[test]
fn subscriber_refresh_picks_up_growth() -> Result<()> {
    let private = tempdir().unwrap();
    let published = tempdir().unwrap();
    let config = StoreConfig::single(private.path(), published.path());

    let mut store = tmstat::Store::create(&config, "growing")?;
    let table = store.register_table("counters", false, &counters_columns())?;
    let mut row = table.insert()?;
    fill_row(&mut row, "a", 1, 0, 0)?;
    drop(row);
    let path = store.publish()?;

    let reader = Segment::open_subscriber(&path)?;
    let reader_table = TableHandle::open(&reader, "counters")?;
    assert_eq!(reader_table.row_count(), 1);

    // The publisher's file descriptor survived the rename, so rows
    // inserted after publish still land in the now-published file.
    let mut row = table.insert()?;
    fill_row(&mut row, "b", 2, 0, 0)?;
    drop(row);

    assert!(reader.refresh()?);
    assert_eq!(reader_table.row_count(), 2);
    Ok(())
}

#[test]
fn merge_two_segments_sums_counters() -> Result<()> {
    let seg_a = Segment::create_in_memory()?;
    let table_a = TableHandle::register(&seg_a, "counters", false, &counters_columns())?;
    let mut row = table_a.insert()?;
    fill_row(&mut row, "web-1", 10, 1, 0b01)?;
    drop(row);

    let seg_b = Segment::create_in_memory()?;
    let table_b = TableHandle::register(&seg_b, "counters", false, &counters_columns())?;
    let mut row = table_b.insert()?;
    fill_row(&mut row, "web-1", 5, 2, 0b10)?;
    drop(row);
    let mut row = table_b.insert()?;
    fill_row(&mut row, "web-2", 3, 0, 0)?;
    drop(row);

    let dest = Segment::create_in_memory()?;
    let merged = tmstat::merge::merge_to_file(&[table_a, table_b], &dest, "merged", &counters_columns())?;

    assert_eq!(merged.row_count(), 2);
    let rows = tmstat::query::scan(&merged)?;
    let web1 = rows.iter().find(|r| r.get_text("host").unwrap() == "web-1").unwrap();
    assert_eq!(web1.get_u64("requests")?, 15);
    assert_eq!(web1.get_u64("errors")?, 3);
    assert_eq!(web1.get_u64("flags")?, 0b11);
    Ok(())
}

#[test]
fn sorted_table_uses_binary_search() -> Result<()> {
    let dest = Segment::create_in_memory()?;
    let seg_a = Segment::create_in_memory()?;
    let table_a = TableHandle::register(&seg_a, "counters", false, &counters_columns())?;
    for (host, n) in [("a", 1u64), ("b", 2), ("c", 3)] {
        let mut row = table_a.insert()?;
        fill_row(&mut row, host, n, 0, 0)?;
        drop(row);
    }

    let merged = tmstat::merge::merge_to_file(&[table_a], &dest, "sorted_counters", &counters_columns())?;
    assert!(merged.is_sorted());

    let mut key = merged.pseudo_row();
    key.set_text("host", "b")?;
    let (found, plan) = tmstat::query::find_by_key(&merged, &key)?;
    assert_eq!(plan, tmstat::QueryPlan::BinarySearch);
    assert_eq!(found.unwrap().get_u64("requests")?, 2);
    Ok(())
}

#[test]
fn bad_file_in_published_dir_is_skipped_not_fatal() -> Result<()> {
    let private = tempdir().unwrap();
    let published = tempdir().unwrap();
    let config = StoreConfig::single(private.path(), published.path());

    let mut store = tmstat::Store::create(&config, "healthy")?;
    let table = store.register_table("counters", false, &counters_columns())?;
    let mut row = table.insert()?;
    fill_row(&mut row, "web-1", 1, 0, 0)?;
    drop(row);
    store.publish()?;

    std::fs::write(published.path().join("garbage"), b"not a segment").unwrap();

    let subscriber = tmstat::Subscriber::new(config);
    let tables = subscriber.tables_named("counters")?;
    assert_eq!(tables.len(), 1);
    let rows = tmstat::query::scan(&tables[0])?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get_text("host")?, "web-1");
    Ok(())
}

#[test]
fn union_merges_two_published_segments_and_refreshes_on_growth() -> Result<()> {
    let private_a = tempdir().unwrap();
    let private_b = tempdir().unwrap();
    let published = tempdir().unwrap();
    let config_a = StoreConfig::single(private_a.path(), published.path());
    let config_b = StoreConfig::single(private_b.path(), published.path());

    let mut store_a = tmstat::Store::create(&config_a, "node-a")?;
    let table_a = store_a.register_table("counters", false, &counters_columns())?;
    let mut row = table_a.insert()?;
    fill_row(&mut row, "web-1", 10, 1, 0b01)?;
    drop(row);
    store_a.publish()?;

    let mut store_b = tmstat::Store::create(&config_b, "node-b")?;
    let table_b = store_b.register_table("counters", false, &counters_columns())?;
    let mut row = table_b.insert()?;
    fill_row(&mut row, "web-1", 5, 2, 0b10)?;
    drop(row);
    let mut row = table_b.insert()?;
    fill_row(&mut row, "web-2", 3, 0, 0)?;
    drop(row);
    store_b.publish()?;

    let union_config = StoreConfig::single(tempdir().unwrap().path(), published.path());
    let union = tmstat::Union::open(union_config)?;
    assert_eq!(union.generation(), 1);
    assert!(union.table_names()?.contains("counters"));

    let rows = union.query("counters", &[])?;
    assert_eq!(rows.len(), 2);
    let web1 = rows.iter().find(|r| r.get_text("host").unwrap() == "web-1").unwrap();
    assert_eq!(web1.get_u64("requests")?, 15);
    assert_eq!(web1.get_u64("errors")?, 3);
    assert_eq!(web1.get_u64("flags")?, 0b11);

    // No new published file, no outstanding handles: a second refresh
    // finds the directory's ctime unchanged and leaves the generation
    // alone.
    drop(rows);
    assert!(!union.refresh()?);
    assert_eq!(union.generation(), 1);

    let mut store_c = tmstat::Store::create(&StoreConfig::single(tempdir().unwrap().path(), published.path()), "node-c")?;
    let table_c = store_c.register_table("counters", false, &counters_columns())?;
    let mut row = table_c.insert()?;
    fill_row(&mut row, "web-3", 1, 0, 0)?;
    drop(row);
    store_c.publish()?;

    assert!(union.force_refresh()?);
    assert_eq!(union.generation(), 2);
    let rows = union.query("counters", &[])?;
    assert_eq!(rows.len(), 3);
    Ok(())
}

#[test]
fn labels_are_scoped_by_tree_prefix() -> Result<()> {
    let segment = Segment::create_in_memory()?;
    tmstat::label::create_label(&segment, "startup", 1)?;
    tmstat::label::create_label(&segment, "shutdown", 1)?;
    tmstat::label::create_label(&segment, "unrelated", 2)?;

    let labels = tmstat::label::list_labels(&segment, 1)?;
    assert_eq!(labels.len(), 2);
    assert_eq!(labels[0].name, "startup");
    assert_eq!(labels[1].name, "shutdown");
    Ok(())
}
