use std::io::Write;

use anyhow::Result;
use basalt::{sym, AggOp, CsvOptions, Graph, TypeTag, Value};

#[test]
fn csv_with_three_typed_columns() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("t.csv");
    std::fs::write(&path, "a,b,c\n1,2.5,foo\n2,3.5,bar\n")?;

    let t = basalt::read_csv(&path)?;
    assert_eq!(t.ncols(), 3);
    assert_eq!(t.nrows(), 2);

    let a = t.col("a").unwrap();
    assert_eq!(a.tag(), TypeTag::I64 as i8);
    assert_eq!(a.get_i64(0)?, 1);
    assert_eq!(a.get_i64(1)?, 2);

    let b = t.col("b").unwrap();
    assert_eq!(b.tag(), TypeTag::F64 as i8);
    assert_eq!(b.get_f64(0)?, 2.5);
    assert_eq!(b.get_f64(1)?, 3.5);

    let c = t.col("c").unwrap();
    assert_eq!(c.tag(), TypeTag::Sym as i8);
    assert_eq!(c.get_i64(0)?, sym::intern_str("foo")?);
    assert_eq!(c.get_i64(1)?, sym::intern_str("bar")?);
    Ok(())
}

#[test]
fn csv_round_trip_against_reference_writer() -> Result<()> {
    // Write a fixture with the csv crate, load it with the engine, and
    // compare cell by cell.
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("ref.csv");
    let mut w = csv::Writer::from_path(&path)?;
    w.write_record(["id", "price", "ticker"])?;
    for i in 0..500i64 {
        w.write_record(&[
            i.to_string(),
            format!("{}", i as f64 * 0.25),
            format!("s{}", i % 7),
        ])?;
    }
    w.flush()?;

    let t = basalt::read_csv(&path)?;
    assert_eq!(t.nrows(), 500);
    let id = t.col("id").unwrap();
    let price = t.col("price").unwrap();
    let ticker = t.col("ticker").unwrap();
    for i in 0..500i64 {
        assert_eq!(id.get_i64(i)?, i);
        assert_eq!(price.get_f64(i)?, i as f64 * 0.25);
        assert_eq!(sym::str_of(ticker.get_i64(i)?)?, format!("s{}", i % 7));
    }
    Ok(())
}

#[test]
fn csv_quoted_fields_and_crlf() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("q.csv");
    let mut f = std::fs::File::create(&path)?;
    write!(f, "name,note\r\n\"x\",\"say \"\"hi\"\"\"\r\n\"multi\nline\",plain\r\n")?;
    drop(f);

    let t = basalt::read_csv(&path)?;
    assert_eq!(t.nrows(), 2);
    let note = t.col("note").unwrap();
    assert_eq!(sym::str_of(note.get_i64(0)?)?, "say \"hi\"");
    let name = t.col("name").unwrap();
    assert_eq!(sym::str_of(name.get_i64(1)?)?, "multi\nline");
    Ok(())
}

#[test]
fn csv_write_then_read_back() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("out.csv");
    let t = Value::table_from(
        &["k", "x"],
        vec![Value::i64_vec(&[1, 2, 3])?, Value::f64_vec(&[0.5, 1.5, 2.5])?],
    )?;
    basalt::write_csv(&t, &path)?;
    let back = basalt::read_csv(&path)?;
    assert_eq!(back.nrows(), 3);
    assert_eq!(back.col("x").unwrap().get_f64(2)?, 2.5);
    Ok(())
}

#[test]
fn csv_tab_delimiter_autodetected() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("t.tsv");
    std::fs::write(&path, "a\tb\n1\t2\n3\t4\n")?;
    let t = basalt::read_csv(&path)?;
    assert_eq!(t.ncols(), 2);
    assert_eq!(t.col("b").unwrap().get_i64(1)?, 4);

    // Explicit delimiter override takes precedence.
    let t2 = basalt::read_csv_opts(
        &path,
        CsvOptions {
            delimiter: Some(b'\t'),
            header: Some(true),
            types: None,
        },
    )?;
    assert_eq!(t2.nrows(), 2);
    Ok(())
}

#[test]
fn parallel_csv_equals_serial() -> Result<()> {
    // Enough rows to cross the serial fallback and exercise the pool plus
    // the packed local-symbol rewrite.
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("big.csv");
    let mut body = String::from("n,s\n");
    for i in 0..20_000i64 {
        body.push_str(&format!("{i},tag{}\n", i % 13));
    }
    std::fs::write(&path, &body)?;

    let t = basalt::read_csv(&path)?;
    assert_eq!(t.nrows(), 20_000);
    let n = t.col("n").unwrap();
    let s = t.col("s").unwrap();
    for i in (0..20_000i64).step_by(997) {
        assert_eq!(n.get_i64(i)?, i);
        assert_eq!(sym::str_of(s.get_i64(i)?)?, format!("tag{}", i % 13));
    }
    Ok(())
}

#[test]
fn partitioned_database_round_trip() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let p0 = Value::table_from(
        &["id", "v"],
        vec![
            Value::i64_vec(&[0, 0, 1, 1, 2])?,
            Value::i64_vec(&[10, 20, 30, 40, 50])?,
        ],
    )?;
    let p1 = Value::table_from(
        &["id", "v"],
        vec![
            Value::i64_vec(&[0, 1, 1, 2, 2])?,
            Value::i64_vec(&[60, 70, 80, 90, 100])?,
        ],
    )?;
    basalt::io::part_save(dir.path(), "20240101", "t", &p0)?;
    basalt::io::part_save(dir.path(), "20240102", "t", &p1)?;

    let t = basalt::part_open(dir.path(), "t")?;
    assert_eq!(t.nrows(), 10);

    // Group by id, sum v across partitions.
    let mut g = Graph::new(&t)?;
    let id = g.scan("id")?;
    let v = g.scan("v")?;
    let grp = g.group(&[id], &[(AggOp::Sum, v)])?;
    let root = g.optimize(grp)?;
    let out = g.execute(root)?;
    let keys = out.col("id").unwrap();
    let sums = out.col("sum_v").unwrap();
    let mut found = std::collections::HashMap::new();
    for i in 0..out.nrows() {
        found.insert(keys.get_i64(i)?, sums.get_i64(i)?);
    }
    assert_eq!(found[&0], 90);
    assert_eq!(found[&1], 220);
    assert_eq!(found[&2], 240);
    Ok(())
}

#[test]
fn partition_counts_match_the_key_map() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let p0 = Value::table_from(&["v"], vec![Value::i64_vec(&[1, 2, 3])?])?;
    let p1 = Value::table_from(&["v"], vec![Value::i64_vec(&[4])?])?;
    basalt::io::part_save(dir.path(), "20240101", "t", &p0)?;
    basalt::io::part_save(dir.path(), "20240102", "t", &p1)?;
    let t = basalt::part_open(dir.path(), "t")?;

    // count per partition via group-by on the virtual key column.
    let mut g = Graph::new(&t)?;
    let part = g.scan("part")?;
    let v = g.scan("v")?;
    let grp = g.group(&[part], &[(AggOp::Count, v)])?;
    let root = g.optimize(grp)?;
    let out = g.execute(root)?;

    let map = t.col("part").unwrap();
    let counts = map.partition_map_counts()?;
    let keys = map.partition_map_keys()?;
    let gk = out.col("part").unwrap();
    let gc = out.col("count_v").unwrap();
    for i in 0..keys.len() {
        let key = keys.get_i64(i)?;
        let expect = counts.get_i64(i)?;
        let mut got = None;
        for j in 0..out.nrows() {
            if gk.get_i64(j)? == key {
                got = Some(gc.get_i64(j)?);
            }
        }
        assert_eq!(got, Some(expect));
    }
    Ok(())
}

#[test]
fn symbol_directory_survives_save_and_load() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("sym");
    let a = sym::intern_str("persisted_alpha")?;
    let b = sym::intern_str("persisted_beta")?;
    sym::save(&path)?;
    // Reloading into the same process must keep every id stable.
    sym::load(&path)?;
    assert_eq!(sym::intern_str("persisted_alpha")?, a);
    assert_eq!(sym::intern_str("persisted_beta")?, b);
    assert_eq!(sym::str_of(a)?, "persisted_alpha");
    Ok(())
}

#[test]
fn mem_stats_track_allocations() -> Result<()> {
    let before = basalt::mem_stats();
    let v = Value::i64_vec(&(0..10_000).collect::<Vec<_>>())?;
    let after = basalt::mem_stats();
    assert!(after.alloc_count > before.alloc_count);
    assert!(after.bytes_allocated >= before.bytes_allocated);
    drop(v);
    let freed = basalt::mem_stats();
    assert!(freed.free_count > before.free_count);
    Ok(())
}
