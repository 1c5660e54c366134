use anyhow::Result;
use basalt::{
    sym, AggOp, Frame, FrameBound, FrameType, Graph, JoinType, TypeTag, Value, WindowFunc,
};

fn trades() -> Result<Value> {
    let tickers: Vec<i64> = ["ibm", "msft", "ibm", "aapl", "msft", "ibm"]
        .iter()
        .map(|s| sym::intern_str(s))
        .collect::<basalt::Result<_>>()?;
    Ok(Value::table_from(
        &["ticker", "qty", "price"],
        vec![
            Value::sym_vec_from(&tickers)?,
            Value::i64_vec(&[100, 200, 300, 400, 500, 600])?,
            Value::f64_vec(&[10.0, 20.0, 11.0, 30.0, 21.0, 12.0])?,
        ],
    )?)
}

#[test]
fn sort_orders_rows_and_is_stable() -> Result<()> {
    let t = trades()?;
    let mut g = Graph::new(&t)?;
    let tbl = g.const_table(t.clone())?;
    let ticker = g.scan("ticker")?;
    let qty = g.scan("qty")?;
    let sorted = g.sort(tbl, &[ticker, qty], &[false, true], &[false, false])?;
    let root = g.optimize(sorted)?;
    let out = g.execute(root)?;
    assert_eq!(out.nrows(), 6);
    let tk = out.col("ticker").unwrap();
    let q = out.col("qty").unwrap();
    // aapl first, then ibm by qty descending, then msft.
    assert_eq!(sym::str_of(tk.get_i64(0)?)?, "aapl");
    assert_eq!(sym::str_of(tk.get_i64(1)?)?, "ibm");
    assert_eq!(q.get_i64(1)?, 600);
    assert_eq!(q.get_i64(3)?, 100);
    assert_eq!(sym::str_of(tk.get_i64(4)?)?, "msft");
    Ok(())
}

#[test]
fn sort_with_equal_keys_preserves_input_order() -> Result<()> {
    let t = Value::table_from(
        &["k", "seq"],
        vec![
            Value::i64_vec(&[7, 7, 7, 7, 7])?,
            Value::i64_vec(&[0, 1, 2, 3, 4])?,
        ],
    )?;
    let mut g = Graph::new(&t)?;
    let tbl = g.const_table(t.clone())?;
    let k = g.scan("k")?;
    let sorted = g.sort(tbl, &[k], &[false], &[false])?;
    let out = g.execute(sorted)?;
    let seq = out.col("seq").unwrap();
    for i in 0..5 {
        assert_eq!(seq.get_i64(i)?, i);
    }
    Ok(())
}

#[test]
fn inner_join_through_the_graph() -> Result<()> {
    let orders = Value::table_from(
        &["id", "qty"],
        vec![Value::i64_vec(&[1, 2, 3])?, Value::i64_vec(&[10, 20, 30])?],
    )?;
    let prices = Value::table_from(
        &["id", "px"],
        vec![Value::i64_vec(&[2, 3, 4])?, Value::f64_vec(&[2.0, 3.0, 4.0])?],
    )?;
    let mut g = Graph::new(&orders)?;
    let left = g.const_table(orders.clone())?;
    let right = g.const_table(prices.clone())?;
    let key = g.scan("id")?;
    let joined = g.join(left, &[key], right, &[key], JoinType::Inner)?;
    let root = g.optimize(joined)?;
    let out = g.execute(root)?;
    assert_eq!(out.nrows(), 2);
    assert_eq!(out.ncols(), 3);
    assert!(out.col("px").is_some());
    Ok(())
}

#[test]
fn window_rank_and_running_sum() -> Result<()> {
    let t = trades()?;
    let mut g = Graph::new(&t)?;
    let tbl = g.const_table(t.clone())?;
    let ticker = g.scan("ticker")?;
    let qty = g.scan("qty")?;
    let win = g.window(
        tbl,
        &[ticker],
        &[qty],
        &[false],
        &[
            (WindowFunc::RowNumber, None),
            (WindowFunc::Sum, Some(qty)),
        ],
        Frame {
            ty: FrameType::Rows,
            start: FrameBound::UnboundedPreceding,
            end: FrameBound::CurrentRow,
        },
    )?;
    let root = g.optimize(win)?;
    let out = g.execute(root)?;
    assert_eq!(out.nrows(), 6);

    let tk = out.col("ticker").unwrap();
    let rn = out.col("row_number_0").unwrap();
    let run = out.col("sum_1").unwrap();
    // ibm rows are 100, 300, 600 in qty order; the running sum ends at 1000.
    for i in 0..6 {
        if sym::str_of(tk.get_i64(i)?)? == "ibm" && rn.get_i64(i)? == 3 {
            assert_eq!(run.get_i64(i)?, 1000);
        }
    }
    Ok(())
}

#[test]
fn window_lag_within_partition() -> Result<()> {
    let t = Value::table_from(
        &["grp", "x"],
        vec![
            Value::i64_vec(&[1, 1, 1, 2, 2])?,
            Value::i64_vec(&[10, 20, 30, 40, 50])?,
        ],
    )?;
    let mut g = Graph::new(&t)?;
    let tbl = g.const_table(t.clone())?;
    let grp = g.scan("grp")?;
    let x = g.scan("x")?;
    let win = g.window(
        tbl,
        &[grp],
        &[x],
        &[false],
        &[(WindowFunc::Lag(1), Some(x))],
        Frame::default(),
    )?;
    let out = g.execute(win)?;
    let lag = out.col("lag_0").unwrap();
    assert!(lag.is_null_at(0)?);
    assert_eq!(lag.get_i64(1)?, 10);
    assert_eq!(lag.get_i64(2)?, 20);
    assert!(lag.is_null_at(3)?);
    assert_eq!(lag.get_i64(4)?, 40);
    Ok(())
}

#[test]
fn window_ntile_and_value_functions() -> Result<()> {
    let t = Value::table_from(
        &["x"],
        vec![Value::i64_vec(&[5, 1, 4, 2, 3])?],
    )?;
    let mut g = Graph::new(&t)?;
    let tbl = g.const_table(t.clone())?;
    let x = g.scan("x")?;
    let win = g.window(
        tbl,
        &[],
        &[x],
        &[false],
        &[
            (WindowFunc::Ntile(2), None),
            (WindowFunc::FirstValue, Some(x)),
            (WindowFunc::LastValue, Some(x)),
        ],
        Frame {
            ty: FrameType::Rows,
            start: FrameBound::UnboundedPreceding,
            end: FrameBound::UnboundedFollowing,
        },
    )?;
    let out = g.execute(win)?;
    let nt = out.col("ntile_0").unwrap();
    let first = out.col("first_value_1").unwrap();
    let last = out.col("last_value_2").unwrap();
    // Ordered by x: 1,2,3 in bucket 1; 4,5 in bucket 2.
    let xc = out.col("x").unwrap();
    for i in 0..5 {
        let expect_bucket = if xc.get_i64(i)? <= 3 { 1 } else { 2 };
        assert_eq!(nt.get_i64(i)?, expect_bucket);
        assert_eq!(first.get_i64(i)?, 1);
        assert_eq!(last.get_i64(i)?, 5);
    }
    Ok(())
}

#[test]
fn window_range_frame_includes_peers() -> Result<()> {
    // Two rows tie on the order key; a RANGE frame ending at CURRENT ROW
    // includes both peers for both rows.
    let t = Value::table_from(
        &["k", "v"],
        vec![Value::i64_vec(&[1, 1, 2])?, Value::i64_vec(&[10, 20, 30])?],
    )?;
    let mut g = Graph::new(&t)?;
    let tbl = g.const_table(t.clone())?;
    let k = g.scan("k")?;
    let v = g.scan("v")?;
    let win = g.window(
        tbl,
        &[],
        &[k],
        &[false],
        &[(WindowFunc::Sum, Some(v))],
        Frame {
            ty: FrameType::Range,
            start: FrameBound::UnboundedPreceding,
            end: FrameBound::CurrentRow,
        },
    )?;
    let out = g.execute(win)?;
    let sums = out.col("sum_0").unwrap();
    let kc = out.col("k").unwrap();
    for i in 0..3 {
        let expect = if kc.get_i64(i)? == 1 { 30 } else { 60 };
        assert_eq!(sums.get_i64(i)?, expect);
    }
    Ok(())
}

#[test]
fn asof_join_takes_latest_quote_in_window() -> Result<()> {
    let s = |x: &str| sym::intern_str(x).unwrap();
    let trades = Value::table_from(
        &["sym", "time", "qty"],
        vec![
            Value::sym_vec_from(&[s("a"), s("a"), s("b")])?,
            Value::i64_vec(&[100, 200, 150])?,
            Value::i64_vec(&[1, 2, 3])?,
        ],
    )?;
    let quotes = Value::table_from(
        &["sym", "time", "px"],
        vec![
            Value::sym_vec_from(&[s("a"), s("a"), s("a"), s("b")])?,
            Value::i64_vec(&[90, 95, 190, 149])?,
            Value::f64_vec(&[1.0, 1.5, 2.5, 9.0])?,
        ],
    )?;
    let mut g = Graph::new(&trades)?;
    let left = g.const_table(trades.clone())?;
    let right = g.const_table(quotes.clone())?;
    let time = g.scan("time")?;
    let symk = g.scan("sym")?;
    let wj = g.window_join(left, right, time, symk, -100, 0, &[])?;
    let out = g.execute(wj)?;
    assert_eq!(out.nrows(), 3);
    let px = out.col("px").unwrap();
    // Trade at t=100 sees quotes at 90 and 95; the latest (1.5) wins.
    assert_eq!(px.get_f64(0)?, 1.5);
    // Trade at t=200 sees the quote at 190.
    assert_eq!(px.get_f64(1)?, 2.5);
    // Trade in "b" at t=150 sees the quote at 149.
    assert_eq!(px.get_f64(2)?, 9.0);
    Ok(())
}

#[test]
fn asof_join_with_aggregate_counts_matches() -> Result<()> {
    let s = |x: &str| sym::intern_str(x).unwrap();
    let trades = Value::table_from(
        &["sym", "time"],
        vec![
            Value::sym_vec_from(&[s("a")])?,
            Value::i64_vec(&[100])?,
        ],
    )?;
    let quotes = Value::table_from(
        &["sym", "time", "px"],
        vec![
            Value::sym_vec_from(&[s("a"), s("a"), s("a")])?,
            Value::i64_vec(&[90, 95, 101])?,
            Value::f64_vec(&[1.0, 2.0, 3.0])?,
        ],
    )?;
    let mut g = Graph::new(&trades)?;
    let left = g.const_table(trades.clone())?;
    let right = g.const_table(quotes.clone())?;
    let time = g.scan("time")?;
    let symk = g.scan("sym")?;
    let px = g.col_ref("px")?;
    let wj = g.window_join(left, right, time, symk, -10, 0, &[(AggOp::Avg, px)])?;
    let out = g.execute(wj)?;
    let avg = out.col("avg_px").unwrap();
    assert_eq!(avg.get_f64(0)?, 1.5);
    Ok(())
}

#[test]
fn distinct_returns_unique_keys() -> Result<()> {
    let t = Value::table_from(
        &["k"],
        vec![Value::i64_vec(&[3, 1, 3, 2, 1, 3])?],
    )?;
    let mut g = Graph::new(&t)?;
    let k = g.scan("k")?;
    let d = g.distinct(&[k])?;
    let root = g.optimize(d)?;
    let out = g.execute(root)?;
    assert_eq!(out.nrows(), 3);
    let kc = out.col("k").unwrap();
    let mut vals: Vec<i64> = (0..3).map(|i| kc.get_i64(i).unwrap()).collect();
    vals.sort_unstable();
    assert_eq!(vals, vec![1, 2, 3]);
    Ok(())
}

#[test]
fn project_builds_named_columns() -> Result<()> {
    let t = trades()?;
    let mut g = Graph::new(&t)?;
    let tbl = g.const_table(t.clone())?;
    let qty = g.scan("qty")?;
    let price = g.scan("price")?;
    let notional = g.mul(qty, price)?;
    let named = g.alias(notional, "notional")?;
    let proj = g.project(tbl, &[qty, named])?;
    let root = g.optimize(proj)?;
    let out = g.execute(root)?;
    assert_eq!(out.ncols(), 2);
    let n = out.col("notional").unwrap();
    assert_eq!(n.get_f64(0)?, 1000.0);
    Ok(())
}

#[test]
fn string_pipeline_upper_like_concat() -> Result<()> {
    let t = trades()?;
    let mut g = Graph::new(&t)?;
    let ticker = g.scan("ticker")?;
    let up = g.upper(ticker)?;
    let out = g.execute(up)?;
    assert_eq!(sym::str_of(out.get_i64(0)?)?, "IBM");

    let mut g2 = Graph::new(&t)?;
    let ticker2 = g2.scan("ticker")?;
    let pat = g2.const_str("m%")?;
    let like = g2.like(ticker2, pat)?;
    let hits = g2.execute(like)?;
    assert!(!hits.get_bool(0)?);
    assert!(hits.get_bool(1)?);
    Ok(())
}

#[test]
fn if_cast_and_isnull() -> Result<()> {
    let t = Value::table_from(
        &["x"],
        vec![{
            let mut v = Value::i64_vec(&[1, 2, 3])?;
            v.set_null(1, true)?;
            v
        }],
    )?;
    let mut g = Graph::new(&t)?;
    let x = g.scan("x")?;
    let isn = g.is_null(x)?;
    let out = g.execute(isn)?;
    assert!(!out.get_bool(0)?);
    assert!(out.get_bool(1)?);

    let mut g2 = Graph::new(&t)?;
    let x2 = g2.scan("x")?;
    let f = g2.cast(x2, TypeTag::F64)?;
    let casted = g2.execute(f)?;
    assert_eq!(casted.tag(), TypeTag::F64 as i8);
    assert_eq!(casted.get_f64(2)?, 3.0);
    assert!(casted.is_null_at(1)?);

    let mut g3 = Graph::new(&t)?;
    let x3 = g3.scan("x")?;
    let two = g3.const_i64(2)?;
    let cond = g3.gt(x3, two)?;
    let yes = g3.const_i64(1)?;
    let no = g3.const_i64(0)?;
    let pick = g3.if_(cond, yes, no)?;
    let picked = g3.execute(pick)?;
    assert_eq!(picked.get_i64(0)?, 0);
    assert!(picked.is_null_at(1)?);
    assert_eq!(picked.get_i64(2)?, 1);
    Ok(())
}

#[test]
fn min_max_first_last_reductions() -> Result<()> {
    let t = trades()?;
    let mut g = Graph::new(&t)?;
    let price = g.scan("price")?;
    let mn = g.min(price)?;
    let mx = g.max(price)?;
    let fst = g.first(price)?;
    let lst = g.last(price)?;
    assert_eq!(g.execute(mn)?.as_f64()?, 10.0);
    assert_eq!(g.execute(mx)?.as_f64()?, 30.0);
    assert_eq!(g.execute(fst)?.as_f64()?, 10.0);
    assert_eq!(g.execute(lst)?.as_f64()?, 12.0);
    Ok(())
}

#[test]
fn count_distinct_and_avg_through_graph() -> Result<()> {
    let t = trades()?;
    let mut g = Graph::new(&t)?;
    let ticker = g.scan("ticker")?;
    let cd = g.count_distinct(ticker)?;
    assert_eq!(g.execute(cd)?.as_i64()?, 3);

    let mut g2 = Graph::new(&t)?;
    let qty = g2.scan("qty")?;
    let avg = g2.avg(qty)?;
    assert_eq!(g2.execute(avg)?.as_f64()?, 350.0);
    Ok(())
}
