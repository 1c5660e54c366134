//! Window functions and the as-of join over a small trade/quote tape.
//!
//! ```sh
//! cargo run --example windowed_trades
//! ```

use basalt::{
    sym, Frame, FrameBound, FrameType, Graph, Result, Value, WindowFunc,
};

fn main() -> Result<()> {
    let s = |x: &str| sym::intern_str(x);
    let trades = Value::table_from(
        &["sym", "time", "qty"],
        vec![
            Value::sym_vec_from(&[s("ibm")?, s("ibm")?, s("msft")?, s("ibm")?, s("msft")?])?,
            Value::i64_vec(&[100, 140, 150, 210, 260])?,
            Value::i64_vec(&[50, 75, 30, 25, 60])?,
        ],
    )?;
    let quotes = Value::table_from(
        &["sym", "time", "bid"],
        vec![
            Value::sym_vec_from(&[s("ibm")?, s("msft")?, s("ibm")?, s("ibm")?, s("msft")?])?,
            Value::i64_vec(&[95, 120, 135, 205, 250])?,
            Value::f64_vec(&[101.5, 44.0, 101.75, 102.25, 44.5])?,
        ],
    )?;

    // Running volume and trade number per symbol.
    let mut g = Graph::new(&trades)?;
    let tbl = g.const_table(trades.clone())?;
    let symc = g.scan("sym")?;
    let time = g.scan("time")?;
    let qty = g.scan("qty")?;
    let win = g.window(
        tbl,
        &[symc],
        &[time],
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
    println!("running volume per symbol:");
    for i in 0..out.nrows() {
        println!(
            "  {:>4} t={:<4} qty={:<3} #{} cum={}",
            sym::str_of(out.col("sym").unwrap().get_i64(i)?)?,
            out.col("time").unwrap().get_i64(i)?,
            out.col("qty").unwrap().get_i64(i)?,
            out.col("row_number_0").unwrap().get_i64(i)?,
            out.col("sum_1").unwrap().get_i64(i)?,
        );
    }

    // Prevailing bid at each trade: as-of join within the last 60 ticks.
    let mut g2 = Graph::new(&trades)?;
    let left = g2.const_table(trades.clone())?;
    let right = g2.const_table(quotes.clone())?;
    let tkey = g2.scan("time")?;
    let skey = g2.scan("sym")?;
    let joined = g2.window_join(left, right, tkey, skey, -60, 0, &[])?;
    let out2 = g2.execute(joined)?;
    println!("trades with prevailing bids:");
    for i in 0..out2.nrows() {
        let bid = out2.col("bid").unwrap();
        let bid_s = if bid.is_null_at(i)? {
            "-".to_string()
        } else {
            format!("{:.2}", bid.get_f64(i)?)
        };
        println!(
            "  {:>4} t={:<4} bid={}",
            sym::str_of(out2.col("sym").unwrap().get_i64(i)?)?,
            out2.col("time").unwrap().get_i64(i)?,
            bid_s,
        );
    }
    Ok(())
}
