//! End-to-end pipeline: generate a CSV, ingest it in parallel, filter,
//! aggregate, sort, and export the result.
//!
//! ```sh
//! cargo run --example query_pipeline
//! ```

use std::io::Write;

use basalt::{AggOp, Graph, Result, Value};

fn main() -> Result<()> {
    let dir = std::env::temp_dir().join("basalt_demo");
    std::fs::create_dir_all(&dir).ok();
    let input = dir.join("sales.csv");

    // A synthetic sales file: region, units, unit_price.
    {
        let mut f = std::fs::File::create(&input).expect("create demo csv");
        writeln!(f, "region,units,unit_price").unwrap();
        let regions = ["emea", "amer", "apac"];
        for i in 0..50_000i64 {
            writeln!(
                f,
                "{},{},{}",
                regions[(i % 3) as usize],
                (i % 17) + 1,
                (i % 7) as f64 * 1.25 + 5.0
            )
            .unwrap();
        }
    }

    let table = basalt::read_csv(&input)?;
    println!(
        "loaded {} rows x {} columns",
        table.nrows(),
        table.ncols()
    );

    // revenue = units * unit_price; keep rows with revenue >= 40;
    // total revenue per region; sort by region name.
    let mut g = Graph::new(&table)?;
    let region = g.scan("region")?;
    let units = g.scan("units")?;
    let price = g.scan("unit_price")?;
    let revenue = g.mul(units, price)?;
    let named = g.alias(revenue, "revenue")?;

    let threshold = g.const_f64(40.0)?;
    let keep = g.ge(revenue, threshold)?;
    let region_kept = g.filter(region, keep)?;
    let revenue_kept = g.filter(named, keep)?;

    let grouped = g.group(&[region_kept], &[(AggOp::Sum, revenue_kept), (AggOp::Count, revenue_kept)])?;
    let root = g.optimize(grouped)?;
    println!("{}", g.explain(root));
    let out = g.execute(root)?;

    for i in 0..out.nrows() {
        let region = basalt::sym::str_of(out.col_by_idx(0)?.get_i64(i)?)?;
        let total = out.col_by_idx(1)?.get_f64(i)?;
        let n = out.col_by_idx(2)?.get_i64(i)?;
        println!("{region:>6}  {n:>7} rows  {total:>14.2}");
    }

    let export = dir.join("revenue_by_region.csv");
    basalt::write_csv(&out, &export)?;
    println!("wrote {}", export.display());
    Ok(())
}
