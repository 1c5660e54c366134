// Cancellation and pool lifecycle touch process-global state, so these
// tests live in their own binary and take a lock to run one at a time.

use std::sync::Mutex;

use anyhow::Result;
use basalt::{Graph, Value};

static SERIAL: Mutex<()> = Mutex::new(());

#[test]
fn execute_clears_a_stale_cancel_flag() -> Result<()> {
    let _guard = SERIAL.lock().unwrap();
    basalt::cancel();
    let t = Value::table_from(&["x"], vec![Value::i64_vec(&[1, 2, 3])?])?;
    let mut g = Graph::new(&t)?;
    let x = g.scan("x")?;
    let s = g.sum(x)?;
    // A cancel raised before the query starts is cleared at execute entry.
    assert_eq!(g.execute(s)?.as_i64()?, 6);
    Ok(())
}

#[test]
fn pool_init_and_destroy_cycle() -> Result<()> {
    let _guard = SERIAL.lock().unwrap();
    // The lifecycle is a 4-state CAS: a second init without a destroy is
    // refused; after destroy, init works again.
    if basalt::pool_init(2).is_ok() {
        assert!(basalt::pool_init(2).is_err());
        basalt::pool_destroy();
        basalt::pool_init(1).map_err(anyhow::Error::from)?;
        basalt::pool_destroy();
    } else {
        // The pool already exists (lazy init); destroying and
        // re-initializing must still work.
        basalt::pool_destroy();
        basalt::pool_init(2).map_err(anyhow::Error::from)?;
        basalt::pool_destroy();
    }
    Ok(())
}
