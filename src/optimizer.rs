//! Optimizer passes, run in a fixed order:
//!
//! 1. **Type inference** — post-order; any node still carrying `out_type
//!    == 0` gets the promotion of its inputs.
//! 2. **Constant folding** — post-order; nodes whose inputs are all CONST
//!    atoms are computed at plan time under IEEE 754 semantics. A
//!    constant-`true` FILTER degrades to MATERIALIZE, a constant-`false`
//!    one to an empty HEAD. Nodes owning structural ext data never fold.
//! 3. **Fusion** — comparison predicates feeding a FILTER (and used only
//!    there) are marked FUSED; the executor then runs compare-and-select
//!    as one morsel pass.
//! 4. **Dead-code elimination** — reverse reachability from the root,
//!    following input slots, ternary/variadic ext operands and all
//!    structural ext children; everything unreached is flagged DEAD.
//!
//! Traversals are iterative; the scratch stack starts in a fixed inline
//! buffer and spills to the heap only for large graphs.

use crate::error::Result;
// Folding computes with the very same scalar kernels the executor runs,
// so a folded subgraph and its runtime evaluation cannot drift apart.
use crate::exec::kernels::{fold_binary, fold_unary};
use crate::graph::{ExtData, Graph, OpFlags, OpId, Opcode};
use crate::types::TypeTag;
use crate::value::Value;

/// Inline capacity of traversal stacks; graphs bigger than this spill.
const SCRATCH_INLINE: usize = 64;

/// A stack of node ids with a fixed inline buffer and heap fallback.
struct Scratch {
    inline: [OpId; SCRATCH_INLINE],
    len: usize,
    spill: Vec<OpId>,
}

impl Scratch {
    fn new() -> Scratch {
        Scratch {
            inline: [OpId::NONE; SCRATCH_INLINE],
            len: 0,
            spill: Vec::new(),
        }
    }

    fn push(&mut self, id: OpId) {
        if self.len < SCRATCH_INLINE {
            self.inline[self.len] = id;
            self.len += 1;
        } else {
            self.spill.push(id);
        }
    }

    fn pop(&mut self) -> Option<OpId> {
        if let Some(id) = self.spill.pop() {
            return Some(id);
        }
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(self.inline[self.len])
    }
}

/// Run every pass over the graph rooted at `root`.
pub(crate) fn optimize(g: &mut Graph, root: OpId) -> Result<OpId> {
    infer_types(g, root);
    fold_constants(g, root)?;
    fuse(g, root);
    eliminate_dead(g, root);
    Ok(root)
}

/// Children of a node that the traversals must follow: the two input
/// slots plus every node id referenced from ext data.
fn for_each_child(g: &Graph, id: OpId, mut f: impl FnMut(OpId)) {
    let node = g.node(id);
    for slot in node.inputs {
        if slot != OpId::NONE {
            f(slot);
        }
    }
    match g.ext_of(id) {
        Some(ExtData::Ternary(c)) => f(*c),
        Some(ExtData::Concat(args)) => args.iter().copied().for_each(&mut f),
        Some(ExtData::Group { keys, aggs }) => {
            keys.iter().copied().for_each(&mut f);
            aggs.iter().for_each(|(_, a)| f(*a));
        }
        Some(ExtData::Sort { keys, .. }) => keys.iter().copied().for_each(&mut f),
        Some(ExtData::Join {
            left_keys,
            right_keys,
            ..
        }) => {
            left_keys.iter().copied().for_each(&mut f);
            right_keys.iter().copied().for_each(&mut f);
        }
        Some(ExtData::Window {
            part, order, funcs, ..
        }) => {
            part.iter().copied().for_each(&mut f);
            order.iter().copied().for_each(&mut f);
            funcs.iter().filter_map(|(_, i)| *i).for_each(&mut f);
        }
        Some(ExtData::AsOf {
            time, sym, aggs, ..
        }) => {
            f(*time);
            f(*sym);
            aggs.iter().for_each(|(_, a)| f(*a));
        }
        Some(ExtData::Cols(cols)) => cols.iter().copied().for_each(&mut f),
        _ => {}
    }
}

/// Reachable node ids in post order (children before parents).
fn post_order(g: &Graph, root: OpId) -> Vec<OpId> {
    let mut order = Vec::new();
    let mut visited = vec![false; g.len()];
    let mut emitted = vec![false; g.len()];
    let mut stack = Scratch::new();
    stack.push(root);
    while let Some(id) = stack.pop() {
        if emitted[id.idx()] {
            continue;
        }
        if visited[id.idx()] {
            emitted[id.idx()] = true;
            order.push(id);
            continue;
        }
        visited[id.idx()] = true;
        stack.push(id);
        for_each_child(g, id, |c| {
            if !visited[c.idx()] {
                stack.push(c);
            }
        });
    }
    order
}

// ----- pass 1: type inference -----

fn infer_types(g: &mut Graph, root: OpId) {
    for id in post_order(g, root) {
        if g.node(id).out_type != 0 {
            continue;
        }
        let node = g.node(id).clone();
        let mut out: Option<TypeTag> = None;
        let mut all_atoms = true;
        for slot in node.inputs {
            if slot == OpId::NONE {
                continue;
            }
            let t = g.node(slot).out_type;
            if t == 0 {
                continue;
            }
            all_atoms &= t < 0;
            let base = TypeTag::try_from(t.abs()).ok();
            out = match (out, base) {
                (None, b) => b,
                (Some(a), Some(b)) => crate::types::promote(a, b).ok().or(Some(a)),
                (o, None) => o,
            };
        }
        if let Some(t) = out {
            let sign = if all_atoms { -1 } else { 1 };
            g.node_mut(id).out_type = t as i8 * sign;
        }
    }
}

// ----- pass 2: constant folding -----

fn const_atom(g: &Graph, id: OpId) -> Option<&Value> {
    if g.node(id).opcode != Opcode::Const {
        return None;
    }
    match g.ext_of(id) {
        Some(ExtData::Const(v)) if v.is_atom() => Some(v),
        _ => None,
    }
}

/// Replace a node in place with a CONST atom literal.
fn rewrite_const(g: &mut Graph, id: OpId, v: Value) {
    let node = g.node_mut(id);
    node.opcode = Opcode::Const;
    node.arity = 0;
    node.inputs = [OpId::NONE; 2];
    node.est_rows = 1;
    node.out_type = v.tag();
    g.ext[id.idx()] = Some(ExtData::Const(v));
}

fn fold_constants(g: &mut Graph, root: OpId) -> Result<()> {
    for id in post_order(g, root) {
        let node = g.node(id).clone();
        match node.opcode {
            // Unary math over a constant atom.
            Opcode::Neg
            | Opcode::Abs
            | Opcode::Not
            | Opcode::Sqrt
            | Opcode::Log
            | Opcode::Exp
            | Opcode::Ceil
            | Opcode::Floor => {
                let Some(a) = const_atom(g, node.inputs[0]) else {
                    continue;
                };
                let folded = fold_unary(node.opcode, a, node.out_type)?;
                rewrite_const(g, id, folded);
            }
            // Binary arithmetic / comparison over constant atoms.
            Opcode::Add
            | Opcode::Sub
            | Opcode::Mul
            | Opcode::Div
            | Opcode::Mod
            | Opcode::Eq
            | Opcode::Ne
            | Opcode::Lt
            | Opcode::Le
            | Opcode::Gt
            | Opcode::Ge
            | Opcode::And
            | Opcode::Or
            | Opcode::Min2
            | Opcode::Max2 => {
                let (Some(a), Some(b)) =
                    (const_atom(g, node.inputs[0]), const_atom(g, node.inputs[1]))
                else {
                    continue;
                };
                let folded = fold_binary(node.opcode, a, b, node.out_type)?;
                rewrite_const(g, id, folded);
            }
            // IF over three constant atoms picks a branch.
            Opcode::If => {
                let Some(ExtData::Ternary(else_id)) = g.ext_of(id).cloned() else {
                    continue;
                };
                let (Some(c), Some(t), Some(e)) = (
                    const_atom(g, node.inputs[0]),
                    const_atom(g, node.inputs[1]),
                    const_atom(g, else_id),
                ) else {
                    continue;
                };
                let pick = if c.as_i64()? != 0 { t.clone() } else { e.clone() };
                rewrite_const(g, id, pick);
            }
            // Constant predicates collapse the FILTER itself.
            Opcode::Filter => {
                let Some(pred) = const_atom(g, node.inputs[1]) else {
                    continue;
                };
                let always = pred.as_i64()? != 0;
                let node = g.node_mut(id);
                if always {
                    node.opcode = Opcode::Materialize;
                    node.arity = 1;
                    node.inputs[1] = OpId::NONE;
                    g.ext[id.idx()] = None;
                } else {
                    node.opcode = Opcode::Head;
                    node.arity = 1;
                    node.inputs[1] = OpId::NONE;
                    node.est_rows = 0;
                    g.ext[id.idx()] = Some(ExtData::Count(0));
                }
            }
            _ => {}
        }
    }
    Ok(())
}

// ----- pass 3: fusion -----

fn fuse(g: &mut Graph, root: OpId) {
    // Use counts over the reachable subgraph: a predicate may only fuse
    // into a FILTER if nothing else consumes it.
    let reachable = post_order(g, root);
    let mut uses = vec![0u32; g.len()];
    for &id in &reachable {
        for_each_child(g, id, |c| uses[c.idx()] += 1);
    }
    for &id in &reachable {
        if g.node(id).opcode != Opcode::Filter {
            continue;
        }
        let pred = g.node(id).inputs[1];
        if pred == OpId::NONE || uses[pred.idx()] != 1 {
            continue;
        }
        let p = g.node(pred);
        if !p.opcode.fuseable() {
            continue;
        }
        // Fuse only when both comparison operands are plain sources; the
        // filter kernel then evaluates scan-compare-select in one pass.
        let cheap = p.inputs.iter().all(|&i| {
            i == OpId::NONE
                || matches!(g.node(i).opcode, Opcode::Scan | Opcode::Const)
        });
        if cheap {
            g.node_mut(pred).flags |= OpFlags::FUSED;
            log::trace!("fused predicate {} into filter {}", pred.0, id.0);
        }
    }
}

// ----- pass 4: dead-code elimination -----

fn eliminate_dead(g: &mut Graph, root: OpId) {
    let mut reachable = vec![false; g.len()];
    for id in post_order(g, root) {
        reachable[id.idx()] = true;
    }
    for i in 0..g.len() {
        if !reachable[i] {
            g.node_mut(OpId(i as u32)).flags |= OpFlags::DEAD;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;

    #[test]
    fn folds_constant_arithmetic() -> Result<()> {
        let mut g = Graph::unbound();
        let a = g.const_i64(6)?;
        let b = g.const_i64(7)?;
        let m = g.mul(a, b)?;
        let root = g.optimize(m)?;
        assert_eq!(g.node(root).opcode, Opcode::Const);
        match g.ext_of(root) {
            Some(ExtData::Const(v)) => assert_eq!(v.as_i64()?, 42),
            other => panic!("expected folded const, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn division_folds_to_float_with_ieee_zero() -> Result<()> {
        let mut g = Graph::unbound();
        let a = g.const_i64(1)?;
        let b = g.const_i64(0)?;
        let d = g.div(a, b)?;
        g.optimize(d)?;
        match g.ext_of(d) {
            Some(ExtData::Const(v)) => assert!(v.as_f64()?.is_infinite()),
            other => panic!("expected folded const, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn int_min_div_is_left_to_runtime_but_mod_zero_folds() -> Result<()> {
        let mut g = Graph::unbound();
        let a = g.const_i64(5)?;
        let b = g.const_i64(0)?;
        let m = g.modulo(a, b)?;
        g.optimize(m)?;
        match g.ext_of(m) {
            Some(ExtData::Const(v)) => assert_eq!(v.as_i64()?, 0),
            other => panic!("expected folded const, got {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn constant_true_filter_becomes_materialize() -> Result<()> {
        let t = Value::table_from(&["x"], vec![Value::i64_vec(&[1, 2])?])?;
        let mut g = Graph::new(&t)?;
        let x = g.scan("x")?;
        let c = g.const_bool(true)?;
        let f = g.filter(x, c)?;
        g.optimize(f)?;
        assert_eq!(g.node(f).opcode, Opcode::Materialize);
        Ok(())
    }

    #[test]
    fn constant_false_filter_becomes_empty_head() -> Result<()> {
        let t = Value::table_from(&["x"], vec![Value::i64_vec(&[1, 2])?])?;
        let mut g = Graph::new(&t)?;
        let x = g.scan("x")?;
        let c = g.const_bool(false)?;
        let f = g.filter(x, c)?;
        g.optimize(f)?;
        assert_eq!(g.node(f).opcode, Opcode::Head);
        assert!(matches!(g.ext_of(f), Some(ExtData::Count(0))));
        Ok(())
    }

    #[test]
    fn dce_marks_unreachable_nodes() -> Result<()> {
        let t = Value::table_from(&["x"], vec![Value::i64_vec(&[1, 2])?])?;
        let mut g = Graph::new(&t)?;
        let x = g.scan("x")?;
        let orphan = g.const_i64(123)?;
        let _unused = g.add(x, orphan)?;
        let keep = g.sum(x)?;
        g.optimize(keep)?;
        assert!(g.node(_unused).flags.contains(OpFlags::DEAD));
        assert!(!g.node(x).flags.contains(OpFlags::DEAD));
        assert!(!g.node(keep).flags.contains(OpFlags::DEAD));
        Ok(())
    }

    #[test]
    fn filter_predicates_fuse_when_sole_consumer() -> Result<()> {
        let t = Value::table_from(&["x"], vec![Value::i64_vec(&[1, 2, 3])?])?;
        let mut g = Graph::new(&t)?;
        let x = g.scan("x")?;
        let c = g.const_i64(2)?;
        let p = g.ge(x, c)?;
        let f = g.filter(x, p)?;
        g.optimize(f)?;
        assert!(g.node(p).flags.contains(OpFlags::FUSED));
        Ok(())
    }
}
