//! String operators over SYM data.
//!
//! SYM vectors hold interned ids; every operator resolves ids back to
//! bytes, computes on the text, and re-interns the result, so repeated
//! values cost one transformation each in the intern table's favor. LIKE
//! and ILIKE translate SQL wildcards (`%`, `_`) into an anchored regex
//! compiled once per call.

use regex::Regex;

use crate::error::{Error, Result};
use crate::graph::Opcode;
use crate::sym;
use crate::types::TypeTag;
use crate::value::Value;

/// Per-row string access with atom broadcast; parted inputs are densified
/// first.
struct StrInput {
    broadcast: Option<Option<String>>,
    col: Option<Value>,
    len: Option<i64>,
}

impl StrInput {
    fn of(v: &Value) -> Result<StrInput> {
        if v.is_atom() {
            let s = match v.atom_tag()? {
                TypeTag::Sym => Some(sym::str_of(v.as_i64()?)?),
                TypeTag::Str => Some(String::from_utf8_lossy(v.as_str_bytes()?).into_owned()),
                t => return Err(Error::Type(format!("{t:?} atom is not a string"))),
            };
            return Ok(StrInput {
                broadcast: Some(s),
                col: None,
                len: None,
            });
        }
        let dense = crate::exec::dense_column(v)?;
        if dense.vec_tag_or_base()? != TypeTag::Sym {
            return Err(Error::Type(format!(
                "tag {} is not a string column",
                dense.tag()
            )));
        }
        Ok(StrInput {
            broadcast: None,
            len: Some(dense.header().len()),
            col: Some(dense),
        })
    }

    fn at(&self, i: i64) -> Result<Option<String>> {
        if let Some(b) = &self.broadcast {
            return Ok(b.clone());
        }
        let col = self.col.as_ref().unwrap();
        if col.is_null_at(i)? {
            return Ok(None);
        }
        Ok(Some(sym::str_of(col.get_i64(i)?)?))
    }
}

/// Number of rows across string inputs, or `None` when all are atoms.
fn common_rows(inputs: &[&StrInput]) -> Result<Option<i64>> {
    let mut rows = None;
    for inp in inputs {
        if let Some(n) = inp.len {
            match rows {
                None => rows = Some(n),
                Some(m) if m != n => {
                    return Err(Error::LengthMismatch { left: m, right: n });
                }
                _ => {}
            }
        }
    }
    Ok(rows)
}

/// Build a SYM vector (or atom) by mapping rows through `f`.
fn map_strings(
    inputs: &[&StrInput],
    f: impl Fn(&[Option<String>]) -> Result<Option<String>>,
) -> Result<Value> {
    match common_rows(inputs)? {
        None => {
            let vals: Vec<Option<String>> = inputs
                .iter()
                .map(|i| i.at(0))
                .collect::<Result<_>>()?;
            match f(&vals)? {
                Some(s) => Value::sym_atom(sym::intern_str(&s)?),
                None => {
                    let mut out = Value::sym_vec(8, 1)?;
                    out.push_null()?;
                    Ok(out)
                }
            }
        }
        Some(n) => {
            let mut out = Value::sym_vec(8, n)?;
            for r in 0..n {
                let vals: Vec<Option<String>> = inputs
                    .iter()
                    .map(|i| i.at(r))
                    .collect::<Result<_>>()?;
                match f(&vals)? {
                    Some(s) => out.push_i64(sym::intern_str(&s)?)?,
                    None => out.push_null()?,
                }
            }
            Ok(out)
        }
    }
}

/// UPPER / LOWER / TRIM / STRLEN.
pub(crate) fn eval_unary(op: Opcode, a: &Value) -> Result<Value> {
    let input = StrInput::of(a)?;
    if op == Opcode::StrLen {
        return match common_rows(&[&input])? {
            None => match input.at(0)? {
                Some(s) => Value::i64_atom(s.len() as i64),
                None => Value::i64_atom(0),
            },
            Some(n) => {
                let mut out = Value::vec(TypeTag::I64, n)?;
                for r in 0..n {
                    match input.at(r)? {
                        Some(s) => out.push_i64(s.len() as i64)?,
                        None => out.push_null()?,
                    }
                }
                Ok(out)
            }
        };
    }
    map_strings(&[&input], |vals| {
        Ok(vals[0].as_ref().map(|s| match op {
            Opcode::Upper => s.to_uppercase(),
            Opcode::Lower => s.to_lowercase(),
            _ => s.trim().to_string(),
        }))
    })
}

/// Translate a SQL LIKE pattern into an anchored regex.
fn like_to_regex(pattern: &str, insensitive: bool) -> Result<Regex> {
    let mut re = String::with_capacity(pattern.len() + 8);
    if insensitive {
        re.push_str("(?i)");
    }
    re.push('^');
    for ch in pattern.chars() {
        match ch {
            '%' => re.push_str(".*"),
            '_' => re.push('.'),
            c => re.push_str(&regex::escape(&c.to_string())),
        }
    }
    re.push('$');
    Regex::new(&re).map_err(|e| Error::Domain(format!("bad LIKE pattern {pattern:?}: {e}")))
}

/// LIKE / ILIKE: the pattern must be a scalar; output is BOOL.
pub(crate) fn eval_like(a: &Value, pattern: &Value, insensitive: bool) -> Result<Value> {
    let pat_in = StrInput::of(pattern)?;
    let Some(pat) = pat_in.at(0)? else {
        return Err(Error::Domain("LIKE pattern is null".into()));
    };
    if pat_in.len.is_some() {
        return Err(Error::Rank("LIKE pattern must be a scalar".into()));
    }
    let re = like_to_regex(&pat, insensitive)?;
    let input = StrInput::of(a)?;
    match common_rows(&[&input])? {
        None => match input.at(0)? {
            Some(s) => Value::bool_atom(re.is_match(&s)),
            None => Value::bool_atom(false),
        },
        Some(n) => {
            let mut out = Value::vec(TypeTag::Bool, n)?;
            for r in 0..n {
                match input.at(r)? {
                    Some(s) => out.push_bool(re.is_match(&s))?,
                    None => out.push_null()?,
                }
            }
            Ok(out)
        }
    }
}

/// 1-based SUBSTR with clamping; a start past the end yields the empty
/// string.
pub(crate) fn eval_substr(s: &Value, start: &Value, len: &Value) -> Result<Value> {
    let input = StrInput::of(s)?;
    let start = start.as_i64()?;
    let take = len.as_i64()?;
    if take < 0 {
        return Err(Error::Range(format!("negative substring length {take}")));
    }
    map_strings(&[&input], |vals| {
        Ok(vals[0].as_ref().map(|text| {
            let chars: Vec<char> = text.chars().collect();
            let from = (start.max(1) - 1) as usize;
            if from >= chars.len() {
                String::new()
            } else {
                let to = (from + take as usize).min(chars.len());
                chars[from..to].iter().collect()
            }
        }))
    })
}

pub(crate) fn eval_replace(s: &Value, from: &Value, to: &Value) -> Result<Value> {
    let input = StrInput::of(s)?;
    let from_in = StrInput::of(from)?;
    let to_in = StrInput::of(to)?;
    let Some(from_s) = from_in.at(0)? else {
        return Err(Error::Domain("REPLACE search string is null".into()));
    };
    let to_s = to_in.at(0)?.unwrap_or_default();
    map_strings(&[&input], |vals| {
        Ok(vals[0].as_ref().map(|text| text.replace(&from_s, &to_s)))
    })
}

/// Element-wise variadic concatenation; a null operand nulls the row.
pub(crate) fn eval_concat(vals: &[Value]) -> Result<Value> {
    let inputs: Vec<StrInput> = vals.iter().map(StrInput::of).collect::<Result<_>>()?;
    let refs: Vec<&StrInput> = inputs.iter().collect();
    map_strings(&refs, |parts| {
        let mut out = String::new();
        for p in parts {
            match p {
                Some(s) => out.push_str(s),
                None => return Ok(None),
            }
        }
        Ok(Some(out))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym_col(vals: &[&str]) -> Result<Value> {
        let ids: Vec<i64> = vals
            .iter()
            .map(|s| sym::intern_str(s))
            .collect::<Result<_>>()?;
        Value::sym_vec_from(&ids)
    }

    #[test]
    fn upper_and_strlen() -> Result<()> {
        let col = sym_col(&["abc", "Hello"])?;
        let up = eval_unary(Opcode::Upper, &col)?;
        assert_eq!(sym::str_of(up.get_i64(0)?)?, "ABC");
        assert_eq!(sym::str_of(up.get_i64(1)?)?, "HELLO");
        let lens = eval_unary(Opcode::StrLen, &col)?;
        assert_eq!(lens.get_i64(1)?, 5);
        Ok(())
    }

    #[test]
    fn like_wildcards() -> Result<()> {
        let col = sym_col(&["apple", "banana", "apricot"])?;
        let pat = Value::sym_atom(sym::intern_str("ap%")?)?;
        let hits = eval_like(&col, &pat, false)?;
        assert!(hits.get_bool(0)?);
        assert!(!hits.get_bool(1)?);
        assert!(hits.get_bool(2)?);
        let one = Value::sym_atom(sym::intern_str("b_nana")?)?;
        let hits = eval_like(&col, &one, false)?;
        assert!(hits.get_bool(1)?);
        Ok(())
    }

    #[test]
    fn ilike_ignores_case() -> Result<()> {
        let col = sym_col(&["Apple"])?;
        let pat = Value::sym_atom(sym::intern_str("apple")?)?;
        assert!(eval_like(&col, &pat, true)?.get_bool(0)?);
        assert!(!eval_like(&col, &pat, false)?.get_bool(0)?);
        Ok(())
    }

    #[test]
    fn substr_is_one_based_and_clamped() -> Result<()> {
        let col = sym_col(&["hello"])?;
        let out = eval_substr(&col, &Value::i64_atom(2)?, &Value::i64_atom(3)?)?;
        assert_eq!(sym::str_of(out.get_i64(0)?)?, "ell");
        let out = eval_substr(&col, &Value::i64_atom(99)?, &Value::i64_atom(3)?)?;
        assert_eq!(sym::str_of(out.get_i64(0)?)?, "");
        Ok(())
    }

    #[test]
    fn replace_and_concat() -> Result<()> {
        let col = sym_col(&["a-b-c"])?;
        let out = eval_replace(
            &col,
            &Value::sym_atom(sym::intern_str("-")?)?,
            &Value::sym_atom(sym::intern_str(".")?)?,
        )?;
        assert_eq!(sym::str_of(out.get_i64(0)?)?, "a.b.c");
        let joined = eval_concat(&[col, sym_col(&["!"])?])?;
        assert_eq!(sym::str_of(joined.get_i64(0)?)?, "a-b-c!");
        Ok(())
    }
}
