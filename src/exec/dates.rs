//! EXTRACT and DATE_TRUNC over DATE and TIMESTAMP columns.
//!
//! DATE counts days since 2000-01-01; TIMESTAMP counts nanoseconds since
//! the same epoch. Calendar math converts through days-since-1970 with the
//! proleptic Gregorian algorithm. `dow` is 0 = Sunday, `doy` is 1-based,
//! and `epoch` extracts Unix seconds.

use crate::error::{Error, Result};
use crate::graph::Opcode;
use crate::types::{DateField, TypeTag};
use crate::value::Value;

/// Days between 1970-01-01 and 2000-01-01.
const EPOCH_2000_DAYS: i64 = 10_957;
const NANOS_PER_SEC: i64 = 1_000_000_000;
const NANOS_PER_DAY: i64 = 86_400 * NANOS_PER_SEC;

/// Civil date from days since 1970-01-01 (proleptic Gregorian).
fn civil_from_days(z: i64) -> (i64, i64, i64) {
    let z = z + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097);
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = doy - (153 * mp + 2) / 5 + 1;
    let m = if mp < 10 { mp + 3 } else { mp - 9 };
    (if m <= 2 { y + 1 } else { y }, m, d)
}

/// Days since 1970-01-01 from a civil date.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = y.div_euclid(400);
    let yoe = y - era * 400;
    let mp = if m > 2 { m - 3 } else { m + 9 };
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

/// Split a raw value into `(days since 1970, nanos within day)`.
fn split(tag: TypeTag, raw: i64) -> Result<(i64, i64)> {
    match tag {
        TypeTag::Date => Ok((raw + EPOCH_2000_DAYS, 0)),
        TypeTag::Timestamp => {
            let days = raw.div_euclid(NANOS_PER_DAY);
            let within = raw.rem_euclid(NANOS_PER_DAY);
            Ok((days + EPOCH_2000_DAYS, within))
        }
        TypeTag::Time => Ok((EPOCH_2000_DAYS, raw.rem_euclid(NANOS_PER_DAY))),
        t => Err(Error::Type(format!("{t:?} is not a date/time class"))),
    }
}

fn extract_field(tag: TypeTag, raw: i64, field: DateField) -> Result<i64> {
    let (days, within) = split(tag, raw)?;
    let (y, m, d) = civil_from_days(days);
    Ok(match field {
        DateField::Year => y,
        DateField::Month => m,
        DateField::Day => d,
        DateField::Hour => within / (3600 * NANOS_PER_SEC),
        DateField::Minute => (within / (60 * NANOS_PER_SEC)) % 60,
        DateField::Second => (within / NANOS_PER_SEC) % 60,
        DateField::DayOfWeek => (days + 4).rem_euclid(7),
        DateField::DayOfYear => days - days_from_civil(y, 1, 1) + 1,
        DateField::Epoch => days * 86_400 + within / NANOS_PER_SEC,
    })
}

fn trunc_field(tag: TypeTag, raw: i64, field: DateField) -> Result<i64> {
    let (days, within) = split(tag, raw)?;
    let (y, m, _) = civil_from_days(days);
    let trunc_days = match field {
        DateField::Year => days_from_civil(y, 1, 1),
        DateField::Month => days_from_civil(y, m, 1),
        _ => days,
    };
    match tag {
        TypeTag::Date => Ok(trunc_days - EPOCH_2000_DAYS),
        TypeTag::Timestamp => {
            let within = match field {
                DateField::Year | DateField::Month | DateField::Day => 0,
                DateField::Hour => within - within % (3600 * NANOS_PER_SEC),
                DateField::Minute => within - within % (60 * NANOS_PER_SEC),
                DateField::Second => within - within % NANOS_PER_SEC,
                _ => within,
            };
            Ok((trunc_days - EPOCH_2000_DAYS) * NANOS_PER_DAY + within)
        }
        _ => Ok(raw),
    }
}

/// EXTRACT yields I64; DATE_TRUNC keeps the input tag.
pub(crate) fn eval(op: Opcode, a: &Value, field: DateField) -> Result<Value> {
    let extract = op == Opcode::Extract;
    if a.is_atom() {
        let tag = a.atom_tag()?;
        let raw = a.as_i64()?;
        return if extract {
            Value::i64_atom(extract_field(tag, raw, field)?)
        } else {
            Value::int_atom_of(tag, trunc_field(tag, raw, field)?)
        };
    }
    let dense = crate::exec::dense_column(a)?;
    let tag = dense.vec_tag_or_base()?;
    let n = dense.header().len();
    let mut out = if extract {
        Value::vec(TypeTag::I64, n)?
    } else {
        Value::vec(tag, n)?
    };
    for i in 0..n {
        if dense.is_null_at(i)? {
            out.push_null()?;
            continue;
        }
        let raw = dense.get_i64(i)?;
        let v = if extract {
            extract_field(tag, raw, field)?
        } else {
            trunc_field(tag, raw, field)?
        };
        out.push_i64(v)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn civil_round_trips() {
        for days in [-10_957, 0, 10_957, 19_000, 60] {
            let (y, m, d) = civil_from_days(days);
            assert_eq!(days_from_civil(y, m, d), days);
        }
        assert_eq!(civil_from_days(0), (1970, 1, 1));
        assert_eq!(civil_from_days(EPOCH_2000_DAYS), (2000, 1, 1));
    }

    #[test]
    fn extract_from_dates() -> Result<()> {
        // Day 60 after 2000-01-01 lands on 2000-03-01 (leap year).
        let mut col = Value::vec(TypeTag::Date, 1)?;
        col.push_i64(60)?;
        let y = eval(Opcode::Extract, &col, DateField::Year)?;
        assert_eq!(y.get_i64(0)?, 2000);
        let m = eval(Opcode::Extract, &col, DateField::Month)?;
        assert_eq!(m.get_i64(0)?, 3);
        let doy = eval(Opcode::Extract, &col, DateField::DayOfYear)?;
        assert_eq!(doy.get_i64(0)?, 61);
        Ok(())
    }

    #[test]
    fn trunc_timestamp_to_day() -> Result<()> {
        let one_and_a_bit_days = NANOS_PER_DAY + 3_600 * NANOS_PER_SEC;
        let mut col = Value::vec(TypeTag::Timestamp, 1)?;
        col.push_i64(one_and_a_bit_days)?;
        let t = eval(Opcode::DateTrunc, &col, DateField::Day)?;
        assert_eq!(t.get_i64(0)?, NANOS_PER_DAY);
        Ok(())
    }
}
