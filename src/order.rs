use crate::index::EntityIndex;
use crate::model::Instrument;
use std::cmp::Ordering;

/// Locale-ish natural comparator: case-insensitive, with digit runs
/// compared numerically, so "RA2" < "RA10" and "ut2" < "UT10".
pub fn compare_natural(a: &str, b: &str) -> Ordering {
    let mut ca = a.chars().peekable();
    let mut cb = b.chars().peekable();

    loop {
        match (ca.peek().copied(), cb.peek().copied()) {
            (None, None) => break,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                if x.is_ascii_digit() && y.is_ascii_digit() {
                    let na = take_digits(&mut ca);
                    let nb = take_digits(&mut cb);
                    let ord = compare_digit_runs(&na, &nb);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                } else {
                    let xl = x.to_lowercase();
                    let yl = y.to_lowercase();
                    let ord = xl.cmp(yl);
                    if ord != Ordering::Equal {
                        return ord;
                    }
                    ca.next();
                    cb.next();
                }
            }
        }
    }

    // Equal ignoring case and leading zeros; fall back to the raw bytes
    // so the ordering stays total and deterministic.
    a.cmp(b)
}

fn take_digits(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> String {
    let mut run = String::new();
    while let Some(c) = chars.peek().copied() {
        if !c.is_ascii_digit() {
            break;
        }
        run.push(c);
        chars.next();
    }
    run
}

fn compare_digit_runs(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

/// Composite sort for instruments: evaluation period (missing UT -> 0),
/// then UT name, activity name and instrument name, each natural and
/// each level only breaking ties from the previous one.
pub fn compare_instruments(index: &EntityIndex, a: &Instrument, b: &Instrument) -> Ordering {
    let ut_a = index.ut_by_id.get(&a.ut_id);
    let ut_b = index.ut_by_id.get(&b.ut_id);

    let period_a = ut_a.map(|ut| ut.evaluation_period).unwrap_or(0);
    let period_b = ut_b.map(|ut| ut.evaluation_period).unwrap_or(0);
    if period_a != period_b {
        return period_a.cmp(&period_b);
    }

    let ut_name_a = ut_a.map(|ut| ut.name.as_str()).unwrap_or("");
    let ut_name_b = ut_b.map(|ut| ut.name.as_str()).unwrap_or("");
    let ord = compare_natural(ut_name_a, ut_name_b);
    if ord != Ordering::Equal {
        return ord;
    }

    let act_name_a = index
        .activity_by_id
        .get(&a.activity_id)
        .map(|act| act.name.as_str())
        .unwrap_or("");
    let act_name_b = index
        .activity_by_id
        .get(&b.activity_id)
        .map(|act| act.name.as_str())
        .unwrap_or("");
    let ord = compare_natural(act_name_a, act_name_b);
    if ord != Ordering::Equal {
        return ord;
    }

    compare_natural(&a.name, &b.name)
}
