use std::cmp::Ordering;

use serde_json::Value;

use super::Expr;

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 1,
        Value::Bool(false) => 2,
        Value::Bool(true) => 3,
        Value::Number(_) => 4,
        Value::String(_) => 5,
        Value::Array(_) => 6,
        Value::Object(_) => 7,
    }
}

/// Total order over JSON values: null < false < true < numbers < strings < arrays < objects.
///
/// Objects compare by size first, then by sorted keys, then by values.
pub fn collate(left: &Value, right: &Value) -> Ordering {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                let ord = collate(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        (Value::Object(a), Value::Object(b)) => {
            let ord = a.len().cmp(&b.len());
            if ord != Ordering::Equal {
                return ord;
            }
            let keys = a.keys().cmp(b.keys());
            if keys != Ordering::Equal {
                return keys;
            }
            for (x, y) in a.values().zip(b.values()) {
                let ord = collate(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        }
        _ => type_rank(left).cmp(&type_rank(right)),
    }
}

/// Compares two range bounds when both are literals; MISSING sorts first.
///
/// Returns `None` when either bound needs evaluation.
pub fn collate_bounds(low: &Expr, high: &Expr) -> Option<Ordering> {
    match (low, high) {
        (Expr::Missing, Expr::Missing) => Some(Ordering::Equal),
        (Expr::Missing, Expr::Constant(_)) => Some(Ordering::Less),
        (Expr::Constant(_), Expr::Missing) => Some(Ordering::Greater),
        (Expr::Constant(a), Expr::Constant(b)) => Some(collate(a, b)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_order_is_fixed() {
        let ordered = [
            json!(null),
            json!(false),
            json!(true),
            json!(-1.5),
            json!(7),
            json!("a"),
            json!([1]),
            json!({"a": 1}),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(collate(&pair[0], &pair[1]), Ordering::Less, "{pair:?}");
        }
    }

    #[test]
    fn integers_and_floats_compare_numerically() {
        assert_eq!(collate(&json!(2), &json!(2.0)), Ordering::Equal);
        assert_eq!(collate(&json!([1, 2]), &json!([1, 2, 0])), Ordering::Less);
    }

    #[test]
    fn non_literal_bounds_are_incomparable() {
        assert_eq!(
            collate_bounds(&Expr::Missing, &Expr::constant(1)),
            Some(Ordering::Less)
        );
        assert_eq!(collate_bounds(&Expr::ident("x"), &Expr::constant(1)), None);
    }
}
