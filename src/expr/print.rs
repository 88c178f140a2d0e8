use std::fmt::{self, Write};

use serde_json::Value;

use super::{
    Aggregate, Binding, ComprehensionKind, Expr, QuantifierKind, SortTerm, WindowSpec,
};

/// Writes `name` as a back-quoted identifier.
pub(crate) fn write_ident(f: &mut impl Write, name: &str) -> fmt::Result {
    f.write_char('`')?;
    for ch in name.chars() {
        if ch == '`' {
            f.write_str("``")?;
        } else {
            f.write_char(ch)?;
        }
    }
    f.write_char('`')
}

fn write_constant(f: &mut fmt::Formatter<'_>, value: &Value) -> fmt::Result {
    match value {
        Value::Array(items) => {
            f.write_char('[')?;
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write_constant(f, item)?;
            }
            f.write_char(']')
        }
        Value::Object(fields) => {
            f.write_char('{')?;
            for (i, (key, item)) in fields.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}: ", Value::String(key.clone()))?;
                write_constant(f, item)?;
            }
            f.write_char('}')
        }
        scalar => write!(f, "{scalar}"),
    }
}

fn write_list(f: &mut fmt::Formatter<'_>, items: &[Expr]) -> fmt::Result {
    for (i, item) in items.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{item}")?;
    }
    Ok(())
}

fn write_bindings(f: &mut fmt::Formatter<'_>, bindings: &[Binding]) -> fmt::Result {
    for (i, binding) in bindings.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        if let Some(name) = &binding.name_variable {
            write_ident(f, name)?;
            f.write_char(':')?;
        }
        write_ident(f, &binding.variable)?;
        let keyword = if binding.descend { "within" } else { "in" };
        write!(f, " {keyword} {}", binding.expr)?;
    }
    Ok(())
}

impl fmt::Display for SortTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.expr)?;
        if self.descending {
            f.write_str(" desc")?;
        }
        match self.nulls_first {
            Some(true) => f.write_str(" nulls first"),
            Some(false) => f.write_str(" nulls last"),
            None => Ok(()),
        }
    }
}

fn write_window(f: &mut fmt::Formatter<'_>, window: &WindowSpec) -> fmt::Result {
    f.write_str(" over (")?;
    let mut sep = "";
    if !window.partition_by.is_empty() {
        f.write_str("partition by ")?;
        write_list(f, &window.partition_by)?;
        sep = " ";
    }
    if !window.order_by.is_empty() {
        write!(f, "{sep}order by ")?;
        for (i, term) in window.order_by.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{term}")?;
        }
    }
    f.write_char(')')
}

fn write_aggregate(f: &mut fmt::Formatter<'_>, agg: &Aggregate) -> fmt::Result {
    write!(f, "{}(", agg.func.name())?;
    if agg.distinct {
        f.write_str("distinct ")?;
    }
    match &agg.operand {
        Some(operand) => write!(f, "{operand}")?,
        None => f.write_char('*')?,
    }
    f.write_char(')')?;
    if let Some(window) = &agg.window {
        write_window(f, window)?;
    }
    Ok(())
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Constant(value) => write_constant(f, value),
            Expr::Missing => f.write_str("missing"),
            Expr::Identifier(ident) => write_ident(f, &ident.name),
            Expr::Field(base, name) => {
                write!(f, "({base}.")?;
                write_ident(f, name)?;
                f.write_char(')')
            }
            Expr::Element(base, index) => write!(f, "({base}[{index}])"),
            Expr::NamedParameter(name) => write!(f, "${name}"),
            Expr::PositionalParameter(pos) => write!(f, "${pos}"),
            Expr::Not(inner) => write!(f, "(not {inner})"),
            Expr::Negate(inner) => write!(f, "(-{inner})"),
            Expr::Binary(op, left, right) => write!(f, "({left} {} {right})", op.symbol()),
            Expr::Is(op, inner) => write!(f, "({inner} {})", op.keyword()),
            Expr::Function(name, args) => {
                write!(f, "{name}(")?;
                write_list(f, args)?;
                f.write_char(')')
            }
            Expr::Aggregate(agg) => write_aggregate(f, agg),
            Expr::ArrayConstruct(items) => {
                f.write_char('[')?;
                write_list(f, items)?;
                f.write_char(']')
            }
            Expr::ObjectConstruct(fields) => {
                f.write_char('{')?;
                for (i, (key, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}: {value}", Value::String(key.clone()))?;
                }
                f.write_char('}')
            }
            Expr::Quantified(q) => {
                let keyword = match q.kind {
                    QuantifierKind::Any => "any",
                    QuantifierKind::Every => "every",
                    QuantifierKind::AnyAndEvery => "any and every",
                };
                write!(f, "{keyword} ")?;
                write_bindings(f, &q.bindings)?;
                write!(f, " satisfies {} end", q.satisfies)
            }
            Expr::Comprehension(c) => {
                let keyword = match c.kind {
                    ComprehensionKind::Array => "array",
                    ComprehensionKind::First => "first",
                };
                write!(f, "{keyword} {} for ", c.mapping)?;
                write_bindings(f, &c.bindings)?;
                if let Some(when) = &c.when {
                    write!(f, " when {when}")?;
                }
                f.write_str(" end")
            }
            Expr::ObjectComprehension(c) => {
                write!(f, "object {} : {} for ", c.name_mapping, c.value_mapping)?;
                write_bindings(f, &c.bindings)?;
                if let Some(when) = &c.when {
                    write!(f, " when {when}")?;
                }
                f.write_str(" end")
            }
            Expr::Subquery(select) => write!(f, "({select})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{AggregateFunc, BinaryOp, Quantified};
    use serde_json::json;

    #[test]
    fn composites_are_fully_parenthesized() {
        let expr = Expr::binary(
            BinaryOp::And,
            Expr::equals(Expr::path("t", &["type"]), Expr::constant("hotel")),
            Expr::binary(BinaryOp::Gt, Expr::path("t", &["stars"]), Expr::constant(-3)),
        );
        assert_eq!(
            expr.to_string(),
            "(((`t`.`type`) = \"hotel\") and ((`t`.`stars`) > -3))"
        );
    }

    #[test]
    fn constants_and_constructs_print_alike() {
        let constant = Expr::constant(json!([1, "a", {"k": true}]));
        let construct = Expr::ArrayConstruct(vec![
            Expr::constant(1),
            Expr::constant("a"),
            Expr::ObjectConstruct([("k".to_string(), Expr::constant(true))].into()),
        ]);
        assert_eq!(constant.to_string(), construct.to_string());
        assert_eq!(constant.to_string(), "[1, \"a\", {\"k\": true}]");
    }

    #[test]
    fn quantifier_and_aggregate_text() {
        let expr = Expr::Quantified(Box::new(Quantified {
            kind: QuantifierKind::AnyAndEvery,
            bindings: vec![Binding::new("x", Expr::path("t", &["arr"])).with_name_variable("i")],
            satisfies: Expr::binary(BinaryOp::Gt, Expr::ident("x"), Expr::constant(1)),
        }));
        assert_eq!(
            expr.to_string(),
            "any and every `i`:`x` in (`t`.`arr`) satisfies (`x` > 1) end"
        );

        let windowed = Expr::Aggregate(Aggregate {
            func: AggregateFunc::Sum,
            operand: Some(Box::new(Expr::ident("v"))),
            distinct: true,
            window: Some(WindowSpec {
                partition_by: vec![Expr::ident("p")],
                order_by: vec![SortTerm::desc(Expr::ident("o"))],
            }),
        });
        assert_eq!(
            windowed.to_string(),
            "sum(distinct `v`) over (partition by `p` order by `o` desc)"
        );
    }

    #[test]
    fn backticks_are_doubled() {
        assert_eq!(Expr::ident("we`ird").to_string(), "`we``ird`");
    }
}
