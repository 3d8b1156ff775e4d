//! Fingerprint and label-matcher extraction (C1).
//!
//! Parses PromQL with a real grammar (`promql-parser`), not a hand-rolled
//! tokenizer, so masking and matcher-order normalisation operate on the AST
//! rather than on source text.

use std::collections::BTreeMap;

use promql_parser::label::{MatchOp, Matcher};
use promql_parser::parser::{self, AggregateExpr, BinaryExpr, Call, Expr, ParenExpr, SubqueryExpr, UnaryExpr, VectorSelector};

/// An ordered `name -> value` map extracted from one vector selector,
/// including synthetic `__name__` when the selector names a metric.
pub type LabelMatcherMap = BTreeMap<String, String>;

/// Stable 16-hex-character fingerprint of a PromQL string, or the empty
/// string if the query fails to parse.
pub fn fingerprint(promql: &str) -> String {
    match parser::parse(promql) {
        Ok(expr) => {
            let canonical = canonical_form(&expr);
            let hash = seahash::hash(canonical.as_bytes());
            format!("{hash:016x}")
        }
        Err(_) => String::new(),
    }
}

/// Extracts one label-matcher map per vector selector, in AST-traversal
/// order. `None` signals a parse failure (stored as JSON `null` by callers).
pub fn label_matchers(promql: &str) -> Option<Vec<LabelMatcherMap>> {
    let expr = parser::parse(promql).ok()?;
    let mut out = Vec::new();
    collect_selectors(&expr, &mut out);
    Some(out)
}

fn collect_selectors(expr: &Expr, out: &mut Vec<LabelMatcherMap>) {
    match expr {
        Expr::VectorSelector(vs) => out.push(matcher_map(vs)),
        Expr::MatrixSelector(ms) => out.push(matcher_map(&ms.vector_selector)),
        Expr::Unary(UnaryExpr { expr }) | Expr::Paren(ParenExpr { expr }) => collect_selectors(expr, out),
        Expr::Subquery(SubqueryExpr { expr, .. }) => collect_selectors(expr, out),
        Expr::Binary(BinaryExpr { lhs, rhs, .. }) => {
            collect_selectors(lhs, out);
            collect_selectors(rhs, out);
        }
        Expr::Aggregate(AggregateExpr { expr, param, .. }) => {
            collect_selectors(expr, out);
            if let Some(param) = param {
                collect_selectors(param, out);
            }
        }
        Expr::Call(Call { args, .. }) => {
            for arg in args.args.iter() {
                collect_selectors(arg, out);
            }
        }
        Expr::NumberLiteral(_) | Expr::StringLiteral(_) | Expr::Extension(_) => {}
    }
}

fn matcher_map(vs: &VectorSelector) -> LabelMatcherMap {
    let mut map = BTreeMap::new();
    if let Some(name) = &vs.name {
        map.insert("__name__".to_owned(), name.clone());
    }
    for matcher in vs.matchers.matchers.iter() {
        map.insert(matcher.name.clone(), matcher.value.clone());
    }
    map
}

/// Renders an AST into a canonical string: vector-selector matchers are
/// sorted lexicographically by name, and numeric/string literals are
/// replaced with placeholders so that equivalent-but-differently-valued
/// queries fingerprint identically.
fn canonical_form(expr: &Expr) -> String {
    match expr {
        Expr::VectorSelector(vs) => vector_selector_form(vs),
        Expr::MatrixSelector(ms) => format!("{}[{:?}]", vector_selector_form(&ms.vector_selector), ms.range),
        Expr::NumberLiteral(_) => "#NUM#".to_owned(),
        Expr::StringLiteral(_) => "#STR#".to_owned(),
        Expr::Unary(UnaryExpr { expr }) => format!("-({})", canonical_form(expr)),
        Expr::Paren(ParenExpr { expr }) => format!("({})", canonical_form(expr)),
        Expr::Subquery(SubqueryExpr { expr, range, step, .. }) => {
            format!("{}[{range:?}:{step:?}]", canonical_form(expr))
        }
        Expr::Binary(BinaryExpr { op, lhs, rhs, .. }) => {
            format!("{}{:?}{}", canonical_form(lhs), op, canonical_form(rhs))
        }
        Expr::Aggregate(AggregateExpr { op, expr, param, .. }) => {
            let param = param
                .as_ref()
                .map(|p| format!(",{}", canonical_form(p)))
                .unwrap_or_default();
            format!("{:?}({}{param})", op, canonical_form(expr))
        }
        Expr::Call(Call { func, args }) => {
            let args: Vec<String> = args.args.iter().map(|a| canonical_form(a)).collect();
            format!("{}({})", func.name, args.join(","))
        }
        Expr::Extension(_) => "#EXT#".to_owned(),
    }
}

fn vector_selector_form(vs: &VectorSelector) -> String {
    let mut matchers: Vec<&Matcher> = vs.matchers.matchers.iter().collect();
    matchers.sort_by(|a, b| a.name.cmp(&b.name));
    let rendered: Vec<String> = matchers.iter().map(|m| format!("{}{}{:?}", m.name, match_op(m.op), m.value)).collect();
    format!("{}{{{}}}", vs.name.clone().unwrap_or_default(), rendered.join(","))
}

fn match_op(op: MatchOp) -> &'static str {
    match op {
        MatchOp::Equal => "=",
        MatchOp::NotEqual => "!=",
        MatchOp::Re(_) => "=~",
        MatchOp::NotRe(_) => "!~",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_stable_across_matcher_order() {
        let a = fingerprint(r#"up{a="1",b="2"}"#);
        let b = fingerprint(r#"up{b="2",a="1"}"#);
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);
    }

    #[test]
    fn fingerprint_stable_across_literal_values() {
        let a = fingerprint("rate(http_requests_total[5m]) > 10");
        let b = fingerprint("rate(http_requests_total[5m]) > 999");
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_empty_on_parse_failure() {
        assert_eq!(fingerprint("this is not promql {{{"), "");
    }

    #[test]
    fn label_matchers_extracts_name_and_explicit_matchers() {
        let matchers = label_matchers(r#"up{job="node"}"#).unwrap();
        assert_eq!(matchers.len(), 1);
        assert_eq!(matchers[0].get("__name__"), Some(&"up".to_owned()));
        assert_eq!(matchers[0].get("job"), Some(&"node".to_owned()));
    }

    #[test]
    fn label_matchers_none_on_parse_failure() {
        assert!(label_matchers("{{{not promql").is_none());
    }

    #[test]
    fn label_matchers_traverses_binary_expr_in_order() {
        let matchers = label_matchers("up{} + down{}").unwrap();
        assert_eq!(matchers.len(), 2);
        assert_eq!(matchers[0].get("__name__"), Some(&"up".to_owned()));
        assert_eq!(matchers[1].get("__name__"), Some(&"down".to_owned()));
    }
}
