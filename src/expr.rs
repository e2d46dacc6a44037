/*!
 * @file expr.rs
 * @brief Expression AST for filters, projections and accumulator arguments
 */

use bson::Bson;
use indexmap::IndexMap;

use crate::operators::{
    AccumulatorOp, ArithmeticOp, ArrayOp, ComparisonOp, ConversionTarget, DateOp, LogicalOp,
    StringOp,
};

/// Declared return-type hint on a field path. Governs whether a
/// type-coercing access is emitted in the base dialect; the extended
/// dialect's dot notation preserves JSON types on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Number,
    String,
    Date,
}

/// Closed expression hierarchy. Owned exclusively by the containing stage
/// or parent expression; the renderer only ever borrows it.
#[derive(Debug, Clone, PartialEq)]
pub enum Expression {
    /// Constant value, bound as `:n` where a bind is well-formed.
    Literal(Bson),
    /// Dotted field path without the leading `$`.
    FieldPath {
        path: String,
        type_hint: Option<FieldType>,
    },
    /// `$$name` reference (let-bindings, array operator loop variables).
    Variable(String),
    Comparison {
        op: ComparisonOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    /// IN / NIN set membership; the value list may be empty.
    In {
        target: Box<Expression>,
        values: Vec<Expression>,
        negated: bool,
    },
    Logical {
        op: LogicalOp,
        operands: Vec<Expression>,
    },
    Arithmetic {
        op: ArithmeticOp,
        operands: Vec<Expression>,
    },
    Cond {
        condition: Box<Expression>,
        then_branch: Box<Expression>,
        else_branch: Box<Expression>,
    },
    IfNull {
        value: Box<Expression>,
        replacement: Box<Expression>,
    },
    Switch {
        branches: Vec<(Expression, Expression)>,
        default: Option<Box<Expression>>,
    },
    StringFunc {
        op: StringOp,
        args: Vec<Expression>,
    },
    /// `$regexMatch` / `$regexFind` and the field-level `$regex` filter.
    RegexMatch {
        input: Box<Expression>,
        pattern: Box<Expression>,
        options: Option<String>,
    },
    Replace {
        input: Box<Expression>,
        find: Box<Expression>,
        replacement: Box<Expression>,
        all: bool,
    },
    DateFunc {
        op: DateOp,
        arg: Box<Expression>,
    },
    ArrayFunc {
        op: ArrayOp,
        args: Vec<Expression>,
    },
    Filter {
        input: Box<Expression>,
        var: String,
        cond: Box<Expression>,
    },
    Map {
        input: Box<Expression>,
        var: String,
        mapping: Box<Expression>,
    },
    Reduce {
        input: Box<Expression>,
        initial: Box<Expression>,
        combiner: Box<Expression>,
    },
    MergeObjects(Vec<Expression>),
    Accumulator {
        op: AccumulatorOp,
        arg: Box<Expression>,
    },
    Convert {
        target: ConversionTarget,
        input: Box<Expression>,
        on_error: Option<Box<Expression>>,
        on_null: Option<Box<Expression>>,
    },
    /// `$type`: JSON type name of the argument.
    TypeOf(Box<Expression>),
    Exists {
        path: String,
        must_exist: bool,
    },
    /// Ordered document constructor (`$mergeObjects` operands,
    /// `$replaceRoot` bodies, projected sub-documents).
    InlineObject(IndexMap<String, Expression>),
    /// Compound group key; each entry renders under its own alias.
    CompoundId(IndexMap<String, Expression>),
}

impl Expression {
    pub fn field(path: impl Into<String>) -> Self {
        Expression::FieldPath {
            path: path.into(),
            type_hint: None,
        }
    }

    pub fn literal(value: impl Into<Bson>) -> Self {
        Expression::Literal(value.into())
    }

    /// Collects every field path referenced anywhere under this node, in
    /// visit order. The pipeline renderer uses this to decide whether a
    /// `$match` placed after `$setWindowFields` filters on a window output.
    pub fn referenced_fields(&self, out: &mut Vec<String>) {
        match self {
            Expression::Literal(_) | Expression::Variable(_) => {}
            Expression::FieldPath { path, .. } => out.push(path.clone()),
            Expression::Comparison { left, right, .. } => {
                left.referenced_fields(out);
                right.referenced_fields(out);
            }
            Expression::In { target, values, .. } => {
                target.referenced_fields(out);
                for v in values {
                    v.referenced_fields(out);
                }
            }
            Expression::Logical { operands, .. } | Expression::Arithmetic { operands, .. } => {
                for o in operands {
                    o.referenced_fields(out);
                }
            }
            Expression::Cond {
                condition,
                then_branch,
                else_branch,
            } => {
                condition.referenced_fields(out);
                then_branch.referenced_fields(out);
                else_branch.referenced_fields(out);
            }
            Expression::IfNull { value, replacement } => {
                value.referenced_fields(out);
                replacement.referenced_fields(out);
            }
            Expression::Switch { branches, default } => {
                for (cond, result) in branches {
                    cond.referenced_fields(out);
                    result.referenced_fields(out);
                }
                if let Some(d) = default {
                    d.referenced_fields(out);
                }
            }
            Expression::StringFunc { args, .. } | Expression::ArrayFunc { args, .. } => {
                for a in args {
                    a.referenced_fields(out);
                }
            }
            Expression::RegexMatch { input, pattern, .. } => {
                input.referenced_fields(out);
                pattern.referenced_fields(out);
            }
            Expression::Replace {
                input,
                find,
                replacement,
                ..
            } => {
                input.referenced_fields(out);
                find.referenced_fields(out);
                replacement.referenced_fields(out);
            }
            Expression::DateFunc { arg, .. } => arg.referenced_fields(out),
            Expression::Filter { input, cond, .. } => {
                input.referenced_fields(out);
                cond.referenced_fields(out);
            }
            Expression::Map { input, mapping, .. } => {
                input.referenced_fields(out);
                mapping.referenced_fields(out);
            }
            Expression::Reduce {
                input,
                initial,
                combiner,
            } => {
                input.referenced_fields(out);
                initial.referenced_fields(out);
                combiner.referenced_fields(out);
            }
            Expression::MergeObjects(items) => {
                for i in items {
                    i.referenced_fields(out);
                }
            }
            Expression::Accumulator { arg, .. } => arg.referenced_fields(out),
            Expression::Convert {
                input,
                on_error,
                on_null,
                ..
            } => {
                input.referenced_fields(out);
                if let Some(e) = on_error {
                    e.referenced_fields(out);
                }
                if let Some(n) = on_null {
                    n.referenced_fields(out);
                }
            }
            Expression::TypeOf(inner) => inner.referenced_fields(out),
            Expression::Exists { path, .. } => out.push(path.clone()),
            Expression::InlineObject(fields) | Expression::CompoundId(fields) => {
                for (_, e) in fields {
                    e.referenced_fields(out);
                }
            }
        }
    }

    /// True when any referenced field path equals, or descends from, one of
    /// the given names.
    pub fn references_any(&self, names: &[&str]) -> bool {
        let mut fields = Vec::new();
        self.referenced_fields(&mut fields);
        fields.iter().any(|f| {
            names
                .iter()
                .any(|n| f == n || f.starts_with(&format!("{}.", n)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::ComparisonOp;

    #[test]
    fn referenced_fields_walks_nested_expressions() {
        let expr = Expression::Logical {
            op: LogicalOp::And,
            operands: vec![
                Expression::Comparison {
                    op: ComparisonOp::Gt,
                    left: Box::new(Expression::field("amount")),
                    right: Box::new(Expression::literal(10)),
                },
                Expression::Exists {
                    path: "customer.tier".to_string(),
                    must_exist: true,
                },
            ],
        };
        let mut fields = Vec::new();
        expr.referenced_fields(&mut fields);
        assert_eq!(fields, vec!["amount", "customer.tier"]);
    }

    #[test]
    fn references_any_matches_prefixes() {
        let expr = Expression::Comparison {
            op: ComparisonOp::Lte,
            left: Box::new(Expression::field("rank.value")),
            right: Box::new(Expression::literal(3)),
        };
        assert!(expr.references_any(&["rank"]));
        assert!(!expr.references_any(&["ranking"]));
    }
}
