/*!
 * @file expr_parser.rs
 * @brief Parses BSON document trees into the expression AST
 */

use bson::{Bson, Document};
use indexmap::IndexMap;

use crate::error::{MongoraError, Result};
use crate::expr::{Expression, FieldType};
use crate::operators::{
    AccumulatorOp, ArithmeticOp, ArrayOp, ComparisonOp, ConversionTarget, DateOp, LogicalOp,
    StringOp,
};
use crate::validate::{sanitize, validate_field_path};

/// Stateless parser with two entry points: `parse_filter` for match
/// context and `parse_value` for projection/expression context. The two
/// differ in how `$not`, `$and`/`$or` and bare documents are read.
pub struct ExpressionParser;

impl ExpressionParser {
    /// Match-context entry. Sibling conditions combine with an implicit
    /// AND. An empty filter document is rejected.
    pub fn parse_filter(doc: &Document) -> Result<Expression> {
        if doc.is_empty() {
            return Err(MongoraError::validation(
                "EMPTY_FILTER",
                "match filter document is empty",
            ));
        }

        let mut operands = Vec::new();
        for (key, value) in doc {
            if key.starts_with('$') {
                operands.push(Self::parse_filter_operator(key, value)?);
            } else {
                operands.push(Self::parse_field_condition(key, value)?);
            }
        }
        Ok(Self::combine_and(operands))
    }

    /// Expression-context entry.
    pub fn parse_value(value: &Bson) -> Result<Expression> {
        match value {
            Bson::String(s) => {
                if let Some(var) = s.strip_prefix("$$") {
                    Ok(Expression::Variable(var.to_string()))
                } else if s.starts_with('$') {
                    Ok(Expression::FieldPath {
                        path: validate_field_path(s)?,
                        type_hint: None,
                    })
                } else {
                    Ok(Expression::Literal(Bson::String(s.clone())))
                }
            }
            Bson::Document(doc) => Self::parse_value_document(doc),
            other => Ok(Expression::Literal(other.clone())),
        }
    }

    /// Group/bucket/window accumulator argument: `{"$sum": "$amount"}`.
    pub fn parse_accumulator(value: &Bson) -> Result<Expression> {
        let doc = value.as_document().ok_or_else(|| {
            MongoraError::validation("BAD_ACCUMULATOR", "accumulator must be a document")
        })?;
        if doc.len() != 1 {
            return Err(MongoraError::validation(
                "BAD_ACCUMULATOR",
                "accumulator document must have exactly one operator",
            ));
        }
        let (token, arg) = doc.iter().next().unwrap();
        let op = AccumulatorOp::from_token(token)
            .ok_or_else(|| MongoraError::unsupported(token.clone()))?;

        // {$count: {}} takes no argument and counts rows.
        let mut parsed = if op == AccumulatorOp::Count {
            Expression::Literal(Bson::Int32(1))
        } else {
            Self::parse_value(arg)?
        };

        if matches!(op, AccumulatorOp::Sum | AccumulatorOp::Avg) {
            if let Expression::FieldPath { path, .. } = parsed {
                parsed = Expression::FieldPath {
                    path,
                    type_hint: Some(FieldType::Number),
                };
            }
        }

        Ok(Expression::Accumulator {
            op,
            arg: Box::new(parsed),
        })
    }

    fn combine_and(mut operands: Vec<Expression>) -> Expression {
        if operands.len() == 1 {
            operands.pop().unwrap()
        } else {
            Expression::Logical {
                op: LogicalOp::And,
                operands,
            }
        }
    }

    // Top-level filter operators: $and/$or/$nor take arrays of filter
    // documents, $not takes one, $expr switches to expression context.
    fn parse_filter_operator(token: &str, value: &Bson) -> Result<Expression> {
        match token {
            "$and" | "$or" | "$nor" => {
                let op = LogicalOp::from_token(token).unwrap();
                let docs = value.as_array().ok_or_else(|| {
                    MongoraError::validation(
                        "BAD_LOGICAL",
                        format!("{} requires an array of filter documents", token),
                    )
                })?;
                if docs.is_empty() {
                    return Err(MongoraError::validation(
                        "BAD_LOGICAL",
                        format!("{} requires at least one operand", token),
                    ));
                }
                let mut operands = Vec::with_capacity(docs.len());
                for item in docs {
                    let doc = item.as_document().ok_or_else(|| {
                        MongoraError::validation(
                            "BAD_LOGICAL",
                            format!("{} operands must be documents", token),
                        )
                    })?;
                    operands.push(Self::parse_filter(doc)?);
                }
                Ok(Expression::Logical { op, operands })
            }
            "$not" => {
                let doc = value.as_document().ok_or_else(|| {
                    MongoraError::validation(
                        "BAD_NOT",
                        "filter-level $not requires a filter document",
                    )
                })?;
                Ok(Expression::Logical {
                    op: LogicalOp::Not,
                    operands: vec![Self::parse_filter(doc)?],
                })
            }
            "$expr" => Self::parse_value(value),
            other => Err(MongoraError::unsupported(other.to_string())),
        }
    }

    // One `field: condition` entry of a filter document.
    fn parse_field_condition(field: &str, value: &Bson) -> Result<Expression> {
        let path = validate_field_path(field)?;

        let operator_doc = match value {
            Bson::Document(doc) if doc.keys().next().map(|k| k.starts_with('$')).unwrap_or(false) => doc,
            other => {
                // Direct equality, including exact sub-document match.
                return Ok(Expression::Comparison {
                    op: ComparisonOp::Eq,
                    left: Box::new(Expression::field(path)),
                    right: Box::new(Self::parse_value(other)?),
                });
            }
        };

        let mut operands = Vec::new();
        for (op_token, op_value) in operator_doc {
            match op_token.as_str() {
                "$options" => continue, // consumed by $regex below
                "$eq" | "$ne" | "$gt" | "$gte" | "$lt" | "$lte" => {
                    let op = ComparisonOp::from_token(op_token).unwrap();
                    operands.push(Expression::Comparison {
                        op,
                        left: Box::new(Expression::field(path.clone())),
                        right: Box::new(Self::parse_value(op_value)?),
                    });
                }
                "$in" | "$nin" => {
                    let values = op_value.as_array().ok_or_else(|| {
                        MongoraError::validation(
                            "BAD_IN",
                            format!("{} requires an array argument", op_token),
                        )
                    })?;
                    let mut parsed = Vec::with_capacity(values.len());
                    for v in values {
                        parsed.push(Self::parse_value(v)?);
                    }
                    operands.push(Expression::In {
                        target: Box::new(Expression::field(path.clone())),
                        values: parsed,
                        negated: op_token == "$nin",
                    });
                }
                "$exists" => {
                    let must_exist = op_value.as_bool().ok_or_else(|| {
                        MongoraError::validation("BAD_EXISTS", "$exists requires a boolean")
                    })?;
                    operands.push(Expression::Exists {
                        path: path.clone(),
                        must_exist,
                    });
                }
                "$regex" => {
                    let pattern = op_value.as_str().ok_or_else(|| {
                        MongoraError::validation("BAD_REGEX", "$regex requires a string pattern")
                    })?;
                    let options = operator_doc
                        .get("$options")
                        .and_then(|v| v.as_str())
                        .map(|s| s.to_string());
                    operands.push(Expression::RegexMatch {
                        input: Box::new(Expression::field(path.clone())),
                        pattern: Box::new(Expression::Literal(Bson::String(pattern.to_string()))),
                        options,
                    });
                }
                "$not" => {
                    let nested = op_value.as_document().ok_or_else(|| {
                        MongoraError::validation(
                            "BAD_NOT",
                            "field-level $not requires an operator document",
                        )
                    })?;
                    let inner = Self::parse_field_condition(field, &Bson::Document(nested.clone()))?;
                    operands.push(Expression::Logical {
                        op: LogicalOp::Not,
                        operands: vec![inner],
                    });
                }
                "$size" => {
                    let size = Self::parse_value(op_value)?;
                    operands.push(Expression::Comparison {
                        op: ComparisonOp::Eq,
                        left: Box::new(Expression::ArrayFunc {
                            op: ArrayOp::Size,
                            args: vec![Expression::field(path.clone())],
                        }),
                        right: Box::new(size),
                    });
                }
                other => return Err(MongoraError::unsupported(other.to_string())),
            }
        }

        if operands.is_empty() {
            return Err(MongoraError::validation(
                "EMPTY_OPERATOR_DOC",
                format!("no operator for field: {}", sanitize(field)),
            ));
        }
        Ok(Self::combine_and(operands))
    }

    fn parse_value_document(doc: &Document) -> Result<Expression> {
        let first_is_operator = doc.keys().next().map(|k| k.starts_with('$')).unwrap_or(false);

        if !first_is_operator {
            // Inline object constructor; insertion order preserved.
            let mut fields = IndexMap::new();
            for (key, value) in doc {
                validate_field_path(key)?;
                fields.insert(key.clone(), Self::parse_value(value)?);
            }
            return Ok(Expression::InlineObject(fields));
        }

        if doc.len() != 1 {
            return Err(MongoraError::validation(
                "BAD_OPERATOR_DOC",
                "operator application must have exactly one key",
            ));
        }
        let (token, arg) = doc.iter().next().unwrap();
        Self::parse_operator_call(token, arg)
    }

    fn parse_operator_call(token: &str, arg: &Bson) -> Result<Expression> {
        if let Some(op) = ArithmeticOp::from_token(token) {
            return Self::parse_arithmetic(op, token, arg);
        }
        if let Some(op) = ComparisonOp::from_token(token) {
            let args = Self::expect_args(token, arg, 2, 2)?;
            return Ok(Expression::Comparison {
                op,
                left: Box::new(args[0].clone()),
                right: Box::new(args[1].clone()),
            });
        }
        if let Some(op) = DateOp::from_token(token) {
            return Ok(Expression::DateFunc {
                op,
                arg: Box::new(Self::parse_value(arg)?),
            });
        }
        if let Some(target) = ConversionTarget::from_token(token) {
            return Ok(Expression::Convert {
                target,
                input: Box::new(Self::parse_value(arg)?),
                on_error: None,
                on_null: None,
            });
        }

        match token {
            "$and" | "$or" | "$nor" => {
                let op = LogicalOp::from_token(token).unwrap();
                let operands = Self::expect_args(token, arg, 1, usize::MAX)?;
                Ok(Expression::Logical { op, operands })
            }
            "$not" => {
                // Expression-context $not takes a single expression,
                // optionally wrapped in a one-element array.
                let inner = match arg {
                    Bson::Array(items) if items.len() == 1 => Self::parse_value(&items[0])?,
                    Bson::Array(_) => {
                        return Err(MongoraError::validation(
                            "BAD_NOT",
                            "$not takes exactly one operand",
                        ))
                    }
                    other => Self::parse_value(other)?,
                };
                Ok(Expression::Logical {
                    op: LogicalOp::Not,
                    operands: vec![inner],
                })
            }
            "$in" => {
                let args = arg.as_array().ok_or_else(|| {
                    MongoraError::validation("BAD_IN", "$in requires [element, array]")
                })?;
                if args.len() != 2 {
                    return Err(MongoraError::validation(
                        "BAD_IN",
                        "$in requires [element, array]",
                    ));
                }
                let target = Self::parse_value(&args[0])?;
                let values = match &args[1] {
                    Bson::Array(items) => {
                        let mut parsed = Vec::with_capacity(items.len());
                        for v in items {
                            parsed.push(Self::parse_value(v)?);
                        }
                        parsed
                    }
                    _ => {
                        return Err(MongoraError::validation(
                            "BAD_IN",
                            "$in second argument must be an array",
                        ))
                    }
                };
                Ok(Expression::In {
                    target: Box::new(target),
                    values,
                    negated: false,
                })
            }
            "$cond" => Self::parse_cond(arg),
            "$ifNull" => {
                let args = Self::expect_args(token, arg, 2, usize::MAX)?;
                // More than two operands fold left into nested NVLs.
                let mut iter = args.into_iter();
                let mut acc = iter.next().unwrap();
                for replacement in iter {
                    acc = Expression::IfNull {
                        value: Box::new(acc),
                        replacement: Box::new(replacement),
                    };
                }
                Ok(acc)
            }
            "$switch" => Self::parse_switch(arg),
            "$concat" => {
                let args = Self::expect_args(token, arg, 1, usize::MAX)?;
                Ok(Expression::StringFunc {
                    op: StringOp::Concat,
                    args,
                })
            }
            "$toUpper" | "$toLower" | "$strLenCP" | "$strLenBytes" => {
                let op = StringOp::from_token(token).unwrap();
                Ok(Expression::StringFunc {
                    op,
                    args: vec![Self::parse_value(arg)?],
                })
            }
            "$trim" | "$ltrim" | "$rtrim" => {
                let op = StringOp::from_token(token).unwrap();
                let doc = arg.as_document().ok_or_else(|| {
                    MongoraError::validation(
                        "BAD_TRIM",
                        format!("{} requires a document with input", token),
                    )
                })?;
                let input = doc.get("input").ok_or_else(|| {
                    MongoraError::validation("BAD_TRIM", format!("{} requires input", token))
                })?;
                let mut args = vec![Self::parse_value(input)?];
                if let Some(chars) = doc.get("chars") {
                    args.push(Self::parse_value(chars)?);
                }
                Ok(Expression::StringFunc { op, args })
            }
            "$substr" | "$substrCP" | "$substrBytes" => {
                let args = Self::expect_args(token, arg, 3, 3)?;
                Ok(Expression::StringFunc {
                    op: StringOp::Substr,
                    args,
                })
            }
            "$split" => {
                let args = Self::expect_args(token, arg, 2, 2)?;
                Ok(Expression::StringFunc {
                    op: StringOp::Split,
                    args,
                })
            }
            "$indexOfCP" | "$indexOfBytes" => {
                let args = Self::expect_args(token, arg, 2, 2)?;
                Ok(Expression::StringFunc {
                    op: StringOp::IndexOf,
                    args,
                })
            }
            "$regexMatch" | "$regexFind" => {
                let doc = arg.as_document().ok_or_else(|| {
                    MongoraError::validation(
                        "BAD_REGEX",
                        format!("{} requires {{input, regex}}", token),
                    )
                })?;
                let input = doc.get("input").ok_or_else(|| {
                    MongoraError::validation("BAD_REGEX", format!("{} requires input", token))
                })?;
                let regex = doc.get("regex").ok_or_else(|| {
                    MongoraError::validation("BAD_REGEX", format!("{} requires regex", token))
                })?;
                let options = doc.get("options").and_then(|v| v.as_str()).map(|s| s.to_string());
                Ok(Expression::RegexMatch {
                    input: Box::new(Self::parse_value(input)?),
                    pattern: Box::new(Self::parse_value(regex)?),
                    options,
                })
            }
            "$replaceOne" | "$replaceAll" => {
                let doc = arg.as_document().ok_or_else(|| {
                    MongoraError::validation(
                        "BAD_REPLACE",
                        format!("{} requires {{input, find, replacement}}", token),
                    )
                })?;
                let pick = |key: &str| -> Result<Expression> {
                    let value = doc.get(key).ok_or_else(|| {
                        MongoraError::validation(
                            "BAD_REPLACE",
                            format!("{} requires {}", token, key),
                        )
                    })?;
                    Self::parse_value(value)
                };
                Ok(Expression::Replace {
                    input: Box::new(pick("input")?),
                    find: Box::new(pick("find")?),
                    replacement: Box::new(pick("replacement")?),
                    all: token == "$replaceAll",
                })
            }
            "$arrayElemAt" => {
                let args = Self::expect_args(token, arg, 2, 2)?;
                Ok(Expression::ArrayFunc {
                    op: ArrayOp::ElemAt,
                    args,
                })
            }
            "$size" | "$first" | "$last" => {
                let op = ArrayOp::from_token(token).unwrap();
                Ok(Expression::ArrayFunc {
                    op,
                    args: vec![Self::parse_value(arg)?],
                })
            }
            "$concatArrays" => {
                let args = Self::expect_args(token, arg, 1, usize::MAX)?;
                Ok(Expression::ArrayFunc {
                    op: ArrayOp::ConcatArrays,
                    args,
                })
            }
            "$slice" => {
                let args = Self::expect_args(token, arg, 2, 3)?;
                Ok(Expression::ArrayFunc {
                    op: ArrayOp::Slice,
                    args,
                })
            }
            "$filter" => {
                let doc = arg.as_document().ok_or_else(|| {
                    MongoraError::validation("BAD_FILTER", "$filter requires {input, cond}")
                })?;
                let input = doc.get("input").ok_or_else(|| {
                    MongoraError::validation("BAD_FILTER", "$filter requires input")
                })?;
                let cond = doc.get("cond").ok_or_else(|| {
                    MongoraError::validation("BAD_FILTER", "$filter requires cond")
                })?;
                let var = doc
                    .get("as")
                    .and_then(|v| v.as_str())
                    .unwrap_or("this")
                    .to_string();
                Ok(Expression::Filter {
                    input: Box::new(Self::parse_value(input)?),
                    var,
                    cond: Box::new(Self::parse_value(cond)?),
                })
            }
            "$map" => {
                let doc = arg.as_document().ok_or_else(|| {
                    MongoraError::validation("BAD_MAP", "$map requires {input, in}")
                })?;
                let input = doc.get("input").ok_or_else(|| {
                    MongoraError::validation("BAD_MAP", "$map requires input")
                })?;
                let mapping = doc.get("in").ok_or_else(|| {
                    MongoraError::validation("BAD_MAP", "$map requires in")
                })?;
                let var = doc
                    .get("as")
                    .and_then(|v| v.as_str())
                    .unwrap_or("this")
                    .to_string();
                Ok(Expression::Map {
                    input: Box::new(Self::parse_value(input)?),
                    var,
                    mapping: Box::new(Self::parse_value(mapping)?),
                })
            }
            "$reduce" => {
                let doc = arg.as_document().ok_or_else(|| {
                    MongoraError::validation(
                        "BAD_REDUCE",
                        "$reduce requires {input, initialValue, in}",
                    )
                })?;
                let pick = |key: &str| -> Result<Expression> {
                    let value = doc.get(key).ok_or_else(|| {
                        MongoraError::validation(
                            "BAD_REDUCE",
                            format!("$reduce requires {}", key),
                        )
                    })?;
                    Self::parse_value(value)
                };
                Ok(Expression::Reduce {
                    input: Box::new(pick("input")?),
                    initial: Box::new(pick("initialValue")?),
                    combiner: Box::new(pick("in")?),
                })
            }
            "$mergeObjects" => {
                let items = match arg {
                    Bson::Array(items) => {
                        let mut parsed = Vec::with_capacity(items.len());
                        for v in items {
                            parsed.push(Self::parse_value(v)?);
                        }
                        parsed
                    }
                    other => vec![Self::parse_value(other)?],
                };
                Ok(Expression::MergeObjects(items))
            }
            "$literal" => Ok(Expression::Literal(arg.clone())),
            "$type" => Ok(Expression::TypeOf(Box::new(Self::parse_value(arg)?))),
            "$convert" => {
                let doc = arg.as_document().ok_or_else(|| {
                    MongoraError::validation("BAD_CONVERT", "$convert requires {input, to}")
                })?;
                let input = doc.get("input").ok_or_else(|| {
                    MongoraError::validation("BAD_CONVERT", "$convert requires input")
                })?;
                let to = doc
                    .get("to")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        MongoraError::validation("BAD_CONVERT", "$convert requires a to type name")
                    })?;
                let target = ConversionTarget::from_type_name(to).ok_or_else(|| {
                    MongoraError::unsupported(format!("$convert to {}", sanitize(to)))
                })?;
                let on_error = doc
                    .get("onError")
                    .map(Self::parse_value)
                    .transpose()?
                    .map(Box::new);
                let on_null = doc
                    .get("onNull")
                    .map(Self::parse_value)
                    .transpose()?
                    .map(Box::new);
                Ok(Expression::Convert {
                    target,
                    input: Box::new(Self::parse_value(input)?),
                    on_error,
                    on_null,
                })
            }
            // Expression-context $sum/$avg appear inside $project over
            // arrays; route them through the accumulator kind so the
            // renderer can reuse the aggregate forms.
            "$sum" | "$avg" => {
                let op = AccumulatorOp::from_token(token).unwrap();
                Ok(Expression::Accumulator {
                    op,
                    arg: Box::new(Self::parse_value(arg)?),
                })
            }
            other => Err(MongoraError::unsupported(other.to_string())),
        }
    }

    fn parse_arithmetic(op: ArithmeticOp, token: &str, arg: &Bson) -> Result<Expression> {
        let (min, max) = op.arity();
        let operands = match arg {
            Bson::Array(_) => Self::expect_args(token, arg, min, max)?,
            single if op.allows_single_operand() => vec![Self::parse_value(single)?],
            _ => {
                return Err(MongoraError::validation(
                    "BAD_ARITY",
                    format!("{} requires an array argument", token),
                ))
            }
        };
        Ok(Expression::Arithmetic { op, operands })
    }

    fn parse_cond(arg: &Bson) -> Result<Expression> {
        match arg {
            Bson::Array(items) if items.len() == 3 => Ok(Expression::Cond {
                condition: Box::new(Self::parse_value(&items[0])?),
                then_branch: Box::new(Self::parse_value(&items[1])?),
                else_branch: Box::new(Self::parse_value(&items[2])?),
            }),
            Bson::Document(doc) => {
                let pick = |key: &str| -> Result<Expression> {
                    let value = doc.get(key).ok_or_else(|| {
                        MongoraError::validation("BAD_COND", format!("$cond requires {}", key))
                    })?;
                    Self::parse_value(value)
                };
                Ok(Expression::Cond {
                    condition: Box::new(pick("if")?),
                    then_branch: Box::new(pick("then")?),
                    else_branch: Box::new(pick("else")?),
                })
            }
            _ => Err(MongoraError::validation(
                "BAD_COND",
                "$cond requires [if, then, else] or {if, then, else}",
            )),
        }
    }

    fn parse_switch(arg: &Bson) -> Result<Expression> {
        let doc = arg.as_document().ok_or_else(|| {
            MongoraError::validation("BAD_SWITCH", "$switch requires {branches}")
        })?;
        let raw_branches = doc
            .get("branches")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                MongoraError::validation("BAD_SWITCH", "$switch requires a branches array")
            })?;
        if raw_branches.is_empty() {
            return Err(MongoraError::validation(
                "BAD_SWITCH",
                "$switch requires at least one branch",
            ));
        }
        let mut branches = Vec::with_capacity(raw_branches.len());
        for branch in raw_branches {
            let branch_doc = branch.as_document().ok_or_else(|| {
                MongoraError::validation("BAD_SWITCH", "$switch branches must be documents")
            })?;
            let case = branch_doc.get("case").ok_or_else(|| {
                MongoraError::validation("BAD_SWITCH", "$switch branch requires case")
            })?;
            let then = branch_doc.get("then").ok_or_else(|| {
                MongoraError::validation("BAD_SWITCH", "$switch branch requires then")
            })?;
            branches.push((Self::parse_value(case)?, Self::parse_value(then)?));
        }
        let default = doc
            .get("default")
            .map(Self::parse_value)
            .transpose()?
            .map(Box::new);
        Ok(Expression::Switch { branches, default })
    }

    fn expect_args(token: &str, arg: &Bson, min: usize, max: usize) -> Result<Vec<Expression>> {
        let items = arg.as_array().ok_or_else(|| {
            MongoraError::validation(
                "BAD_ARITY",
                format!("{} requires an array argument", token),
            )
        })?;
        if items.len() < min || items.len() > max {
            return Err(MongoraError::validation(
                "BAD_ARITY",
                format!(
                    "{} takes between {} and {} operands, got {}",
                    token,
                    min,
                    if max == usize::MAX { "unbounded".to_string() } else { max.to_string() },
                    items.len()
                ),
            ));
        }
        let mut parsed = Vec::with_capacity(items.len());
        for item in items {
            parsed.push(Self::parse_value(item)?);
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn direct_equality_filter() {
        let expr = ExpressionParser::parse_filter(&doc! { "status": "completed" }).unwrap();
        match expr {
            Expression::Comparison { op, left, right } => {
                assert_eq!(op, ComparisonOp::Eq);
                assert_eq!(*left, Expression::field("status"));
                assert_eq!(*right, Expression::Literal(Bson::String("completed".into())));
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn sibling_conditions_combine_with_and() {
        let expr = ExpressionParser::parse_filter(&doc! {
            "status": "completed",
            "amount": { "$gte": 100 }
        })
        .unwrap();
        match expr {
            Expression::Logical { op, operands } => {
                assert_eq!(op, LogicalOp::And);
                assert_eq!(operands.len(), 2);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn empty_filter_is_rejected() {
        let err = ExpressionParser::parse_filter(&doc! {}).unwrap_err();
        assert!(matches!(err, MongoraError::Validation(_)));
    }

    #[test]
    fn empty_in_list_is_accepted() {
        let expr = ExpressionParser::parse_filter(&doc! {
            "tier": { "$in": [] }
        })
        .unwrap();
        match expr {
            Expression::In { values, negated, .. } => {
                assert!(values.is_empty());
                assert!(!negated);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn in_requires_array() {
        let err = ExpressionParser::parse_filter(&doc! { "tier": { "$in": "gold" } }).unwrap_err();
        assert!(matches!(err, MongoraError::Validation(_)));
    }

    #[test]
    fn unknown_field_operator_is_unsupported() {
        let err = ExpressionParser::parse_filter(&doc! { "loc": { "$near": [0, 0] } }).unwrap_err();
        assert!(matches!(err, MongoraError::UnsupportedOperator(_)));
    }

    #[test]
    fn field_references_strip_one_dollar() {
        let expr = ExpressionParser::parse_value(&Bson::String("$customer.tier".into())).unwrap();
        assert_eq!(expr, Expression::field("customer.tier"));
    }

    #[test]
    fn double_dollar_is_a_variable() {
        let expr = ExpressionParser::parse_value(&Bson::String("$$this".into())).unwrap();
        assert_eq!(expr, Expression::Variable("this".into()));
    }

    #[test]
    fn regex_picks_up_sibling_options() {
        let expr = ExpressionParser::parse_filter(&doc! {
            "name": { "$regex": "^a", "$options": "i" }
        })
        .unwrap();
        match expr {
            Expression::RegexMatch { options, .. } => assert_eq!(options.as_deref(), Some("i")),
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn cond_accepts_both_shapes() {
        let array_form = ExpressionParser::parse_value(&Bson::Document(doc! {
            "$cond": [ { "$gte": ["$qty", 100] }, "bulk", "retail" ]
        }))
        .unwrap();
        let doc_form = ExpressionParser::parse_value(&Bson::Document(doc! {
            "$cond": { "if": { "$gte": ["$qty", 100] }, "then": "bulk", "else": "retail" }
        }))
        .unwrap();
        assert_eq!(array_form, doc_form);
    }

    #[test]
    fn subtract_arity_is_enforced() {
        let err = ExpressionParser::parse_value(&Bson::Document(doc! {
            "$subtract": ["$a"]
        }))
        .unwrap_err();
        assert!(matches!(err, MongoraError::Validation(_)));
    }

    #[test]
    fn abs_accepts_bare_operand() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! { "$abs": "$delta" })).unwrap();
        match expr {
            Expression::Arithmetic { op, operands } => {
                assert_eq!(op, ArithmeticOp::Abs);
                assert_eq!(operands.len(), 1);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn accumulator_sum_field_gets_number_hint() {
        let expr =
            ExpressionParser::parse_accumulator(&Bson::Document(doc! { "$sum": "$amount" })).unwrap();
        match expr {
            Expression::Accumulator { op, arg } => {
                assert_eq!(op, AccumulatorOp::Sum);
                assert_eq!(
                    *arg,
                    Expression::FieldPath {
                        path: "amount".into(),
                        type_hint: Some(FieldType::Number)
                    }
                );
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn inline_object_preserves_order() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! {
            "month": { "$month": "$createdAt" },
            "year": { "$year": "$createdAt" }
        }))
        .unwrap();
        match expr {
            Expression::InlineObject(fields) => {
                let keys: Vec<_> = fields.keys().cloned().collect();
                assert_eq!(keys, vec!["month", "year"]);
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }

    #[test]
    fn convert_parses_handlers() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! {
            "$convert": { "input": "$price", "to": "int", "onError": 0, "onNull": 0 }
        }))
        .unwrap();
        match expr {
            Expression::Convert {
                target,
                on_error,
                on_null,
                ..
            } => {
                assert_eq!(target, ConversionTarget::Int);
                assert!(on_error.is_some());
                assert!(on_null.is_some());
            }
            other => panic!("unexpected parse: {:?}", other),
        }
    }
}
