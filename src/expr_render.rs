/*!
 * @file expr_render.rs
 * @brief Renders expression nodes into Oracle SQL fragments
 */

use bson::Bson;

use crate::config::OracleDialect;
use crate::context::{GenerationContext, VarBinding};
use crate::error::{MongoraError, Result};
use crate::expr::{Expression, FieldType};
use crate::mongora_warn;
use crate::operators::{
    AccumulatorOp, ArithmeticOp, ArrayOp, ComparisonOp, ConversionTarget, DateOp, LogicalOp,
    StringOp,
};

/// Oracle format mask for ISO-8601 timestamps stored as JSON strings.
const ISO_TIMESTAMP_FORMAT: &str = "YYYY-MM-DD\"T\"HH24:MI:SS.FF3TZR";

/// Redact sentinels render as plain string literals, never as variables.
const REDACT_SENTINELS: [&str; 3] = ["PRUNE", "KEEP", "DESCEND"];

/// Emits `name` as a SQL identifier: unquoted when it already follows the
/// all-lowercase identifier grammar, double-quoted otherwise so case and
/// leading underscores survive.
pub fn sql_ident(name: &str) -> String {
    let mut chars = name.chars();
    let plain = matches!(chars.next(), Some(c) if c.is_ascii_lowercase())
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_');
    if plain {
        name.to_string()
    } else {
        format!("\"{}\"", name.replace('"', "\"\""))
    }
}

/// One step of JSON dot notation. Segments that are not plain identifiers
/// (leading underscore, leading digit) need double quotes.
fn dot_segment(segment: &str) -> String {
    let mut chars = segment.chars();
    let plain = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if plain {
        segment.to_string()
    } else {
        format!("\"{}\"", segment)
    }
}

fn dot_path(path: &str) -> String {
    path.split('.').map(dot_segment).collect::<Vec<_>>().join(".")
}

pub fn json_path(path: &str) -> String {
    format!("$.{}", path)
}

/// Strict mode raises UnsupportedOperator; otherwise a comment-annotated
/// NULL keeps the surrounding SQL well-formed.
pub fn unsupported_placeholder(token: &str, ctx: &mut GenerationContext) -> Result<()> {
    if ctx.options.strict {
        return Err(MongoraError::unsupported(token.to_string()));
    }
    mongora_warn!("emitting placeholder for unsupported operator {}", token);
    ctx.push(&format!("/* unsupported: {} */ NULL", token));
    Ok(())
}

/// JSON_TABLE column clause for a single JSON-typed value column.
fn json_table_value_column(ctx: &GenerationContext) -> &'static str {
    match ctx.config.dialect {
        OracleDialect::Extended => "val JSON PATH '$'",
        OracleDialect::Base => "val FORMAT JSON PATH '$'",
    }
}

/// Renders a document access on `alias.<data>` for the remainder path, in
/// whatever access style the dialect and output mode require.
pub(crate) fn render_document_access(
    alias: &str,
    path: Option<&str>,
    hint: Option<FieldType>,
    ctx: &mut GenerationContext,
) {
    let data = ctx.data_column().to_string();
    let Some(path) = path else {
        ctx.push(&format!("{}.{}", alias, data));
        return;
    };

    if ctx.in_json_output() {
        ctx.push(&format!(
            "JSON_QUERY({}.{}, '{}')",
            alias,
            data,
            json_path(path)
        ));
        return;
    }

    match ctx.config.dialect {
        OracleDialect::Extended => {
            ctx.push(&format!("{}.{}.{}", alias, data, dot_path(path)));
        }
        OracleDialect::Base => {
            let access = format!("JSON_VALUE({}.{}, '{}')", alias, data, json_path(path));
            if hint == Some(FieldType::Number) {
                ctx.push(&format!("TO_NUMBER({})", access));
            } else {
                ctx.push(&access);
            }
        }
    }
}

/// Field-path resolution chain: unwind registry, wrapped-query column
/// scope, virtual fields from `$addFields`, lookup joins, then plain JSON
/// access on the base row.
pub fn render_field_access(
    path: &str,
    hint: Option<FieldType>,
    ctx: &mut GenerationContext,
) -> Result<()> {
    if let Some(sql) = ctx.raw_column(path) {
        ctx.push(&sql);
        return Ok(());
    }

    if let Some((alias, rest)) = ctx.unwind_for_path(path) {
        render_document_access(&alias, rest.as_deref(), hint, ctx);
        return Ok(());
    }

    if let Some((alias, column)) = ctx.resolve_column(path) {
        if alias.is_empty() {
            ctx.push(&sql_ident(&column));
        } else {
            ctx.push(&format!("{}.{}", alias, sql_ident(&column)));
        }
        return Ok(());
    }

    if let Some(expr) = ctx.virtual_field(path) {
        return render_expr(&expr, ctx);
    }

    if let Some((binding, rest)) = ctx.lookup_for_path(path) {
        let alias = binding.alias.clone();
        render_document_access(&alias, rest.as_deref(), hint, ctx);
        return Ok(());
    }

    let alias = ctx.base_alias();
    render_document_access(&alias, Some(path), hint, ctx);
    Ok(())
}

pub fn render_expr(expr: &Expression, ctx: &mut GenerationContext) -> Result<()> {
    match expr {
        Expression::Literal(value) => ctx.push_value(value.clone()),
        Expression::FieldPath { path, type_hint } => render_field_access(path, *type_hint, ctx),
        Expression::Variable(name) => render_variable(name, ctx),
        Expression::Comparison { op, left, right } => {
            render_expr(left, ctx)?;
            ctx.push(&format!(" {} ", op.sql_symbol()));
            render_expr(right, ctx)
        }
        Expression::In {
            target,
            values,
            negated,
        } => render_in(target, values, *negated, ctx),
        Expression::Logical { op, operands } => render_logical(*op, operands, ctx),
        Expression::Arithmetic { op, operands } => render_arithmetic(*op, operands, ctx),
        Expression::Cond {
            condition,
            then_branch,
            else_branch,
        } => {
            ctx.push("CASE WHEN ");
            render_expr(condition, ctx)?;
            ctx.push(" THEN ");
            render_expr(then_branch, ctx)?;
            ctx.push(" ELSE ");
            render_expr(else_branch, ctx)?;
            ctx.push(" END");
            Ok(())
        }
        Expression::IfNull { value, replacement } => {
            ctx.push("NVL(");
            render_expr(value, ctx)?;
            ctx.push(", ");
            render_expr(replacement, ctx)?;
            ctx.push(")");
            Ok(())
        }
        Expression::Switch { branches, default } => {
            ctx.push("CASE");
            for (case, then) in branches {
                ctx.push(" WHEN ");
                render_expr(case, ctx)?;
                ctx.push(" THEN ");
                render_expr(then, ctx)?;
            }
            if let Some(default) = default {
                ctx.push(" ELSE ");
                render_expr(default, ctx)?;
            }
            ctx.push(" END");
            Ok(())
        }
        Expression::StringFunc { op, args } => render_string_func(*op, args, ctx),
        Expression::RegexMatch {
            input,
            pattern,
            options,
        } => render_regex_match(input, pattern, options.as_deref(), ctx),
        Expression::Replace {
            input,
            find,
            replacement,
            all,
        } => render_replace(input, find, replacement, *all, ctx),
        Expression::DateFunc { op, arg } => render_date_func(*op, arg, ctx),
        Expression::ArrayFunc { op, args } => render_array_func(*op, args, ctx),
        Expression::Filter { input, var, cond } => render_filter(input, var, cond, ctx),
        Expression::Map {
            input,
            var,
            mapping,
        } => render_map(input, var, mapping, ctx),
        Expression::Reduce {
            input,
            initial,
            combiner,
        } => render_reduce(input, initial, combiner, ctx),
        Expression::MergeObjects(items) => render_merge_objects(items, ctx),
        Expression::Accumulator { op, arg } => render_accumulator(*op, arg, ctx),
        Expression::Convert {
            target,
            input,
            on_error,
            on_null,
        } => render_convert(*target, input, on_error.as_deref(), on_null.as_deref(), ctx),
        Expression::TypeOf(inner) => render_type_of(inner, ctx),
        Expression::Exists { path, must_exist } => {
            if !must_exist {
                ctx.push("NOT ");
            }
            let data = ctx.data_column().to_string();
            ctx.push(&format!(
                "JSON_EXISTS({}.{}, '{}')",
                ctx.base_alias(),
                data,
                json_path(path)
            ));
            Ok(())
        }
        Expression::InlineObject(fields) => {
            ctx.push("JSON_OBJECT(");
            ctx.enter_json_output();
            let result = (|| -> Result<()> {
                for (i, (name, value)) in fields.iter().enumerate() {
                    if i > 0 {
                        ctx.push(", ");
                    }
                    ctx.push(&format!("'{}' VALUE ", name.replace('\'', "''")));
                    render_expr(value, ctx)?;
                }
                Ok(())
            })();
            ctx.exit_json_output();
            result?;
            ctx.push(")");
            Ok(())
        }
        // In bare expression position a compound key renders as its
        // comma-separated parts (the GROUP BY form); the SELECT list gives
        // each part its own alias in the pipeline renderer.
        Expression::CompoundId(fields) => {
            for (i, (_, value)) in fields.iter().enumerate() {
                if i > 0 {
                    ctx.push(", ");
                }
                render_expr(value, ctx)?;
            }
            Ok(())
        }
    }
}

fn render_variable(name: &str, ctx: &mut GenerationContext) -> Result<()> {
    if REDACT_SENTINELS.contains(&name) {
        ctx.push(&format!("'$${}'", name));
        return Ok(());
    }
    match ctx.variable(name) {
        Some(VarBinding::Column(sql)) => {
            ctx.push(&sql);
            Ok(())
        }
        Some(VarBinding::Expr(expr)) => {
            // Let-binding expressions evaluate in the scope that declared
            // them, one alias level up from the lateral body.
            let saved = ctx.suspend_base_alias();
            let result = render_expr(&expr, ctx);
            ctx.restore_base_alias(saved);
            result
        }
        None => Err(MongoraError::translation(format!(
            "unbound variable $${}",
            name
        ))),
    }
}

fn render_in(
    target: &Expression,
    values: &[Expression],
    negated: bool,
    ctx: &mut GenerationContext,
) -> Result<()> {
    if values.is_empty() {
        // Nothing is in the empty set.
        ctx.push(if negated { "1=1" } else { "1=0" });
        return Ok(());
    }
    render_expr(target, ctx)?;
    ctx.push(if negated { " NOT IN (" } else { " IN (" });
    for (i, value) in values.iter().enumerate() {
        if i > 0 {
            ctx.push(", ");
        }
        render_expr(value, ctx)?;
    }
    ctx.push(")");
    Ok(())
}

fn render_logical(
    op: LogicalOp,
    operands: &[Expression],
    ctx: &mut GenerationContext,
) -> Result<()> {
    match op {
        LogicalOp::Not => {
            ctx.push("NOT (");
            render_expr(&operands[0], ctx)?;
            ctx.push(")");
            Ok(())
        }
        LogicalOp::And | LogicalOp::Or => {
            // Single-operand conjunctions collapse to the operand alone.
            if operands.len() == 1 {
                return render_expr(&operands[0], ctx);
            }
            let joiner = if op == LogicalOp::And { " AND " } else { " OR " };
            ctx.push("(");
            for (i, operand) in operands.iter().enumerate() {
                if i > 0 {
                    ctx.push(joiner);
                }
                render_expr(operand, ctx)?;
            }
            ctx.push(")");
            Ok(())
        }
        LogicalOp::Nor => {
            ctx.push("NOT (");
            for (i, operand) in operands.iter().enumerate() {
                if i > 0 {
                    ctx.push(" OR ");
                }
                render_expr(operand, ctx)?;
            }
            ctx.push(")");
            Ok(())
        }
    }
}

fn render_arithmetic(
    op: ArithmeticOp,
    operands: &[Expression],
    ctx: &mut GenerationContext,
) -> Result<()> {
    if let Some(symbol) = op.infix_symbol() {
        if operands.len() == 1 {
            return render_expr(&operands[0], ctx);
        }
        ctx.push("(");
        for (i, operand) in operands.iter().enumerate() {
            if i > 0 {
                ctx.push(&format!(" {} ", symbol));
            }
            render_expr(operand, ctx)?;
        }
        ctx.push(")");
        return Ok(());
    }

    ctx.push(op.function_name());
    ctx.push("(");
    for (i, operand) in operands.iter().enumerate() {
        if i > 0 {
            ctx.push(", ");
        }
        render_expr(operand, ctx)?;
    }
    ctx.push(")");
    Ok(())
}

fn render_string_func(
    op: StringOp,
    args: &[Expression],
    ctx: &mut GenerationContext,
) -> Result<()> {
    match op {
        StringOp::ToUpper | StringOp::ToLower | StringOp::StrLen => {
            let name = match op {
                StringOp::ToUpper => "UPPER",
                StringOp::ToLower => "LOWER",
                _ => "LENGTH",
            };
            ctx.push(name);
            ctx.push("(");
            render_expr(&args[0], ctx)?;
            ctx.push(")");
            Ok(())
        }
        StringOp::Trim | StringOp::Ltrim | StringOp::Rtrim => {
            if args.len() == 1 {
                let name = match op {
                    StringOp::Trim => "TRIM",
                    StringOp::Ltrim => "LTRIM",
                    _ => "RTRIM",
                };
                ctx.push(name);
                ctx.push("(");
                render_expr(&args[0], ctx)?;
                ctx.push(")");
                return Ok(());
            }
            // With a character set, TRIM becomes LTRIM(RTRIM(..)).
            match op {
                StringOp::Trim => {
                    ctx.push("LTRIM(RTRIM(");
                    render_expr(&args[0], ctx)?;
                    ctx.push(", ");
                    render_expr(&args[1], ctx)?;
                    ctx.push("), ");
                    render_expr(&args[1], ctx)?;
                    ctx.push(")");
                }
                StringOp::Ltrim => {
                    ctx.push("LTRIM(");
                    render_expr(&args[0], ctx)?;
                    ctx.push(", ");
                    render_expr(&args[1], ctx)?;
                    ctx.push(")");
                }
                _ => {
                    ctx.push("RTRIM(");
                    render_expr(&args[0], ctx)?;
                    ctx.push(", ");
                    render_expr(&args[1], ctx)?;
                    ctx.push(")");
                }
            }
            Ok(())
        }
        StringOp::Concat => {
            ctx.push("(");
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    ctx.push(" || ");
                }
                render_expr(arg, ctx)?;
            }
            ctx.push(")");
            Ok(())
        }
        StringOp::Substr => {
            // Source positions are zero-based.
            ctx.push("SUBSTR(");
            render_expr(&args[0], ctx)?;
            ctx.push(", (");
            render_expr(&args[1], ctx)?;
            ctx.push(") + 1, ");
            render_expr(&args[2], ctx)?;
            ctx.push(")");
            Ok(())
        }
        StringOp::IndexOf => {
            // INSTR is one-based with 0 for no match; shifting by one
            // matches the source's zero-based, -1-for-missing contract.
            ctx.push("(INSTR(");
            render_expr(&args[0], ctx)?;
            ctx.push(", ");
            render_expr(&args[1], ctx)?;
            ctx.push(") - 1)");
            Ok(())
        }
        StringOp::Split => {
            let jt = ctx.next_alias();
            ctx.push("(SELECT JSON_ARRAYAGG(REGEXP_SUBSTR(");
            render_expr(&args[0], ctx)?;
            ctx.push(", '[^' || ");
            render_expr(&args[1], ctx)?;
            ctx.push(&format!(
                " || ']+', 1, {jt}.n) ORDER BY {jt}.n) FROM (SELECT LEVEL AS n FROM DUAL CONNECT BY LEVEL <= REGEXP_COUNT("
            ));
            render_expr(&args[0], ctx)?;
            ctx.push(", '[^' || ");
            render_expr(&args[1], ctx)?;
            ctx.push(&format!(" || ']+')) {jt})"));
            Ok(())
        }
    }
}

/// Maps source regex flags onto Oracle REGEXP match parameters; unknown
/// flags are dropped.
fn regex_match_parameters(options: &str) -> String {
    options
        .chars()
        .filter_map(|c| match c {
            'i' => Some('i'),
            'm' => Some('m'),
            's' => Some('n'),
            _ => None,
        })
        .collect()
}

fn render_regex_match(
    input: &Expression,
    pattern: &Expression,
    options: Option<&str>,
    ctx: &mut GenerationContext,
) -> Result<()> {
    ctx.push("REGEXP_LIKE(");
    render_expr(input, ctx)?;
    ctx.push(", ");
    render_expr(pattern, ctx)?;
    if let Some(options) = options {
        let params = regex_match_parameters(options);
        if !params.is_empty() {
            ctx.push(&format!(", '{}'", params));
        }
    }
    ctx.push(")");
    Ok(())
}

fn render_replace(
    input: &Expression,
    find: &Expression,
    replacement: &Expression,
    all: bool,
    ctx: &mut GenerationContext,
) -> Result<()> {
    if all {
        ctx.push("REPLACE(");
        render_expr(input, ctx)?;
        ctx.push(", ");
        render_expr(find, ctx)?;
        ctx.push(", ");
        render_expr(replacement, ctx)?;
        ctx.push(")");
    } else {
        // First occurrence only; REGEXP_REPLACE treats the needle as a
        // pattern, so metacharacters in find behave as regex syntax.
        ctx.push("REGEXP_REPLACE(");
        render_expr(input, ctx)?;
        ctx.push(", ");
        render_expr(find, ctx)?;
        ctx.push(", ");
        render_expr(replacement, ctx)?;
        ctx.push(", 1, 1)");
    }
    Ok(())
}

fn render_timestamp_coercion(arg: &Expression, ctx: &mut GenerationContext) -> Result<()> {
    ctx.push("TO_TIMESTAMP_TZ(");
    render_expr(arg, ctx)?;
    ctx.push(&format!(", '{}')", ISO_TIMESTAMP_FORMAT));
    Ok(())
}

fn render_date_func(op: DateOp, arg: &Expression, ctx: &mut GenerationContext) -> Result<()> {
    if let Some(field) = op.extract_field() {
        ctx.push(&format!("EXTRACT({} FROM ", field));
        render_timestamp_coercion(arg, ctx)?;
        ctx.push(")");
        return Ok(());
    }
    let format = op.to_char_format().unwrap();
    ctx.push("TO_NUMBER(TO_CHAR(");
    render_timestamp_coercion(arg, ctx)?;
    ctx.push(&format!(", '{}'))", format));
    Ok(())
}

/// Literal (non-negative or -1) array index, when statically known.
fn literal_index(expr: &Expression) -> Option<i64> {
    match expr {
        Expression::Literal(Bson::Int32(i)) => Some(*i as i64),
        Expression::Literal(Bson::Int64(i)) => Some(*i),
        Expression::Literal(Bson::Double(f)) if f.fract() == 0.0 => Some(*f as i64),
        _ => None,
    }
}

fn render_array_func(
    op: ArrayOp,
    args: &[Expression],
    ctx: &mut GenerationContext,
) -> Result<()> {
    match op {
        ArrayOp::Size => render_array_size(&args[0], ctx),
        ArrayOp::ElemAt => {
            let Some(index) = literal_index(&args[1]) else {
                return unsupported_placeholder("$arrayElemAt with dynamic index", ctx);
            };
            let step = if index >= 0 {
                format!("[{}]", index)
            } else if index == -1 {
                "[last]".to_string()
            } else {
                format!("[last{}]", index + 1)
            };
            render_json_query_step(&args[0], &step, ctx)
        }
        ArrayOp::First => render_json_query_step(&args[0], "[0]", ctx),
        ArrayOp::Last => render_json_query_step(&args[0], "[last]", ctx),
        ArrayOp::Slice => render_slice(args, ctx),
        ArrayOp::ConcatArrays => {
            let jt = ctx.next_alias();
            let union_alias = ctx.next_alias();
            let column = json_table_value_column(ctx);
            ctx.push(&format!(
                "COALESCE((SELECT JSON_ARRAYAGG({union_alias}.val) FROM ("
            ));
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    ctx.push(" UNION ALL ");
                }
                ctx.push(&format!("SELECT {jt}.val FROM JSON_TABLE("));
                render_expr(arg, ctx)?;
                ctx.push(&format!(", '$[*]' COLUMNS ({column})) {jt}"));
            }
            ctx.push(&format!(") {union_alias}), JSON_ARRAY())"));
            Ok(())
        }
    }
}

/// `$size` over a lookup's as-field renders a correlated COUNT and marks
/// the join consumed; anything else goes through the JSON `size()` item
/// method.
fn render_array_size(arg: &Expression, ctx: &mut GenerationContext) -> Result<()> {
    if let Expression::FieldPath { path, .. } = arg {
        let lookup = ctx.lookup_for_path(path).and_then(|(binding, rest)| {
            if rest.is_none() {
                Some(binding.clone())
            } else {
                None
            }
        });
        if let Some(binding) = lookup {
            ctx.consume_lookup(path);
            let count_alias = ctx.next_alias();
            let table = ctx.config.qualified_table(&binding.from);
            let saved = ctx.suspend_json_output();
            ctx.push(&format!(
                "(SELECT COUNT(*) FROM {table} {count_alias} WHERE "
            ));
            render_document_access(&count_alias, Some(&binding.foreign_field), None, ctx);
            ctx.push(" = ");
            let joined = render_field_access(&binding.local_field, None, ctx);
            ctx.push(")");
            ctx.restore_json_output(saved);
            joined?;
            return Ok(());
        }

        let data = ctx.data_column().to_string();
        let suffix = match ctx.config.dialect {
            OracleDialect::Extended => " RETURNING NUMBER)",
            OracleDialect::Base => ")",
        };
        ctx.push(&format!(
            "JSON_VALUE({}.{}, '{}.size()'{}",
            ctx.base_alias(),
            data,
            json_path(path),
            suffix
        ));
        return Ok(());
    }

    ctx.push("JSON_VALUE(");
    render_expr(arg, ctx)?;
    ctx.push(", '$.size()')");
    Ok(())
}

/// JSON_QUERY with a path step applied to an array-valued target.
fn render_json_query_step(
    target: &Expression,
    step: &str,
    ctx: &mut GenerationContext,
) -> Result<()> {
    if let Expression::FieldPath { path, .. } = target {
        let data = ctx.data_column().to_string();
        ctx.push(&format!(
            "JSON_QUERY({}.{}, '{}{}')",
            ctx.base_alias(),
            data,
            json_path(path),
            step
        ));
        return Ok(());
    }
    ctx.push("JSON_QUERY(");
    render_expr(target, ctx)?;
    ctx.push(&format!(", '${}')", step));
    Ok(())
}

fn render_slice(args: &[Expression], ctx: &mut GenerationContext) -> Result<()> {
    let step = if args.len() == 2 {
        let Some(n) = literal_index(&args[1]) else {
            return unsupported_placeholder("$slice with dynamic count", ctx);
        };
        if n >= 0 {
            format!("[0 to {}]", n - 1)
        } else {
            format!("[last{} to last]", n + 1)
        }
    } else {
        let (Some(position), Some(n)) = (literal_index(&args[1]), literal_index(&args[2])) else {
            return unsupported_placeholder("$slice with dynamic bounds", ctx);
        };
        if position < 0 || n < 1 {
            return unsupported_placeholder("$slice with negative position", ctx);
        }
        format!("[{} to {}]", position, position + n - 1)
    };
    render_json_query_step(&args[0], &step, ctx)
}

fn render_filter(
    input: &Expression,
    var: &str,
    cond: &Expression,
    ctx: &mut GenerationContext,
) -> Result<()> {
    let jt = ctx.next_alias();
    let column = json_table_value_column(ctx);
    ctx.push(&format!("COALESCE((SELECT JSON_ARRAYAGG({jt}.val) FROM JSON_TABLE("));
    render_expr(input, ctx)?;
    ctx.push(&format!(", '$[*]' COLUMNS ({column})) {jt} WHERE "));
    ctx.bind_variable(var.to_string(), VarBinding::Column(format!("{jt}.val")));
    let result = render_expr(cond, ctx);
    ctx.unbind_variable(var);
    result?;
    ctx.push("), JSON_ARRAY())");
    Ok(())
}

fn render_map(
    input: &Expression,
    var: &str,
    mapping: &Expression,
    ctx: &mut GenerationContext,
) -> Result<()> {
    let jt = ctx.next_alias();
    let column = json_table_value_column(ctx);
    ctx.push("COALESCE((SELECT JSON_ARRAYAGG(");
    ctx.bind_variable(var.to_string(), VarBinding::Column(format!("{jt}.val")));
    let result = (|| -> Result<()> {
        render_expr(mapping, ctx)?;
        ctx.push(") FROM JSON_TABLE(");
        render_expr(input, ctx)?;
        Ok(())
    })();
    ctx.unbind_variable(var);
    result?;
    ctx.push(&format!(", '$[*]' COLUMNS ({column})) {jt}), JSON_ARRAY())"));
    Ok(())
}

/// `$reduce` translates only for the recognisable sum and string-concat
/// combiners; everything else is a documented gap.
fn render_reduce(
    input: &Expression,
    initial: &Expression,
    combiner: &Expression,
    ctx: &mut GenerationContext,
) -> Result<()> {
    if let Some(term) = reduce_sum_term(combiner) {
        let jt = ctx.next_alias();
        let column = json_table_value_column(ctx);
        ctx.push("COALESCE((SELECT SUM(");
        ctx.bind_variable("this".to_string(), VarBinding::Column(format!("{jt}.val")));
        let result = render_expr(term, ctx);
        ctx.unbind_variable("this");
        result?;
        ctx.push(") FROM JSON_TABLE(");
        render_expr(input, ctx)?;
        ctx.push(&format!(", '$[*]' COLUMNS ({column})) {jt}), "));
        render_expr(initial, ctx)?;
        ctx.push(")");
        return Ok(());
    }

    if let Some(parts) = reduce_concat_terms(combiner) {
        let jt = ctx.next_alias();
        let column = json_table_value_column(ctx);
        ctx.push("(SELECT LISTAGG(");
        ctx.bind_variable("this".to_string(), VarBinding::Column(format!("{jt}.val")));
        let result = (|| -> Result<()> {
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    ctx.push(" || ");
                }
                render_expr(part, ctx)?;
            }
            Ok(())
        })();
        ctx.unbind_variable("this");
        result?;
        ctx.push(&format!(
            ") WITHIN GROUP (ORDER BY {jt}.idx) FROM JSON_TABLE("
        ));
        render_expr(input, ctx)?;
        ctx.push(&format!(
            ", '$[*]' COLUMNS (idx FOR ORDINALITY, {column})) {jt})"
        ));
        return Ok(());
    }

    unsupported_placeholder("$reduce", ctx)
}

/// `{$add: ["$$value", term]}` (either operand order) where the term does
/// not itself use the accumulator.
fn reduce_sum_term(combiner: &Expression) -> Option<&Expression> {
    let Expression::Arithmetic { op, operands } = combiner else {
        return None;
    };
    if *op != ArithmeticOp::Add || operands.len() != 2 {
        return None;
    }
    let is_value = |e: &Expression| matches!(e, Expression::Variable(name) if name == "value");
    let term = if is_value(&operands[0]) {
        &operands[1]
    } else if is_value(&operands[1]) {
        &operands[0]
    } else {
        return None;
    };
    if is_value(term) {
        return None;
    }
    Some(term)
}

/// `{$concat: ["$$value", parts...]}` where the accumulator leads.
fn reduce_concat_terms(combiner: &Expression) -> Option<&[Expression]> {
    let Expression::StringFunc { op, args } = combiner else {
        return None;
    };
    if *op != StringOp::Concat || args.len() < 2 {
        return None;
    }
    if !matches!(&args[0], Expression::Variable(name) if name == "value") {
        return None;
    }
    Some(&args[1..])
}

fn render_merge_objects(items: &[Expression], ctx: &mut GenerationContext) -> Result<()> {
    if items.is_empty() {
        ctx.push("JSON_OBJECT()");
        return Ok(());
    }
    if items.len() == 1 {
        return render_expr(&items[0], ctx);
    }
    // Left fold: JSON_MERGEPATCH(JSON_MERGEPATCH(a, b), c)
    for _ in 1..items.len() {
        ctx.push("JSON_MERGEPATCH(");
    }
    render_expr(&items[0], ctx)?;
    for item in &items[1..] {
        ctx.push(", ");
        render_expr(item, ctx)?;
        ctx.push(")");
    }
    Ok(())
}

fn is_literal_one(expr: &Expression) -> bool {
    match expr {
        Expression::Literal(Bson::Int32(1)) | Expression::Literal(Bson::Int64(1)) => true,
        Expression::Literal(Bson::Double(f)) => *f == 1.0,
        _ => false,
    }
}

fn render_accumulator(
    op: AccumulatorOp,
    arg: &Expression,
    ctx: &mut GenerationContext,
) -> Result<()> {
    match op {
        AccumulatorOp::Count => {
            ctx.push("COUNT(*)");
            Ok(())
        }
        AccumulatorOp::Sum if is_literal_one(arg) => {
            ctx.push("COUNT(*)");
            Ok(())
        }
        AccumulatorOp::Sum | AccumulatorOp::Avg | AccumulatorOp::Min | AccumulatorOp::Max => {
            let name = match op {
                AccumulatorOp::Sum => "SUM",
                AccumulatorOp::Avg => "AVG",
                AccumulatorOp::Min => "MIN",
                _ => "MAX",
            };
            ctx.push(name);
            ctx.push("(");
            render_expr(arg, ctx)?;
            ctx.push(")");
            Ok(())
        }
        AccumulatorOp::First | AccumulatorOp::Last => {
            // Document order stands in for the identity column ordering.
            let keep = if op == AccumulatorOp::First {
                ("MIN", "FIRST")
            } else {
                ("MAX", "LAST")
            };
            ctx.push(keep.0);
            ctx.push("(");
            render_expr(arg, ctx)?;
            let id = ctx.id_column().to_string();
            ctx.push(&format!(
                ") KEEP (DENSE_RANK {} ORDER BY {}.{})",
                keep.1,
                ctx.base_alias(),
                id
            ));
            Ok(())
        }
        AccumulatorOp::Push => {
            ctx.push("JSON_ARRAYAGG(");
            render_expr(arg, ctx)?;
            ctx.push(")");
            Ok(())
        }
        AccumulatorOp::AddToSet => {
            ctx.push("JSON_ARRAYAGG(DISTINCT ");
            render_expr(arg, ctx)?;
            ctx.push(")");
            Ok(())
        }
    }
}

fn render_convert(
    target: ConversionTarget,
    input: &Expression,
    on_error: Option<&Expression>,
    on_null: Option<&Expression>,
    ctx: &mut GenerationContext,
) -> Result<()> {
    // onNull wraps the input before conversion.
    let render_input = |ctx: &mut GenerationContext| -> Result<()> {
        if let Some(on_null) = on_null {
            ctx.push("NVL(");
            render_expr(input, ctx)?;
            ctx.push(", ");
            render_expr(on_null, ctx)?;
            ctx.push(")");
        } else {
            render_expr(input, ctx)?;
        }
        Ok(())
    };
    let render_on_error = |ctx: &mut GenerationContext| -> Result<()> {
        if let Some(on_error) = on_error {
            ctx.push(" DEFAULT ");
            render_expr(on_error, ctx)?;
            ctx.push(" ON CONVERSION ERROR");
        }
        Ok(())
    };

    match target {
        ConversionTarget::Int | ConversionTarget::Long => {
            ctx.push("TRUNC(TO_NUMBER(");
            render_input(ctx)?;
            render_on_error(ctx)?;
            ctx.push("))");
        }
        ConversionTarget::Double | ConversionTarget::Decimal => {
            ctx.push("TO_NUMBER(");
            render_input(ctx)?;
            render_on_error(ctx)?;
            ctx.push(")");
        }
        ConversionTarget::String => {
            ctx.push("TO_CHAR(");
            render_input(ctx)?;
            ctx.push(")");
        }
        ConversionTarget::Bool => {
            ctx.push("CASE WHEN (");
            render_input(ctx)?;
            ctx.push(") IS NULL THEN NULL WHEN TO_CHAR(");
            render_input(ctx)?;
            ctx.push(") IN ('true', '1') THEN TRUE ELSE FALSE END");
        }
        ConversionTarget::Date => {
            ctx.push("TO_TIMESTAMP_TZ(");
            render_input(ctx)?;
            render_on_error(ctx)?;
            ctx.push(&format!(", '{}')", ISO_TIMESTAMP_FORMAT));
        }
    }
    Ok(())
}

fn render_type_of(inner: &Expression, ctx: &mut GenerationContext) -> Result<()> {
    if let Expression::FieldPath { path, .. } = inner {
        let data = ctx.data_column().to_string();
        ctx.push(&format!(
            "JSON_VALUE({}.{}, '{}.type()')",
            ctx.base_alias(),
            data,
            json_path(path)
        ));
        return Ok(());
    }
    unsupported_placeholder("$type over a computed value", ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TranslateOptions, TranslatorConfig};
    use crate::expr_parser::ExpressionParser;
    use bson::doc;

    fn render(expr: &Expression) -> (String, Vec<Bson>) {
        let config = TranslatorConfig::new("orders");
        let options = TranslateOptions::default();
        let mut ctx = GenerationContext::new(&config, &options);
        render_expr(expr, &mut ctx).unwrap();
        ctx.finish()
    }

    fn render_filter_doc(filter: bson::Document) -> (String, Vec<Bson>) {
        let expr = ExpressionParser::parse_filter(&filter).unwrap();
        render(&expr)
    }

    #[test]
    fn equality_uses_dot_notation_and_bind() {
        let (sql, binds) = render_filter_doc(doc! { "status": "completed" });
        assert_eq!(sql, "base.data.status = :1");
        assert_eq!(binds, vec![Bson::String("completed".into())]);
    }

    #[test]
    fn quoted_segment_for_underscore_names() {
        let (sql, _) = render_filter_doc(doc! { "_id": 7 });
        assert_eq!(sql, "base.data.\"_id\" = :1");
    }

    #[test]
    fn empty_in_renders_false() {
        let (sql, binds) = render_filter_doc(doc! { "tier": { "$in": [] } });
        assert_eq!(sql, "1=0");
        assert!(binds.is_empty());
        let (sql, _) = render_filter_doc(doc! { "tier": { "$nin": [] } });
        assert_eq!(sql, "1=1");
    }

    #[test]
    fn in_list_binds_in_order() {
        let (sql, binds) = render_filter_doc(doc! { "tier": { "$in": ["gold", "silver"] } });
        assert_eq!(sql, "base.data.tier IN (:1, :2)");
        assert_eq!(binds.len(), 2);
    }

    #[test]
    fn implicit_and_keeps_filter_order() {
        let (sql, binds) = render_filter_doc(doc! {
            "status": "completed",
            "amount": { "$gte": 100 }
        });
        assert_eq!(sql, "(base.data.status = :1 AND base.data.amount >= :2)");
        assert_eq!(binds[0], Bson::String("completed".into()));
        assert_eq!(binds[1], Bson::Int32(100));
    }

    #[test]
    fn booleans_render_inline() {
        let (sql, binds) = render_filter_doc(doc! { "active": true });
        assert_eq!(sql, "base.data.active = TRUE");
        assert!(binds.is_empty());
    }

    #[test]
    fn exists_uses_json_exists() {
        let (sql, _) = render_filter_doc(doc! { "email": { "$exists": true } });
        assert_eq!(sql, "JSON_EXISTS(base.data, '$.email')");
        let (sql, _) = render_filter_doc(doc! { "email": { "$exists": false } });
        assert_eq!(sql, "NOT JSON_EXISTS(base.data, '$.email')");
    }

    #[test]
    fn cond_renders_case_when() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! {
            "$cond": { "if": { "$gte": ["$qty", 100] }, "then": "bulk", "else": "retail" }
        }))
        .unwrap();
        let (sql, binds) = render(&expr);
        assert_eq!(
            sql,
            "CASE WHEN base.data.qty >= :1 THEN :2 ELSE :3 END"
        );
        assert_eq!(binds.len(), 3);
    }

    #[test]
    fn if_null_renders_nvl() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! {
            "$ifNull": ["$nickname", "anonymous"]
        }))
        .unwrap();
        let (sql, _) = render(&expr);
        assert_eq!(sql, "NVL(base.data.nickname, :1)");
    }

    #[test]
    fn arithmetic_infix_chains() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! {
            "$add": ["$a", "$b", 1]
        }))
        .unwrap();
        let (sql, _) = render(&expr);
        assert_eq!(sql, "(base.data.a + base.data.b + :1)");
    }

    #[test]
    fn mod_requires_function_call() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! {
            "$mod": ["$a", 3]
        }))
        .unwrap();
        let (sql, _) = render(&expr);
        assert_eq!(sql, "MOD(base.data.a, :1)");
    }

    #[test]
    fn max_renders_greatest() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! {
            "$max": ["$a", "$b"]
        }))
        .unwrap();
        let (sql, _) = render(&expr);
        assert_eq!(sql, "GREATEST(base.data.a, base.data.b)");
    }

    #[test]
    fn sum_one_specialises_to_count_star() {
        let expr =
            ExpressionParser::parse_accumulator(&Bson::Document(doc! { "$sum": 1 })).unwrap();
        let (sql, binds) = render(&expr);
        assert_eq!(sql, "COUNT(*)");
        assert!(binds.is_empty());
    }

    #[test]
    fn sum_field_renders_aggregate() {
        let expr =
            ExpressionParser::parse_accumulator(&Bson::Document(doc! { "$sum": "$amount" }))
                .unwrap();
        let (sql, _) = render(&expr);
        assert_eq!(sql, "SUM(base.data.amount)");
    }

    #[test]
    fn push_renders_json_arrayagg() {
        let expr =
            ExpressionParser::parse_accumulator(&Bson::Document(doc! { "$push": "$sku" })).unwrap();
        let (sql, _) = render(&expr);
        assert_eq!(sql, "JSON_ARRAYAGG(base.data.sku)");
        let expr = ExpressionParser::parse_accumulator(&Bson::Document(doc! { "$addToSet": "$sku" }))
            .unwrap();
        let (sql, _) = render(&expr);
        assert_eq!(sql, "JSON_ARRAYAGG(DISTINCT base.data.sku)");
    }

    #[test]
    fn inline_object_switches_to_json_query() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! {
            "total": "$amount"
        }))
        .unwrap();
        let (sql, _) = render(&expr);
        assert_eq!(
            sql,
            "JSON_OBJECT('total' VALUE JSON_QUERY(base.data, '$.amount'))"
        );
    }

    #[test]
    fn regex_maps_options() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! {
            "$regexMatch": { "input": "$name", "regex": "^a", "options": "is" }
        }))
        .unwrap();
        let (sql, _) = render(&expr);
        assert_eq!(sql, "REGEXP_LIKE(base.data.name, :1, 'in')");
    }

    #[test]
    fn date_extract() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! {
            "$year": "$createdAt"
        }))
        .unwrap();
        let (sql, _) = render(&expr);
        assert!(sql.starts_with("EXTRACT(YEAR FROM TO_TIMESTAMP_TZ(base.data.createdAt"));
    }

    #[test]
    fn array_elem_at_literal_index() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! {
            "$arrayElemAt": ["$items", 0]
        }))
        .unwrap();
        let (sql, _) = render(&expr);
        assert_eq!(sql, "JSON_QUERY(base.data, '$.items[0]')");

        let expr = ExpressionParser::parse_value(&Bson::Document(doc! {
            "$arrayElemAt": ["$items", -1]
        }))
        .unwrap();
        let (sql, _) = render(&expr);
        assert_eq!(sql, "JSON_QUERY(base.data, '$.items[last]')");
    }

    #[test]
    fn size_uses_item_method() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! { "$size": "$items" })).unwrap();
        let (sql, _) = render(&expr);
        assert_eq!(sql, "JSON_VALUE(base.data, '$.items.size()' RETURNING NUMBER)");
    }

    #[test]
    fn filter_binds_loop_variable() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! {
            "$filter": {
                "input": "$items",
                "as": "item",
                "cond": { "$gte": ["$$item", 10] }
            }
        }))
        .unwrap();
        let (sql, _) = render(&expr);
        assert!(sql.starts_with("COALESCE((SELECT JSON_ARRAYAGG(t1.val) FROM JSON_TABLE("));
        assert!(sql.contains("WHERE t1.val >= :1"));
        assert!(sql.ends_with("), JSON_ARRAY())"));
    }

    #[test]
    fn reduce_sum_pattern() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! {
            "$reduce": {
                "input": "$scores",
                "initialValue": 0,
                "in": { "$add": ["$$value", "$$this"] }
            }
        }))
        .unwrap();
        let (sql, _) = render(&expr);
        assert!(sql.starts_with("COALESCE((SELECT SUM(t1.val) FROM JSON_TABLE("));
    }

    #[test]
    fn reduce_general_combiner_is_placeholder() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! {
            "$reduce": {
                "input": "$scores",
                "initialValue": 0,
                "in": { "$multiply": ["$$value", "$$this"] }
            }
        }))
        .unwrap();
        let (sql, _) = render(&expr);
        assert!(sql.contains("/* unsupported: $reduce */ NULL"));
    }

    #[test]
    fn reduce_general_combiner_fails_in_strict_mode() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! {
            "$reduce": {
                "input": "$scores",
                "initialValue": 0,
                "in": { "$multiply": ["$$value", "$$this"] }
            }
        }))
        .unwrap();
        let config = TranslatorConfig::new("orders");
        let options = TranslateOptions::strict();
        let mut ctx = GenerationContext::new(&config, &options);
        let err = render_expr(&expr, &mut ctx).unwrap_err();
        assert!(matches!(err, MongoraError::UnsupportedOperator(_)));
    }

    #[test]
    fn merge_objects_folds_mergepatch() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! {
            "$mergeObjects": ["$a", "$b", "$c"]
        }))
        .unwrap();
        let (sql, _) = render(&expr);
        assert_eq!(
            sql,
            "JSON_MERGEPATCH(JSON_MERGEPATCH(base.data.a, base.data.b), base.data.c)"
        );
    }

    #[test]
    fn convert_with_on_error_uses_conversion_default() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! {
            "$convert": { "input": "$price", "to": "int", "onError": 0 }
        }))
        .unwrap();
        let (sql, _) = render(&expr);
        assert_eq!(
            sql,
            "TRUNC(TO_NUMBER(base.data.price DEFAULT :1 ON CONVERSION ERROR))"
        );
    }

    #[test]
    fn type_of_field_uses_item_method() {
        let expr = ExpressionParser::parse_value(&Bson::Document(doc! { "$type": "$price" })).unwrap();
        let (sql, _) = render(&expr);
        assert_eq!(sql, "JSON_VALUE(base.data, '$.price.type()')");
    }

    #[test]
    fn redact_sentinels_are_string_literals() {
        let expr = ExpressionParser::parse_value(&Bson::String("$$PRUNE".into())).unwrap();
        let (sql, binds) = render(&expr);
        assert_eq!(sql, "'$$PRUNE'");
        assert!(binds.is_empty());
    }

    #[test]
    fn base_dialect_routes_through_json_value() {
        let config = TranslatorConfig::new("orders").with_dialect(OracleDialect::Base);
        let options = TranslateOptions::default();
        let mut ctx = GenerationContext::new(&config, &options);
        let expr = ExpressionParser::parse_filter(&doc! { "status": "completed" }).unwrap();
        render_expr(&expr, &mut ctx).unwrap();
        let (sql, _) = ctx.finish();
        assert_eq!(sql, "JSON_VALUE(base.data, '$.status') = :1");
    }

    #[test]
    fn number_hint_coerces_in_base_dialect() {
        let config = TranslatorConfig::new("orders").with_dialect(OracleDialect::Base);
        let options = TranslateOptions::default();
        let mut ctx = GenerationContext::new(&config, &options);
        let expr = ExpressionParser::parse_accumulator(&Bson::Document(doc! { "$sum": "$amount" }))
            .unwrap();
        render_expr(&expr, &mut ctx).unwrap();
        let (sql, _) = ctx.finish();
        assert_eq!(sql, "SUM(TO_NUMBER(JSON_VALUE(base.data, '$.amount')))");
    }

    #[test]
    fn sql_ident_quotes_mixed_case() {
        assert_eq!(sql_ident("rank"), "rank");
        assert_eq!(sql_ident("totalAmount"), "\"totalAmount\"");
        assert_eq!(sql_ident("_id"), "\"_id\"");
    }
}
