/*!
 * @file stage_render.rs
 * @brief Per-stage SQL fragments: sort, pagination, windows, joins
 */

use crate::config::OracleDialect;
use crate::context::{GenerationContext, LookupBinding, VarBinding};
use crate::error::{MongoraError, Result};
use crate::expr_render::{
    json_path, render_document_access, render_expr, render_field_access, sql_ident,
};
use crate::mongora_warn;
use crate::stage::{
    FrameBound, FrameUnit, GraphLookupStage, LookupKind, LookupStage, SetWindowFieldsStage,
    SortField, Stage, UnwindStage, WindowFrame, WindowOutput,
};

/// ORDER BY over sort fields. Fields naming an output column of the
/// current SELECT list reference the column alias; everything else goes
/// through normal field-path resolution.
pub fn render_order_by(
    fields: &[SortField],
    output_columns: &[String],
    ctx: &mut GenerationContext,
) -> Result<()> {
    ctx.push("ORDER BY ");
    for (i, field) in fields.iter().enumerate() {
        if i > 0 {
            ctx.push(", ");
        }
        if output_columns.iter().any(|c| c == &field.path) {
            ctx.push(&sql_ident(&field.path));
        } else {
            render_field_access(&field.path, None, ctx)?;
        }
        if field.descending {
            ctx.push(" DESC");
        }
    }
    Ok(())
}

/// OFFSET / FETCH FIRST. Counts are inline; a bind would defeat plan
/// sharing for pagination shapes and the values are parser-validated
/// integers.
pub fn render_offset_fetch(skip: Option<u64>, limit: Option<u64>, ctx: &mut GenerationContext) {
    if let Some(skip) = skip {
        ctx.sep();
        ctx.push(&format!("OFFSET {} ROWS", skip));
    }
    if let Some(limit) = limit {
        ctx.sep();
        ctx.push(&format!("FETCH FIRST {} ROWS ONLY", limit));
    }
}

fn frame_bound_sql(bound: FrameBound, is_lower: bool) -> String {
    match bound {
        FrameBound::Unbounded => {
            if is_lower {
                "UNBOUNDED PRECEDING".to_string()
            } else {
                "UNBOUNDED FOLLOWING".to_string()
            }
        }
        FrameBound::Current => "CURRENT ROW".to_string(),
        FrameBound::Offset(0) => "CURRENT ROW".to_string(),
        FrameBound::Offset(n) if n < 0 => format!("{} PRECEDING", -n),
        FrameBound::Offset(n) => format!("{} FOLLOWING", n),
    }
}

pub fn render_frame(frame: &WindowFrame, ctx: &mut GenerationContext) {
    let unit = match frame.unit {
        FrameUnit::Documents => "ROWS",
        FrameUnit::Range => "RANGE",
    };
    ctx.push(&format!(
        "{} BETWEEN {} AND {}",
        unit,
        frame_bound_sql(frame.lower, true),
        frame_bound_sql(frame.upper, false)
    ));
}

/// One `$setWindowFields` output as `FN(arg) OVER (...)`.
pub fn render_window_function(
    output: &WindowOutput,
    window: &SetWindowFieldsStage,
    ctx: &mut GenerationContext,
) -> Result<()> {
    ctx.push(output.op.sql_function());
    ctx.push("(");
    if !output.op.is_ranking() {
        match &output.arg {
            Some(arg) => render_expr(arg, ctx)?,
            None => ctx.push("*"),
        }
    }
    ctx.push(") OVER (");

    let mut need_space = false;
    if let Some(partition) = &window.partition_by {
        ctx.push("PARTITION BY ");
        render_expr(partition, ctx)?;
        need_space = true;
    }
    if !window.sort_by.is_empty() {
        if need_space {
            ctx.push(" ");
        }
        ctx.push("ORDER BY ");
        for (i, field) in window.sort_by.iter().enumerate() {
            if i > 0 {
                ctx.push(", ");
            }
            render_field_access(&field.path, None, ctx)?;
            if field.descending {
                ctx.push(" DESC");
            }
        }
        need_space = true;
    }
    if let Some(frame) = &output.frame {
        if need_space {
            ctx.push(" ");
        }
        render_frame(frame, ctx);
    }
    ctx.push(")");
    Ok(())
}

/// Registers an unwind's JSON_TABLE alias ahead of SELECT-list rendering.
/// Returns None when the unwind path targets a lookup's as-field; the join
/// already produces the right row multiplicity so no JSON_TABLE is
/// emitted.
pub fn register_unwind_stage(unwind: &UnwindStage, ctx: &mut GenerationContext) -> Option<String> {
    if ctx.lookup_for_path(&unwind.path).is_some() {
        return None;
    }
    let alias = ctx.next_alias();
    ctx.register_unwind(unwind.path.clone(), alias.clone());
    if let Some(index_field) = &unwind.include_array_index {
        // FOR ORDINALITY is one-based; the exposed index is zero-based.
        ctx.register_raw_column(index_field.clone(), format!("({}.idx - 1)", alias));
    }
    Some(alias)
}

/// JSON_TABLE row source for an unwind, emitted into the FROM clause.
pub fn render_unwind_join(
    unwind: &UnwindStage,
    alias: &str,
    ctx: &mut GenerationContext,
) -> Result<()> {
    let data = ctx.data_column().to_string();
    let base = ctx.base_alias();
    let value_column = match ctx.config.dialect {
        OracleDialect::Extended => format!("{} JSON PATH '$'", data),
        OracleDialect::Base => format!("{} FORMAT JSON PATH '$'", data),
    };
    let ordinality = if unwind.include_array_index.is_some() {
        ", idx FOR ORDINALITY"
    } else {
        ""
    };
    let table = format!(
        "JSON_TABLE({}.{}, '{}[*]' COLUMNS ({}{})) {}",
        base,
        data,
        json_path(&unwind.path),
        value_column,
        ordinality,
        alias
    );
    if unwind.preserve_null_and_empty_arrays {
        ctx.push(" OUTER APPLY ");
        ctx.push(&table);
    } else {
        ctx.push(", ");
        ctx.push(&table);
    }
    Ok(())
}

/// Allocates the join alias for a lookup before any SELECT-list rendering
/// so field paths under the as-name resolve to it.
pub fn register_lookup_stage(lookup: &LookupStage, ctx: &mut GenerationContext) {
    let alias = ctx.next_alias();
    let (local_field, foreign_field) = match &lookup.kind {
        LookupKind::Equality {
            local_field,
            foreign_field,
        } => (local_field.clone(), foreign_field.clone()),
        LookupKind::Pipeline { .. } => (String::new(), String::new()),
    };
    ctx.register_lookup(
        lookup.as_field.clone(),
        LookupBinding {
            from: lookup.from.clone(),
            local_field,
            foreign_field,
            alias,
            consumed: false,
        },
    );
}

/// LEFT OUTER JOIN for a lookup, skipped entirely when a `$size` already
/// consumed it as a correlated COUNT.
pub fn render_lookup_join(lookup: &LookupStage, ctx: &mut GenerationContext) -> Result<()> {
    if ctx.lookup_consumed(&lookup.as_field) {
        return Ok(());
    }
    let binding = ctx
        .lookup(&lookup.as_field)
        .cloned()
        .ok_or_else(|| MongoraError::translation("lookup join rendered before registration"))?;
    let table = ctx.config.qualified_table(&lookup.from);

    match &lookup.kind {
        LookupKind::Equality {
            local_field,
            foreign_field,
        } => {
            ctx.push(&format!(" LEFT OUTER JOIN {} {} ON (", table, binding.alias));
            render_document_access(&binding.alias, Some(foreign_field), None, ctx);
            ctx.push(" = ");
            render_field_access(local_field, None, ctx)?;
            ctx.push(")");
            Ok(())
        }
        LookupKind::Pipeline { let_vars, pipeline } => {
            let data = ctx.data_column().to_string();
            let row_alias = ctx.next_alias();
            for (name, expr) in let_vars {
                ctx.bind_variable(name.clone(), VarBinding::Expr(expr.clone()));
            }
            ctx.push(&format!(
                " LEFT OUTER JOIN LATERAL (SELECT JSON_ARRAYAGG({row}.{data}) AS {data} FROM {table} {row}",
                row = row_alias,
                data = data,
                table = table
            ));
            ctx.push_base_alias(row_alias);
            let result = render_lookup_inner_pipeline(pipeline, ctx);
            ctx.pop_base_alias();
            for (name, _) in let_vars {
                ctx.unbind_variable(name);
            }
            result?;
            ctx.push(&format!(") {} ON (1=1)", binding.alias));
            Ok(())
        }
    }
}

/// Inside a lateral lookup only filter stages translate; anything else in
/// the inner pipeline is a feature gap.
fn render_lookup_inner_pipeline(pipeline: &[Stage], ctx: &mut GenerationContext) -> Result<()> {
    let mut first = true;
    for stage in pipeline {
        match stage {
            Stage::Match(filter) => {
                ctx.push(if first { " WHERE " } else { " AND " });
                first = false;
                render_expr(filter, ctx)?;
            }
            other => {
                if ctx.options.strict {
                    return Err(MongoraError::unsupported(format!(
                        "{} inside $lookup pipeline",
                        other.operator_token()
                    )));
                }
                mongora_warn!(
                    "ignoring {} inside $lookup pipeline",
                    other.operator_token()
                );
            }
        }
    }
    Ok(())
}

/// LATERAL join for `$graphLookup`. Only the zero-depth form translates;
/// recursive traversal renders an empty-array lateral so the surrounding
/// statement stays well-formed.
pub fn render_graph_lookup_join(
    stage: &GraphLookupStage,
    lateral_alias: &str,
    ctx: &mut GenerationContext,
) -> Result<()> {
    let data = ctx.data_column().to_string();

    if stage.max_depth == Some(0) {
        let row_alias = ctx.next_alias();
        let table = ctx.config.qualified_table(&stage.from);
        ctx.push(&format!(
            " LEFT OUTER JOIN LATERAL (SELECT JSON_ARRAYAGG({row}.{data}) AS {data} FROM {table} {row} WHERE ",
            row = row_alias,
            data = data,
            table = table
        ));
        render_document_access(&row_alias, Some(&stage.connect_to_field), None, ctx);
        ctx.push(" = ");
        render_expr(&stage.start_with, ctx)?;
        if let Some(restrict) = &stage.restrict_search_with_match {
            ctx.push(" AND ");
            ctx.push_base_alias(row_alias.clone());
            let result = render_expr(restrict, ctx);
            ctx.pop_base_alias();
            result?;
        }
        ctx.push(&format!(") {} ON (1=1)", lateral_alias));
        return Ok(());
    }

    if ctx.options.strict {
        return Err(MongoraError::unsupported(
            "$graphLookup recursive traversal".to_string(),
        ));
    }
    mongora_warn!("recursive $graphLookup renders an empty result set");
    ctx.push(&format!(
        " LEFT OUTER JOIN LATERAL (SELECT JSON_ARRAY() AS {data} FROM DUAL) {} ON (1=1)",
        lateral_alias,
        data = data
    ));
    Ok(())
}

/// `$unset` and exclusion-mode `$project` both strip paths from the
/// document with JSON_TRANSFORM.
pub fn render_remove_projection(paths: &[String], ctx: &mut GenerationContext) {
    let data = ctx.data_column().to_string();
    let base = ctx.base_alias();
    ctx.push(&format!("JSON_TRANSFORM({}.{}", base, data));
    for path in paths {
        ctx.push(&format!(", REMOVE '{}'", json_path(path)));
    }
    ctx.push(")");
}
