/*!
 * @file renderer.rs
 * @brief Pipeline classification and SQL shape dispatch
 */

use crate::context::GenerationContext;
use crate::error::{MongoraError, Result};
use crate::expr::Expression;
use crate::expr_render::{
    json_path, render_document_access, render_expr, render_field_access, sql_ident,
    unsupported_placeholder,
};
use crate::mongora_warn;
use crate::operators::ArrayOp;
use crate::pipeline::Pipeline;
use crate::stage::{
    AddFieldsStage, BucketAutoStage, BucketStage, FacetStage, GraphLookupStage, GroupStage,
    LookupStage, MergeStage, OutStage, ProjectField, ProjectStage, SetWindowFieldsStage,
    SortStage, Stage, UnionWithStage, UnwindStage, WhenMatched, WhenNotMatched,
};
use crate::stage_render::{
    register_lookup_stage, register_unwind_stage, render_graph_lookup_join, render_lookup_join,
    render_offset_fetch, render_order_by, render_remove_projection, render_unwind_join,
    render_window_function,
};

/// Semantic slots produced by one classification pass over the stage
/// sequence. Every field borrows from the pipeline; the model itself is
/// cheap to clone for the recursive shapes (`$out`, `$merge`, facets).
#[derive(Default, Clone)]
struct PipelineModel<'a> {
    matches: Vec<&'a Expression>,
    post_window_matches: Vec<&'a Expression>,
    group: Option<&'a GroupStage>,
    post_union_group: Option<&'a GroupStage>,
    add_fields: Vec<&'a AddFieldsStage>,
    post_group_add_fields: Vec<&'a AddFieldsStage>,
    sort: Option<&'a SortStage>,
    post_union_sort: Option<&'a SortStage>,
    limit: Option<u64>,
    skip: Option<u64>,
    post_union_limit: Option<u64>,
    post_union_skip: Option<u64>,
    project: Option<&'a ProjectStage>,
    post_facet_project: Option<&'a ProjectStage>,
    count: Option<&'a str>,
    sample: Option<u64>,
    bucket: Option<&'a BucketStage>,
    bucket_auto: Option<&'a BucketAutoStage>,
    facet: Option<&'a FacetStage>,
    replace_root: Option<&'a Expression>,
    out: Option<&'a OutStage>,
    merge: Option<&'a MergeStage>,
    lookups: Vec<&'a LookupStage>,
    unwinds: Vec<&'a UnwindStage>,
    unions: Vec<&'a UnionWithStage>,
    graph_lookups: Vec<&'a GraphLookupStage>,
    windows: Vec<&'a SetWindowFieldsStage>,
    redacts: Vec<&'a Expression>,
    unsets: Vec<&'a Vec<String>>,
}

impl<'a> PipelineModel<'a> {
    fn analyze(stages: &'a [Stage]) -> Result<Self> {
        let mut model = PipelineModel::default();
        let mut seen_union = false;
        let mut seen_group = false;
        let mut seen_facet = false;
        let mut seen_replace_root = false;
        let mut window_outputs: Vec<String> = Vec::new();

        for stage in stages {
            match stage {
                Stage::Match(expr) => {
                    let names: Vec<&str> = window_outputs.iter().map(|s| s.as_str()).collect();
                    if !names.is_empty() && expr.references_any(&names) {
                        model.post_window_matches.push(expr);
                    } else {
                        model.matches.push(expr);
                    }
                }
                Stage::Group(group) => {
                    if seen_union {
                        model.post_union_group = Some(group);
                    } else {
                        model.group = Some(group);
                        seen_group = true;
                    }
                }
                Stage::AddFields(add) => {
                    // Once the root is replaced there is no row source the
                    // computed expressions could resolve against.
                    if seen_replace_root {
                        return Err(MongoraError::unsupported(
                            "$addFields after $replaceRoot".to_string(),
                        ));
                    }
                    if seen_group {
                        model.post_group_add_fields.push(add);
                    } else {
                        model.add_fields.push(add);
                    }
                }
                Stage::Sort(sort) => {
                    if seen_union {
                        model.post_union_sort = Some(sort);
                    } else {
                        model.sort = Some(sort);
                    }
                }
                Stage::Limit(n) => {
                    if seen_union {
                        model.post_union_limit = Some(*n);
                    } else {
                        model.limit = Some(*n);
                    }
                }
                Stage::Skip(n) => {
                    if seen_union {
                        model.post_union_skip = Some(*n);
                    } else {
                        model.skip = Some(*n);
                    }
                }
                Stage::Project(project) => {
                    if seen_facet {
                        model.post_facet_project = Some(project);
                    } else {
                        model.project = Some(project);
                    }
                }
                Stage::Count(name) => model.count = Some(name.as_str()),
                Stage::Sample(n) => model.sample = Some(*n),
                Stage::Bucket(bucket) => model.bucket = Some(bucket),
                Stage::BucketAuto(bucket) => model.bucket_auto = Some(bucket),
                Stage::Facet(facet) => {
                    model.facet = Some(facet);
                    seen_facet = true;
                }
                Stage::ReplaceRoot(expr) => {
                    model.replace_root = Some(expr);
                    seen_replace_root = true;
                }
                Stage::Out(out) => model.out = Some(out),
                Stage::Merge(merge) => model.merge = Some(merge),
                Stage::Lookup(lookup) => model.lookups.push(lookup),
                Stage::Unwind(unwind) => model.unwinds.push(unwind),
                Stage::UnionWith(union) => {
                    model.unions.push(union);
                    seen_union = true;
                }
                Stage::GraphLookup(graph) => model.graph_lookups.push(graph),
                Stage::SetWindowFields(window) => {
                    window_outputs.extend(window.output.keys().cloned());
                    model.windows.push(window);
                }
                Stage::Redact(expr) => model.redacts.push(expr),
                Stage::Unset(paths) => model.unsets.push(paths),
            }
        }

        if model.replace_root.is_some() {
            if !model.windows.is_empty() {
                return Err(MongoraError::unsupported(
                    "$setWindowFields combined with $replaceRoot".to_string(),
                ));
            }
            if !model.graph_lookups.is_empty() {
                return Err(MongoraError::unsupported(
                    "$graphLookup combined with $replaceRoot".to_string(),
                ));
            }
        }
        Ok(model)
    }
}

/// Pre-registered join sources; aliases are allocated before any SELECT
/// text so field paths can resolve against them.
struct JoinPlan<'a> {
    unwind_joins: Vec<(&'a UnwindStage, String)>,
    graph_aliases: Vec<String>,
}

fn register_sources<'a>(model: &PipelineModel<'a>, ctx: &mut GenerationContext) -> JoinPlan<'a> {
    for lookup in &model.lookups {
        register_lookup_stage(lookup, ctx);
    }
    let mut unwind_joins = Vec::new();
    for unwind in &model.unwinds {
        if let Some(alias) = register_unwind_stage(unwind, ctx) {
            unwind_joins.push((*unwind, alias));
        }
    }
    for add in &model.add_fields {
        for (name, expr) in &add.fields {
            ctx.register_virtual_field(name.clone(), expr.clone());
        }
    }
    let graph_aliases = model
        .graph_lookups
        .iter()
        .map(|_| ctx.next_alias())
        .collect();
    JoinPlan {
        unwind_joins,
        graph_aliases,
    }
}

pub fn render_pipeline(pipeline: &Pipeline, ctx: &mut GenerationContext) -> Result<()> {
    let model = PipelineModel::analyze(pipeline.stages())?;
    render_model(&model, pipeline.collection(), ctx)
}

fn render_model(model: &PipelineModel, collection: &str, ctx: &mut GenerationContext) -> Result<()> {
    if let Some(out) = model.out {
        return render_out(model, out, collection, ctx);
    }
    if let Some(merge) = model.merge {
        return render_merge(model, merge, collection, ctx);
    }
    if model.post_union_group.is_some() {
        return render_post_union_group(model, collection, ctx);
    }
    if !model.post_window_matches.is_empty() {
        return render_post_window(model, collection, ctx);
    }
    if !model.post_group_add_fields.is_empty() && model.group.is_some() {
        return render_post_group_add_fields(model, collection, ctx);
    }
    if model.bucket_auto.is_some() {
        return render_bucket_auto(model, collection, ctx);
    }
    if model.facet.is_some() && model.count.is_none() {
        return render_facet_query(model, collection, ctx);
    }
    if should_json_wrap(model, ctx) {
        return render_json_aggregation(model, collection, ctx);
    }
    render_standard(model, collection, ctx)
}

fn should_json_wrap(model: &PipelineModel, ctx: &GenerationContext) -> bool {
    match model.project {
        Some(project) if !project.exclusion_mode => {
            model.group.is_none()
                && model.facet.is_none()
                && model.count.is_none()
                && model.bucket.is_none()
                && model.replace_root.is_none()
                && model.unions.is_empty()
                && !ctx.in_nested()
        }
        _ => false,
    }
}

fn target_table(database: Option<&str>, collection: &str, ctx: &GenerationContext) -> String {
    match database {
        Some(db) => format!("{}.{}", db, collection),
        None => ctx.config.qualified_table(collection),
    }
}

// --- shape 1: $out ---

fn render_out(
    model: &PipelineModel,
    out: &OutStage,
    collection: &str,
    ctx: &mut GenerationContext,
) -> Result<()> {
    let mut inner = model.clone();
    inner.out = None;
    let data = ctx.data_column().to_string();
    let target = target_table(out.database.as_deref(), &out.collection, ctx);
    ctx.push(&format!("INSERT INTO {} ({}) ", target, data));
    ctx.enter_nested();
    let result = render_model(&inner, collection, ctx);
    ctx.exit_nested();
    result
}

// --- shape 2: $merge ---

fn render_merge(
    model: &PipelineModel,
    merge: &MergeStage,
    collection: &str,
    ctx: &mut GenerationContext,
) -> Result<()> {
    if ctx.options.strict
        && (merge.when_matched == WhenMatched::Fail
            || merge.when_not_matched == WhenNotMatched::Fail)
    {
        return Err(MongoraError::unsupported("$merge fail policy".to_string()));
    }

    let mut inner = model.clone();
    inner.merge = None;
    let data = ctx.data_column().to_string();
    let target = target_table(merge.database.as_deref(), &merge.into, ctx);
    ctx.push(&format!("MERGE INTO {} tgt USING (", target));
    ctx.enter_nested();
    let result = render_model(&inner, collection, ctx);
    ctx.exit_nested();
    result?;
    ctx.push(") src ON (");
    for (i, field) in merge.on.iter().enumerate() {
        if i > 0 {
            ctx.push(" AND ");
        }
        render_document_access("tgt", Some(field), None, ctx);
        ctx.push(" = ");
        render_document_access("src", Some(field), None, ctx);
    }
    ctx.push(")");

    match merge.when_matched {
        WhenMatched::Replace => {
            ctx.push(&format!(
                " WHEN MATCHED THEN UPDATE SET tgt.{data} = src.{data}"
            ));
        }
        WhenMatched::Merge => {
            ctx.push(&format!(
                " WHEN MATCHED THEN UPDATE SET tgt.{data} = JSON_MERGEPATCH(tgt.{data}, src.{data})"
            ));
        }
        WhenMatched::KeepExisting => {}
        WhenMatched::Fail => {
            mongora_warn!("$merge whenMatched: fail is not enforceable in SQL; clause omitted");
        }
    }
    match merge.when_not_matched {
        WhenNotMatched::Insert => {
            ctx.push(&format!(
                " WHEN NOT MATCHED THEN INSERT ({data}) VALUES (src.{data})"
            ));
        }
        WhenNotMatched::Discard => {}
        WhenNotMatched::Fail => {
            mongora_warn!("$merge whenNotMatched: fail is not enforceable in SQL; clause omitted");
        }
    }
    Ok(())
}

// --- shape 3: group after $unionWith ---

fn render_post_union_group(
    model: &PipelineModel,
    collection: &str,
    ctx: &mut GenerationContext,
) -> Result<()> {
    let group = model
        .post_union_group
        .ok_or_else(|| MongoraError::translation("post-union group slot vanished"))?;

    // Fields the outer aggregates touch become projected columns of every
    // union branch; the outer query references the column identifiers.
    let mut fields: Vec<String> = Vec::new();
    if let Some(id) = &group.id {
        id.referenced_fields(&mut fields);
    }
    for (_, acc) in &group.accumulators {
        acc.referenced_fields(&mut fields);
    }
    let mut seen = Vec::new();
    fields.retain(|f| {
        if seen.contains(f) {
            false
        } else {
            seen.push(f.clone());
            true
        }
    });

    ctx.push("SELECT ");
    if let Some(hint) = ctx.take_hint() {
        ctx.push(&format!("/*+ {} */ ", hint));
    }
    ctx.push_column_scope("u".to_string(), fields.clone());
    let columns = render_group_select(group, ctx)?;
    ctx.pop_column_scope();

    ctx.sep();
    ctx.push("FROM (");
    render_projected_select(collection, &model.matches, &fields, ctx)?;
    for union in &model.unions {
        ctx.push(" UNION ALL ");
        render_projected_branch(union, &fields, ctx)?;
    }
    ctx.push(") u");

    ctx.push_column_scope("u".to_string(), fields);
    let group_by = render_group_by_clause(group, ctx);
    ctx.pop_column_scope();
    group_by?;

    if let Some(sort) = model.post_union_sort {
        ctx.sep();
        render_order_by(&sort.fields, &columns, ctx)?;
    }
    render_offset_fetch(model.post_union_skip, model.post_union_limit, ctx);
    Ok(())
}

/// `SELECT base.data AS data, <field> AS "<field>" ... FROM <coll> base
/// [WHERE ...]`, the row shape every union branch agrees on.
fn render_projected_select(
    collection: &str,
    matches: &[&Expression],
    fields: &[String],
    ctx: &mut GenerationContext,
) -> Result<()> {
    let data = ctx.data_column().to_string();
    ctx.push(&format!("SELECT base.{} AS {}", data, data));
    for field in fields {
        ctx.push(", ");
        render_field_access(field, None, ctx)?;
        ctx.push(&format!(" AS {}", sql_ident(field)));
    }
    ctx.push(&format!(
        " FROM {} base",
        ctx.config.qualified_table(collection)
    ));
    if !matches.is_empty() {
        ctx.push(" WHERE ");
        for (i, m) in matches.iter().enumerate() {
            if i > 0 {
                ctx.push(" AND ");
            }
            render_expr(m, ctx)?;
        }
    }
    Ok(())
}

fn render_projected_branch(
    union: &UnionWithStage,
    fields: &[String],
    ctx: &mut GenerationContext,
) -> Result<()> {
    let branch = PipelineModel::analyze(&union.pipeline)?;
    let snapshot = ctx.snapshot_registries();
    for stage in &union.pipeline {
        if !matches!(stage, Stage::Match(_)) {
            mongora_warn!(
                "ignoring {} inside $unionWith branch feeding a group",
                stage.operator_token()
            );
        }
    }
    let result = render_projected_select(&union.collection, &branch.matches, fields, ctx);
    ctx.restore_registries(snapshot);
    result
}

// --- shape 4: match on window outputs ---

fn render_post_window(
    model: &PipelineModel,
    collection: &str,
    ctx: &mut GenerationContext,
) -> Result<()> {
    let data = ctx.data_column().to_string();
    let id = ctx.id_column().to_string();
    let window_columns: Vec<String> = model
        .windows
        .iter()
        .flat_map(|w| w.output.keys().cloned())
        .collect();

    ctx.push("SELECT ");
    if let Some(hint) = ctx.take_hint() {
        ctx.push(&format!("/*+ {} */ ", hint));
    }
    let mut outer_columns = window_columns.clone();
    match model.project {
        Some(project) if !project.exclusion_mode => {
            ctx.push_base_alias("w".to_string());
            ctx.push_column_scope(String::new(), window_columns.clone());
            let result = (|| -> Result<Vec<String>> {
                let mut columns = Vec::new();
                let mut first = true;
                for (name, field) in &project.fields {
                    let ProjectField::Include(expr) = field else {
                        continue;
                    };
                    if !first {
                        ctx.push(", ");
                    }
                    first = false;
                    render_expr(expr, ctx)?;
                    ctx.push(&format!(" AS {}", sql_ident(name)));
                    columns.push(name.clone());
                }
                Ok(columns)
            })();
            ctx.pop_column_scope();
            ctx.pop_base_alias();
            outer_columns.extend(result?);
        }
        _ => ctx.push("*"),
    }

    ctx.sep();
    ctx.push(&format!("FROM (SELECT {}, {}", id, data));
    for window in &model.windows {
        for (name, output) in &window.output {
            ctx.push(", ");
            render_window_function(output, window, ctx)?;
            ctx.push(&format!(" AS {}", sql_ident(name)));
        }
    }
    ctx.push(&format!(
        " FROM {} {}",
        ctx.config.qualified_table(collection),
        ctx.base_alias()
    ));
    if !model.matches.is_empty() {
        ctx.push(" WHERE ");
        for (i, m) in model.matches.iter().enumerate() {
            if i > 0 {
                ctx.push(" AND ");
            }
            render_expr(m, ctx)?;
        }
    }
    ctx.push(") w");

    ctx.push_base_alias("w".to_string());
    ctx.push_column_scope(String::new(), window_columns);
    let tail = (|| -> Result<()> {
        ctx.sep();
        ctx.push("WHERE ");
        for (i, m) in model.post_window_matches.iter().enumerate() {
            if i > 0 {
                ctx.push(" AND ");
            }
            render_expr(m, ctx)?;
        }
        if let Some(sort) = model.sort {
            ctx.sep();
            render_order_by(&sort.fields, &outer_columns, ctx)?;
        }
        Ok(())
    })();
    ctx.pop_column_scope();
    ctx.pop_base_alias();
    tail?;
    render_offset_fetch(model.skip, model.limit, ctx);
    Ok(())
}

// --- shape 5: $addFields after $group ---

fn group_output_columns(group: &GroupStage) -> Vec<String> {
    let mut columns = Vec::new();
    match &group.id {
        None => {
            if group.accumulators.is_empty() {
                columns.push("dummy".to_string());
            }
        }
        Some(Expression::CompoundId(fields)) => columns.extend(fields.keys().cloned()),
        Some(_) => columns.push("_id".to_string()),
    }
    columns.extend(group.accumulators.keys().cloned());
    columns
}

fn render_post_group_add_fields(
    model: &PipelineModel,
    collection: &str,
    ctx: &mut GenerationContext,
) -> Result<()> {
    let group = model
        .group
        .ok_or_else(|| MongoraError::translation("post-group addFields without a group"))?;
    ctx.push("SELECT ");
    if let Some(hint) = ctx.take_hint() {
        ctx.push(&format!("/*+ {} */ ", hint));
    }
    ctx.push("inner_query.*");

    let mut columns = group_output_columns(group);
    ctx.push_column_scope("inner_query".to_string(), columns.clone());
    let computed = (|| -> Result<()> {
        for add in &model.post_group_add_fields {
            for (name, expr) in &add.fields {
                ctx.push(", ");
                render_expr(expr, ctx)?;
                ctx.push(&format!(" AS {}", sql_ident(name)));
                columns.push(name.clone());
            }
        }
        Ok(())
    })();
    ctx.pop_column_scope();
    computed?;

    ctx.sep();
    ctx.push("FROM (");
    let mut inner = model.clone();
    inner.post_group_add_fields = Vec::new();
    inner.sort = None;
    inner.limit = None;
    inner.skip = None;
    ctx.enter_nested();
    let result = render_model(&inner, collection, ctx);
    ctx.exit_nested();
    result?;
    ctx.push(") inner_query");

    if let Some(sort) = model.sort {
        ctx.sep();
        ctx.push_column_scope("inner_query".to_string(), columns.clone());
        let sorted = render_order_by(&sort.fields, &columns, ctx);
        ctx.pop_column_scope();
        sorted?;
    }
    render_offset_fetch(model.skip, model.limit, ctx);
    Ok(())
}

// --- shape 6: $bucketAuto ---

fn render_bucket_auto(
    model: &PipelineModel,
    collection: &str,
    ctx: &mut GenerationContext,
) -> Result<()> {
    let bucket = model
        .bucket_auto
        .ok_or_else(|| MongoraError::translation("bucketAuto slot vanished"))?;
    if bucket.granularity.is_some() {
        mongora_warn!("$bucketAuto granularity is ignored; NTILE produces equal-count buckets");
    }
    let wrapper = ctx.next_alias();
    let data = ctx.data_column().to_string();
    let id = ctx.id_column().to_string();

    ctx.push("SELECT ");
    if let Some(hint) = ctx.take_hint() {
        ctx.push(&format!("/*+ {} */ ", hint));
    }
    ctx.push(&format!(
        "JSON_OBJECT('min' VALUE MIN({w}.bucket_val), 'max' VALUE MAX({w}.bucket_val)) AS \"_id\"",
        w = wrapper
    ));
    ctx.push_base_alias(wrapper.clone());
    let accumulators = (|| -> Result<()> {
        if bucket.output.is_empty() {
            ctx.push(", COUNT(*) AS count");
            return Ok(());
        }
        for (name, acc) in &bucket.output {
            ctx.push(", ");
            render_expr(acc, ctx)?;
            ctx.push(&format!(" AS {}", sql_ident(name)));
        }
        Ok(())
    })();
    ctx.pop_base_alias();
    accumulators?;

    ctx.sep();
    ctx.push(&format!(
        "FROM (SELECT base.{id} AS {id}, base.{data} AS {data}, ",
        id = id,
        data = data
    ));
    render_expr(&bucket.group_by, ctx)?;
    ctx.push(" AS bucket_val");
    ctx.push(&format!(", NTILE({}) OVER (ORDER BY ", bucket.buckets));
    render_expr(&bucket.group_by, ctx)?;
    ctx.push(") AS bucket_id");
    ctx.push(&format!(
        " FROM {} base",
        ctx.config.qualified_table(collection)
    ));
    if !model.matches.is_empty() {
        ctx.push(" WHERE ");
        for (i, m) in model.matches.iter().enumerate() {
            if i > 0 {
                ctx.push(" AND ");
            }
            render_expr(m, ctx)?;
        }
    }
    ctx.push(&format!(") {}", wrapper));
    ctx.sep();
    ctx.push(&format!("GROUP BY {}.bucket_id", wrapper));
    ctx.sep();
    ctx.push(&format!("ORDER BY {}.bucket_id", wrapper));
    Ok(())
}

// --- $facet object construction ---

fn render_facet_query(
    model: &PipelineModel,
    collection: &str,
    ctx: &mut GenerationContext,
) -> Result<()> {
    let facet = model
        .facet
        .ok_or_else(|| MongoraError::translation("facet slot vanished"))?;
    if let Some(project) = model.post_facet_project {
        return render_post_facet_project(model, facet, project, collection, ctx);
    }

    let data = ctx.data_column().to_string();
    ctx.push("SELECT ");
    if let Some(hint) = ctx.take_hint() {
        ctx.push(&format!("/*+ {} */ ", hint));
    }
    ctx.push("JSON_OBJECT(");
    for (i, (name, stages)) in facet.facets.iter().enumerate() {
        if i > 0 {
            ctx.push(", ");
        }
        ctx.push(&format!("'{}' VALUE (", name.replace('\'', "''")));
        render_facet_subquery(model, stages, collection, ctx)?;
        ctx.push(")");
    }
    ctx.push(&format!(") AS {}", data));
    ctx.sep();
    ctx.push("FROM DUAL");
    Ok(())
}

/// A facet pipeline consisting only of `$match`es and a single `$count`.
fn facet_count_name(stages: &[Stage]) -> Option<&str> {
    let mut count = None;
    for stage in stages {
        match stage {
            Stage::Count(name) => {
                if count.is_some() {
                    return None;
                }
                count = Some(name.as_str());
            }
            Stage::Match(_) => {}
            _ => return None,
        }
    }
    count
}

fn render_facet_subquery(
    parent: &PipelineModel,
    stages: &[Stage],
    collection: &str,
    ctx: &mut GenerationContext,
) -> Result<()> {
    if let Some(count_name) = facet_count_name(stages) {
        return render_count_facet(parent, count_name, collection, ctx);
    }

    // Generic facet: inherit the parent's filters and grouping, then apply
    // the facet's own stages over that result.
    let mut combined: Vec<Stage> = Vec::new();
    for m in &parent.matches {
        combined.push(Stage::Match((*m).clone()));
    }
    if let Some(group) = parent.group {
        combined.push(Stage::Group(group.clone()));
    }
    combined.extend(stages.iter().cloned());

    let sub = PipelineModel::analyze(&combined)?;
    let snapshot = ctx.snapshot_registries();
    ctx.enter_nested();
    ctx.push("SELECT JSON_ARRAYAGG(JSON_OBJECT(*) RETURNING CLOB) FROM (");
    let result = render_model(&sub, collection, ctx);
    ctx.exit_nested();
    ctx.restore_registries(snapshot);
    result?;
    ctx.push(")");
    Ok(())
}

fn render_count_facet(
    parent: &PipelineModel,
    count_name: &str,
    collection: &str,
    ctx: &mut GenerationContext,
) -> Result<()> {
    ctx.push(&format!(
        "SELECT JSON_ARRAYAGG(JSON_OBJECT('{}' VALUE cnt)) FROM (SELECT COUNT(*) AS cnt FROM ",
        count_name.replace('\'', "''")
    ));
    if parent.group.is_some() {
        // Counting grouped rows counts the groups.
        ctx.push("(");
        let mut inner = parent.clone();
        inner.facet = None;
        inner.post_facet_project = None;
        inner.sort = None;
        inner.limit = None;
        inner.skip = None;
        inner.count = None;
        ctx.enter_nested();
        let result = render_model(&inner, collection, ctx);
        ctx.exit_nested();
        result?;
        ctx.push(")");
    } else {
        ctx.push(&format!("{} base", ctx.config.qualified_table(collection)));
        if !parent.matches.is_empty() {
            ctx.push(" WHERE ");
            for (i, m) in parent.matches.iter().enumerate() {
                if i > 0 {
                    ctx.push(" AND ");
                }
                render_expr(m, ctx)?;
            }
        }
    }
    ctx.push(")");
    Ok(())
}

/// Post-facet `$project` extracts scalars from facet arrays via
/// `JSON_VALUE((<facet>), '$[0].field')`.
fn render_post_facet_project(
    model: &PipelineModel,
    facet: &FacetStage,
    project: &ProjectStage,
    collection: &str,
    ctx: &mut GenerationContext,
) -> Result<()> {
    ctx.push("SELECT ");
    if let Some(hint) = ctx.take_hint() {
        ctx.push(&format!("/*+ {} */ ", hint));
    }
    let mut first = true;
    for (name, field) in &project.fields {
        let ProjectField::Include(expr) = field else {
            continue;
        };
        if !first {
            ctx.push(", ");
        }
        first = false;
        render_facet_extract(model, facet, expr, collection, ctx)?;
        ctx.push(&format!(" AS {}", sql_ident(name)));
    }
    ctx.sep();
    ctx.push("FROM DUAL");
    Ok(())
}

fn facet_extract_path(expr: &Expression) -> Option<&str> {
    match expr {
        Expression::FieldPath { path, .. } => Some(path),
        Expression::ArrayFunc {
            op: ArrayOp::ElemAt,
            args,
        } if args.len() == 2 => match (&args[0], &args[1]) {
            (
                Expression::FieldPath { path, .. },
                Expression::Literal(bson::Bson::Int32(0) | bson::Bson::Int64(0)),
            ) => Some(path),
            _ => None,
        },
        _ => None,
    }
}

fn render_facet_extract(
    model: &PipelineModel,
    facet: &FacetStage,
    expr: &Expression,
    collection: &str,
    ctx: &mut GenerationContext,
) -> Result<()> {
    if let Some(path) = facet_extract_path(expr) {
        if let Some((facet_name, rest)) = path.split_once('.') {
            if let Some(stages) = facet.facets.get(facet_name) {
                ctx.push("JSON_VALUE((");
                render_facet_subquery(model, stages, collection, ctx)?;
                ctx.push(&format!("), '{}')", json_path(&format!("[0].{}", rest))));
                return Ok(());
            }
        }
    }
    unsupported_placeholder("$project after $facet", ctx)
}

// --- shape 7: JSON-aggregation wrap ---

fn render_json_aggregation(
    model: &PipelineModel,
    collection: &str,
    ctx: &mut GenerationContext,
) -> Result<()> {
    let project = model
        .project
        .ok_or_else(|| MongoraError::translation("projection slot vanished"))?;
    ctx.push("SELECT ");
    if let Some(hint) = ctx.take_hint() {
        ctx.push(&format!("/*+ {} */ ", hint));
    }
    ctx.push("JSON_ARRAYAGG(JSON_OBJECT(*) RETURNING CLOB)");
    ctx.sep();
    ctx.push("FROM (");

    let plan = register_sources(model, ctx);
    ctx.push("SELECT ");
    let mut output_columns: Vec<String> = Vec::new();
    let mut first = true;
    for (name, field) in &project.fields {
        let ProjectField::Include(expr) = field else {
            continue;
        };
        if !first {
            ctx.push(", ");
        }
        first = false;
        ctx.enter_json_output();
        let rendered = render_expr(expr, ctx);
        ctx.exit_json_output();
        rendered?;
        ctx.push(&format!(" AS {}", sql_ident(name)));
        output_columns.push(name.clone());
    }
    render_window_columns(model, &mut output_columns, ctx)?;
    render_graph_columns(model, &plan, &mut output_columns, ctx);

    render_from_and_joins(model, collection, &plan, ctx)?;
    render_where(model, ctx)?;
    if model.sample.is_some() {
        ctx.sep();
        ctx.push("ORDER BY DBMS_RANDOM.VALUE");
    } else if let Some(sort) = model.sort {
        ctx.sep();
        render_order_by(&sort.fields, &output_columns, ctx)?;
    }
    let effective_limit = model
        .limit
        .or(model.sample)
        .or(model.sort.and_then(|s| s.limit_hint));
    render_offset_fetch(model.skip, effective_limit, ctx);
    ctx.push(")");
    Ok(())
}

// --- shape 8: standard query ---

fn render_standard(
    model: &PipelineModel,
    collection: &str,
    ctx: &mut GenerationContext,
) -> Result<()> {
    let plan = register_sources(model, ctx);
    let data = ctx.data_column().to_string();

    ctx.push("SELECT ");
    if let Some(hint) = ctx.take_hint() {
        ctx.push(&format!("/*+ {} */ ", hint));
    }

    let mut output_columns: Vec<String> = Vec::new();
    if let Some(name) = model.count {
        ctx.push(&format!("COUNT(*) AS {}", sql_ident(name)));
        output_columns.push(name.to_string());
    } else if let Some(expr) = model.replace_root {
        render_replace_root(expr, &data, ctx)?;
        output_columns.push(data.clone());
    } else if let Some(group) = model.group {
        output_columns.extend(render_group_select(group, ctx)?);
    } else if let Some(bucket) = model.bucket {
        output_columns.extend(render_bucket_select(bucket, ctx)?);
    } else if let Some(project) = model.project {
        output_columns.extend(render_project_select(project, &data, ctx)?);
    } else if !model.unsets.is_empty() {
        let paths: Vec<String> = model
            .unsets
            .iter()
            .flat_map(|u| u.iter().cloned())
            .collect();
        render_remove_projection(&paths, ctx);
        ctx.push(&format!(" AS {}", data));
        output_columns.push(data.clone());
    } else {
        let base = ctx.base_alias();
        ctx.push(&format!("{}.{}", base, data));
        output_columns.push(data.clone());
    }

    // Computed columns ride along on row-shaped selects only; after
    // $replaceRoot the original row is gone and nothing may ride along.
    if model.group.is_none()
        && model.count.is_none()
        && model.bucket.is_none()
        && model.replace_root.is_none()
    {
        for add in &model.add_fields {
            for (name, expr) in &add.fields {
                ctx.push(", ");
                render_expr(expr, ctx)?;
                ctx.push(&format!(" AS {}", sql_ident(name)));
                output_columns.push(name.clone());
            }
        }
        render_window_columns(model, &mut output_columns, ctx)?;
        render_graph_columns(model, &plan, &mut output_columns, ctx);
    }

    render_from_and_joins(model, collection, &plan, ctx)?;
    render_where(model, ctx)?;

    if let Some(group) = model.group {
        render_group_by_clause(group, ctx)?;
    } else if let Some(bucket) = model.bucket {
        ctx.sep();
        ctx.push("GROUP BY ");
        render_bucket_case(bucket, ctx)?;
    }

    if model.sample.is_some() {
        ctx.sep();
        ctx.push("ORDER BY DBMS_RANDOM.VALUE");
    } else if let Some(sort) = model.sort {
        ctx.sep();
        render_order_by(&sort.fields, &output_columns, ctx)?;
    }
    let effective_limit = model
        .limit
        .or(model.sample)
        .or(model.sort.and_then(|s| s.limit_hint));
    render_offset_fetch(model.skip, effective_limit, ctx);

    for union in &model.unions {
        ctx.sep();
        ctx.push("UNION ALL ");
        render_union_branch(union, ctx)?;
    }
    if let Some(sort) = model.post_union_sort {
        ctx.sep();
        render_order_by(&sort.fields, &output_columns, ctx)?;
    }
    render_offset_fetch(model.post_union_skip, model.post_union_limit, ctx);
    Ok(())
}

fn render_window_columns(
    model: &PipelineModel,
    output_columns: &mut Vec<String>,
    ctx: &mut GenerationContext,
) -> Result<()> {
    for window in &model.windows {
        for (name, output) in &window.output {
            ctx.push(", ");
            render_window_function(output, window, ctx)?;
            ctx.push(&format!(" AS {}", sql_ident(name)));
            output_columns.push(name.clone());
        }
    }
    Ok(())
}

fn render_graph_columns(
    model: &PipelineModel,
    plan: &JoinPlan,
    output_columns: &mut Vec<String>,
    ctx: &mut GenerationContext,
) {
    let data = ctx.data_column().to_string();
    for (stage, alias) in model.graph_lookups.iter().zip(&plan.graph_aliases) {
        ctx.push(&format!(
            ", {}.{} AS {}",
            alias,
            data,
            sql_ident(&stage.as_field)
        ));
        output_columns.push(stage.as_field.clone());
    }
}

fn render_from_and_joins(
    model: &PipelineModel,
    collection: &str,
    plan: &JoinPlan,
    ctx: &mut GenerationContext,
) -> Result<()> {
    ctx.sep();
    let base = ctx.base_alias();
    ctx.push(&format!(
        "FROM {} {}",
        ctx.config.qualified_table(collection),
        base
    ));
    for (unwind, alias) in &plan.unwind_joins {
        render_unwind_join(unwind, alias, ctx)?;
    }
    for lookup in &model.lookups {
        render_lookup_join(lookup, ctx)?;
    }
    for (stage, alias) in model.graph_lookups.iter().zip(&plan.graph_aliases) {
        render_graph_lookup_join(stage, alias, ctx)?;
    }
    Ok(())
}

fn render_where(model: &PipelineModel, ctx: &mut GenerationContext) -> Result<()> {
    if model.matches.is_empty() && model.redacts.is_empty() {
        return Ok(());
    }
    ctx.sep();
    ctx.push("WHERE ");
    let mut first = true;
    for m in &model.matches {
        if !first {
            ctx.push(" AND ");
        }
        first = false;
        render_expr(m, ctx)?;
    }
    // Redact filters append after match filters.
    for redact in &model.redacts {
        if !first {
            ctx.push(" AND ");
        }
        first = false;
        render_expr(redact, ctx)?;
        ctx.push(" != '$$PRUNE'");
    }
    Ok(())
}

fn render_union_branch(union: &UnionWithStage, ctx: &mut GenerationContext) -> Result<()> {
    let branch = PipelineModel::analyze(&union.pipeline)?;
    let snapshot = ctx.snapshot_registries();
    ctx.enter_nested();
    let result = render_model(&branch, &union.collection, ctx);
    ctx.exit_nested();
    ctx.restore_registries(snapshot);
    result
}

/// New-root paths resolve through the normal chain in JSON-output mode,
/// so a root introduced by an earlier `$addFields` renders its registered
/// expression instead of a dead JSON path.
fn render_replace_root(expr: &Expression, data: &str, ctx: &mut GenerationContext) -> Result<()> {
    match expr {
        Expression::FieldPath { path, .. } => {
            ctx.enter_json_output();
            let result = render_field_access(path, None, ctx);
            ctx.exit_json_output();
            result?;
        }
        other => render_expr(other, ctx)?,
    }
    ctx.push(&format!(" AS {}", data));
    Ok(())
}

fn render_group_select(group: &GroupStage, ctx: &mut GenerationContext) -> Result<Vec<String>> {
    let mut columns = Vec::new();
    let mut first = true;
    match &group.id {
        None => {
            if group.accumulators.is_empty() {
                ctx.push("NULL AS dummy");
                return Ok(vec!["dummy".to_string()]);
            }
        }
        Some(Expression::CompoundId(fields)) => {
            for (name, expr) in fields {
                if !first {
                    ctx.push(", ");
                }
                first = false;
                render_expr(expr, ctx)?;
                ctx.push(&format!(" AS {}", sql_ident(name)));
                columns.push(name.clone());
            }
        }
        Some(expr) => {
            render_expr(expr, ctx)?;
            ctx.push(" AS \"_id\"");
            columns.push("_id".to_string());
            first = false;
        }
    }
    for (name, acc) in &group.accumulators {
        if !first {
            ctx.push(", ");
        }
        first = false;
        render_expr(acc, ctx)?;
        ctx.push(&format!(" AS {}", sql_ident(name)));
        columns.push(name.clone());
    }
    Ok(columns)
}

fn render_group_by_clause(group: &GroupStage, ctx: &mut GenerationContext) -> Result<()> {
    let Some(id) = &group.id else {
        return Ok(());
    };
    ctx.sep();
    ctx.push("GROUP BY ");
    render_expr(id, ctx)
}

fn render_bucket_select(bucket: &BucketStage, ctx: &mut GenerationContext) -> Result<Vec<String>> {
    render_bucket_case(bucket, ctx)?;
    ctx.push(" AS \"_id\"");
    let mut columns = vec!["_id".to_string()];
    if bucket.output.is_empty() {
        ctx.push(", COUNT(*) AS count");
        columns.push("count".to_string());
    } else {
        for (name, acc) in &bucket.output {
            ctx.push(", ");
            render_expr(acc, ctx)?;
            ctx.push(&format!(" AS {}", sql_ident(name)));
            columns.push(name.clone());
        }
    }
    Ok(columns)
}

/// Boundary buckets as a CASE over half-open ranges. Boundaries render
/// inline: a bind placeholder is ill-formed there.
fn render_bucket_case(bucket: &BucketStage, ctx: &mut GenerationContext) -> Result<()> {
    ctx.push("CASE");
    for pair in bucket.boundaries.windows(2) {
        ctx.push(" WHEN ");
        render_expr(&bucket.group_by, ctx)?;
        ctx.push(" >= ");
        ctx.push_inline_literal(&pair[0])?;
        ctx.push(" AND ");
        render_expr(&bucket.group_by, ctx)?;
        ctx.push(" < ");
        ctx.push_inline_literal(&pair[1])?;
        ctx.push(" THEN ");
        ctx.push_inline_literal(&pair[0])?;
    }
    if let Some(default) = &bucket.default {
        ctx.push(" ELSE ");
        ctx.push_inline_literal(default)?;
    }
    ctx.push(" END");
    Ok(())
}

fn render_project_select(
    project: &ProjectStage,
    data: &str,
    ctx: &mut GenerationContext,
) -> Result<Vec<String>> {
    if project.exclusion_mode {
        let paths: Vec<String> = project
            .fields
            .iter()
            .filter(|(_, f)| matches!(f, ProjectField::Excluded))
            .map(|(name, _)| name.clone())
            .collect();
        render_remove_projection(&paths, ctx);
        ctx.push(&format!(" AS {}", data));
        return Ok(vec![data.to_string()]);
    }
    let mut columns = Vec::new();
    let mut first = true;
    for (name, field) in &project.fields {
        let ProjectField::Include(expr) = field else {
            continue;
        };
        if !first {
            ctx.push(", ");
        }
        first = false;
        render_expr(expr, ctx)?;
        ctx.push(&format!(" AS {}", sql_ident(name)));
        columns.push(name.clone());
    }
    Ok(columns)
}
