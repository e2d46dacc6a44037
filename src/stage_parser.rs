/*!
 * @file stage_parser.rs
 * @brief Per-stage parsers and the stage dispatch registry
 */

use bson::{Bson, Document};
use indexmap::IndexMap;

use crate::error::{MongoraError, Result};
use crate::expr::Expression;
use crate::expr_parser::ExpressionParser;
use crate::operators::{AccumulatorOp, WindowOp};
use crate::stage::{
    AddFieldsStage, BucketAutoStage, BucketStage, FacetStage, FrameBound, FrameUnit,
    GraphLookupStage, GroupStage, LookupKind, LookupStage, MergeStage, OutStage, ProjectField,
    ProjectStage, SetWindowFieldsStage, SortField, SortStage, Stage, UnionWithStage, UnwindStage,
    WhenMatched, WhenNotMatched, WindowFrame, WindowOutput,
};
use crate::validate::{sanitize, validate_field_path, validate_table_name};

/// Stage-document dispatch. Parsers recurse through `parse_pipeline` for
/// the nested pipelines of `$unionWith`, `$facet` and the `$lookup`
/// pipeline form.
pub struct StageParser;

impl StageParser {
    pub fn parse_pipeline(stage_docs: &[Document]) -> Result<Vec<Stage>> {
        let mut stages = Vec::with_capacity(stage_docs.len());
        for doc in stage_docs {
            Self::parse_stage_into(doc, &mut stages)?;
        }
        Ok(stages)
    }

    /// Parses one stage document. `$sortByCount` desugars to two stages,
    /// so parsers append rather than return.
    fn parse_stage_into(doc: &Document, out: &mut Vec<Stage>) -> Result<()> {
        if doc.len() != 1 {
            return Err(MongoraError::validation(
                "BAD_STAGE",
                "pipeline stage must have exactly one operator key",
            ));
        }
        let (token, value) = doc.iter().next().unwrap();

        let stage = match token.as_str() {
            "$match" => {
                let filter = value.as_document().ok_or_else(|| {
                    MongoraError::validation("BAD_MATCH", "$match stage must be a document")
                })?;
                Stage::Match(ExpressionParser::parse_filter(filter)?)
            }
            "$group" => Stage::Group(Self::parse_group(value)?),
            "$project" => Stage::Project(Self::parse_project(value)?),
            "$sort" => Stage::Sort(Self::parse_sort(value)?),
            "$limit" => Stage::Limit(Self::coerce_count(token, value, false)?),
            "$skip" => Stage::Skip(Self::coerce_count(token, value, true)?),
            "$lookup" => Stage::Lookup(Self::parse_lookup(value)?),
            "$unwind" => Stage::Unwind(Self::parse_unwind(value)?),
            "$addFields" | "$set" => Stage::AddFields(Self::parse_add_fields(token, value)?),
            "$unionWith" => Stage::UnionWith(Self::parse_union_with(value)?),
            "$bucket" => Stage::Bucket(Self::parse_bucket(value)?),
            "$bucketAuto" => Stage::BucketAuto(Self::parse_bucket_auto(value)?),
            "$facet" => Stage::Facet(Self::parse_facet(value)?),
            "$graphLookup" => Stage::GraphLookup(Self::parse_graph_lookup(value)?),
            "$setWindowFields" => Stage::SetWindowFields(Self::parse_set_window_fields(value)?),
            "$redact" => Stage::Redact(ExpressionParser::parse_value(value)?),
            "$sample" => Stage::Sample(Self::parse_sample(value)?),
            "$count" => Stage::Count(Self::parse_count(value)?),
            "$merge" => Stage::Merge(Self::parse_merge(value)?),
            "$out" => Stage::Out(Self::parse_out(value)?),
            "$replaceRoot" => {
                let body = value.as_document().ok_or_else(|| {
                    MongoraError::validation(
                        "BAD_REPLACE_ROOT",
                        "$replaceRoot stage must be a document",
                    )
                })?;
                let new_root = body.get("newRoot").ok_or_else(|| {
                    MongoraError::validation("BAD_REPLACE_ROOT", "$replaceRoot requires newRoot")
                })?;
                Stage::ReplaceRoot(ExpressionParser::parse_value(new_root)?)
            }
            "$replaceWith" => Stage::ReplaceRoot(ExpressionParser::parse_value(value)?),
            "$unset" => Stage::Unset(Self::parse_unset(value)?),
            "$sortByCount" => {
                // Desugars to a count group followed by a descending sort.
                let group_by = ExpressionParser::parse_value(value)?;
                let mut accumulators = IndexMap::new();
                accumulators.insert(
                    "count".to_string(),
                    Expression::Accumulator {
                        op: AccumulatorOp::Sum,
                        arg: Box::new(Expression::Literal(Bson::Int32(1))),
                    },
                );
                out.push(Stage::Group(GroupStage {
                    id: Some(group_by),
                    accumulators,
                }));
                out.push(Stage::Sort(SortStage {
                    fields: vec![SortField {
                        path: "count".to_string(),
                        descending: true,
                    }],
                    limit_hint: None,
                }));
                return Ok(());
            }
            other => return Err(MongoraError::unsupported(other.to_string())),
        };

        out.push(stage);
        Ok(())
    }

    /// Permissive numeric coercion: any BSON number truncates to integer.
    fn coerce_count(token: &str, value: &Bson, allow_zero: bool) -> Result<u64> {
        let number = match value {
            Bson::Int32(i) => *i as f64,
            Bson::Int64(i) => *i as f64,
            Bson::Double(f) => *f,
            _ => {
                return Err(MongoraError::validation(
                    "BAD_COUNT",
                    format!("{} stage must be a number", token),
                ))
            }
        };
        if number < 0.0 || (!allow_zero && number < 1.0) {
            return Err(MongoraError::validation(
                "BAD_COUNT",
                format!("{} must be {}", token, if allow_zero { "non-negative" } else { "positive" }),
            ));
        }
        Ok(number.trunc() as u64)
    }

    fn parse_group(value: &Bson) -> Result<GroupStage> {
        let doc = value.as_document().ok_or_else(|| {
            MongoraError::validation("BAD_GROUP", "$group stage must be a document")
        })?;
        if !doc.contains_key("_id") {
            return Err(MongoraError::validation("BAD_GROUP", "$group requires _id"));
        }

        let id = Self::parse_group_id(doc.get("_id").unwrap())?;
        let mut accumulators = IndexMap::new();
        for (name, acc) in doc {
            if name == "_id" {
                continue;
            }
            validate_field_path(name)?;
            accumulators.insert(name.clone(), ExpressionParser::parse_accumulator(acc)?);
        }
        Ok(GroupStage { id, accumulators })
    }

    fn parse_group_id(value: &Bson) -> Result<Option<Expression>> {
        match value {
            Bson::Null => Ok(None),
            Bson::Document(doc)
                if !doc.is_empty()
                    && !doc.keys().next().map(|k| k.starts_with('$')).unwrap_or(false) =>
            {
                // Compound key: each entry renders under its own alias.
                let mut fields = IndexMap::new();
                for (name, v) in doc {
                    validate_field_path(name)?;
                    fields.insert(name.clone(), ExpressionParser::parse_value(v)?);
                }
                Ok(Some(Expression::CompoundId(fields)))
            }
            other => Ok(Some(ExpressionParser::parse_value(other)?)),
        }
    }

    fn parse_project(value: &Bson) -> Result<ProjectStage> {
        let doc = value.as_document().ok_or_else(|| {
            MongoraError::validation("BAD_PROJECT", "$project stage must be a document")
        })?;
        if doc.is_empty() {
            return Err(MongoraError::validation(
                "BAD_PROJECT",
                "$project requires at least one field",
            ));
        }

        let mut fields = IndexMap::new();
        let mut has_include = false;
        let mut has_exclude = false;
        for (name, spec) in doc {
            validate_field_path(name)?;
            let field = match spec {
                Bson::Int32(0) | Bson::Int64(0) | Bson::Boolean(false) => {
                    if name != "_id" {
                        has_exclude = true;
                    }
                    ProjectField::Excluded
                }
                Bson::Int32(1) | Bson::Int64(1) | Bson::Boolean(true) => {
                    has_include = true;
                    ProjectField::Include(Expression::field(name.clone()))
                }
                other => {
                    has_include = true;
                    ProjectField::Include(ExpressionParser::parse_value(other)?)
                }
            };
            fields.insert(name.clone(), field);
        }

        if has_include && has_exclude {
            return Err(MongoraError::validation(
                "MIXED_PROJECTION",
                "cannot mix inclusion and exclusion in one $project",
            ));
        }
        Ok(ProjectStage {
            fields,
            exclusion_mode: !has_include,
        })
    }

    fn parse_sort(value: &Bson) -> Result<SortStage> {
        let doc = value.as_document().ok_or_else(|| {
            MongoraError::validation("BAD_SORT", "$sort stage must be a document")
        })?;
        if doc.is_empty() {
            return Err(MongoraError::validation(
                "BAD_SORT",
                "$sort requires at least one field",
            ));
        }
        let mut fields = Vec::with_capacity(doc.len());
        for (name, direction) in doc {
            let path = validate_field_path(name)?;
            let dir = match direction {
                Bson::Int32(i) => *i as f64,
                Bson::Int64(i) => *i as f64,
                Bson::Double(f) => *f,
                _ => {
                    return Err(MongoraError::validation(
                        "BAD_SORT",
                        "sort direction must be 1 or -1",
                    ))
                }
            };
            if dir == 0.0 {
                return Err(MongoraError::validation(
                    "BAD_SORT",
                    "sort direction must be 1 or -1",
                ));
            }
            fields.push(SortField {
                path,
                descending: dir < 0.0,
            });
        }
        Ok(SortStage {
            fields,
            limit_hint: None,
        })
    }

    fn parse_lookup(value: &Bson) -> Result<LookupStage> {
        let doc = value.as_document().ok_or_else(|| {
            MongoraError::validation("BAD_LOOKUP", "$lookup stage must be a document")
        })?;
        let from = doc
            .get("from")
            .and_then(|v| v.as_str())
            .ok_or_else(|| MongoraError::validation("BAD_LOOKUP", "$lookup requires from"))?;
        let as_field = doc
            .get("as")
            .and_then(|v| v.as_str())
            .ok_or_else(|| MongoraError::validation("BAD_LOOKUP", "$lookup requires as"))?;
        validate_table_name(from)?;
        let as_field = validate_field_path(as_field)?;

        let kind = if let Some(pipeline) = doc.get("pipeline") {
            let stage_docs = Self::stage_documents(pipeline, "$lookup pipeline")?;
            let mut let_vars = IndexMap::new();
            if let Some(lets) = doc.get("let").and_then(|v| v.as_document()) {
                for (name, v) in lets {
                    validate_field_path(name)?;
                    let_vars.insert(name.clone(), ExpressionParser::parse_value(v)?);
                }
            }
            LookupKind::Pipeline {
                let_vars,
                pipeline: Self::parse_pipeline(&stage_docs)?,
            }
        } else {
            let local_field = doc
                .get("localField")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    MongoraError::validation("BAD_LOOKUP", "$lookup requires localField")
                })?;
            let foreign_field = doc
                .get("foreignField")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    MongoraError::validation("BAD_LOOKUP", "$lookup requires foreignField")
                })?;
            LookupKind::Equality {
                local_field: validate_field_path(local_field)?,
                foreign_field: validate_field_path(foreign_field)?,
            }
        };

        Ok(LookupStage {
            from: from.to_string(),
            as_field,
            kind,
        })
    }

    fn parse_unwind(value: &Bson) -> Result<UnwindStage> {
        match value {
            Bson::String(path) => Ok(UnwindStage {
                path: validate_field_path(path)?,
                include_array_index: None,
                preserve_null_and_empty_arrays: false,
            }),
            Bson::Document(doc) => {
                let path = doc
                    .get("path")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        MongoraError::validation("BAD_UNWIND", "$unwind requires path")
                    })?;
                let include_array_index = doc
                    .get("includeArrayIndex")
                    .and_then(|v| v.as_str())
                    .map(validate_field_path)
                    .transpose()?;
                let preserve = doc
                    .get("preserveNullAndEmptyArrays")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                Ok(UnwindStage {
                    path: validate_field_path(path)?,
                    include_array_index,
                    preserve_null_and_empty_arrays: preserve,
                })
            }
            _ => Err(MongoraError::validation(
                "BAD_UNWIND",
                "$unwind stage must be a string or document",
            )),
        }
    }

    fn parse_add_fields(token: &str, value: &Bson) -> Result<AddFieldsStage> {
        let doc = value.as_document().ok_or_else(|| {
            MongoraError::validation(
                "BAD_ADD_FIELDS",
                format!("{} stage must be a document", token),
            )
        })?;
        if doc.is_empty() {
            return Err(MongoraError::validation(
                "BAD_ADD_FIELDS",
                format!("{} requires at least one field", token),
            ));
        }
        let mut fields = IndexMap::new();
        for (name, v) in doc {
            validate_field_path(name)?;
            fields.insert(name.clone(), ExpressionParser::parse_value(v)?);
        }
        Ok(AddFieldsStage { fields })
    }

    fn parse_union_with(value: &Bson) -> Result<UnionWithStage> {
        match value {
            Bson::String(coll) => Ok(UnionWithStage {
                collection: validate_table_name(coll)?,
                pipeline: Vec::new(),
            }),
            Bson::Document(doc) => {
                let coll = doc
                    .get("coll")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        MongoraError::validation("BAD_UNION", "$unionWith requires coll")
                    })?;
                let pipeline = match doc.get("pipeline") {
                    Some(p) => Self::parse_pipeline(&Self::stage_documents(p, "$unionWith pipeline")?)?,
                    None => Vec::new(),
                };
                Ok(UnionWithStage {
                    collection: validate_table_name(coll)?,
                    pipeline,
                })
            }
            _ => Err(MongoraError::validation(
                "BAD_UNION",
                "$unionWith stage must be a string or document",
            )),
        }
    }

    fn parse_bucket(value: &Bson) -> Result<BucketStage> {
        let doc = value.as_document().ok_or_else(|| {
            MongoraError::validation("BAD_BUCKET", "$bucket stage must be a document")
        })?;
        let group_by = doc
            .get("groupBy")
            .ok_or_else(|| MongoraError::validation("BAD_BUCKET", "$bucket requires groupBy"))?;
        let boundaries: Vec<Bson> = doc
            .get("boundaries")
            .and_then(|v| v.as_array())
            .ok_or_else(|| {
                MongoraError::validation("BAD_BUCKET", "$bucket requires boundaries")
            })?
            .to_vec();
        if boundaries.len() < 2 {
            return Err(MongoraError::validation(
                "BAD_BUCKET",
                "$bucket requires at least two boundaries",
            ));
        }
        let output = Self::parse_output_accumulators(doc.get("output"))?;
        Ok(BucketStage {
            group_by: ExpressionParser::parse_value(group_by)?,
            boundaries,
            default: doc.get("default").cloned(),
            output,
        })
    }

    fn parse_bucket_auto(value: &Bson) -> Result<BucketAutoStage> {
        let doc = value.as_document().ok_or_else(|| {
            MongoraError::validation("BAD_BUCKET_AUTO", "$bucketAuto stage must be a document")
        })?;
        let group_by = doc.get("groupBy").ok_or_else(|| {
            MongoraError::validation("BAD_BUCKET_AUTO", "$bucketAuto requires groupBy")
        })?;
        let buckets = doc.get("buckets").ok_or_else(|| {
            MongoraError::validation("BAD_BUCKET_AUTO", "$bucketAuto requires buckets")
        })?;
        let buckets = Self::coerce_count("$bucketAuto.buckets", buckets, false)? as u32;
        let output = Self::parse_output_accumulators(doc.get("output"))?;
        let granularity = doc
            .get("granularity")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Ok(BucketAutoStage {
            group_by: ExpressionParser::parse_value(group_by)?,
            buckets,
            output,
            granularity,
        })
    }

    fn parse_output_accumulators(value: Option<&Bson>) -> Result<IndexMap<String, Expression>> {
        let mut output = IndexMap::new();
        if let Some(doc) = value.and_then(|v| v.as_document()) {
            for (name, acc) in doc {
                validate_field_path(name)?;
                output.insert(name.clone(), ExpressionParser::parse_accumulator(acc)?);
            }
        }
        Ok(output)
    }

    fn parse_facet(value: &Bson) -> Result<FacetStage> {
        let doc = value.as_document().ok_or_else(|| {
            MongoraError::validation("BAD_FACET", "$facet stage must be a document")
        })?;
        if doc.is_empty() {
            return Err(MongoraError::validation(
                "BAD_FACET",
                "$facet requires at least one facet",
            ));
        }
        let mut facets = IndexMap::new();
        for (name, sub) in doc {
            validate_field_path(name)?;
            let stage_docs = Self::stage_documents(sub, "$facet pipeline")?;
            facets.insert(name.clone(), Self::parse_pipeline(&stage_docs)?);
        }
        Ok(FacetStage { facets })
    }

    fn parse_graph_lookup(value: &Bson) -> Result<GraphLookupStage> {
        let doc = value.as_document().ok_or_else(|| {
            MongoraError::validation("BAD_GRAPH_LOOKUP", "$graphLookup stage must be a document")
        })?;
        let required_str = |key: &str| -> Result<String> {
            doc.get(key)
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    MongoraError::validation(
                        "BAD_GRAPH_LOOKUP",
                        format!("$graphLookup requires {}", key),
                    )
                })
        };
        let from = validate_table_name(&required_str("from")?)?;
        let connect_from_field = validate_field_path(&required_str("connectFromField")?)?;
        let connect_to_field = validate_field_path(&required_str("connectToField")?)?;
        let as_field = validate_field_path(&required_str("as")?)?;
        let start_with = doc.get("startWith").ok_or_else(|| {
            MongoraError::validation("BAD_GRAPH_LOOKUP", "$graphLookup requires startWith")
        })?;
        let max_depth = match doc.get("maxDepth") {
            Some(v) => Some(Self::coerce_count("$graphLookup.maxDepth", v, true)? as i64),
            None => None,
        };
        let depth_field = doc
            .get("depthField")
            .and_then(|v| v.as_str())
            .map(validate_field_path)
            .transpose()?;
        let restrict_search_with_match = doc
            .get("restrictSearchWithMatch")
            .and_then(|v| v.as_document())
            .filter(|d| !d.is_empty())
            .map(ExpressionParser::parse_filter)
            .transpose()?;

        Ok(GraphLookupStage {
            from,
            start_with: ExpressionParser::parse_value(start_with)?,
            connect_from_field,
            connect_to_field,
            as_field,
            max_depth,
            depth_field,
            restrict_search_with_match,
        })
    }

    fn parse_set_window_fields(value: &Bson) -> Result<SetWindowFieldsStage> {
        let doc = value.as_document().ok_or_else(|| {
            MongoraError::validation(
                "BAD_WINDOW",
                "$setWindowFields stage must be a document",
            )
        })?;
        let partition_by = doc
            .get("partitionBy")
            .map(ExpressionParser::parse_value)
            .transpose()?;
        let sort_by = match doc.get("sortBy") {
            Some(sort) => Self::parse_sort(sort)?.fields,
            None => Vec::new(),
        };
        let output_doc = doc
            .get("output")
            .and_then(|v| v.as_document())
            .ok_or_else(|| {
                MongoraError::validation("BAD_WINDOW", "$setWindowFields requires output")
            })?;
        if output_doc.is_empty() {
            return Err(MongoraError::validation(
                "BAD_WINDOW",
                "$setWindowFields output must not be empty",
            ));
        }

        let mut output = IndexMap::new();
        for (name, spec) in output_doc {
            validate_field_path(name)?;
            output.insert(name.clone(), Self::parse_window_output(name, spec)?);
        }
        Ok(SetWindowFieldsStage {
            partition_by,
            sort_by,
            output,
        })
    }

    fn parse_window_output(name: &str, spec: &Bson) -> Result<WindowOutput> {
        let doc = spec.as_document().ok_or_else(|| {
            MongoraError::validation(
                "BAD_WINDOW",
                format!("window output {} must be a document", sanitize(name)),
            )
        })?;

        let mut op = None;
        let mut arg = None;
        let mut frame = None;
        for (key, value) in doc {
            if key == "window" {
                frame = Some(Self::parse_window_frame(value)?);
                continue;
            }
            let window_op = WindowOp::from_token(key)
                .ok_or_else(|| MongoraError::unsupported(key.clone()))?;
            op = Some(window_op);
            // Ranking operators and $count take a bare {} argument.
            if !window_op.is_ranking() && window_op != WindowOp::Count {
                arg = Some(ExpressionParser::parse_value(value)?);
            }
        }

        let op = op.ok_or_else(|| {
            MongoraError::validation(
                "BAD_WINDOW",
                format!("window output {} has no operator", sanitize(name)),
            )
        })?;
        if op.is_ranking() && frame.is_some() {
            return Err(MongoraError::validation(
                "BAD_WINDOW",
                "ranking window operators accept no frame",
            ));
        }
        Ok(WindowOutput { op, arg, frame })
    }

    fn parse_window_frame(value: &Bson) -> Result<WindowFrame> {
        let doc = value.as_document().ok_or_else(|| {
            MongoraError::validation("BAD_WINDOW", "window must be a document")
        })?;
        let (unit, bounds) = if let Some(b) = doc.get("documents") {
            (FrameUnit::Documents, b)
        } else if let Some(b) = doc.get("range") {
            (FrameUnit::Range, b)
        } else {
            return Err(MongoraError::validation(
                "BAD_WINDOW",
                "window requires documents or range bounds",
            ));
        };
        let bounds = bounds.as_array().ok_or_else(|| {
            MongoraError::validation("BAD_WINDOW", "window bounds must be a two-element array")
        })?;
        if bounds.len() != 2 {
            return Err(MongoraError::validation(
                "BAD_WINDOW",
                "window bounds must be a two-element array",
            ));
        }
        Ok(WindowFrame {
            unit,
            lower: Self::parse_frame_bound(&bounds[0])?,
            upper: Self::parse_frame_bound(&bounds[1])?,
        })
    }

    fn parse_frame_bound(value: &Bson) -> Result<FrameBound> {
        match value {
            Bson::String(s) if s == "unbounded" => Ok(FrameBound::Unbounded),
            Bson::String(s) if s == "current" => Ok(FrameBound::Current),
            Bson::Int32(i) => Ok(FrameBound::Offset(*i as i64)),
            Bson::Int64(i) => Ok(FrameBound::Offset(*i)),
            Bson::Double(f) => Ok(FrameBound::Offset(f.trunc() as i64)),
            other => Err(MongoraError::validation(
                "BAD_WINDOW",
                format!("invalid window bound: {}", sanitize(&other.to_string())),
            )),
        }
    }

    fn parse_sample(value: &Bson) -> Result<u64> {
        let doc = value.as_document().ok_or_else(|| {
            MongoraError::validation("BAD_SAMPLE", "$sample stage must be a document")
        })?;
        let size = doc.get("size").ok_or_else(|| {
            MongoraError::validation("BAD_SAMPLE", "$sample requires size")
        })?;
        Self::coerce_count("$sample.size", size, false)
    }

    fn parse_count(value: &Bson) -> Result<String> {
        let name = value.as_str().ok_or_else(|| {
            MongoraError::validation("BAD_COUNT_STAGE", "$count stage must be a string")
        })?;
        if name.is_empty() || name.starts_with('$') {
            return Err(MongoraError::validation(
                "BAD_COUNT_STAGE",
                "$count field name must be non-empty and must not start with $",
            ));
        }
        validate_field_path(name)
    }

    fn parse_merge(value: &Bson) -> Result<MergeStage> {
        let (into, database, doc) = match value {
            Bson::String(coll) => (coll.clone(), None, None),
            Bson::Document(doc) => {
                let (into, database) = match doc.get("into") {
                    Some(Bson::String(coll)) => (coll.clone(), None),
                    Some(Bson::Document(target)) => {
                        let coll = target
                            .get("coll")
                            .and_then(|v| v.as_str())
                            .ok_or_else(|| {
                                MongoraError::validation("BAD_MERGE", "$merge into requires coll")
                            })?;
                        let db = target.get("db").and_then(|v| v.as_str()).map(|s| s.to_string());
                        (coll.to_string(), db)
                    }
                    _ => {
                        return Err(MongoraError::validation(
                            "BAD_MERGE",
                            "$merge requires into",
                        ))
                    }
                };
                (into, database, Some(doc))
            }
            _ => {
                return Err(MongoraError::validation(
                    "BAD_MERGE",
                    "$merge stage must be a string or document",
                ))
            }
        };

        let into = validate_table_name(&into)?;
        let database = database.map(|db| validate_table_name(&db)).transpose()?;

        let mut on = vec!["_id".to_string()];
        let mut when_matched = WhenMatched::Merge;
        let mut when_not_matched = WhenNotMatched::Insert;
        if let Some(doc) = doc {
            match doc.get("on") {
                Some(Bson::String(field)) => on = vec![validate_field_path(field)?],
                Some(Bson::Array(fields)) => {
                    on = Vec::with_capacity(fields.len());
                    for f in fields {
                        let field = f.as_str().ok_or_else(|| {
                            MongoraError::validation("BAD_MERGE", "$merge on fields must be strings")
                        })?;
                        on.push(validate_field_path(field)?);
                    }
                    if on.is_empty() {
                        return Err(MongoraError::validation(
                            "BAD_MERGE",
                            "$merge on must not be empty",
                        ));
                    }
                }
                Some(_) => {
                    return Err(MongoraError::validation(
                        "BAD_MERGE",
                        "$merge on must be a string or array of strings",
                    ))
                }
                None => {}
            }
            if let Some(policy) = doc.get("whenMatched").and_then(|v| v.as_str()) {
                when_matched = match policy {
                    "replace" => WhenMatched::Replace,
                    "keepExisting" => WhenMatched::KeepExisting,
                    "merge" => WhenMatched::Merge,
                    "fail" => WhenMatched::Fail,
                    other => return Err(MongoraError::unsupported(format!("whenMatched: {}", sanitize(other)))),
                };
            }
            if let Some(policy) = doc.get("whenNotMatched").and_then(|v| v.as_str()) {
                when_not_matched = match policy {
                    "insert" => WhenNotMatched::Insert,
                    "discard" => WhenNotMatched::Discard,
                    "fail" => WhenNotMatched::Fail,
                    other => {
                        return Err(MongoraError::unsupported(format!(
                            "whenNotMatched: {}",
                            sanitize(other)
                        )))
                    }
                };
            }
        }

        Ok(MergeStage {
            into,
            database,
            on,
            when_matched,
            when_not_matched,
        })
    }

    fn parse_out(value: &Bson) -> Result<OutStage> {
        match value {
            Bson::String(coll) => Ok(OutStage {
                collection: validate_table_name(coll)?,
                database: None,
            }),
            Bson::Document(doc) => {
                let coll = doc
                    .get("coll")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| MongoraError::validation("BAD_OUT", "$out requires coll"))?;
                let database = doc
                    .get("db")
                    .and_then(|v| v.as_str())
                    .map(validate_table_name)
                    .transpose()?;
                Ok(OutStage {
                    collection: validate_table_name(coll)?,
                    database,
                })
            }
            _ => Err(MongoraError::validation(
                "BAD_OUT",
                "$out stage must be a string or document",
            )),
        }
    }

    fn parse_unset(value: &Bson) -> Result<Vec<String>> {
        let paths = match value {
            Bson::String(path) => vec![validate_field_path(path)?],
            Bson::Array(items) => {
                let mut paths = Vec::with_capacity(items.len());
                for item in items {
                    let path = item.as_str().ok_or_else(|| {
                        MongoraError::validation("BAD_UNSET", "$unset entries must be strings")
                    })?;
                    paths.push(validate_field_path(path)?);
                }
                paths
            }
            _ => {
                return Err(MongoraError::validation(
                    "BAD_UNSET",
                    "$unset stage must be a string or array of strings",
                ))
            }
        };
        if paths.is_empty() {
            return Err(MongoraError::validation(
                "BAD_UNSET",
                "$unset requires at least one field path",
            ));
        }
        Ok(paths)
    }

    fn stage_documents(value: &Bson, what: &str) -> Result<Vec<Document>> {
        let items = value.as_array().ok_or_else(|| {
            MongoraError::validation("BAD_PIPELINE", format!("{} must be an array", what))
        })?;
        let mut docs = Vec::with_capacity(items.len());
        for item in items {
            let doc = item.as_document().ok_or_else(|| {
                MongoraError::validation(
                    "BAD_PIPELINE",
                    format!("{} stages must be documents", what),
                )
            })?;
            docs.push(doc.clone());
        }
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn unknown_stage_is_unsupported() {
        let err = StageParser::parse_pipeline(&[doc! { "$densify": {} }]).unwrap_err();
        assert!(matches!(err, MongoraError::UnsupportedOperator(t) if t == "$densify"));
    }

    #[test]
    fn limit_is_coerced_and_bounded() {
        let stages = StageParser::parse_pipeline(&[doc! { "$limit": 5.9 }]).unwrap();
        assert_eq!(stages, vec![Stage::Limit(5)]);
        assert!(StageParser::parse_pipeline(&[doc! { "$limit": 0 }]).is_err());
        assert!(StageParser::parse_pipeline(&[doc! { "$skip": 0 }]).is_ok());
        assert!(StageParser::parse_pipeline(&[doc! { "$skip": -1 }]).is_err());
    }

    #[test]
    fn group_requires_id() {
        assert!(StageParser::parse_pipeline(&[doc! { "$group": { "total": { "$sum": 1 } } }]).is_err());
        let stages = StageParser::parse_pipeline(&[doc! {
            "$group": { "_id": null, "total": { "$sum": "$amount" } }
        }])
        .unwrap();
        match &stages[0] {
            Stage::Group(group) => {
                assert!(group.id.is_none());
                assert!(group.accumulators.contains_key("total"));
            }
            other => panic!("unexpected stage: {:?}", other),
        }
    }

    #[test]
    fn compound_group_key_keeps_order() {
        let stages = StageParser::parse_pipeline(&[doc! {
            "$group": { "_id": { "state": "$state", "city": "$city" } }
        }])
        .unwrap();
        match &stages[0] {
            Stage::Group(group) => match group.id.as_ref().unwrap() {
                Expression::CompoundId(fields) => {
                    let keys: Vec<_> = fields.keys().cloned().collect();
                    assert_eq!(keys, vec!["state", "city"]);
                }
                other => panic!("unexpected id: {:?}", other),
            },
            other => panic!("unexpected stage: {:?}", other),
        }
    }

    #[test]
    fn mixed_projection_is_rejected() {
        assert!(StageParser::parse_pipeline(&[doc! {
            "$project": { "a": 1, "b": 0 }
        }])
        .is_err());
        // _id exclusion may accompany inclusions
        assert!(StageParser::parse_pipeline(&[doc! {
            "$project": { "_id": 0, "a": 1 }
        }])
        .is_ok());
    }

    #[test]
    fn exclusion_mode_is_detected() {
        let stages = StageParser::parse_pipeline(&[doc! { "$project": { "secret": 0 } }]).unwrap();
        match &stages[0] {
            Stage::Project(project) => assert!(project.exclusion_mode),
            other => panic!("unexpected stage: {:?}", other),
        }
    }

    #[test]
    fn lookup_forms() {
        let stages = StageParser::parse_pipeline(&[doc! {
            "$lookup": {
                "from": "customers",
                "localField": "customerId",
                "foreignField": "email",
                "as": "customer"
            }
        }])
        .unwrap();
        match &stages[0] {
            Stage::Lookup(lookup) => {
                assert_eq!(lookup.from, "customers");
                assert!(matches!(lookup.kind, LookupKind::Equality { .. }));
            }
            other => panic!("unexpected stage: {:?}", other),
        }

        let stages = StageParser::parse_pipeline(&[doc! {
            "$lookup": {
                "from": "customers",
                "let": { "cid": "$customerId" },
                "pipeline": [ { "$match": { "active": true } } ],
                "as": "customer"
            }
        }])
        .unwrap();
        match &stages[0] {
            Stage::Lookup(lookup) => match &lookup.kind {
                LookupKind::Pipeline { let_vars, pipeline } => {
                    assert!(let_vars.contains_key("cid"));
                    assert_eq!(pipeline.len(), 1);
                }
                other => panic!("unexpected kind: {:?}", other),
            },
            other => panic!("unexpected stage: {:?}", other),
        }
    }

    #[test]
    fn unwind_string_and_document_forms() {
        let stages = StageParser::parse_pipeline(&[doc! { "$unwind": "$items" }]).unwrap();
        match &stages[0] {
            Stage::Unwind(unwind) => {
                assert_eq!(unwind.path, "items");
                assert!(!unwind.preserve_null_and_empty_arrays);
            }
            other => panic!("unexpected stage: {:?}", other),
        }

        let stages = StageParser::parse_pipeline(&[doc! {
            "$unwind": {
                "path": "$items",
                "includeArrayIndex": "idx",
                "preserveNullAndEmptyArrays": true
            }
        }])
        .unwrap();
        match &stages[0] {
            Stage::Unwind(unwind) => {
                assert_eq!(unwind.include_array_index.as_deref(), Some("idx"));
                assert!(unwind.preserve_null_and_empty_arrays);
            }
            other => panic!("unexpected stage: {:?}", other),
        }
    }

    #[test]
    fn bucket_boundary_minimum() {
        assert!(StageParser::parse_pipeline(&[doc! {
            "$bucket": { "groupBy": "$price", "boundaries": [0] }
        }])
        .is_err());
    }

    #[test]
    fn window_fields_parse_frames() {
        let stages = StageParser::parse_pipeline(&[doc! {
            "$setWindowFields": {
                "partitionBy": "$state",
                "sortBy": { "salary": -1 },
                "output": {
                    "rank": { "$rank": {} },
                    "running": {
                        "$sum": "$salary",
                        "window": { "documents": ["unbounded", "current"] }
                    }
                }
            }
        }])
        .unwrap();
        match &stages[0] {
            Stage::SetWindowFields(window) => {
                assert_eq!(window.output.len(), 2);
                let running = &window.output["running"];
                let frame = running.frame.unwrap();
                assert_eq!(frame.unit, FrameUnit::Documents);
                assert_eq!(frame.lower, FrameBound::Unbounded);
                assert_eq!(frame.upper, FrameBound::Current);
            }
            other => panic!("unexpected stage: {:?}", other),
        }
    }

    #[test]
    fn merge_policies() {
        let stages = StageParser::parse_pipeline(&[doc! {
            "$merge": {
                "into": "summary",
                "on": ["region", "period"],
                "whenMatched": "replace",
                "whenNotMatched": "discard"
            }
        }])
        .unwrap();
        match &stages[0] {
            Stage::Merge(merge) => {
                assert_eq!(merge.on, vec!["region", "period"]);
                assert_eq!(merge.when_matched, WhenMatched::Replace);
                assert_eq!(merge.when_not_matched, WhenNotMatched::Discard);
            }
            other => panic!("unexpected stage: {:?}", other),
        }
        assert!(StageParser::parse_pipeline(&[doc! {
            "$merge": { "into": "summary", "whenMatched": "pipeline" }
        }])
        .is_err());
    }

    #[test]
    fn count_rejects_operator_names() {
        assert!(StageParser::parse_pipeline(&[doc! { "$count": "$total" }]).is_err());
        assert!(StageParser::parse_pipeline(&[doc! { "$count": "" }]).is_err());
        let stages = StageParser::parse_pipeline(&[doc! { "$count": "total" }]).unwrap();
        assert_eq!(stages, vec![Stage::Count("total".into())]);
    }

    #[test]
    fn sort_by_count_desugars() {
        let stages = StageParser::parse_pipeline(&[doc! { "$sortByCount": "$category" }]).unwrap();
        assert_eq!(stages.len(), 2);
        assert!(matches!(stages[0], Stage::Group(_)));
        match &stages[1] {
            Stage::Sort(sort) => {
                assert_eq!(sort.fields[0].path, "count");
                assert!(sort.fields[0].descending);
            }
            other => panic!("unexpected stage: {:?}", other),
        }
    }

    #[test]
    fn replace_with_is_replace_root() {
        let stages = StageParser::parse_pipeline(&[doc! { "$replaceWith": "$detail" }]).unwrap();
        assert!(matches!(stages[0], Stage::ReplaceRoot(_)));
    }
}
