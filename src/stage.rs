/*!
 * @file stage.rs
 * @brief Pipeline stage AST and per-stage option structs
 */

use bson::Bson;
use indexmap::IndexMap;

use crate::expr::Expression;
use crate::operators::WindowOp;

/// Closed set of pipeline stages. Argument constraints are enforced by the
/// stage parsers; the renderer assumes a well-formed tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Expression),
    Group(GroupStage),
    Project(ProjectStage),
    Sort(SortStage),
    Limit(u64),
    Skip(u64),
    Lookup(LookupStage),
    Unwind(UnwindStage),
    AddFields(AddFieldsStage),
    UnionWith(UnionWithStage),
    Bucket(BucketStage),
    BucketAuto(BucketAutoStage),
    Facet(FacetStage),
    GraphLookup(GraphLookupStage),
    SetWindowFields(SetWindowFieldsStage),
    Redact(Expression),
    Sample(u64),
    Count(String),
    Merge(MergeStage),
    Out(OutStage),
    ReplaceRoot(Expression),
    Unset(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupStage {
    /// `None` models `_id: null` (a single group over all rows).
    pub id: Option<Expression>,
    pub accumulators: IndexMap<String, Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProjectField {
    Excluded,
    Include(Expression),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectStage {
    pub fields: IndexMap<String, ProjectField>,
    /// True when every entry is an exclusion (`{secret: 0}` style).
    pub exclusion_mode: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortField {
    pub path: String,
    pub descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortStage {
    pub fields: Vec<SortField>,
    /// Set by an optimiser pass to mark a Top-N candidate; used as the
    /// FETCH count when no explicit `$limit` follows.
    pub limit_hint: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LookupKind {
    Equality {
        local_field: String,
        foreign_field: String,
    },
    Pipeline {
        let_vars: IndexMap<String, Expression>,
        pipeline: Vec<Stage>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LookupStage {
    pub from: String,
    pub as_field: String,
    pub kind: LookupKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnwindStage {
    pub path: String,
    pub include_array_index: Option<String>,
    pub preserve_null_and_empty_arrays: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AddFieldsStage {
    pub fields: IndexMap<String, Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UnionWithStage {
    pub collection: String,
    pub pipeline: Vec<Stage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketStage {
    pub group_by: Expression,
    /// At least two, monotonically non-decreasing. Rendered inline since a
    /// bind would be ill-formed inside the CASE boundaries.
    pub boundaries: Vec<Bson>,
    pub default: Option<Bson>,
    pub output: IndexMap<String, Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BucketAutoStage {
    pub group_by: Expression,
    pub buckets: u32,
    pub output: IndexMap<String, Expression>,
    pub granularity: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FacetStage {
    pub facets: IndexMap<String, Vec<Stage>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GraphLookupStage {
    pub from: String,
    pub start_with: Expression,
    pub connect_from_field: String,
    pub connect_to_field: String,
    pub as_field: String,
    pub max_depth: Option<i64>,
    pub depth_field: Option<String>,
    pub restrict_search_with_match: Option<Expression>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameUnit {
    Documents,
    Range,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameBound {
    Unbounded,
    Current,
    Offset(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowFrame {
    pub unit: FrameUnit,
    pub lower: FrameBound,
    pub upper: FrameBound,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WindowOutput {
    pub op: WindowOp,
    pub arg: Option<Expression>,
    pub frame: Option<WindowFrame>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SetWindowFieldsStage {
    pub partition_by: Option<Expression>,
    pub sort_by: Vec<SortField>,
    pub output: IndexMap<String, WindowOutput>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenMatched {
    Replace,
    KeepExisting,
    Merge,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhenNotMatched {
    Insert,
    Discard,
    Fail,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MergeStage {
    pub into: String,
    pub database: Option<String>,
    pub on: Vec<String>,
    pub when_matched: WhenMatched,
    pub when_not_matched: WhenNotMatched,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutStage {
    pub collection: String,
    pub database: Option<String>,
}

impl Stage {
    /// Operator token this stage was parsed from, for diagnostics.
    pub fn operator_token(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Group(_) => "$group",
            Stage::Project(_) => "$project",
            Stage::Sort(_) => "$sort",
            Stage::Limit(_) => "$limit",
            Stage::Skip(_) => "$skip",
            Stage::Lookup(_) => "$lookup",
            Stage::Unwind(_) => "$unwind",
            Stage::AddFields(_) => "$addFields",
            Stage::UnionWith(_) => "$unionWith",
            Stage::Bucket(_) => "$bucket",
            Stage::BucketAuto(_) => "$bucketAuto",
            Stage::Facet(_) => "$facet",
            Stage::GraphLookup(_) => "$graphLookup",
            Stage::SetWindowFields(_) => "$setWindowFields",
            Stage::Redact(_) => "$redact",
            Stage::Sample(_) => "$sample",
            Stage::Count(_) => "$count",
            Stage::Merge(_) => "$merge",
            Stage::Out(_) => "$out",
            Stage::ReplaceRoot(_) => "$replaceRoot",
            Stage::Unset(_) => "$unset",
        }
    }
}
