/*!
 * @file driver.rs
 * @brief Pipeline execution: stage dispatch, execution context, cursor
 */

use crate::collection::{CollectionProvider, FilterMatcher};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::expr::Variables;
use crate::stages::{Pipeline, Stage};
use crate::{docpipe_debug, docpipe_info};
use bson::{DateTime as BsonDateTime, Document};

/// Everything a running pipeline needs beyond the documents themselves:
/// the collaborators for cross-collection stages, engine limits, and the
/// `NOW` timestamp every `evaluate` call sees as `$$NOW`.
pub struct ExecutionContext<'a> {
    pub provider: &'a dyn CollectionProvider,
    pub matcher: &'a dyn FilterMatcher,
    pub config: &'a EngineConfig,
    pub now: BsonDateTime,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(provider: &'a dyn CollectionProvider, matcher: &'a dyn FilterMatcher, config: &'a EngineConfig) -> Self {
        Self {
            provider,
            matcher,
            config,
            now: BsonDateTime::now(),
        }
    }
}

/// The result of running a pipeline: materialized rows plus a thin
/// iterator-style wrapper. This engine has no spill-to-disk or streaming
/// cursor story, so `Cursor` is just an owned `Vec` underneath.
pub struct Cursor {
    rows: Vec<Document>,
}

impl Cursor {
    pub fn to_array(self) -> Vec<Document> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Compiles and runs `raw_pipeline` over `input`, returning a `Cursor`
/// over the final stage's output.
pub async fn aggregate(input: Vec<Document>, raw_pipeline: &[Document], ctx: &ExecutionContext<'_>) -> Result<Cursor> {
    let pipeline = Pipeline::compile(raw_pipeline, ctx.config.max_pipeline_stages)?;
    docpipe_info!("compiled pipeline with {} stage(s)", pipeline.stages.len());

    let vars = Variables::new(ctx.now, Document::new());
    let rows = execute_stages(input, &pipeline.stages, ctx.provider, ctx.matcher, ctx.config, &vars).await?;
    Ok(Cursor { rows })
}

/// Runs a compiled stage list over `input`. Exposed at crate level (not
/// just via `aggregate`) because `$facet` and `$unionWith` with an inline
/// sub-pipeline both need to recurse into this without re-parsing.
pub async fn execute_stages(
    mut input: Vec<Document>,
    stages: &[Stage],
    provider: &dyn CollectionProvider,
    matcher: &dyn FilterMatcher,
    config: &EngineConfig,
    vars_base: &Variables,
) -> Result<Vec<Document>> {
    for stage in stages {
        docpipe_debug!("executing stage {}", stage_name(stage));
        input = execute_one(input, stage, provider, matcher, config, vars_base).await?;
    }
    Ok(input)
}

fn stage_name(stage: &Stage) -> &'static str {
    match stage {
        Stage::Match(_) => "$match",
        Stage::Project(_) => "$project",
        Stage::Set(_) => "$set",
        Stage::Unset(_) => "$unset",
        Stage::ReplaceRoot(_) => "$replaceRoot",
        Stage::Redact(_) => "$redact",
        Stage::Unwind(_) => "$unwind",
        Stage::Group(_) => "$group",
        Stage::Sort(_) => "$sort",
        Stage::Limit(_) => "$limit",
        Stage::Skip(_) => "$skip",
        Stage::Count(_) => "$count",
        Stage::Lookup(_) => "$lookup",
        Stage::GraphLookup(_) => "$graphLookup",
        Stage::Densify(_) => "$densify",
        Stage::Fill(_) => "$fill",
        Stage::SetWindowFields(_) => "$setWindowFields",
        Stage::SortByCount(_) => "$sortByCount",
        Stage::Sample(_) => "$sample",
        Stage::Facet(_) => "$facet",
        Stage::Bucket(_) => "$bucket",
        Stage::BucketAuto(_) => "$bucketAuto",
        Stage::UnionWith(_) => "$unionWith",
        Stage::Out(_) => "$out",
    }
}

async fn execute_one(
    input: Vec<Document>,
    stage: &Stage,
    provider: &dyn CollectionProvider,
    matcher: &dyn FilterMatcher,
    config: &EngineConfig,
    vars_base: &Variables,
) -> Result<Vec<Document>> {
    use crate::stages::{facet, grouping, joins, reshape, windowing};

    match stage {
        Stage::Match(filter) => reshape::run_match(input, filter, matcher),
        Stage::Project(spec) => reshape::run_project(input, spec, vars_base),
        Stage::Set(spec) => reshape::run_set(input, spec, vars_base),
        Stage::Unset(fields) => Ok(reshape::run_unset(input, fields)),
        Stage::ReplaceRoot(expr) => reshape::run_replace_root(input, expr, vars_base),
        Stage::Redact(expr) => reshape::run_redact(input, expr, vars_base),
        Stage::Unwind(opts) => reshape::run_unwind(
            input,
            &opts.path,
            opts.include_array_index.as_deref(),
            opts.preserve_null_and_empty,
        ),
        Stage::Group(spec) => grouping::run_group(input, spec, vars_base),
        Stage::Sort(spec) => {
            let keys = crate::sorter::parse_sort_spec(spec);
            let mut rows = input;
            crate::sorter::sort_documents(&mut rows, &keys);
            Ok(rows)
        }
        Stage::Limit(n) => {
            let mut rows = input;
            rows.truncate((*n).max(0) as usize);
            Ok(rows)
        }
        Stage::Skip(n) => {
            let rows = input;
            Ok(rows.into_iter().skip((*n).max(0) as usize).collect())
        }
        Stage::Count(field) => {
            if input.is_empty() {
                return Ok(vec![]);
            }
            let mut doc = Document::new();
            doc.insert(field.clone(), bson::Bson::Int64(input.len() as i64));
            Ok(vec![doc])
        }
        Stage::Lookup(opts) => joins::run_lookup(input, opts, provider, config).await,
        Stage::GraphLookup(opts) => joins::run_graph_lookup(input, opts, provider, matcher, config, vars_base).await,
        Stage::Densify(opts) => windowing::run_densify(input, opts, vars_base),
        Stage::Fill(opts) => windowing::run_fill(input, opts, vars_base),
        Stage::SetWindowFields(opts) => windowing::run_set_window_fields(input, opts, vars_base),
        Stage::SortByCount(expr) => grouping::run_sort_by_count(input, expr, vars_base),
        Stage::Sample(size) => facet::run_sample(input, *size, config.default_sample_size_cap),
        Stage::Facet(facets) => facet::run_facet(input, facets, provider, matcher, config, vars_base).await,
        Stage::Bucket(opts) => grouping::run_bucket(input, opts, vars_base),
        Stage::BucketAuto(opts) => grouping::run_bucket_auto(input, opts, vars_base),
        Stage::UnionWith(opts) => joins::run_union_with(input, opts, provider, matcher, config, vars_base).await,
        Stage::Out(opts) => joins::run_out(input, opts, provider).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{InMemoryProvider, SimpleEqualityMatcher};
    use bson::doc;

    #[tokio::test]
    async fn runs_match_then_sort_then_limit() {
        let provider = InMemoryProvider::new();
        let matcher = SimpleEqualityMatcher;
        let config = EngineConfig::default();
        let ctx = ExecutionContext::new(&provider, &matcher, &config);

        let input = vec![doc! {"a": 3}, doc! {"a": 1}, doc! {"a": 2}];
        let pipeline = vec![doc! {"$sort": {"a": 1}}, doc! {"$limit": 2}];
        let cursor = aggregate(input, &pipeline, &ctx).await.unwrap();
        let rows = cursor.to_array();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get_i32("a").unwrap(), 1);
        assert_eq!(rows[1].get_i32("a").unwrap(), 2);
    }

    #[tokio::test]
    async fn count_stage_reports_row_count() {
        let provider = InMemoryProvider::new();
        let matcher = SimpleEqualityMatcher;
        let config = EngineConfig::default();
        let ctx = ExecutionContext::new(&provider, &matcher, &config);

        let input = vec![doc! {"a": 1}, doc! {"a": 2}];
        let pipeline = vec![doc! {"$count": "total"}];
        let cursor = aggregate(input, &pipeline, &ctx).await.unwrap();
        let rows = cursor.to_array();
        assert_eq!(rows[0].get_i64("total").unwrap(), 2);
    }
}
