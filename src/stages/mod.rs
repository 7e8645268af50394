/*!
 * @file stages/mod.rs
 * @brief Pipeline compilation: stage parsing and shape validation
 *
 * Stage *shape* (ordering rules, which stages may only appear first/last,
 * mutually-exclusive terminal stages) is checked once at compile time,
 * not re-checked on every document during execution.
 */

pub mod facet;
pub mod grouping;
pub mod joins;
pub mod reshape;
pub mod windowing;

use crate::error::{DocPipeError, Result};
use bson::{Bson, Document};

#[derive(Debug, Clone)]
pub struct UnwindOptions {
    pub path: String,
    pub include_array_index: Option<String>,
    pub preserve_null_and_empty: bool,
}

#[derive(Debug, Clone)]
pub struct LookupOptions {
    pub from: String,
    pub local_field: String,
    pub foreign_field: String,
    pub as_field: String,
}

#[derive(Debug, Clone)]
pub struct GraphLookupOptions {
    pub from: String,
    pub start_with: Bson,
    pub connect_from_field: String,
    pub connect_to_field: String,
    pub as_field: String,
    pub max_depth: Option<u32>,
    pub depth_field: Option<String>,
    pub restrict_search_with_match: Option<Document>,
}

#[derive(Debug, Clone)]
pub struct BucketOptions {
    pub group_by: Bson,
    pub boundaries: Vec<Bson>,
    pub default: Option<Bson>,
    pub output: Option<Document>,
}

#[derive(Debug, Clone)]
pub struct BucketAutoOptions {
    pub group_by: Bson,
    pub buckets: u32,
    pub output: Option<Document>,
}

#[derive(Debug, Clone)]
pub struct UnionWithOptions {
    pub coll: String,
    pub pipeline: Option<Vec<Document>>,
}

#[derive(Debug, Clone)]
pub enum DensifyRange {
    Full,
    Partition,
    Bounds(Bson, Bson),
}

#[derive(Debug, Clone)]
pub struct DensifyOptions {
    pub field: String,
    pub partition_by_fields: Vec<String>,
    pub range: DensifyRange,
    pub step: f64,
    pub unit: Option<String>,
}

#[derive(Debug, Clone)]
pub enum FillMethod {
    Value(Bson),
    Locf,
    Linear,
}

#[derive(Debug, Clone)]
pub struct FillOptions {
    pub partition_by_fields: Vec<String>,
    pub sort_by: Option<Document>,
    pub output: Vec<(String, FillMethod)>,
}

#[derive(Debug, Clone)]
pub struct WindowOutputSpec {
    pub field: String,
    pub operator: String,
    pub arg: Bson,
    pub window: Option<Document>,
}

#[derive(Debug, Clone)]
pub struct SetWindowFieldsOptions {
    pub partition_by: Option<Bson>,
    pub sort_by: Option<Document>,
    pub output: Vec<WindowOutputSpec>,
}

#[derive(Debug, Clone)]
pub struct OutOptions {
    pub collection: String,
    /// `$merge` with `whenMatched:"replace"`/`whenNotMatched:"insert"` is
    /// accepted as a narrowed alias of `$out`; anything else is rejected
    /// at compile time.
    pub merge: bool,
}

#[derive(Debug, Clone)]
pub enum Stage {
    Match(Document),
    Project(Document),
    Set(Document),
    Unset(Vec<String>),
    ReplaceRoot(Bson),
    Redact(Bson),
    Unwind(UnwindOptions),
    Group(Document),
    Sort(Document),
    Limit(i64),
    Skip(i64),
    Count(String),
    Lookup(LookupOptions),
    GraphLookup(GraphLookupOptions),
    Densify(DensifyOptions),
    Fill(FillOptions),
    SetWindowFields(SetWindowFieldsOptions),
    SortByCount(Bson),
    Sample(u64),
    Facet(Vec<(String, Vec<Stage>)>),
    Bucket(BucketOptions),
    BucketAuto(BucketAutoOptions),
    UnionWith(UnionWithOptions),
    Out(OutOptions),
}

pub struct Pipeline {
    pub stages: Vec<Stage>,
}

impl Pipeline {
    /// Parses and shape-validates a raw `[{ "$stageName": ... }, ...]`
    /// array into a compiled `Pipeline`.
    pub fn compile(raw: &[Document], max_stages: usize) -> Result<Self> {
        if raw.len() > max_stages {
            return Err(DocPipeError::pipeline("pipeline", format!("exceeds maximum of {max_stages} stages")));
        }

        let stages: Vec<Stage> = raw.iter().map(parse_stage).collect::<Result<_>>()?;
        validate_shape(&stages)?;
        Ok(Self { stages })
    }
}

fn validate_shape(stages: &[Stage]) -> Result<()> {
    for (i, stage) in stages.iter().enumerate() {
        match stage {
            Stage::Out(_) => {
                if i != stages.len() - 1 {
                    return Err(DocPipeError::pipeline("$out", "must be the last stage in the pipeline"));
                }
            }
            Stage::Facet(sub_facets) => {
                for (name, sub) in sub_facets {
                    for s in sub {
                        if matches!(s, Stage::Facet(_)) {
                            return Err(DocPipeError::pipeline("$facet", format!("sub-pipeline '{name}' may not itself contain $facet")));
                        }
                        if matches!(s, Stage::Out(_)) {
                            return Err(DocPipeError::pipeline("$facet", format!("sub-pipeline '{name}' may not contain $out")));
                        }
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}

fn get_doc<'a>(d: &'a Document, key: &str) -> Result<&'a Document> {
    d.get_document(key).map_err(|_| DocPipeError::pipeline(key, "expected a document"))
}

fn get_string(d: &Document, key: &str) -> Result<String> {
    d.get_str(key).map(|s| s.to_string()).map_err(|_| DocPipeError::pipeline(key, "expected a string"))
}

fn parse_stage(raw: &Document) -> Result<Stage> {
    if raw.len() != 1 {
        return Err(DocPipeError::pipeline("stage", "each stage must have exactly one operator key"));
    }
    let (key, value) = raw.iter().next().unwrap();

    Ok(match key.as_str() {
        "$match" => Stage::Match(value.as_document().ok_or_else(|| DocPipeError::pipeline("$match", "expected a document"))?.clone()),
        "$project" => Stage::Project(value.as_document().ok_or_else(|| DocPipeError::pipeline("$project", "expected a document"))?.clone()),
        "$set" | "$addFields" => Stage::Set(value.as_document().ok_or_else(|| DocPipeError::pipeline(key, "expected a document"))?.clone()),
        "$unset" => Stage::Unset(parse_unset(value)?),
        "$replaceRoot" => {
            let d = value.as_document().ok_or_else(|| DocPipeError::pipeline("$replaceRoot", "expected a document"))?;
            Stage::ReplaceRoot(d.get("newRoot").ok_or_else(|| DocPipeError::pipeline("$replaceRoot", "missing 'newRoot'"))?.clone())
        }
        "$replaceWith" => Stage::ReplaceRoot(value.clone()),
        "$redact" => Stage::Redact(value.clone()),
        "$unwind" => Stage::Unwind(parse_unwind(value)?),
        "$group" => Stage::Group(value.as_document().ok_or_else(|| DocPipeError::pipeline("$group", "expected a document"))?.clone()),
        "$sort" => Stage::Sort(value.as_document().ok_or_else(|| DocPipeError::pipeline("$sort", "expected a document"))?.clone()),
        "$limit" => Stage::Limit(parse_limit(value)?),
        "$skip" => Stage::Skip(parse_skip(value)?),
        "$count" => Stage::Count(parse_count_field(value)?),
        "$lookup" => Stage::Lookup(parse_lookup(value)?),
        "$graphLookup" => Stage::GraphLookup(parse_graph_lookup(value)?),
        "$densify" => Stage::Densify(parse_densify(value)?),
        "$fill" => Stage::Fill(parse_fill(value)?),
        "$setWindowFields" => Stage::SetWindowFields(parse_set_window_fields(value)?),
        "$sortByCount" => Stage::SortByCount(value.clone()),
        "$sample" => {
            let d = value.as_document().ok_or_else(|| DocPipeError::pipeline("$sample", "expected a document"))?;
            let size = d.get_i32("size").map(|v| v as u64).or_else(|_| d.get_i64("size").map(|v| v as u64))
                .map_err(|_| DocPipeError::pipeline("$sample", "missing 'size'"))?;
            Stage::Sample(size)
        }
        "$facet" => Stage::Facet(parse_facet(value)?),
        "$bucket" => Stage::Bucket(parse_bucket(value)?),
        "$bucketAuto" => Stage::BucketAuto(parse_bucket_auto(value)?),
        "$unionWith" => Stage::UnionWith(parse_union_with(value)?),
        "$out" => Stage::Out(parse_out(value)?),
        "$merge" => Stage::Out(parse_merge(value)?),
        "$geoNear" => return Err(DocPipeError::pipeline("$geoNear", "not supported by this engine")),
        other => return Err(DocPipeError::pipeline("stage", format!("unknown stage '{other}'"))),
    })
}

fn as_integer(v: &Bson, stage: &str) -> Result<i64> {
    match v {
        Bson::Int32(n) => Ok(*n as i64),
        Bson::Int64(n) => Ok(*n),
        _ => Err(DocPipeError::pipeline(stage, "expected an integer")),
    }
}

fn parse_limit(v: &Bson) -> Result<i64> {
    let n = as_integer(v, "$limit")?;
    if n <= 0 {
        return Err(DocPipeError::pipeline("$limit", "must be a positive integer"));
    }
    Ok(n)
}

fn parse_skip(v: &Bson) -> Result<i64> {
    let n = as_integer(v, "$skip")?;
    if n < 0 {
        return Err(DocPipeError::pipeline("$skip", "must be a non-negative integer"));
    }
    Ok(n)
}

fn parse_unset(v: &Bson) -> Result<Vec<String>> {
    match v {
        Bson::String(s) => Ok(vec![s.clone()]),
        Bson::Array(items) => items
            .iter()
            .map(|i| match i {
                Bson::String(s) => Ok(s.clone()),
                _ => Err(DocPipeError::pipeline("$unset", "array elements must be strings")),
            })
            .collect(),
        _ => Err(DocPipeError::pipeline("$unset", "expected a string or array of strings")),
    }
}

fn parse_unwind(v: &Bson) -> Result<UnwindOptions> {
    match v {
        Bson::String(s) => Ok(UnwindOptions {
            path: s.trim_start_matches('$').to_string(),
            include_array_index: None,
            preserve_null_and_empty: false,
        }),
        Bson::Document(d) => {
            let path = get_string(d, "path")?.trim_start_matches('$').to_string();
            let include_array_index = d.get_str("includeArrayIndex").ok().map(|s| s.to_string());
            let preserve_null_and_empty = d.get_bool("preserveNullAndEmptyArrays").unwrap_or(false);
            Ok(UnwindOptions { path, include_array_index, preserve_null_and_empty })
        }
        _ => Err(DocPipeError::pipeline("$unwind", "expected a string or document")),
    }
}

fn parse_count_field(v: &Bson) -> Result<String> {
    match v {
        Bson::String(s) if !s.is_empty() && !s.starts_with('$') && !s.contains('.') => Ok(s.clone()),
        _ => Err(DocPipeError::pipeline("$count", "expects a non-empty field name with no '.' or leading '$'")),
    }
}

fn parse_lookup(v: &Bson) -> Result<LookupOptions> {
    let d = v.as_document().ok_or_else(|| DocPipeError::pipeline("$lookup", "expected a document"))?;
    Ok(LookupOptions {
        from: get_string(d, "from")?,
        local_field: get_string(d, "localField")?,
        foreign_field: get_string(d, "foreignField")?,
        as_field: get_string(d, "as")?,
    })
}

fn parse_graph_lookup(v: &Bson) -> Result<GraphLookupOptions> {
    let d = v.as_document().ok_or_else(|| DocPipeError::pipeline("$graphLookup", "expected a document"))?;
    Ok(GraphLookupOptions {
        from: get_string(d, "from")?,
        start_with: d.get("startWith").ok_or_else(|| DocPipeError::pipeline("$graphLookup", "missing 'startWith'"))?.clone(),
        connect_from_field: get_string(d, "connectFromField")?,
        connect_to_field: get_string(d, "connectToField")?,
        as_field: get_string(d, "as")?,
        max_depth: d.get_i32("maxDepth").ok().map(|v| v as u32),
        depth_field: d.get_str("depthField").ok().map(|s| s.to_string()),
        restrict_search_with_match: d.get_document("restrictSearchWithMatch").ok().cloned(),
    })
}

fn parse_bucket(v: &Bson) -> Result<BucketOptions> {
    let d = v.as_document().ok_or_else(|| DocPipeError::pipeline("$bucket", "expected a document"))?;
    let boundaries = d
        .get_array("boundaries")
        .map_err(|_| DocPipeError::pipeline("$bucket", "missing 'boundaries'"))?
        .clone();
    if boundaries.len() < 2 {
        return Err(DocPipeError::pipeline("$bucket", "'boundaries' requires at least 2 values"));
    }
    Ok(BucketOptions {
        group_by: d.get("groupBy").ok_or_else(|| DocPipeError::pipeline("$bucket", "missing 'groupBy'"))?.clone(),
        boundaries,
        default: d.get("default").cloned(),
        output: d.get_document("output").ok().cloned(),
    })
}

fn parse_bucket_auto(v: &Bson) -> Result<BucketAutoOptions> {
    let d = v.as_document().ok_or_else(|| DocPipeError::pipeline("$bucketAuto", "expected a document"))?;
    let buckets = d.get_i32("buckets").map(|v| v as u32).map_err(|_| DocPipeError::pipeline("$bucketAuto", "missing 'buckets'"))?;
    if buckets == 0 {
        return Err(DocPipeError::pipeline("$bucketAuto", "'buckets' must be positive"));
    }
    Ok(BucketAutoOptions {
        group_by: d.get("groupBy").ok_or_else(|| DocPipeError::pipeline("$bucketAuto", "missing 'groupBy'"))?.clone(),
        buckets,
        output: d.get_document("output").ok().cloned(),
    })
}

fn parse_union_with(v: &Bson) -> Result<UnionWithOptions> {
    match v {
        Bson::String(s) => Ok(UnionWithOptions { coll: s.clone(), pipeline: None }),
        Bson::Document(d) => {
            let coll = get_string(d, "coll")?;
            let pipeline = match d.get_array("pipeline") {
                Ok(arr) => Some(
                    arr.iter()
                        .map(|s| s.as_document().cloned().ok_or_else(|| DocPipeError::pipeline("$unionWith", "pipeline stages must be documents")))
                        .collect::<Result<Vec<_>>>()?,
                ),
                Err(_) => None,
            };
            Ok(UnionWithOptions { coll, pipeline })
        }
        _ => Err(DocPipeError::pipeline("$unionWith", "expected a string or document")),
    }
}

fn parse_out(v: &Bson) -> Result<OutOptions> {
    match v {
        Bson::String(s) => Ok(OutOptions { collection: s.clone(), merge: false }),
        Bson::Document(d) => Ok(OutOptions { collection: get_string(d, "coll")?, merge: false }),
        _ => Err(DocPipeError::pipeline("$out", "expected a string or document")),
    }
}

fn parse_merge(v: &Bson) -> Result<OutOptions> {
    let d = v.as_document().ok_or_else(|| DocPipeError::pipeline("$merge", "expected a document"))?;
    let collection = match d.get("into") {
        Some(Bson::String(s)) => s.clone(),
        Some(Bson::Document(into)) => get_string(into, "coll")?,
        _ => return Err(DocPipeError::pipeline("$merge", "missing 'into'")),
    };
    let when_matched = d.get_str("whenMatched").unwrap_or("merge");
    let when_not_matched = d.get_str("whenNotMatched").unwrap_or("insert");
    if when_matched != "replace" || when_not_matched != "insert" {
        return Err(DocPipeError::pipeline(
            "$merge",
            "only whenMatched:'replace' / whenNotMatched:'insert' is supported (the rest of $merge's behavior is out of scope)",
        ));
    }
    Ok(OutOptions { collection, merge: true })
}

fn parse_densify(v: &Bson) -> Result<DensifyOptions> {
    let d = v.as_document().ok_or_else(|| DocPipeError::pipeline("$densify", "expected a document"))?;
    let field = get_string(d, "field")?;
    let partition_by_fields = d
        .get_array("partitionByFields")
        .map(|a| a.iter().filter_map(|b| b.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let range_doc = get_doc(d, "range")?;
    let bounds = range_doc.get("bounds").ok_or_else(|| DocPipeError::pipeline("$densify", "missing 'range.bounds'"))?;
    let range = match bounds {
        Bson::String(s) if s == "full" => DensifyRange::Full,
        Bson::String(s) if s == "partition" => DensifyRange::Partition,
        Bson::Array(a) if a.len() == 2 => DensifyRange::Bounds(a[0].clone(), a[1].clone()),
        _ => return Err(DocPipeError::pipeline("$densify", "invalid 'range.bounds'")),
    };
    let step = range_doc.get("step").and_then(|b| match b {
        Bson::Int32(n) => Some(*n as f64),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }).ok_or_else(|| DocPipeError::pipeline("$densify", "missing 'range.step'"))?;
    if !(step > 0.0) {
        return Err(DocPipeError::pipeline("$densify", "'range.step' must be greater than 0"));
    }
    let unit = range_doc.get_str("unit").ok().map(|s| s.to_string());

    Ok(DensifyOptions { field, partition_by_fields, range, step, unit })
}

fn parse_fill(v: &Bson) -> Result<FillOptions> {
    let d = v.as_document().ok_or_else(|| DocPipeError::pipeline("$fill", "expected a document"))?;
    let partition_by_fields = d
        .get_array("partitionByFields")
        .map(|a| a.iter().filter_map(|b| b.as_str().map(String::from)).collect())
        .unwrap_or_default();
    let sort_by = d.get_document("sortBy").ok().cloned();
    let output_doc = get_doc(d, "output")?;
    let mut output = Vec::new();
    for (field, spec) in output_doc {
        let method = match spec {
            Bson::Document(sd) => {
                if let Some(value) = sd.get("value") {
                    FillMethod::Value(value.clone())
                } else if let Ok(method) = sd.get_str("method") {
                    match method {
                        "locf" => FillMethod::Locf,
                        "linear" => FillMethod::Linear,
                        other => return Err(DocPipeError::pipeline("$fill", format!("unknown fill method '{other}'"))),
                    }
                } else {
                    return Err(DocPipeError::pipeline("$fill", "output entry needs 'value' or 'method'"));
                }
            }
            _ => return Err(DocPipeError::pipeline("$fill", "output entry must be a document")),
        };
        output.push((field.clone(), method));
    }
    Ok(FillOptions { partition_by_fields, sort_by, output })
}

fn parse_set_window_fields(v: &Bson) -> Result<SetWindowFieldsOptions> {
    let d = v.as_document().ok_or_else(|| DocPipeError::pipeline("$setWindowFields", "expected a document"))?;
    let partition_by = d.get("partitionBy").cloned();
    let sort_by = d.get_document("sortBy").ok().cloned();
    let output_doc = get_doc(d, "output")?;
    let mut output = Vec::new();
    for (field, spec) in output_doc {
        let spec_doc = spec.as_document().ok_or_else(|| DocPipeError::pipeline("$setWindowFields", "output entries must be documents"))?;
        if spec_doc.len() < 1 {
            return Err(DocPipeError::pipeline("$setWindowFields", "output entry has no operator"));
        }
        let window = spec_doc.get_document("window").ok().cloned();
        let (op, arg) = spec_doc
            .iter()
            .find(|(k, _)| k.starts_with('$'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .ok_or_else(|| DocPipeError::pipeline("$setWindowFields", "output entry missing an operator"))?;
        output.push(WindowOutputSpec { field: field.clone(), operator: op, arg, window });
    }
    Ok(SetWindowFieldsOptions { partition_by, sort_by, output })
}

fn parse_facet(v: &Bson) -> Result<Vec<(String, Vec<Stage>)>> {
    let d = v.as_document().ok_or_else(|| DocPipeError::pipeline("$facet", "expected a document"))?;
    let mut out = Vec::new();
    for (name, sub) in d {
        let arr = sub.as_array().ok_or_else(|| DocPipeError::pipeline("$facet", format!("'{name}' must be a pipeline array")))?;
        let stages: Vec<Stage> = arr
            .iter()
            .map(|s| s.as_document().cloned().ok_or_else(|| DocPipeError::pipeline("$facet", "sub-pipeline stages must be documents")))
            .collect::<Result<Vec<_>>>()?
            .iter()
            .map(parse_stage)
            .collect::<Result<_>>()?;
        out.push((name.clone(), stages));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn rejects_out_not_last() {
        let raw = vec![doc! {"$out": "x"}, doc! {"$match": {}}];
        let err = Pipeline::compile(&raw, 200).unwrap_err();
        assert!(err.to_string().contains("last stage"));
    }

    #[test]
    fn accepts_simple_pipeline() {
        let raw = vec![doc! {"$match": {"a": 1}}, doc! {"$limit": 10}];
        let pipeline = Pipeline::compile(&raw, 200).unwrap();
        assert_eq!(pipeline.stages.len(), 2);
    }

    #[test]
    fn rejects_facet_with_nested_facet() {
        let raw = vec![doc! {"$facet": {"a": [{"$facet": {"b": []}}]}}];
        let err = Pipeline::compile(&raw, 200).unwrap_err();
        assert!(err.to_string().contains("$facet"));
    }

    #[test]
    fn merge_rejects_unsupported_modes() {
        let raw = vec![doc! {"$merge": {"into": "x", "whenMatched": "merge"}}];
        let err = Pipeline::compile(&raw, 200).unwrap_err();
        assert!(err.to_string().contains("whenMatched"));
    }
}
