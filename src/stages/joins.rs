/*!
 * @file stages/joins.rs
 * @brief $lookup, $graphLookup, $unionWith, $out/$merge
 *
 * All four cross collection boundaries, so all four go through
 * `CollectionProvider` rather than touching storage directly.
 */

use crate::bson_order::eq_bson;
use crate::collection::{CollectionProvider, FilterMatcher};
use crate::config::EngineConfig;
use crate::error::{DocPipeError, Result};
use crate::expr::{evaluate, Variables};
use crate::stages::{GraphLookupOptions, LookupOptions, OutOptions, Pipeline, Stage, UnionWithOptions};
use crate::value;
use bson::{Bson, Document};
use std::collections::HashSet;

pub async fn run_lookup(
    docs: Vec<Document>,
    opts: &LookupOptions,
    provider: &dyn CollectionProvider,
    config: &EngineConfig,
) -> Result<Vec<Document>> {
    let handle = provider.collection(&opts.from).await?;
    let foreign = handle.all().await?;
    if foreign.len() > config.max_lookup_fanout {
        return Err(DocPipeError::Environment(format!(
            "$lookup foreign collection '{}' exceeds max_lookup_fanout",
            opts.from
        )));
    }

    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        let local_value = value::get_path(&doc, &opts.local_field).into_bson_or_null();
        let matches: Vec<Bson> = foreign
            .iter()
            .filter(|f| eq_bson(&value::get_path(f, &opts.foreign_field).into_bson_or_null(), &local_value))
            .map(|f| Bson::Document(f.clone()))
            .collect();
        value::set_path(&mut doc, &opts.as_field, Bson::Array(matches));
        out.push(doc);
    }
    Ok(out)
}

pub async fn run_graph_lookup(
    docs: Vec<Document>,
    opts: &GraphLookupOptions,
    provider: &dyn CollectionProvider,
    matcher: &dyn FilterMatcher,
    config: &EngineConfig,
    vars_base: &Variables,
) -> Result<Vec<Document>> {
    let handle = provider.collection(&opts.from).await?;
    let foreign = handle.all().await?;
    if foreign.len() > config.max_lookup_fanout {
        return Err(DocPipeError::Environment(format!(
            "$graphLookup foreign collection '{}' exceeds max_lookup_fanout",
            opts.from
        )));
    }

    let max_depth = opts.max_depth.unwrap_or(config.max_graph_lookup_depth);

    let mut out = Vec::with_capacity(docs.len());
    for mut doc in docs {
        let start_values: Vec<Bson> = match evaluate(&opts.start_with, &doc, vars_base)?.into_bson_or_null() {
            Bson::Array(a) => a,
            other => vec![other],
        };

        let mut visited_ids: HashSet<Vec<u8>> = HashSet::new();
        let mut frontier = start_values;
        let mut results: Vec<(Bson, u32)> = Vec::new();
        let mut depth = 0u32;

        while !frontier.is_empty() && depth <= max_depth {
            let mut next_frontier = Vec::new();
            for target in &frontier {
                for candidate in &foreign {
                    let connect_to = value::get_path(candidate, &opts.connect_to_field).into_bson_or_null();
                    if !eq_bson(&connect_to, target) {
                        continue;
                    }
                    if let Some(restrict) = &opts.restrict_search_with_match {
                        if !matcher.matches(restrict, candidate)? {
                            continue;
                        }
                    }
                    let id_bytes = crate::partition::canonical_bytes(&value::get_path(candidate, "_id").into_bson_or_null());
                    if visited_ids.contains(&id_bytes) {
                        continue;
                    }
                    visited_ids.insert(id_bytes);
                    results.push((Bson::Document(candidate.clone()), depth));
                    next_frontier.push(value::get_path(candidate, &opts.connect_from_field).into_bson_or_null());
                }
            }
            frontier = next_frontier;
            depth += 1;
        }

        let matched: Vec<Bson> = results
            .into_iter()
            .map(|(doc, d)| match &opts.depth_field {
                Some(field) => {
                    if let Bson::Document(mut inner) = doc {
                        inner.insert(field.clone(), Bson::Int64(d as i64));
                        Bson::Document(inner)
                    } else {
                        doc
                    }
                }
                None => doc,
            })
            .collect();

        value::set_path(&mut doc, &opts.as_field, Bson::Array(matched));
        out.push(doc);
    }
    Ok(out)
}

pub async fn run_union_with(
    docs: Vec<Document>,
    opts: &UnionWithOptions,
    provider: &dyn CollectionProvider,
    matcher: &dyn FilterMatcher,
    config: &EngineConfig,
    vars_base: &Variables,
) -> Result<Vec<Document>> {
    let handle = provider.collection(&opts.coll).await?;
    let mut foreign = handle.all().await?;

    if let Some(pipeline_stages) = &opts.pipeline {
        let pipeline = Pipeline::compile(pipeline_stages, config.max_pipeline_stages)?;
        foreign = crate::driver::execute_stages(foreign, &pipeline.stages, provider, matcher, config, vars_base).await?;
    }

    let mut out = docs;
    out.extend(foreign);
    Ok(out)
}

pub async fn run_out(
    docs: Vec<Document>,
    opts: &OutOptions,
    provider: &dyn CollectionProvider,
) -> Result<Vec<Document>> {
    provider.replace_collection(&opts.collection, docs.clone()).await?;
    let _ = opts.merge;
    Ok(docs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collection::{InMemoryProvider, SimpleEqualityMatcher};
    use bson::doc;

    #[tokio::test]
    async fn lookup_joins_on_equal_fields() {
        let provider = InMemoryProvider::new().with_collection("orders", vec![doc! {"userId": 1, "item": "pen"}]);
        let config = EngineConfig::default();
        let docs = vec![doc! {"_id": 1}];
        let opts = LookupOptions {
            from: "orders".to_string(),
            local_field: "_id".to_string(),
            foreign_field: "userId".to_string(),
            as_field: "orders".to_string(),
        };
        let result = run_lookup(docs, &opts, &provider, &config).await.unwrap();
        let orders = result[0].get_array("orders").unwrap();
        assert_eq!(orders.len(), 1);
    }

    #[tokio::test]
    async fn graph_lookup_traverses_two_hops() {
        let foreign = vec![
            doc! {"_id": 1, "reportsTo": 2},
            doc! {"_id": 2, "reportsTo": 3},
            doc! {"_id": 3, "reportsTo": Bson::Null},
        ];
        let provider = InMemoryProvider::new().with_collection("employees", foreign);
        let matcher = SimpleEqualityMatcher;
        let config = EngineConfig::default();
        let vars = Variables::new(bson::DateTime::now(), Document::new());
        let docs = vec![doc! {"_id": 1, "reportsTo": 2}];
        let opts = GraphLookupOptions {
            from: "employees".to_string(),
            start_with: Bson::String("$reportsTo".into()),
            connect_from_field: "reportsTo".to_string(),
            connect_to_field: "_id".to_string(),
            as_field: "chain".to_string(),
            max_depth: None,
            depth_field: None,
            restrict_search_with_match: None,
        };
        let result = run_graph_lookup(docs, &opts, &provider, &matcher, &config, &vars).await.unwrap();
        let chain = result[0].get_array("chain").unwrap();
        assert_eq!(chain.len(), 2);
    }
}
