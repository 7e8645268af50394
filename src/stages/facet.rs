/*!
 * @file stages/facet.rs
 * @brief $facet, $sample
 */

use crate::collection::{CollectionProvider, FilterMatcher};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::expr::Variables;
use crate::stages::Stage;
use bson::{Bson, Document};
use rand::seq::SliceRandom;
use rand::thread_rng;

pub async fn run_facet(
    docs: Vec<Document>,
    facets: &[(String, Vec<Stage>)],
    provider: &dyn CollectionProvider,
    matcher: &dyn FilterMatcher,
    config: &EngineConfig,
    vars_base: &Variables,
) -> Result<Vec<Document>> {
    let mut out = Document::new();
    for (name, stages) in facets {
        let branch = crate::driver::execute_stages(docs.clone(), stages, provider, matcher, config, vars_base).await?;
        out.insert(name.clone(), Bson::Array(branch.into_iter().map(Bson::Document).collect()));
    }
    Ok(vec![out])
}

pub fn run_sample(docs: Vec<Document>, size: u64, cap: usize) -> Result<Vec<Document>> {
    let size = (size as usize).min(cap).min(docs.len());
    let mut rng = thread_rng();
    let mut pool = docs;
    pool.shuffle(&mut rng);
    pool.truncate(size);
    Ok(pool)
}
