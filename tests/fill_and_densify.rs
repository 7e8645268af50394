use anyhow::Result;
use bson::doc;
use docpipe::collection::{InMemoryProvider, SimpleEqualityMatcher};
use docpipe::config::EngineConfig;
use docpipe::driver::{aggregate, ExecutionContext};

#[tokio::test]
async fn fill_locf_carries_forward_across_gaps() -> Result<()> {
    let provider = InMemoryProvider::new();
    let matcher = SimpleEqualityMatcher;
    let config = EngineConfig::default();
    let ctx = ExecutionContext::new(&provider, &matcher, &config);

    let input = vec![
        doc! {"day": 1, "price": 100},
        doc! {"day": 2, "price": bson::Bson::Null},
        doc! {"day": 3, "price": bson::Bson::Null},
        doc! {"day": 4, "price": 130},
    ];

    let pipeline = vec![doc! {
        "$fill": {
            "sortBy": {"day": 1},
            "output": { "price": { "method": "locf" } }
        }
    }];

    let rows = aggregate(input, &pipeline, &ctx).await?.to_array();
    assert_eq!(rows[1].get_i32("price")?, 100);
    assert_eq!(rows[2].get_i32("price")?, 100);
    Ok(())
}

#[tokio::test]
async fn densify_steps_across_numeric_gap() -> Result<()> {
    let provider = InMemoryProvider::new();
    let matcher = SimpleEqualityMatcher;
    let config = EngineConfig::default();
    let ctx = ExecutionContext::new(&provider, &matcher, &config);

    let input = vec![doc! {"x": 0}, doc! {"x": 5}];
    let pipeline = vec![doc! {
        "$densify": {
            "field": "x",
            "range": { "bounds": "full", "step": 1 }
        }
    }];

    let rows = aggregate(input, &pipeline, &ctx).await?.to_array();
    assert_eq!(rows.len(), 6);
    Ok(())
}
