use anyhow::Result;
use bson::doc;
use docpipe::collection::{InMemoryProvider, SimpleEqualityMatcher};
use docpipe::config::EngineConfig;
use docpipe::driver::{aggregate, ExecutionContext};

#[tokio::test]
async fn running_total_accumulates_within_partition() -> Result<()> {
    let provider = InMemoryProvider::new();
    let matcher = SimpleEqualityMatcher;
    let config = EngineConfig::default();
    let ctx = ExecutionContext::new(&provider, &matcher, &config);

    let input = vec![
        doc! {"store": "a", "day": 1, "sales": 10},
        doc! {"store": "a", "day": 2, "sales": 20},
        doc! {"store": "a", "day": 3, "sales": 30},
        doc! {"store": "b", "day": 1, "sales": 5},
    ];

    let pipeline = vec![doc! {
        "$setWindowFields": {
            "partitionBy": "$store",
            "sortBy": {"day": 1},
            "output": {
                "runningTotal": {
                    "$sum": "$sales",
                    "window": { "documents": ["unbounded", "current"] }
                }
            }
        }
    }];

    let rows = aggregate(input, &pipeline, &ctx).await?.to_array();
    let a_rows: Vec<_> = rows.iter().filter(|d| d.get_str("store").unwrap() == "a").collect();
    assert_eq!(a_rows[0].get_i32("runningTotal")?, 10);
    assert_eq!(a_rows[1].get_i32("runningTotal")?, 30);
    assert_eq!(a_rows[2].get_i32("runningTotal")?, 60);

    let b_row = rows.iter().find(|d| d.get_str("store").unwrap() == "b").unwrap();
    assert_eq!(b_row.get_i32("runningTotal")?, 5);
    Ok(())
}

#[tokio::test]
async fn rank_breaks_ties_with_gaps() -> Result<()> {
    let provider = InMemoryProvider::new();
    let matcher = SimpleEqualityMatcher;
    let config = EngineConfig::default();
    let ctx = ExecutionContext::new(&provider, &matcher, &config);

    let input = vec![doc! {"v": 10}, doc! {"v": 10}, doc! {"v": 20}];
    let pipeline = vec![doc! {
        "$setWindowFields": {
            "sortBy": {"v": 1},
            "output": { "r": { "$rank": {} } }
        }
    }];

    let rows = aggregate(input, &pipeline, &ctx).await?.to_array();
    let ranks: Vec<i32> = rows.iter().map(|d| d.get_i32("r").unwrap()).collect();
    assert_eq!(ranks, vec![1, 1, 3]);
    Ok(())
}
