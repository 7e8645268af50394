use anyhow::Result;
use bson::doc;
use docpipe::collection::{InMemoryProvider, SimpleEqualityMatcher};
use docpipe::config::EngineConfig;
use docpipe::driver::{aggregate, ExecutionContext};

#[tokio::test]
async fn project_unwind_and_lookup_compose() -> Result<()> {
    let orders = vec![
        doc! {"customerId": 1, "item": "pen", "qty": 3},
        doc! {"customerId": 1, "item": "pencil", "qty": 1},
    ];
    let provider = InMemoryProvider::new().with_collection("orders", orders);
    let matcher = SimpleEqualityMatcher;
    let config = EngineConfig::default();
    let ctx = ExecutionContext::new(&provider, &matcher, &config);

    let input = vec![doc! {"_id": 1, "name": "ada", "tags": ["vip", "new"]}];
    let pipeline = vec![
        doc! { "$unwind": "$tags" },
        doc! {
            "$lookup": {
                "from": "orders",
                "localField": "_id",
                "foreignField": "customerId",
                "as": "orders",
            }
        },
        doc! {
            "$project": {
                "name": 1,
                "tag": "$tags",
                "orderCount": { "$size": "$orders" },
            }
        },
    ];

    let rows = aggregate(input, &pipeline, &ctx).await?.to_array();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get_str("tag")?, "vip");
    assert_eq!(rows[0].get_i32("orderCount")?, 2);
    Ok(())
}

#[tokio::test]
async fn facet_runs_independent_sub_pipelines() -> Result<()> {
    let provider = InMemoryProvider::new();
    let matcher = SimpleEqualityMatcher;
    let config = EngineConfig::default();
    let ctx = ExecutionContext::new(&provider, &matcher, &config);

    let input = vec![doc! {"v": 1}, doc! {"v": 2}, doc! {"v": 3}];
    let pipeline = vec![doc! {
        "$facet": {
            "count": [ { "$count": "total" } ],
            "passthrough": [ { "$match": {} } ],
        }
    }];

    let rows = aggregate(input, &pipeline, &ctx).await?.to_array();
    let count_branch = rows[0].get_array("count")?;
    assert_eq!(count_branch[0].as_document().unwrap().get_i64("total")?, 3);
    let passthrough = rows[0].get_array("passthrough")?;
    assert_eq!(passthrough.len(), 3);
    Ok(())
}
