use anyhow::Result;
use bson::doc;
use docpipe::collection::{InMemoryProvider, SimpleEqualityMatcher};
use docpipe::config::EngineConfig;
use docpipe::driver::{aggregate, ExecutionContext};

#[tokio::test]
async fn graph_lookup_traverses_depth_two_org_chart() -> Result<()> {
    let employees = vec![
        doc! {"_id": 1, "name": "alice", "managerId": bson::Bson::Null},
        doc! {"_id": 2, "name": "bob", "managerId": 1},
        doc! {"_id": 3, "name": "carol", "managerId": 2},
    ];
    let provider = InMemoryProvider::new().with_collection("employees", employees);
    let matcher = SimpleEqualityMatcher;
    let config = EngineConfig::default();
    let ctx = ExecutionContext::new(&provider, &matcher, &config);

    let input = vec![doc! {"_id": 3, "name": "carol", "managerId": 2}];
    let pipeline = vec![doc! {
        "$graphLookup": {
            "from": "employees",
            "startWith": "$managerId",
            "connectFromField": "managerId",
            "connectToField": "_id",
            "as": "managementChain",
        }
    }];

    let rows = aggregate(input, &pipeline, &ctx).await?.to_array();
    let chain = rows[0].get_array("managementChain")?;
    assert_eq!(chain.len(), 2);
    Ok(())
}

#[tokio::test]
async fn bucket_auto_distributes_five_values_into_two_buckets() -> Result<()> {
    let provider = InMemoryProvider::new();
    let matcher = SimpleEqualityMatcher;
    let config = EngineConfig::default();
    let ctx = ExecutionContext::new(&provider, &matcher, &config);

    let input = (1..=5).map(|n| doc! {"score": n}).collect();
    let pipeline = vec![doc! {
        "$bucketAuto": { "groupBy": "$score", "buckets": 2 }
    }];

    let rows = aggregate(input, &pipeline, &ctx).await?.to_array();
    assert_eq!(rows.len(), 2);
    let total: i64 = rows.iter().map(|d| d.get_i64("count").unwrap()).sum();
    assert_eq!(total, 5);
    Ok(())
}

#[tokio::test]
async fn redact_drops_subdocuments_by_access_tag() -> Result<()> {
    let provider = InMemoryProvider::new();
    let matcher = SimpleEqualityMatcher;
    let config = EngineConfig::default();
    let ctx = ExecutionContext::new(&provider, &matcher, &config);

    let input = vec![doc! {
        "title": "report",
        "body": { "level": "public", "text": "ok" },
        "appendix": { "level": "classified", "text": "secret" },
    }];

    let pipeline = vec![doc! {
        "$redact": {
            "$cond": {
                "if": { "$eq": ["$level", "classified"] },
                "then": "$$PRUNE",
                "else": "$$DESCEND",
            }
        }
    }];

    let rows = aggregate(input, &pipeline, &ctx).await?.to_array();
    assert!(rows[0].contains_key("body"));
    assert!(!rows[0].contains_key("appendix"));
    Ok(())
}
