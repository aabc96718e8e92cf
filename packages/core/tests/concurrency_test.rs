//! Concurrent requests against one cache

mod common;

use anyhow::Result;
use common::{create_test_hierarchy, labels, seed};
use serde_json::json;
use std::thread;

#[test]
fn test_concurrent_requests_populate_once() -> Result<()> {
    let (hierarchy, _temp_dir) = create_test_hierarchy(json!({
        "rootRules": [{ "specifications": [{
            "id": "widgets",
            "kind": { "type": "instancesOfSpecificClasses", "classes": ["Widget"] },
            "hasChildren": "never"
        }]}]
    }))?;
    seed(
        &hierarchy.store,
        &[("w1", "Widget", "Gear"), ("w2", "Widget", "Bolt"), ("w3", "Widget", "Axle")],
    )?;

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let manager = hierarchy.manager.clone();
            let request = hierarchy.request();
            thread::spawn(move || manager.get_children(&request))
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        let nodes = handle
            .join()
            .map_err(|_| anyhow::anyhow!("request thread panicked"))??;
        results.push(nodes);
    }

    assert_eq!(labels(&results[0]), vec!["Axle", "Bolt", "Gear"]);
    assert!(results.iter().all(|nodes| *nodes == results[0]));
    assert_eq!(hierarchy.store.executed_queries(), 1);
    Ok(())
}
