use crate::cmd::{load_config, open_store};
use crate::output::print_json;
use anyhow::Context;
use std::path::Path;

/// `backup delete <id>`: remove one artifact regardless of retention, e.g. a
/// partial dump kept for diagnosis.
pub fn run(config: Option<&Path>, identifier: &str, json: bool) -> anyhow::Result<i32> {
    let cfg = load_config(config)?;
    let store = open_store(&cfg)?;
    store
        .delete(identifier)
        .with_context(|| format!("failed to delete {identifier}"))?;

    if json {
        print_json(&serde_json::json!({
            "identifier": identifier,
            "deleted": true,
        }))?;
    } else {
        println!("Deleted: {identifier}");
    }
    Ok(0)
}
