use crate::cmd::{load_config, open_store};
use crate::output::print_json;
use anyhow::Context;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct Verification {
    identifier: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// `backup verify [<id>]`: re-hash one artifact, or every listed one.
pub fn run(config: Option<&Path>, identifier: Option<&str>, json: bool) -> anyhow::Result<i32> {
    let cfg = load_config(config)?;
    let store = open_store(&cfg)?;

    let ids: Vec<String> = match identifier {
        Some(id) => vec![id.to_string()],
        None => store
            .list_all()
            .context("failed to list artifacts")?
            .into_iter()
            .map(|a| a.identifier)
            .collect(),
    };

    let results: Vec<Verification> = ids
        .into_iter()
        .map(|id| match store.verify(&id) {
            Ok(_) => Verification {
                identifier: id,
                ok: true,
                error: None,
            },
            Err(e) => Verification {
                identifier: id,
                ok: false,
                error: Some(e.to_string()),
            },
        })
        .collect();

    let failed = results.iter().filter(|r| !r.ok).count();

    if json {
        print_json(&results)?;
    } else if results.is_empty() {
        println!("No backups to verify.");
    } else {
        for r in &results {
            match &r.error {
                None => println!("ok      {}", r.identifier),
                Some(e) => println!("FAILED  {}: {e}", r.identifier),
            }
        }
        println!("{} verified, {} failed", results.len() - failed, failed);
    }

    Ok(if failed == 0 { 0 } else { 1 })
}
