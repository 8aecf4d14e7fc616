use crate::cmd::{load_config, open_store};
use crate::output::{human_size, print_json, print_table, Align};
use anyhow::Context;
use std::path::Path;

/// `backup list`: finalized artifacts, newest first.
pub fn run(config: Option<&Path>, json: bool) -> anyhow::Result<i32> {
    let cfg = load_config(config)?;
    let store = open_store(&cfg)?;
    let artifacts = store.list_all().context("failed to list artifacts")?;

    if json {
        print_json(&artifacts)?;
        return Ok(0);
    }

    if artifacts.is_empty() {
        println!("No backups in {}.", store.root().display());
        return Ok(0);
    }

    let rows: Vec<Vec<String>> = artifacts
        .iter()
        .map(|a| {
            vec![
                a.identifier.clone(),
                a.status.to_string(),
                human_size(a.size_bytes),
                a.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
                a.checksum
                    .as_deref()
                    .map(|c| c.chars().take(12).collect())
                    .unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    print_table(
        &[
            ("ID", Align::Left),
            ("STATUS", Align::Left),
            ("SIZE", Align::Right),
            ("CREATED (UTC)", Align::Left),
            ("SHA256", Align::Left),
        ],
        &rows,
    );
    Ok(0)
}
