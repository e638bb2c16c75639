use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{Context, Result};
use cargo_metadata::MetadataCommand;

/// The decision crates stay pure: no database, no HTTP, no runtime. The
/// gateway and store own all I/O.
const PURE_PACKAGE_NAMES: &[&str] = &["lexlead-contracts", "lexlead-marketplace", "lexlead-policy"];
const FORBIDDEN_PURE_DEPENDENCIES: &[&str] = &["sqlx", "axum", "tokio", "reqwest"];

fn main() -> Result<()> {
    let metadata = MetadataCommand::new()
        .exec()
        .context("failed to run `cargo metadata`")?;

    let resolve = metadata
        .resolve
        .as_ref()
        .context("`cargo metadata` did not include a resolved dependency graph")?;

    let id_to_name: HashMap<_, _> = metadata
        .packages
        .iter()
        .map(|p| (p.id.clone(), p.name.as_str()))
        .collect();

    let adjacency: HashMap<_, _> = resolve
        .nodes
        .iter()
        .map(|node| {
            let deps: Vec<_> = node.deps.iter().map(|dep| dep.pkg.clone()).collect();
            (node.id.clone(), deps)
        })
        .collect();

    let mut failed = false;

    for package_name in PURE_PACKAGE_NAMES {
        let package = metadata
            .packages
            .iter()
            .find(|p| p.name == *package_name)
            .with_context(|| format!("package `{}` not found in workspace", package_name))?;

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(package.id.clone());
        visited.insert(package.id.clone());

        let mut violations = Vec::new();

        while let Some(current) = queue.pop_front() {
            let Some(deps) = adjacency.get(&current) else {
                continue;
            };

            for dep in deps.iter().cloned() {
                if !visited.insert(dep.clone()) {
                    continue;
                }

                if let Some(name) = id_to_name.get(&dep)
                    && FORBIDDEN_PURE_DEPENDENCIES.contains(name)
                {
                    violations.push((*name).to_string());
                }

                queue.push_back(dep);
            }
        }

        if violations.is_empty() {
            println!(
                "OK: `{}` has no dependency edge to {}",
                package_name,
                FORBIDDEN_PURE_DEPENDENCIES.join(", ")
            );
        } else {
            violations.sort();
            violations.dedup();
            eprintln!(
                "FAIL: `{}` depends on forbidden crate(s): {}",
                package_name,
                violations.join(", ")
            );
            failed = true;
        }
    }

    if failed {
        std::process::exit(1);
    }

    Ok(())
}
