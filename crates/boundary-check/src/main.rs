//! Fails when the operational API can reach the PHI store crate through any
//! dependency path. PHI storage access belongs to the broker alone.

use std::collections::{HashMap, HashSet, VecDeque};

use anyhow::{Context, Result};
use cargo_metadata::{Metadata, MetadataCommand, PackageId};

struct Boundary {
    package: &'static str,
    forbidden: &'static [&'static str],
}

const BOUNDARIES: &[Boundary] = &[Boundary {
    package: "sokana-api",
    forbidden: &["sokana-phi-store", "sokana-phi-broker"],
}];

fn main() -> Result<()> {
    let metadata = MetadataCommand::new()
        .exec()
        .context("failed to run `cargo metadata`")?;

    let mut failed = false;
    for boundary in BOUNDARIES {
        let violations = forbidden_paths(&metadata, boundary)?;
        if violations.is_empty() {
            println!(
                "OK: `{}` has no dependency edge to {}",
                boundary.package,
                boundary.forbidden.join(", ")
            );
            continue;
        }

        failed = true;
        for path in violations {
            eprintln!(
                "FAIL: `{}` reaches forbidden crate via {}",
                boundary.package,
                path.join(" -> ")
            );
        }
    }

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Breadth-first walk of the resolved graph; returns the first path found to
/// each forbidden package.
fn forbidden_paths(metadata: &Metadata, boundary: &Boundary) -> Result<Vec<Vec<String>>> {
    let resolve = metadata
        .resolve
        .as_ref()
        .context("`cargo metadata` did not include a resolved dependency graph")?;

    let root = metadata
        .packages
        .iter()
        .find(|p| p.name == boundary.package)
        .with_context(|| format!("package `{}` not found in workspace", boundary.package))?;

    let id_to_name: HashMap<&PackageId, &str> = metadata
        .packages
        .iter()
        .map(|p| (&p.id, p.name.as_str()))
        .collect();

    let adjacency: HashMap<&PackageId, Vec<&PackageId>> = resolve
        .nodes
        .iter()
        .map(|node| (&node.id, node.deps.iter().map(|dep| &dep.pkg).collect()))
        .collect();

    let mut parent: HashMap<&PackageId, &PackageId> = HashMap::new();
    let mut visited: HashSet<&PackageId> = HashSet::from([&root.id]);
    let mut queue = VecDeque::from([&root.id]);
    let mut violations = Vec::new();

    while let Some(current) = queue.pop_front() {
        let Some(deps) = adjacency.get(current) else {
            continue;
        };

        for dep in deps.iter().copied() {
            if !visited.insert(dep) {
                continue;
            }
            parent.insert(dep, current);

            if let Some(name) = id_to_name.get(dep)
                && boundary.forbidden.contains(name)
            {
                violations.push(path_to(dep, &parent, &id_to_name));
            }

            queue.push_back(dep);
        }
    }

    violations.sort();
    Ok(violations)
}

fn path_to<'a>(
    target: &'a PackageId,
    parent: &HashMap<&'a PackageId, &'a PackageId>,
    id_to_name: &HashMap<&'a PackageId, &str>,
) -> Vec<String> {
    let mut path = Vec::new();
    let mut cursor = Some(target);
    while let Some(id) = cursor {
        path.push(id_to_name.get(id).copied().unwrap_or("?").to_string());
        cursor = parent.get(id).copied();
    }
    path.reverse();
    path
}
