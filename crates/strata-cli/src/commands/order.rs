use super::{json_pretty, CommandError, EXIT_SUCCESS};
use serde::Serialize;
use std::path::Path;
use strata_buildpack::{parse_order_file, Catalog, Group, GroupBuildpack, Order, Resolver};
use strata_core::{Capability, ExitKind, Platform};
use tracing::info;

#[derive(Serialize)]
struct OrderOutput<'a> {
    platform_api: &'a str,
    order: &'a Order,
}

/// Drop homepages the platform does not record in groups.
fn for_platform(order: Order, platform: &Platform) -> Order {
    if platform.supports(Capability::GroupHomepage) {
        return order;
    }
    order
        .into_iter()
        .map(|g| Group::new(g.iter().map(GroupBuildpack::no_homepage).collect()))
        .collect()
}

pub fn run(
    platform: &Platform,
    order_path: &Path,
    buildpacks_dir: &Path,
    json: bool,
) -> Result<u8, CommandError> {
    let failed = |message: String| CommandError::new(platform.code_for(ExitKind::Failed), message);

    let order = parse_order_file(order_path)
        .map_err(|e| failed(format!("failed to read order {}: {e}", order_path.display())))?;
    let catalog = Catalog::load_dir(buildpacks_dir).map_err(|e| {
        failed(format!(
            "failed to load buildpacks from {}: {e}",
            buildpacks_dir.display()
        ))
    })?;
    info!(
        "loaded {} buildpack(s) from {}",
        catalog.len(),
        buildpacks_dir.display()
    );

    let flat = Resolver::new(&catalog)
        .flatten(&order)
        .map_err(|e| failed(e.to_string()))?;
    let flat = for_platform(flat, platform);

    if json {
        let out = OrderOutput {
            platform_api: platform.api(),
            order: &flat,
        };
        println!("{}", json_pretty(&out).map_err(failed)?);
    } else if flat.is_empty() {
        println!("no groups");
    } else {
        for (i, group) in flat.iter().enumerate() {
            println!("{:>3}: {group}", i + 1);
        }
    }
    Ok(EXIT_SUCCESS)
}
