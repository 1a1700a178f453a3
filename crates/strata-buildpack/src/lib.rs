//! Buildpack descriptors and order resolution for strata.
//!
//! This crate defines the buildpack model: `buildpack.toml` descriptors
//! (`Descriptor`), orders of groups of buildpack references (`Order`, `Group`,
//! `GroupBuildpack`) with their normalization views, a `Catalog` of descriptors
//! loaded from a buildpacks directory, and the `Resolver` that flattens nested
//! meta-buildpack orders into the linear groups a detector tries.

pub mod catalog;
pub mod descriptor;
pub mod group;
pub mod resolve;

pub use catalog::{escape_id, parse_order_file, parse_order_str, Catalog};
pub use descriptor::{
    parse_descriptor_file, parse_descriptor_str, Descriptor, DescriptorError, Info, Stack,
};
pub use group::{Group, GroupBuildpack, Order};
pub use resolve::{flatten_order, ResolveError, Resolver};
