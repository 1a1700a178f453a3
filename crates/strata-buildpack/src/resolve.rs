//! Flattening of nested orders into linear groups.
//!
//! Meta-buildpacks reachable from the input order are resolved bottom-up: an
//! explicit-stack depth-first walk produces their post-order, each one is
//! flattened exactly once, and the flattened groups are substituted in place
//! of every reference to it. The walk never recurses on the call stack, so
//! nesting depth is bounded only by memory.

use crate::catalog::Catalog;
use crate::descriptor::Descriptor;
use crate::group::{Group, GroupBuildpack, Order};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unknown buildpack: {0}")]
    UnknownBuildpack(String),
    #[error("buildpack '{id}' has several versions ({}), a version is required", .versions.join(", "))]
    AmbiguousVersion { id: String, versions: Vec<String> },
    #[error("buildpack order cycle: {0}")]
    Cycle(String),
}

type Key = (String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Work item of the post-order walk: a meta-buildpack, its meta children, and
/// the index of the next child to visit.
struct Frame {
    key: Key,
    children: Vec<Key>,
    next: usize,
}

pub struct Resolver<'a> {
    catalog: &'a Catalog,
}

impl<'a> Resolver<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    /// Expand `order` into the linear groups a detector should try, in order.
    ///
    /// The input order and the catalog are left untouched, so the same
    /// descriptors can back any number of resolutions.
    pub fn flatten(&self, order: &[Group]) -> Result<Order, ResolveError> {
        let mut resolved: HashMap<Key, Order> = HashMap::new();
        for key in self.meta_post_order(order)? {
            let flat = self.expand(self.order_of(&key), &resolved)?;
            debug!(
                "flattened meta-buildpack {}@{} into {} group(s)",
                key.0,
                key.1,
                flat.len()
            );
            resolved.insert(key, flat);
        }
        self.expand(order, &resolved)
    }

    fn lookup(&self, bp: &GroupBuildpack) -> Result<&'a Descriptor, ResolveError> {
        if bp.version.is_empty() {
            let versions = self.catalog.versions(&bp.id);
            return match versions.as_slice() {
                [] => Err(ResolveError::UnknownBuildpack(bp.id.clone())),
                [only] => self
                    .catalog
                    .get(&bp.id, only)
                    .ok_or_else(|| ResolveError::UnknownBuildpack(bp.id.clone())),
                many => Err(ResolveError::AmbiguousVersion {
                    id: bp.id.clone(),
                    versions: many.iter().map(|v| (*v).to_owned()).collect(),
                }),
            };
        }
        self.catalog
            .get(&bp.id, &bp.version)
            .ok_or_else(|| ResolveError::UnknownBuildpack(bp.to_string()))
    }

    fn order_of(&self, key: &Key) -> &'a [Group] {
        self.catalog
            .get(&key.0, &key.1)
            .and_then(|d| d.order.as_deref())
            .unwrap_or_default()
    }

    /// Meta-buildpacks referenced directly by `order`, first occurrence first.
    fn meta_children(&self, order: &[Group]) -> Result<Vec<Key>, ResolveError> {
        let mut keys: Vec<Key> = Vec::new();
        for group in order {
            for bp in group.iter() {
                let descriptor = self.lookup(bp)?;
                if descriptor.is_meta_buildpack() {
                    let key = key_of(descriptor);
                    if !keys.contains(&key) {
                        keys.push(key);
                    }
                }
            }
        }
        Ok(keys)
    }

    fn meta_post_order(&self, order: &[Group]) -> Result<Vec<Key>, ResolveError> {
        let mut marks: HashMap<Key, Mark> = HashMap::new();
        let mut post = Vec::new();

        for root in self.meta_children(order)? {
            if marks.contains_key(&root) {
                continue;
            }
            marks.insert(root.clone(), Mark::Visiting);
            let mut stack = vec![Frame {
                children: self.meta_children(self.order_of(&root))?,
                key: root,
                next: 0,
            }];

            loop {
                let next_child = match stack.last_mut() {
                    None => break,
                    Some(frame) if frame.next < frame.children.len() => {
                        frame.next += 1;
                        Some(frame.children[frame.next - 1].clone())
                    }
                    Some(_) => None,
                };

                match next_child {
                    Some(child) => match marks.get(&child).copied() {
                        Some(Mark::Done) => {}
                        Some(Mark::Visiting) => return Err(cycle_error(&stack, &child)),
                        None => {
                            marks.insert(child.clone(), Mark::Visiting);
                            stack.push(Frame {
                                children: self.meta_children(self.order_of(&child))?,
                                key: child,
                                next: 0,
                            });
                        }
                    },
                    None => {
                        if let Some(frame) = stack.pop() {
                            marks.insert(frame.key.clone(), Mark::Done);
                            post.push(frame.key);
                        }
                    }
                }
            }
        }
        Ok(post)
    }

    fn expand(
        &self,
        order: &[Group],
        resolved: &HashMap<Key, Order>,
    ) -> Result<Order, ResolveError> {
        let mut out = Vec::new();
        for group in order {
            let mut alternatives = vec![Group::default()];
            for bp in group.iter() {
                let descriptor = self.lookup(bp)?;
                if descriptor.is_meta_buildpack() {
                    let sub = resolved
                        .get(&key_of(descriptor))
                        .map(Vec::as_slice)
                        .unwrap_or_default();
                    let mut next = Vec::with_capacity(alternatives.len() * (sub.len() + 1));
                    for alt in &alternatives {
                        next.extend(sub.iter().map(|sub_group| merge(alt, sub_group)));
                        if bp.optional {
                            next.push(alt.clone());
                        }
                    }
                    if next.is_empty() {
                        debug!("{bp} has no runnable groups; dropping alternatives through it");
                    }
                    alternatives = next;
                } else {
                    let entry = Group::from(with_descriptor_info(bp, descriptor));
                    for alt in &mut alternatives {
                        *alt = merge(alt, &entry);
                    }
                }
            }
            out.extend(alternatives);
        }
        Ok(out)
    }
}

/// Convenience wrapper around [`Resolver::flatten`].
pub fn flatten_order(order: &[Group], catalog: &Catalog) -> Result<Order, ResolveError> {
    Resolver::new(catalog).flatten(order)
}

fn key_of(descriptor: &Descriptor) -> Key {
    (
        descriptor.buildpack.id.clone(),
        descriptor.buildpack.version.clone(),
    )
}

/// Append `extra` to `base`, skipping buildpacks `base` already runs.
fn merge(base: &Group, extra: &Group) -> Group {
    let fresh: Vec<GroupBuildpack> = extra
        .iter()
        .filter(|bp| !base.contains(bp))
        .cloned()
        .collect();
    base.append(&[Group::new(fresh)])
}

fn with_descriptor_info(bp: &GroupBuildpack, descriptor: &Descriptor) -> GroupBuildpack {
    let mut out = bp.clone();
    if out.version.is_empty() {
        out.version.clone_from(&descriptor.buildpack.version);
    }
    if out.api.is_empty() {
        out.api.clone_from(&descriptor.api);
    }
    if out.homepage.is_empty() {
        out.homepage.clone_from(&descriptor.buildpack.homepage);
    }
    out
}

fn cycle_error(stack: &[Frame], repeated: &Key) -> ResolveError {
    let start = stack
        .iter()
        .position(|frame| frame.key == *repeated)
        .unwrap_or(0);
    let mut chain: Vec<String> = stack[start..]
        .iter()
        .map(|frame| format!("{}@{}", frame.key.0, frame.key.1))
        .collect();
    chain.push(format!("{}@{}", repeated.0, repeated.1));
    ResolveError::Cycle(chain.join(" -> "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Info;

    fn regular(id: &str) -> Descriptor {
        Descriptor {
            api: "0.7".to_owned(),
            buildpack: Info {
                id: id.to_owned(),
                name: id.to_owned(),
                version: "1".to_owned(),
                ..Info::default()
            },
            ..Descriptor::default()
        }
    }

    fn meta(id: &str, order: &[&[&str]]) -> Descriptor {
        let mut d = regular(id);
        d.order = Some(order.iter().map(|ids| group(ids)).collect());
        d
    }

    fn group(ids: &[&str]) -> Group {
        Group::new(ids.iter().map(|id| GroupBuildpack::new(*id, "1")).collect())
    }

    fn ids(order: &Order) -> Vec<Vec<&str>> {
        order
            .iter()
            .map(|g| g.iter().map(|bp| bp.id.as_str()).collect())
            .collect()
    }

    #[test]
    fn regular_order_passes_through_enriched() {
        let catalog: Catalog = [regular("a"), regular("b")].into_iter().collect();
        let order = vec![group(&["a", "b"]), group(&["b"])];
        let flat = flatten_order(&order, &catalog).unwrap();
        assert_eq!(ids(&flat), vec![vec!["a", "b"], vec!["b"]]);
        assert_eq!(flat[0].group[0].api, "0.7");
    }

    #[test]
    fn meta_is_substituted_in_place() {
        let catalog: Catalog = [
            regular("a"),
            regular("x"),
            regular("y"),
            regular("z"),
            regular("c"),
            meta("m", &[&["x"], &["y", "z"]]),
        ]
        .into_iter()
        .collect();
        let order = vec![group(&["a", "m", "c"])];
        let flat = flatten_order(&order, &catalog).unwrap();
        assert_eq!(
            ids(&flat),
            vec![vec!["a", "x", "c"], vec!["a", "y", "z", "c"]]
        );
    }

    #[test]
    fn nested_meta_resolves_bottom_up() {
        let catalog: Catalog = [
            regular("leaf1"),
            regular("leaf2"),
            meta("inner", &[&["leaf1"], &["leaf2"]]),
            meta("outer", &[&["inner", "leaf2"]]),
        ]
        .into_iter()
        .collect();
        let flat = flatten_order(&[group(&["outer"])], &catalog).unwrap();
        assert_eq!(ids(&flat), vec![vec!["leaf1", "leaf2"], vec!["leaf2"]]);
    }

    #[test]
    fn optional_meta_adds_alternative_without_it() {
        let catalog: Catalog = [regular("a"), regular("x"), meta("m", &[&["x"]])]
            .into_iter()
            .collect();
        let mut g = group(&["a"]);
        g.group.push(GroupBuildpack::new("m", "1").optional());
        let flat = flatten_order(&[g], &catalog).unwrap();
        assert_eq!(ids(&flat), vec![vec!["a", "x"], vec!["a"]]);
    }

    #[test]
    fn duplicates_keep_first_occurrence() {
        let catalog: Catalog = [regular("a"), regular("b"), meta("m", &[&["a", "b"]])]
            .into_iter()
            .collect();
        let flat = flatten_order(&[group(&["a", "m", "b"])], &catalog).unwrap();
        assert_eq!(ids(&flat), vec![vec!["a", "b"]]);
    }

    #[test]
    fn empty_meta_order_yields_no_groups() {
        let catalog: Catalog = [regular("a"), meta("m", &[])].into_iter().collect();
        let flat = flatten_order(&[group(&["a", "m"]), group(&["a"])], &catalog).unwrap();
        assert_eq!(ids(&flat), vec![vec!["a"]]);
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let catalog: Catalog = [meta("m", &[&["m"]])].into_iter().collect();
        let err = flatten_order(&[group(&["m"])], &catalog).unwrap_err();
        assert_eq!(err, ResolveError::Cycle("m@1 -> m@1".to_owned()));
    }

    #[test]
    fn indirect_cycle_names_the_chain() {
        let catalog: Catalog = [
            regular("x"),
            meta("a", &[&["x", "b"]]),
            meta("b", &[&["c"]]),
            meta("c", &[&["a"]]),
        ]
        .into_iter()
        .collect();
        let err = flatten_order(&[group(&["a"])], &catalog).unwrap_err();
        assert_eq!(err, ResolveError::Cycle("a@1 -> b@1 -> c@1 -> a@1".to_owned()));
    }

    #[test]
    fn shared_meta_is_not_a_cycle() {
        let catalog: Catalog = [
            regular("x"),
            meta("shared", &[&["x"]]),
            meta("a", &[&["shared"]]),
            meta("b", &[&["shared"]]),
        ]
        .into_iter()
        .collect();
        let flat = flatten_order(&[group(&["a"]), group(&["b"])], &catalog).unwrap();
        assert_eq!(ids(&flat), vec![vec!["x"], vec!["x"]]);
    }

    #[test]
    fn unknown_buildpack_fails() {
        let catalog = Catalog::new();
        let err = flatten_order(&[group(&["ghost"])], &catalog).unwrap_err();
        assert_eq!(err, ResolveError::UnknownBuildpack("ghost@1".to_owned()));
    }

    #[test]
    fn empty_version_uses_unique_match() {
        let catalog: Catalog = [regular("a")].into_iter().collect();
        let order = vec![Group::new(vec![GroupBuildpack::new("a", "")])];
        let flat = flatten_order(&order, &catalog).unwrap();
        assert_eq!(flat[0].group[0].version, "1");
    }

    #[test]
    fn empty_version_with_several_candidates_is_ambiguous() {
        let mut two = regular("a");
        two.buildpack.version = "2".to_owned();
        let catalog: Catalog = [regular("a"), two].into_iter().collect();
        let order = vec![Group::new(vec![GroupBuildpack::new("a", "")])];
        assert!(matches!(
            flatten_order(&order, &catalog),
            Err(ResolveError::AmbiguousVersion { .. })
        ));
    }

    #[test]
    fn resolution_does_not_mutate_inputs() {
        let catalog: Catalog = [regular("x"), meta("m", &[&["x"]])].into_iter().collect();
        let order = vec![group(&["m"])];
        let before_order = order.clone();
        let before_meta = catalog.get("m", "1").cloned();

        let first = flatten_order(&order, &catalog).unwrap();
        let second = flatten_order(&order, &catalog).unwrap();

        assert_eq!(first, second);
        assert_eq!(order, before_order);
        assert_eq!(catalog.get("m", "1").cloned(), before_meta);
    }

    #[test]
    fn deep_nesting_does_not_overflow() {
        let depth = 5_000;
        let mut descriptors = vec![regular("leaf")];
        let mut child = "leaf".to_owned();
        for level in 0..depth {
            let id = format!("meta{level}");
            descriptors.push(meta(&id, &[&[child.as_str()]]));
            child = id;
        }
        let catalog: Catalog = descriptors.into_iter().collect();
        let flat = flatten_order(&[group(&[child.as_str()])], &catalog).unwrap();
        assert_eq!(ids(&flat), vec![vec!["leaf"]]);
    }
}
