//! Recursive AND/OR filter tree with path-addressed, non-mutating edits.
//!
//! A path is a list of child indexes starting at the root filter list:
//! `[]` is the root itself, `[2]` the third root node, `[2, 0]` the first
//! child of that node (which must be a group). Every operation returns a new
//! tree; callers replace the whole tree.
//!
//! Canonical form: no group is ever left with zero children, and no root
//! level group is left wrapping a single child.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::time::DateRange;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOperator {
    And,
    Or,
}

impl LogicalOperator {
    pub fn toggled(self) -> Self {
        match self {
            LogicalOperator::And => LogicalOperator::Or,
            LogicalOperator::Or => LogicalOperator::And,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Gt,
    Gte,
    Lt,
    Lte,
    Set,
    NotSet,
    InDateRange,
    NotInDateRange,
    BeforeDate,
    AfterDate,
    /// `values = [iso_duration, anchor_time_member]`: the member must fall
    /// within the duration after the same entity's anchor timestamp.
    WithinDurationAfter,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimpleFilter {
    pub member: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub values: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_range: Option<DateRange>,
}

impl SimpleFilter {
    pub fn new(member: impl Into<String>, operator: FilterOperator, values: Vec<String>) -> Self {
        Self {
            member: member.into(),
            operator,
            values,
            date_range: None,
        }
    }

    /// The range of an `inDateRange` filter, from `dateRange` or its values.
    pub fn resolved_date_range(&self) -> Option<DateRange> {
        self.date_range
            .or_else(|| DateRange::from_values(&self.values).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupFilter {
    #[serde(rename = "type")]
    pub logic: LogicalOperator,
    pub filters: Vec<FilterNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterNode {
    Group(GroupFilter),
    Simple(SimpleFilter),
}

impl FilterNode {
    pub fn simple(member: impl Into<String>, operator: FilterOperator, values: Vec<String>) -> Self {
        FilterNode::Simple(SimpleFilter::new(member, operator, values))
    }

    pub fn and(filters: Vec<FilterNode>) -> Self {
        FilterNode::Group(GroupFilter {
            logic: LogicalOperator::And,
            filters,
        })
    }

    pub fn or(filters: Vec<FilterNode>) -> Self {
        FilterNode::Group(GroupFilter {
            logic: LogicalOperator::Or,
            filters,
        })
    }

    pub fn as_group(&self) -> Option<&GroupFilter> {
        match self {
            FilterNode::Group(g) => Some(g),
            FilterNode::Simple(_) => None,
        }
    }

    /// Depth-first walk over every simple filter.
    pub fn visit_simple<F: FnMut(&SimpleFilter)>(&self, f: &mut F) {
        match self {
            FilterNode::Simple(s) => f(s),
            FilterNode::Group(g) => {
                for child in &g.filters {
                    child.visit_simple(f);
                }
            }
        }
    }
}

/// Inserts `new_filter` at `path`. See the module docs for path addressing.
///
/// At the root: an empty tree becomes `[new]`; a lone simple filter is
/// wrapped with the new one in an AND group; a lone group receives the new
/// filter; several siblings are wrapped together with it in an AND group.
/// Below the root the addressed node must be a group and the filter is
/// appended to it. An unresolvable path leaves the tree unchanged.
pub fn add_at_path(tree: &[FilterNode], path: &[usize], new_filter: FilterNode) -> Vec<FilterNode> {
    if path.is_empty() {
        return match tree {
            [] => vec![new_filter],
            [FilterNode::Simple(existing)] => vec![FilterNode::and(vec![
                FilterNode::Simple(existing.clone()),
                new_filter,
            ])],
            [FilterNode::Group(group)] => {
                let mut group = group.clone();
                group.filters.push(new_filter);
                vec![FilterNode::Group(group)]
            }
            siblings => {
                let mut filters = siblings.to_vec();
                filters.push(new_filter);
                vec![FilterNode::and(filters)]
            }
        };
    }

    match rebuild_at(tree, path, &mut |node| match node {
        FilterNode::Group(group) => {
            let mut group = group.clone();
            group.filters.push(new_filter.clone());
            Some(Some(FilterNode::Group(group)))
        }
        FilterNode::Simple(_) => None,
    }) {
        Some(updated) => updated,
        None => {
            debug!(?path, "add_at_path: path does not address a group");
            tree.to_vec()
        }
    }
}

/// Removes the node at `path`, dropping any group emptied by the removal
/// and unwrapping root level groups left with a single child.
pub fn remove_at_path(tree: &[FilterNode], path: &[usize]) -> Vec<FilterNode> {
    if path.is_empty() {
        return tree.to_vec();
    }
    match rebuild_at(tree, path, &mut |_| Some(None)) {
        Some(updated) => canonicalize(&updated),
        None => {
            debug!(?path, "remove_at_path: no node at path");
            tree.to_vec()
        }
    }
}

/// Removes the `index`-th root node.
pub fn remove_top_level(tree: &[FilterNode], index: usize) -> Vec<FilterNode> {
    remove_at_path(tree, &[index])
}

/// Flips the AND/OR type of the group at `path`; children are untouched.
pub fn toggle_group_type(tree: &[FilterNode], path: &[usize]) -> Vec<FilterNode> {
    rebuild_at(tree, path, &mut |node| match node {
        FilterNode::Group(group) => Some(Some(FilterNode::Group(GroupFilter {
            logic: group.logic.toggled(),
            filters: group.filters.clone(),
        }))),
        FilterNode::Simple(_) => None,
    })
    .unwrap_or_else(|| tree.to_vec())
}

/// Swaps the node at `path` for `replacement`.
pub fn replace_at_path(tree: &[FilterNode], path: &[usize], replacement: FilterNode) -> Vec<FilterNode> {
    rebuild_at(tree, path, &mut |_| Some(Some(replacement.clone())))
        .map(|updated| canonicalize(&updated))
        .unwrap_or_else(|| tree.to_vec())
}

pub fn get_at_path<'a>(tree: &'a [FilterNode], path: &[usize]) -> Option<&'a FilterNode> {
    let (first, rest) = path.split_first()?;
    let mut node = tree.get(*first)?;
    for index in rest {
        node = node.as_group()?.filters.get(*index)?;
    }
    Some(node)
}

/// Drops every simple filter matching `pred`, then canonicalizes.
pub fn remove_where<P>(tree: &[FilterNode], pred: P) -> Vec<FilterNode>
where
    P: Fn(&SimpleFilter) -> bool,
{
    fn prune<P: Fn(&SimpleFilter) -> bool>(nodes: &[FilterNode], pred: &P) -> Vec<FilterNode> {
        nodes
            .iter()
            .filter_map(|node| match node {
                FilterNode::Simple(s) if pred(s) => None,
                FilterNode::Simple(_) => Some(node.clone()),
                FilterNode::Group(g) => Some(FilterNode::Group(GroupFilter {
                    logic: g.logic,
                    filters: prune(&g.filters, pred),
                })),
            })
            .collect()
    }
    canonicalize(&prune(tree, &pred))
}

/// First simple filter matching `pred`, depth first.
pub fn find_simple<'a, P>(tree: &'a [FilterNode], pred: P) -> Option<&'a SimpleFilter>
where
    P: Fn(&SimpleFilter) -> bool,
{
    fn walk<'a, P: Fn(&SimpleFilter) -> bool>(
        nodes: &'a [FilterNode],
        pred: &P,
    ) -> Option<&'a SimpleFilter> {
        nodes.iter().find_map(|node| match node {
            FilterNode::Simple(s) => pred(s).then_some(s),
            FilterNode::Group(g) => walk(&g.filters, pred),
        })
    }
    walk(tree, &pred)
}

/// Removes empty groups at any depth and unwraps single-child root groups.
pub fn canonicalize(tree: &[FilterNode]) -> Vec<FilterNode> {
    fn drop_empty(nodes: &[FilterNode]) -> Vec<FilterNode> {
        nodes
            .iter()
            .filter_map(|node| match node {
                FilterNode::Simple(_) => Some(node.clone()),
                FilterNode::Group(g) => {
                    let children = drop_empty(&g.filters);
                    (!children.is_empty()).then(|| {
                        FilterNode::Group(GroupFilter {
                            logic: g.logic,
                            filters: children,
                        })
                    })
                }
            })
            .collect()
    }

    drop_empty(tree)
        .into_iter()
        .map(|node| match node {
            FilterNode::Group(mut g) if g.filters.len() == 1 => g.filters.remove(0),
            other => other,
        })
        .collect()
}

/// Rebuilds the list along `path`, letting `edit` decide the addressed node's
/// fate: `None` = path invalid, `Some(None)` = remove, `Some(Some(n))` =
/// replace. Groups emptied by a removal are dropped on the way back up.
fn rebuild_at<F>(nodes: &[FilterNode], path: &[usize], edit: &mut F) -> Option<Vec<FilterNode>>
where
    F: FnMut(&FilterNode) -> Option<Option<FilterNode>>,
{
    let (index, rest) = path.split_first()?;
    let target = nodes.get(*index)?;

    let replacement = if rest.is_empty() {
        edit(target)?
    } else {
        let group = target.as_group()?;
        let children = rebuild_at(&group.filters, rest, edit)?;
        (!children.is_empty()).then(|| {
            FilterNode::Group(GroupFilter {
                logic: group.logic,
                filters: children,
            })
        })
    };

    let mut out = Vec::with_capacity(nodes.len());
    out.extend_from_slice(&nodes[..*index]);
    out.extend(replacement);
    out.extend_from_slice(&nodes[*index + 1..]);
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eq(member: &str, value: &str) -> FilterNode {
        FilterNode::simple(member, FilterOperator::Equals, vec![value.to_string()])
    }

    fn assert_canonical(tree: &[FilterNode]) {
        fn no_empty(nodes: &[FilterNode]) -> bool {
            nodes.iter().all(|n| match n {
                FilterNode::Simple(_) => true,
                FilterNode::Group(g) => !g.filters.is_empty() && no_empty(&g.filters),
            })
        }
        assert!(no_empty(tree), "empty group left in {tree:?}");
        for node in tree {
            if let FilterNode::Group(g) = node {
                assert!(g.filters.len() > 1, "single-child root group in {tree:?}");
            }
        }
    }

    #[test]
    fn test_root_insertion_policy() {
        let tree = add_at_path(&[], &[], eq("Users.country", "US"));
        assert_eq!(tree, vec![eq("Users.country", "US")]);

        let tree = add_at_path(&tree, &[], eq("Users.plan", "pro"));
        assert_eq!(
            tree,
            vec![FilterNode::and(vec![eq("Users.country", "US"), eq("Users.plan", "pro")])]
        );

        let tree = add_at_path(&tree, &[], eq("Users.age", "30"));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].as_group().unwrap().filters.len(), 3);

        let siblings = vec![eq("A.x", "1"), eq("A.y", "2")];
        let tree = add_at_path(&siblings, &[], eq("A.z", "3"));
        assert_eq!(
            tree,
            vec![FilterNode::and(vec![eq("A.x", "1"), eq("A.y", "2"), eq("A.z", "3")])]
        );
    }

    #[test]
    fn test_add_into_nested_group() {
        let tree = vec![FilterNode::and(vec![
            eq("A.x", "1"),
            FilterNode::or(vec![eq("A.y", "2"), eq("A.y", "3")]),
        ])];
        let tree = add_at_path(&tree, &[0, 1], eq("A.y", "4"));
        let inner = get_at_path(&tree, &[0, 1]).unwrap().as_group().unwrap();
        assert_eq!(inner.logic, LogicalOperator::Or);
        assert_eq!(inner.filters.len(), 3);
    }

    #[test]
    fn test_add_at_invalid_path_is_noop() {
        let tree = vec![eq("A.x", "1")];
        assert_eq!(add_at_path(&tree, &[0], eq("A.y", "2")), tree);
        assert_eq!(add_at_path(&tree, &[5], eq("A.y", "2")), tree);
    }

    #[test]
    fn test_remove_unwraps_single_child_root_group() {
        let tree = vec![FilterNode::and(vec![eq("A.x", "1"), eq("A.y", "2")])];
        let tree = remove_at_path(&tree, &[0, 0]);
        assert_eq!(tree, vec![eq("A.y", "2")]);
    }

    #[test]
    fn test_remove_last_child_drops_group() {
        let tree = vec![FilterNode::and(vec![
            eq("A.x", "1"),
            FilterNode::or(vec![eq("A.y", "2")]),
            eq("A.z", "3"),
        ])];
        let tree = remove_at_path(&tree, &[0, 1, 0]);
        assert_eq!(
            tree,
            vec![FilterNode::and(vec![eq("A.x", "1"), eq("A.z", "3")])]
        );
    }

    #[test]
    fn test_remove_everywhere_stays_canonical() {
        let tree = vec![
            FilterNode::and(vec![
                eq("A.a", "1"),
                FilterNode::or(vec![eq("A.b", "2"), FilterNode::and(vec![eq("A.c", "3")])]),
            ]),
            eq("A.d", "4"),
            FilterNode::or(vec![eq("A.e", "5"), eq("A.f", "6")]),
        ];
        let paths: Vec<Vec<usize>> = vec![
            vec![0],
            vec![0, 0],
            vec![0, 1],
            vec![0, 1, 0],
            vec![0, 1, 1],
            vec![0, 1, 1, 0],
            vec![1],
            vec![2],
            vec![2, 0],
            vec![2, 1],
        ];
        for path in paths {
            let out = remove_at_path(&tree, &path);
            assert_canonical(&out);
        }
        assert_eq!(remove_top_level(&tree, 1).len(), 2);
    }

    #[test]
    fn test_toggle_only_affects_target() {
        let tree = vec![FilterNode::and(vec![
            eq("A.x", "1"),
            FilterNode::and(vec![eq("A.y", "2"), eq("A.z", "3")]),
        ])];
        let tree = toggle_group_type(&tree, &[0]);
        let root = tree[0].as_group().unwrap();
        assert_eq!(root.logic, LogicalOperator::Or);
        assert_eq!(root.filters[1].as_group().unwrap().logic, LogicalOperator::And);

        // toggling a simple filter is ignored
        assert_eq!(toggle_group_type(&tree, &[0, 0]), tree);
    }

    #[test]
    fn test_remove_where_and_find() {
        let date = FilterNode::simple(
            "Orders.createdAt",
            FilterOperator::InDateRange,
            vec!["2024-01-01".into(), "2024-01-31".into()],
        );
        let tree = vec![FilterNode::and(vec![eq("Orders.status", "paid"), date])];
        let found = find_simple(&tree, |f| f.operator == FilterOperator::InDateRange).unwrap();
        assert_eq!(found.member, "Orders.createdAt");

        let pruned = remove_where(&tree, |f| f.member == "Orders.createdAt");
        assert_eq!(pruned, vec![eq("Orders.status", "paid")]);
    }

    #[test]
    fn test_replace_at_path() {
        let tree = vec![eq("A.x", "1"), eq("A.y", "2")];
        let tree = replace_at_path(&tree, &[1], eq("A.y", "9"));
        assert_eq!(tree[1], eq("A.y", "9"));
    }

    #[test]
    fn test_deserialize_mixed_tree() {
        let raw = r#"[
            {"type": "or", "filters": [
                {"member": "Users.country", "operator": "equals", "values": ["US"]},
                {"member": "Users.plan", "operator": "notSet"}
            ]},
            {"member": "Orders.createdAt", "operator": "inDateRange", "values": ["2024-01-01", "2024-01-31"]}
        ]"#;
        let tree: Vec<FilterNode> = serde_json::from_str(raw).unwrap();
        assert_eq!(tree.len(), 2);
        let group = tree[0].as_group().unwrap();
        assert_eq!(group.logic, LogicalOperator::Or);
        match &tree[1] {
            FilterNode::Simple(f) => {
                assert_eq!(f.operator, FilterOperator::InDateRange);
                assert_eq!(f.resolved_date_range().unwrap().days(), 31);
            }
            FilterNode::Group(_) => panic!("expected a simple filter"),
        }
    }
}
