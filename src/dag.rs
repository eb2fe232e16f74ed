//! Branch resolution for tree-structured session logs.
//!
//! Branching providers (Claude Code, Pi) link each entry to its parent. A
//! rewind-and-resend leaves dead branches behind, and parallel tool calls
//! fork the tree. The resolver picks the active branch (root to the newest
//! entry) and reports which dead nodes must still be shown.
//!
//! Nodes live in an arena indexed by id; parents are resolved by lookup and
//! every ancestor walk is guarded by a visited set, so a corrupted log with
//! a cycle cannot loop forever.

use std::collections::{HashMap, HashSet};

/// What the resolver needs to know about a raw entry.
pub trait DagEntry {
    fn id(&self) -> Option<&str>;
    fn parent_id(&self) -> Option<&str>;
    /// Ids of tool invocations carried by this entry.
    fn tool_use_ids(&self) -> Vec<&str>;
    /// Ids of the tool invocations this entry answers.
    fn tool_result_ids(&self) -> Vec<&str>;
    /// Whether this entry can be the terminal node.
    fn has_content(&self) -> bool {
        true
    }
}

#[derive(Debug)]
pub struct DagNode<'a, E> {
    pub id: String,
    pub parent_id: Option<String>,
    pub line_index: usize,
    pub entry: &'a E,
}

// Manual impl: `E` itself need not be Clone.
impl<E> Clone for DagNode<'_, E> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            parent_id: self.parent_id.clone(),
            line_index: self.line_index,
            entry: self.entry,
        }
    }
}

impl<E: DagEntry> DagNode<'_, E> {
    fn is_tool_result(&self) -> bool {
        !self.entry.tool_result_ids().is_empty() && self.entry.tool_use_ids().is_empty()
    }

    fn is_tool_use(&self) -> bool {
        !self.entry.tool_use_ids().is_empty()
    }
}

/// A dead tool_result whose parent is on the active branch.
#[derive(Debug, Clone)]
pub struct SiblingToolResult<'a, E> {
    pub parent_id: String,
    pub node: DagNode<'a, E>,
}

/// A dead tool_use → tool_result chain forked from the active branch.
#[derive(Debug, Clone)]
pub struct SiblingToolBranch<'a, E> {
    pub branch_point_id: String,
    pub nodes: Vec<DagNode<'a, E>>,
}

#[derive(Debug)]
pub struct ResolvedBranch<'a, E> {
    /// Root-first.
    pub active: Vec<DagNode<'a, E>>,
    pub all_tool_result_ids: HashSet<String>,
    pub orphaned_tool_use_ids: HashSet<String>,
    pub sibling_tool_results: Vec<SiblingToolResult<'a, E>>,
    pub sibling_tool_branches: Vec<SiblingToolBranch<'a, E>>,
    parents: HashMap<String, Option<String>>,
}

impl<'a, E: DagEntry> ResolvedBranch<'a, E> {
    /// Side nodes to splice in right after the active node `id`, in line order.
    pub fn attached_to(&self, id: &str) -> Vec<&DagNode<'a, E>> {
        let mut nodes: Vec<&DagNode<'a, E>> = self
            .sibling_tool_results
            .iter()
            .filter(|s| s.parent_id == id)
            .map(|s| &s.node)
            .chain(
                self.sibling_tool_branches
                    .iter()
                    .filter(|b| b.branch_point_id == id)
                    .flat_map(|b| b.nodes.iter()),
            )
            .collect();
        nodes.sort_by_key(|n| n.line_index);
        nodes
    }

    /// Walk up from `id`'s parent until an ancestor satisfying `emitted` is found.
    pub fn nearest_ancestor(&self, id: &str, emitted: impl Fn(&str) -> bool) -> Option<String> {
        let mut visited = HashSet::new();
        let mut current = self.parents.get(id).cloned().flatten();
        while let Some(candidate) = current {
            if !visited.insert(candidate.clone()) {
                return None;
            }
            if emitted(&candidate) {
                return Some(candidate);
            }
            current = self.parents.get(&candidate).cloned().flatten();
        }
        None
    }
}

/// Resolve the active branch and side branches for one session's entries.
///
/// `entries` is in append order; an entry's position is its line index.
pub fn resolve<E: DagEntry>(entries: &[E]) -> ResolvedBranch<'_, E> {
    let mut nodes: Vec<DagNode<'_, E>> = Vec::new();
    let mut by_id: HashMap<String, usize> = HashMap::new();
    let mut all_tool_result_ids = HashSet::new();

    for (line_index, entry) in entries.iter().enumerate() {
        all_tool_result_ids.extend(entry.tool_result_ids().into_iter().map(str::to_string));

        let Some(id) = entry.id() else {
            continue;
        };
        // Duplicate ids: the later line owns the slot.
        by_id.insert(id.to_string(), nodes.len());
        nodes.push(DagNode {
            id: id.to_string(),
            parent_id: entry.parent_id().map(str::to_string),
            line_index,
            entry,
        });
    }

    let parents: HashMap<String, Option<String>> = by_id
        .iter()
        .map(|(id, &idx)| (id.clone(), nodes[idx].parent_id.clone()))
        .collect();

    // Later position wins on equal line index; only the slot owner counts.
    let terminal = nodes
        .iter()
        .enumerate()
        .filter(|(idx, n)| n.entry.has_content() && by_id.get(&n.id) == Some(idx))
        .max_by_key(|(_, n)| n.line_index)
        .map(|(idx, _)| idx);

    let mut active_indices = Vec::new();
    if let Some(start) = terminal {
        let mut visited = HashSet::new();
        let mut current = Some(start);
        while let Some(idx) = current {
            if !visited.insert(idx) {
                // Cycle: treat the remainder as a root.
                break;
            }
            active_indices.push(idx);
            current = nodes[idx]
                .parent_id
                .as_ref()
                .and_then(|p| by_id.get(p))
                .copied();
        }
        active_indices.reverse();
    }

    let active: Vec<DagNode<'_, E>> = active_indices.iter().map(|&i| nodes[i].clone()).collect();
    let active_ids: HashSet<&str> = active.iter().map(|n| n.id.as_str()).collect();

    let orphaned_tool_use_ids: HashSet<String> = active
        .iter()
        .flat_map(|n| n.entry.tool_use_ids())
        .filter(|id| !all_tool_result_ids.contains(*id))
        .map(str::to_string)
        .collect();

    let active_result_ids: HashSet<&str> = active
        .iter()
        .flat_map(|n| n.entry.tool_result_ids())
        .collect();

    // Children lists in line order, dead nodes only.
    let mut dead_children: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, node) in nodes.iter().enumerate() {
        if active_ids.contains(node.id.as_str()) || by_id.get(&node.id) != Some(&idx) {
            continue;
        }
        if let Some(parent) = node.parent_id.as_deref() {
            dead_children.entry(parent).or_default().push(idx);
        }
    }

    let mut sibling_tool_results = Vec::new();
    let mut sibling_tool_branches = Vec::new();

    for branch_point in &active {
        let Some(children) = dead_children.get(branch_point.id.as_str()) else {
            continue;
        };
        for &child_idx in children {
            let child = &nodes[child_idx];
            if child.is_tool_result() {
                let duplicate = child
                    .entry
                    .tool_result_ids()
                    .iter()
                    .all(|id| active_result_ids.contains(id));
                if !duplicate {
                    sibling_tool_results.push(SiblingToolResult {
                        parent_id: branch_point.id.clone(),
                        node: child.clone(),
                    });
                }
            } else if child.is_tool_use() {
                if let Some(chain) = tool_chain(&nodes, &dead_children, child_idx) {
                    sibling_tool_branches.push(SiblingToolBranch {
                        branch_point_id: branch_point.id.clone(),
                        nodes: chain,
                    });
                }
            }
        }
    }

    ResolvedBranch {
        active,
        all_tool_result_ids,
        orphaned_tool_use_ids,
        sibling_tool_results,
        sibling_tool_branches,
        parents,
    }
}

/// Follow the first dead child from `start` while nodes are tool traffic.
/// Accept the chain only if it has ≥2 nodes and answers the first tool_use.
fn tool_chain<'a, E: DagEntry>(
    nodes: &[DagNode<'a, E>],
    dead_children: &HashMap<&str, Vec<usize>>,
    start: usize,
) -> Option<Vec<DagNode<'a, E>>> {
    let mut chain = Vec::new();
    let mut visited = HashSet::new();
    let mut current = Some(start);
    while let Some(idx) = current {
        let node = &nodes[idx];
        if !visited.insert(idx) || !(node.is_tool_use() || node.is_tool_result()) {
            break;
        }
        chain.push(node.clone());
        current = dead_children
            .get(node.id.as_str())
            .and_then(|c| c.first())
            .copied();
    }

    let opening: HashSet<&str> = nodes[start].entry.tool_use_ids().into_iter().collect();
    let answered = chain
        .iter()
        .skip(1)
        .flat_map(|n| n.entry.tool_result_ids())
        .any(|id| opening.contains(&id));

    // Drop trailing nodes past the last result so the splice ends on an answer.
    if chain.len() >= 2 && answered {
        while chain.last().is_some_and(|n| !n.is_tool_result()) {
            chain.pop();
        }
        Some(chain)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Entry {
        id: Option<&'static str>,
        parent: Option<&'static str>,
        uses: Vec<&'static str>,
        results: Vec<&'static str>,
    }

    fn msg(id: &'static str, parent: Option<&'static str>) -> Entry {
        Entry { id: Some(id), parent, uses: vec![], results: vec![] }
    }

    fn tool_use(id: &'static str, parent: Option<&'static str>, call: &'static str) -> Entry {
        Entry { id: Some(id), parent, uses: vec![call], results: vec![] }
    }

    fn tool_result(id: &'static str, parent: Option<&'static str>, call: &'static str) -> Entry {
        Entry { id: Some(id), parent, uses: vec![], results: vec![call] }
    }

    impl DagEntry for Entry {
        fn id(&self) -> Option<&str> {
            self.id
        }
        fn parent_id(&self) -> Option<&str> {
            self.parent
        }
        fn tool_use_ids(&self) -> Vec<&str> {
            self.uses.clone()
        }
        fn tool_result_ids(&self) -> Vec<&str> {
            self.results.clone()
        }
    }

    fn ids<E>(nodes: &[DagNode<'_, E>]) -> Vec<String> {
        nodes.iter().map(|n| n.id.clone()).collect()
    }

    #[test]
    fn rewound_branch_is_dead() {
        let entries = vec![
            msg("a", None),
            msg("b", Some("a")),
            msg("c", Some("b")),
            msg("d", Some("a")),
            msg("e", Some("d")),
        ];
        let resolved = resolve(&entries);
        assert_eq!(ids(&resolved.active), vec!["a", "d", "e"]);
        assert!(resolved.sibling_tool_results.is_empty());
        assert!(resolved.sibling_tool_branches.is_empty());
    }

    #[test]
    fn parallel_tool_result_is_reattached() {
        let entries = vec![
            tool_use("tool-use-1", None, "call-a"),
            tool_use("tool-use-2", Some("tool-use-1"), "call-b"),
            tool_result("result-a", Some("tool-use-1"), "call-a"),
            tool_result("result-b", Some("tool-use-2"), "call-b"),
            msg("response", Some("result-b")),
        ];
        let resolved = resolve(&entries);
        assert_eq!(
            ids(&resolved.active),
            vec!["tool-use-1", "tool-use-2", "result-b", "response"]
        );
        assert_eq!(resolved.sibling_tool_results.len(), 1);
        assert_eq!(resolved.sibling_tool_results[0].parent_id, "tool-use-1");
        assert_eq!(resolved.sibling_tool_results[0].node.id, "result-a");
        assert!(resolved.orphaned_tool_use_ids.is_empty());

        let attached = resolved.attached_to("tool-use-1");
        assert_eq!(attached.len(), 1);
        assert_eq!(attached[0].id, "result-a");
    }

    #[test]
    fn orphan_only_when_no_result_anywhere() {
        // Result for call-1 is stranded on a dead branch; call-2 has none.
        let entries = vec![
            tool_use("u1", None, "call-1"),
            msg("dead", Some("u1")),
            tool_result("r1", Some("dead"), "call-1"),
            tool_use("u2", Some("u1"), "call-2"),
        ];
        let resolved = resolve(&entries);
        assert_eq!(ids(&resolved.active), vec!["u1", "u2"]);
        let expected: HashSet<String> = ["call-2".to_string()].into_iter().collect();
        assert_eq!(resolved.orphaned_tool_use_ids, expected);
        assert!(resolved.all_tool_result_ids.contains("call-1"));
    }

    #[test]
    fn sibling_tool_branch_requires_matching_result() {
        let entries = vec![
            msg("root", None),
            tool_use("side-use", Some("root"), "call-x"),
            tool_result("side-result", Some("side-use"), "call-x"),
            tool_use("lonely-use", Some("root"), "call-y"),
            msg("answer", Some("root")),
        ];
        let resolved = resolve(&entries);
        assert_eq!(ids(&resolved.active), vec!["root", "answer"]);
        assert_eq!(resolved.sibling_tool_branches.len(), 1);
        let branch = &resolved.sibling_tool_branches[0];
        assert_eq!(branch.branch_point_id, "root");
        assert_eq!(ids(&branch.nodes), vec!["side-use", "side-result"]);
    }

    #[test]
    fn missing_parent_is_a_root_and_empty_input_is_empty() {
        let entries = vec![msg("x", Some("never-seen")), msg("y", Some("x"))];
        let resolved = resolve(&entries);
        assert_eq!(ids(&resolved.active), vec!["x", "y"]);

        let empty: Vec<Entry> = Vec::new();
        let resolved = resolve(&empty);
        assert!(resolved.active.is_empty());
        assert!(resolved.orphaned_tool_use_ids.is_empty());
    }

    #[test]
    fn cycle_does_not_loop() {
        let entries = vec![msg("a", Some("c")), msg("b", Some("a")), msg("c", Some("b"))];
        let resolved = resolve(&entries);
        assert_eq!(ids(&resolved.active), vec!["a", "b", "c"]);
    }

    #[test]
    fn duplicate_id_later_line_wins() {
        let entries = vec![msg("a", None), msg("b", Some("a")), msg("a", None)];
        let resolved = resolve(&entries);
        // The later "a" is terminal and a root.
        assert_eq!(ids(&resolved.active), vec!["a"]);
        assert_eq!(resolved.active[0].line_index, 2);
    }

    #[test]
    fn entries_without_id_are_skipped_for_terminal() {
        let entries = vec![
            msg("a", None),
            msg("b", Some("a")),
            Entry { id: None, parent: None, uses: vec![], results: vec!["call-z"] },
        ];
        let resolved = resolve(&entries);
        assert_eq!(ids(&resolved.active), vec!["a", "b"]);
        assert!(resolved.all_tool_result_ids.contains("call-z"));
    }

    #[test]
    fn nearest_ancestor_skips_unemitted_nodes() {
        let entries = vec![msg("a", None), msg("hidden", Some("a")), msg("c", Some("hidden"))];
        let resolved = resolve(&entries);
        let parent = resolved.nearest_ancestor("c", |id| id != "hidden");
        assert_eq!(parent.as_deref(), Some("a"));
        assert_eq!(resolved.nearest_ancestor("a", |_| true), None);
    }
}
