use std::iter::zip;

use super::{RuleRecord, RuleTable, SuffixKind, SuffixNode};
use crate::grammar::{Symbol, SymbolString, BRANCH_CLOSE, BRANCH_OPEN};

const UNMATCHED: u32 = u32::MAX;

/// Partner index of every bracket in a string, built once per step so
/// context matching can hop over whole branches.
#[derive(Debug, Clone, Default)]
pub struct BranchCache {
    matching: Vec<u32>,
}

impl BranchCache {
    pub fn new(symbols: &[Symbol]) -> Self {
        let mut matching = vec![UNMATCHED; symbols.len()];
        let mut open = Vec::new();
        for (index, &symbol) in symbols.iter().enumerate() {
            if symbol == BRANCH_OPEN {
                open.push(index);
            } else if symbol == BRANCH_CLOSE {
                if let Some(start) = open.pop() {
                    matching[start] = index as u32;
                    matching[index] = start as u32;
                }
            }
        }
        BranchCache { matching }
    }

    pub fn partner(&self, index: usize) -> Option<usize> {
        match self.matching.get(index) {
            Some(&UNMATCHED) | None => None,
            Some(&partner) => Some(partner as usize),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ForwardFrame {
    // String position matched to the node at this depth
    position: u32,
    // Opening bracket of the branch taken by a branch node
    open: u32,
    // Where the next alternative for this node starts
    cursor: u32,
}

/// Reusable per-worker memory for forward matching.
#[derive(Debug, Clone, Default)]
pub struct MatchScratch {
    stack: Vec<ForwardFrame>,
}

impl MatchScratch {
    pub fn new() -> Self {
        Self::default()
    }
}

struct View<'a> {
    table: &'a RuleTable,
    string: &'a SymbolString,
    branches: &'a BranchCache,
    file: u16,
}

impl<'a> View<'a> {
    fn is_contextual(&self, symbol: Symbol) -> bool {
        self.table.is_contextual(self.file, symbol)
    }

    // Next visible symbol on the same branch starting at `position`, hopping
    // over any branches on the way
    fn continuation_from(&self, mut position: usize) -> Option<usize> {
        while position < self.string.len() {
            let symbol = self.string.symbol(position);
            if symbol == BRANCH_OPEN {
                position = self.branches.partner(position)? + 1;
            } else if symbol == BRANCH_CLOSE {
                return None;
            } else if self.is_contextual(symbol) {
                return Some(position);
            } else {
                position += 1;
            }
        }
        None
    }

    // Opening bracket of the next branch hanging off the symbol before
    // `position`. Stops at the continuation or the end of the parent branch
    fn branch_from(&self, mut position: usize) -> Option<usize> {
        while position < self.string.len() {
            let symbol = self.string.symbol(position);
            if symbol == BRANCH_OPEN {
                return Some(position);
            }
            if symbol == BRANCH_CLOSE || self.is_contextual(symbol) {
                return None;
            }
            position += 1;
        }
        None
    }

    fn matches(&self, node: &SuffixNode, position: usize) -> bool {
        self.string.symbol(position) == node.symbol && self.string.parameter_count(position) == node.parameter_count as usize
    }

    fn capture(&self, node: &SuffixNode, position: usize, captured: &mut [f32]) {
        let start = node.parameter_offset as usize;
        captured[start..start + node.parameter_count as usize].copy_from_slice(self.string.parameters(position));
    }

    fn continuation_candidate(&self, node: &SuffixNode, cursor: u32) -> Option<ForwardFrame> {
        if cursor == UNMATCHED {
            return None;
        }
        self.continuation_from(cursor as usize)
            .filter(|&position| self.matches(node, position))
            .map(|position| ForwardFrame {
                position: position as u32,
                open: UNMATCHED,
                cursor: UNMATCHED,
            })
    }

    // First branch from `cursor` on whose first symbol `node` matches,
    // skipping branches already taken by a sibling
    fn branch_candidate(&self, node: &SuffixNode, cursor: u32, taken: impl Fn(usize) -> bool) -> Option<ForwardFrame> {
        let mut cursor = cursor as usize;
        while let Some(open) = self.branch_from(cursor) {
            let close = self.branches.partner(open)?;
            cursor = close + 1;
            if taken(open) {
                continue;
            }
            if let Some(first) = self.continuation_from(open + 1).filter(|&first| self.matches(node, first)) {
                return Some(ForwardFrame {
                    position: first as u32,
                    open: open as u32,
                    cursor: cursor as u32,
                });
            }
        }
        None
    }
}

impl RuleTable {
    /// Matches the backward context of `rule` ending just before `index`.
    ///
    /// The walk follows the ancestor path only: closed sibling branches are
    /// skipped whole and opening brackets are stepped out of. Matched
    /// parameters land in `captured` at their pattern offsets.
    pub fn match_backward(&self, rule: &RuleRecord, string: &SymbolString, branches: &BranchCache, index: usize, captured: &mut [f32]) -> bool {
        let prefix = &self.prefix_nodes[rule.prefix.range()];
        let mut position = index;

        for node in prefix.iter().rev() {
            loop {
                if position == 0 {
                    return false;
                }
                position -= 1;
                let symbol = string.symbol(position);
                if symbol == BRANCH_CLOSE {
                    match branches.partner(position) {
                        Some(open) => position = open,
                        None => return false,
                    }
                } else if symbol != BRANCH_OPEN && self.is_contextual(rule.file, symbol) {
                    break;
                }
            }

            if string.symbol(position) != node.symbol || string.parameter_count(position) != node.parameter_count as usize {
                return false;
            }
            let start = node.parameter_offset as usize;
            captured[start..start + node.parameter_count as usize].copy_from_slice(string.parameters(position));
        }
        true
    }

    /// Matches the forward context tree of `rule` starting after `index`.
    ///
    /// Continuation nodes must match the next symbol on the same branch.
    /// Branch nodes match the first symbol of a branch hanging off their
    /// parent. Sibling branch nodes take distinct branches in any order, so
    /// the search backtracks over every assignment before giving up. Nodes
    /// are assigned in preorder on an explicit stack held in `scratch`.
    pub fn match_forward(&self, rule: &RuleRecord, string: &SymbolString, branches: &BranchCache, index: usize, captured: &mut [f32], scratch: &mut MatchScratch) -> bool {
        if !rule.has_forward_context() {
            return true;
        }
        let view = View {
            table: self,
            string,
            branches,
            file: rule.file,
        };

        let root = rule.suffix.index;
        let nodes = &self.suffix_nodes[rule.suffix.range()][1..];
        let stack = &mut scratch.stack;
        stack.clear();
        // Cursor of the frame popped last, tried again from there
        let mut retry: Option<u32> = None;

        while stack.len() < nodes.len() {
            let node = &nodes[stack.len()];
            let parent_position = if node.parent == root {
                index as u32
            } else {
                stack[(node.parent - root - 1) as usize].position
            };
            let cursor = retry.take().unwrap_or(parent_position + 1);

            let found = match node.kind {
                SuffixKind::Continuation => view.continuation_candidate(node, cursor),
                SuffixKind::Branch => {
                    let assigned = &*stack;
                    view.branch_candidate(node, cursor, |open| {
                        zip(nodes, assigned).any(|(sibling, frame)| sibling.parent == node.parent && frame.open == open as u32)
                    })
                }
            };

            match found {
                Some(frame) => stack.push(frame),
                None => match stack.pop() {
                    Some(frame) => retry = Some(frame.cursor),
                    None => return false,
                },
            }
        }

        for (node, frame) in zip(nodes, stack.iter()) {
            view.capture(node, frame.position as usize, captured);
        }
        true
    }
}
