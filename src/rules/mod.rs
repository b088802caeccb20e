/*
    This module freezes parsed rules into flat tables indexed by target
    symbol, and matches their contexts against symbol strings
*/

mod matcher;

use std::collections::HashMap;
use std::mem::Discriminant;

use itertools::Itertools;
use tracing::debug;

use crate::error_handling::Location;
use crate::expression::{Expression, Op};
use crate::grammar::{JaggedIndex, Symbol};
use crate::parser::{ForwardToken, ParsedRule, SymbolMatcher};

pub use matcher::{BranchCache, MatchScratch};

// Stochastic weights may drift this far from 1 before a group is rejected
pub const PROBABILITY_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InvariantViolation {
    #[error("Probabilities of the stochastic rules for `{pattern}` add up to {sum}, not 1")]
    ProbabilitySum { pattern: String, sum: f64 },
    #[error("Rules at {first} and {second} both match `{pattern}` without probabilities")]
    ConflictingRules {
        pattern: String,
        first: Location,
        second: Location,
    },
    #[error("Rule at {location} mixes stochastic and deterministic rules for `{pattern}`")]
    MixedStochasticGroup { pattern: String, location: Location },
    #[error("Symbol `{symbol}` at index {index} was matched to a rule but has no rules")]
    TrivialSymbolNotIndicated { symbol: Symbol, index: usize },
    #[error("Expected {expected} global parameter values, got {actual}")]
    GlobalParameterCount { expected: usize, actual: usize },
    #[error("`{pattern}` needs {count} table entries, more than the {limit} a rule table row holds")]
    TableOverflow { pattern: String, count: usize, limit: usize },
}

fn overflow(pattern: impl ToString, count: usize) -> InvariantViolation {
    InvariantViolation::TableOverflow {
        pattern: pattern.to_string(),
        count,
        limit: JaggedIndex::MAX_LENGTH,
    }
}

fn narrow(count: usize, rule: &ParsedRule) -> Result<u16, InvariantViolation> {
    u16::try_from(count).map_err(|_| overflow(rule, count))
}

fn row(index: usize, length: usize, rule: &ParsedRule) -> Result<JaggedIndex, InvariantViolation> {
    JaggedIndex::try_new(index, length).ok_or_else(|| overflow(rule, length))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuffixKind {
    // First symbol inside a bracketed branch
    Branch,
    // Next symbol along the same branch
    Continuation,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrefixNode {
    pub symbol: Symbol,
    pub parameter_count: u16,
    pub parameter_offset: u16,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuffixNode {
    pub symbol: Symbol,
    pub parameter_count: u16,
    pub parameter_offset: u16,
    pub kind: SuffixKind,
    // Absolute index of the parent node; the root points at itself
    pub parent: u32,
    pub children: JaggedIndex,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OutcomeRecord {
    pub probability: f32,
    pub replacements: JaggedIndex,
    pub parameter_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReplacementRecord {
    pub symbol: Symbol,
    // Range of `RuleTable::expressions`
    pub parameters: JaggedIndex,
}

/// A rule group frozen into offsets. Every rule sharing one pattern becomes
/// a single record with one outcome per rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleRecord {
    pub target: Symbol,
    pub target_parameters: u16,
    pub target_offset: u16,
    pub prefix: JaggedIndex,
    // Suffix tree nodes in preorder, root first
    pub suffix: JaggedIndex,
    // Parameters captured by the whole pattern
    pub captured: u16,
    pub conditional: Option<JaggedIndex>,
    pub outcomes: JaggedIndex,
    pub file: u16,
    pub specificity: u16,
}

impl RuleRecord {
    pub fn is_stochastic(&self) -> bool {
        self.outcomes.len() > 1
    }

    pub fn has_forward_context(&self) -> bool {
        self.suffix.len() > 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SymbolRules {
    // Range of `RuleTable::candidates`, most specific first
    pub candidates: JaggedIndex,
    // Largest capture of any candidate
    pub capture_capacity: u16,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct RuleTable {
    pub rules: Vec<RuleRecord>,
    pub candidates: Vec<u32>,
    pub prefix_nodes: Vec<PrefixNode>,
    pub suffix_nodes: Vec<SuffixNode>,
    pub suffix_children: Vec<u32>,
    pub outcomes: Vec<OutcomeRecord>,
    pub replacements: Vec<ReplacementRecord>,
    pub expressions: Vec<JaggedIndex>,
    pub ops: Vec<Op>,
    // Sorted symbols visible to context matching, one list per file
    pub contextual: Vec<Vec<Symbol>>,
    by_symbol: HashMap<Symbol, SymbolRules>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum ForwardKey {
    Symbol(Symbol, usize),
    Open,
    Close,
}

// Rules with equal keys compete for the same matches
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PatternKey {
    backward: Vec<(Symbol, usize)>,
    target: (Symbol, usize),
    forward: Vec<ForwardKey>,
    // Compiled conditional with locals resolved to slots, so renamed
    // parameters still share a key
    conditional: Option<Vec<(Discriminant<Op>, u32)>>,
}

fn matcher_key(matcher: &SymbolMatcher) -> (Symbol, usize) {
    (matcher.symbol, matcher.parameter_count())
}

fn op_key(op: &Op) -> (Discriminant<Op>, u32) {
    let operand = match *op {
        Op::Constant(value) => value.to_bits(),
        Op::Global(slot) | Op::Local(slot) => u32::from(slot),
        _ => 0,
    };
    (std::mem::discriminant(op), operand)
}

impl PatternKey {
    fn of(rule: &ParsedRule) -> Self {
        PatternKey {
            backward: rule.backward.iter().map(matcher_key).collect(),
            target: matcher_key(&rule.target),
            forward: rule
                .forward
                .iter()
                .map(|token| match token {
                    ForwardToken::Symbol(matcher) => {
                        let (symbol, count) = matcher_key(matcher);
                        ForwardKey::Symbol(symbol, count)
                    }
                    ForwardToken::BranchOpen => ForwardKey::Open,
                    ForwardToken::BranchClose => ForwardKey::Close,
                })
                .collect(),
            conditional: rule
                .conditional
                .as_ref()
                .map(|expression| expression.ops().iter().map(op_key).collect()),
        }
    }
}

fn check_group(group: &[ParsedRule]) -> Result<(), InvariantViolation> {
    let first = &group[0];
    let pattern = first.to_string();

    if let Some(mixed) = group
        .iter()
        .find(|rule| rule.probability.is_some() != first.probability.is_some())
    {
        return Err(InvariantViolation::MixedStochasticGroup {
            pattern,
            location: mixed.location.clone(),
        });
    }

    if first.probability.is_none() {
        if let Some(second) = group.get(1) {
            return Err(InvariantViolation::ConflictingRules {
                pattern,
                first: first.location.clone(),
                second: second.location.clone(),
            });
        }
        return Ok(());
    }

    let sum: f64 = group.iter().filter_map(|rule| rule.probability).map(f64::from).sum();
    if (sum - 1.0).abs() > PROBABILITY_TOLERANCE {
        return Err(InvariantViolation::ProbabilitySum { pattern, sum });
    }
    Ok(())
}

impl RuleTable {
    /// Groups, checks and flattens parsed rules.
    ///
    /// `contextual` holds the symbols each file's rules may see in their
    /// contexts, indexed by `ParsedRule::file`.
    pub fn build(rules: Vec<ParsedRule>, contextual: Vec<Vec<Symbol>>) -> Result<RuleTable, InvariantViolation> {
        let mut group_index: HashMap<PatternKey, usize> = HashMap::new();
        let mut groups: Vec<Vec<ParsedRule>> = Vec::new();
        for rule in rules {
            let key = PatternKey::of(&rule);
            let index = *group_index.entry(key).or_insert_with(|| {
                groups.push(Vec::new());
                groups.len() - 1
            });
            groups[index].push(rule);
        }

        let mut table = RuleTable {
            contextual: contextual
                .into_iter()
                .map(|symbols| symbols.into_iter().sorted().dedup().collect())
                .collect(),
            ..RuleTable::default()
        };
        for group in &groups {
            check_group(group)?;
            table.push_group(group)?;
        }
        table.index_candidates()?;

        debug!(
            "built rule table with {} rules for {} symbols from {} patterns",
            table.outcomes.len(),
            table.by_symbol.len(),
            table.rules.len()
        );
        Ok(table)
    }

    fn push_expression(&mut self, rule: &ParsedRule, expression: &Expression) -> Result<JaggedIndex, InvariantViolation> {
        let index = row(self.ops.len(), expression.ops().len(), rule)?;
        self.ops.extend_from_slice(expression.ops());
        Ok(index)
    }

    fn push_suffix_tree(&mut self, rule: &ParsedRule, first_offset: usize) -> Result<JaggedIndex, InvariantViolation> {
        // Children are collected per node then laid out contiguously
        let root = self.suffix_nodes.len();
        let mut children: Vec<Vec<u32>> = vec![Vec::new()];
        let mut nodes = vec![SuffixNode {
            symbol: rule.target.symbol,
            parameter_count: narrow(rule.target.parameter_count(), rule)?,
            parameter_offset: 0,
            kind: SuffixKind::Continuation,
            parent: root as u32,
            children: JaggedIndex::default(),
        }];

        let mut current = 0usize;
        let mut open: Vec<usize> = Vec::new();
        let mut pending_branch = false;
        let mut offset = first_offset;
        for token in &rule.forward {
            match token {
                ForwardToken::BranchOpen => {
                    open.push(current);
                    pending_branch = true;
                }
                ForwardToken::BranchClose => {
                    current = open.pop().unwrap_or(0);
                    pending_branch = false;
                }
                ForwardToken::Symbol(matcher) => {
                    let node = nodes.len();
                    nodes.push(SuffixNode {
                        symbol: matcher.symbol,
                        parameter_count: narrow(matcher.parameter_count(), rule)?,
                        parameter_offset: narrow(offset, rule)?,
                        kind: if pending_branch { SuffixKind::Branch } else { SuffixKind::Continuation },
                        parent: (root + current) as u32,
                        children: JaggedIndex::default(),
                    });
                    children.push(Vec::new());
                    children[current].push((root + node) as u32);
                    offset += matcher.parameter_count();
                    current = node;
                    pending_branch = false;
                }
            }
        }

        for (node, node_children) in nodes.iter_mut().zip(children) {
            node.children = row(self.suffix_children.len(), node_children.len(), rule)?;
            self.suffix_children.extend(node_children);
        }
        let suffix = row(root, nodes.len(), rule)?;
        self.suffix_nodes.extend(nodes);
        Ok(suffix)
    }

    fn push_outcome(&mut self, rule: &ParsedRule) -> Result<OutcomeRecord, InvariantViolation> {
        let first = self.replacements.len();
        let mut parameter_count = 0;
        for replacement in &rule.replacement {
            let parameters = row(self.expressions.len(), replacement.parameters.len(), rule)?;
            for expression in &replacement.parameters {
                let ops = self.push_expression(rule, expression)?;
                self.expressions.push(ops);
            }
            parameter_count += replacement.parameters.len() as u32;
            self.replacements.push(ReplacementRecord {
                symbol: replacement.symbol,
                parameters,
            });
        }
        Ok(OutcomeRecord {
            probability: rule.probability.unwrap_or(1.0),
            replacements: row(first, rule.replacement.len(), rule)?,
            parameter_count,
        })
    }

    fn push_group(&mut self, group: &[ParsedRule]) -> Result<(), InvariantViolation> {
        let rule = &group[0];

        let prefix_start = self.prefix_nodes.len();
        let mut offset = 0usize;
        for matcher in &rule.backward {
            self.prefix_nodes.push(PrefixNode {
                symbol: matcher.symbol,
                parameter_count: narrow(matcher.parameter_count(), rule)?,
                parameter_offset: narrow(offset, rule)?,
            });
            offset += matcher.parameter_count();
        }
        let target_offset = offset;
        offset += rule.target.parameter_count();

        let suffix = self.push_suffix_tree(rule, offset)?;
        let conditional = match &rule.conditional {
            Some(expression) => Some(self.push_expression(rule, expression)?),
            None => None,
        };

        let outcomes = group.iter().map(|rule| self.push_outcome(rule)).collect::<Result<Vec<_>, _>>()?;
        let outcome_index = row(self.outcomes.len(), outcomes.len(), rule)?;
        self.outcomes.extend(outcomes);

        self.rules.push(RuleRecord {
            target: rule.target.symbol,
            target_parameters: narrow(rule.target.parameter_count(), rule)?,
            target_offset: narrow(target_offset, rule)?,
            prefix: row(prefix_start, rule.backward.len(), rule)?,
            suffix,
            captured: narrow(rule.local_parameter_names().len(), rule)?,
            conditional,
            outcomes: outcome_index,
            file: narrow(rule.file, rule)?,
            specificity: narrow(rule.context_size(), rule)?,
        });
        Ok(())
    }

    // Lays out candidate lists: most specific first, ties in declaration order
    fn index_candidates(&mut self) -> Result<(), InvariantViolation> {
        let by_target = (0..self.rules.len() as u32)
            .sorted_by_key(|&rule| self.rules[rule as usize].target)
            .chunk_by(|&rule| self.rules[rule as usize].target);

        let mut by_symbol = HashMap::new();
        for (target, rules) in &by_target {
            let ordered: Vec<u32> = rules
                .sorted_by_key(|&rule| (std::cmp::Reverse(self.rules[rule as usize].specificity), rule))
                .collect();
            let capture_capacity = ordered
                .iter()
                .map(|&rule| self.rules[rule as usize].captured)
                .max()
                .unwrap_or(0);
            by_symbol.insert(
                target,
                SymbolRules {
                    candidates: JaggedIndex::try_new(self.candidates.len(), ordered.len())
                        .ok_or_else(|| overflow(target, ordered.len()))?,
                    capture_capacity,
                },
            );
            self.candidates.extend(ordered);
        }
        self.by_symbol = by_symbol;
        Ok(())
    }

    pub fn rules_for(&self, symbol: Symbol) -> Option<SymbolRules> {
        self.by_symbol.get(&symbol).copied()
    }

    pub fn candidates(&self, rules: SymbolRules) -> impl Iterator<Item = &RuleRecord> + '_ {
        self.candidates[rules.candidates.range()]
            .iter()
            .map(|&rule| &self.rules[rule as usize])
    }

    pub fn outcome(&self, rule: &RuleRecord, index: usize) -> &OutcomeRecord {
        &self.outcomes[rule.outcomes.range()][index]
    }

    pub fn ops(&self, expression: JaggedIndex) -> &[Op] {
        &self.ops[expression.range()]
    }

    pub fn is_contextual(&self, file: u16, symbol: Symbol) -> bool {
        self.contextual
            .get(file as usize)
            .is_some_and(|symbols| symbols.binary_search(&symbol).is_ok())
    }

    pub fn symbol_count(&self) -> usize {
        self.by_symbol.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse_rule;

    fn s(c: char) -> Symbol {
        Symbol::from_char(c)
    }

    fn parse_all(lines: &[&str]) -> Vec<ParsedRule> {
        lines
            .iter()
            .enumerate()
            .map(|(line, text)| {
                let mut rule = parse_rule(text, &|c| Some(Symbol::from_char(c)), &[]).unwrap();
                rule.location = Location::line("rules", line + 1);
                rule
            })
            .collect()
    }

    fn build(lines: &[&str]) -> Result<RuleTable, InvariantViolation> {
        let contextual = vec!["ABCDEF[]".chars().map(Symbol::from_char).collect()];
        RuleTable::build(parse_all(lines), contextual)
    }

    fn candidate_targets(table: &RuleTable, symbol: char) -> Vec<u16> {
        let rules = table.rules_for(s(symbol)).unwrap();
        table.candidates(rules).map(|rule| rule.specificity).collect()
    }

    #[test]
    fn orders_candidates_by_specificity() {
        let table = build(&["A -> B", "A > A -> C", "A > ABCD -> F", "A > ABC -> E", "A > AB -> D", "B -> A"]).unwrap();

        assert_eq!(candidate_targets(&table, 'A'), vec![4, 3, 2, 1, 0]);
        assert_eq!(candidate_targets(&table, 'B'), vec![0]);
        assert!(table.rules_for(s('C')).is_none());

        // The first candidate replaces with F
        let rules = table.rules_for(s('A')).unwrap();
        let best = table.candidates(rules).next().unwrap();
        let outcome = table.outcome(best, 0);
        assert_eq!(table.replacements[outcome.replacements.range()][0].symbol, s('F'));
    }

    #[test]
    fn equal_specificity_keeps_declaration_order() {
        let table = build(&["A > A -> B", "A < A -> C"]).unwrap();
        let rules = table.rules_for(s('A')).unwrap();
        let prefixes: Vec<usize> = table.candidates(rules).map(|rule| rule.prefix.len()).collect();
        assert_eq!(prefixes, vec![0, 1]);
    }

    #[test]
    fn stochastic_rules_share_one_record() {
        let table = build(&["P(0.5) | A > A ->", "P(0.5) | A > A -> A", "A < A -> B"]).unwrap();
        assert_eq!(table.rules.len(), 2);
        assert!(table.rules[0].is_stochastic());
        assert_eq!(table.outcome(&table.rules[0], 0).replacements.len(), 0);
        assert_eq!(table.outcome(&table.rules[0], 1).replacements.len(), 1);
    }

    #[test]
    fn captures_are_laid_out_in_pattern_order() {
        let table = build(&["A(a) < B(x, y) > C(c)[D(d)]E(e) -> B"]).unwrap();
        let rule = table.rules[0];
        assert_eq!(rule.captured, 6);
        assert_eq!(rule.target_offset, 1);
        assert_eq!(table.prefix_nodes[rule.prefix.range()][0].parameter_offset, 0);

        let root = table.suffix_nodes[rule.suffix.index as usize];
        let c = table.suffix_nodes[table.suffix_children[root.children.range()][0] as usize];
        assert_eq!((c.symbol, c.kind, c.parameter_offset), (s('C'), SuffixKind::Continuation, 3));

        let grandchildren: Vec<_> = table.suffix_children[c.children.range()]
            .iter()
            .map(|&node| {
                let node = table.suffix_nodes[node as usize];
                (node.symbol, node.kind, node.parameter_offset)
            })
            .collect();
        assert_eq!(
            grandchildren,
            vec![(s('D'), SuffixKind::Branch, 4), (s('E'), SuffixKind::Continuation, 5)]
        );
    }

    #[test]
    fn rejects_invalid_groups() {
        assert_eq!(
            build(&["A -> AB", "A -> CA"]).unwrap_err(),
            InvariantViolation::ConflictingRules {
                pattern: "A".to_string(),
                first: Location::line("rules", 1),
                second: Location::line("rules", 2),
            }
        );
        assert!(matches!(
            build(&["P(0.5) | A -> B", "P(0.6) | A -> C"]).unwrap_err(),
            InvariantViolation::ProbabilitySum { .. }
        ));
        assert!(matches!(
            build(&["P(0.5) | A > B -> AB", "P(0.5) | A > BC -> CA"]).unwrap_err(),
            InvariantViolation::ProbabilitySum { .. }
        ));
        assert!(matches!(
            build(&["C < A > B[C][D] -> AB", "C < A > B[C][D] -> CA"]).unwrap_err(),
            InvariantViolation::ConflictingRules { .. }
        ));
        assert!(matches!(
            build(&["P(0.5) | A -> B", "A -> C"]).unwrap_err(),
            InvariantViolation::MixedStochasticGroup { .. }
        ));
    }

    #[test]
    fn conditionals_split_groups() {
        let table = build(&["A(x) : x < 1 -> A(x + 1)", "A(x) : x >= 1 -> A(x - 1)"]).unwrap();
        assert_eq!(table.rules.len(), 2);
        assert!(table.rules.iter().all(|rule| rule.conditional.is_some()));
    }

    #[test]
    fn renamed_parameters_share_a_conditional_group() {
        let table = build(&["P(0.5) | A(x) : x < 2 -> B", "P(0.5) | A(y) : y < 2 -> A"]).unwrap();
        assert_eq!(table.rules.len(), 1);
        assert_eq!(table.rules[0].outcomes.len(), 2);

        let table = build(&["A(x, y) : x < 2 -> B", "A(x, y) : y < 2 -> A"]).unwrap();
        assert_eq!(table.rules.len(), 2);
    }

    #[test]
    fn rejects_rows_too_long_for_the_table() {
        let longest = format!("A -> {}", "B".repeat(JaggedIndex::MAX_LENGTH));
        assert!(build(&[&longest]).is_ok());

        let line = format!("A -> {}", "B".repeat(JaggedIndex::MAX_LENGTH + 1));
        assert_eq!(
            build(&[&line]).unwrap_err(),
            InvariantViolation::TableOverflow {
                pattern: "A".to_string(),
                count: JaggedIndex::MAX_LENGTH + 1,
                limit: JaggedIndex::MAX_LENGTH,
            }
        );
    }

    #[test]
    fn suffix_nodes_point_at_their_parents() {
        let table = build(&["A > [B[C]][D]E -> A"]).unwrap();
        let rule = table.rules[0];
        let root = rule.suffix.index;
        let parents: Vec<(Symbol, u32)> = table.suffix_nodes[rule.suffix.range()]
            .iter()
            .map(|node| (node.symbol, node.parent - root))
            .collect();
        assert_eq!(parents, vec![(s('A'), 0), (s('B'), 0), (s('C'), 1), (s('D'), 0), (s('E'), 0)]);
        assert!(rule.has_forward_context());
    }
}
