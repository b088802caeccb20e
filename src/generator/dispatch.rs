use rand::prelude::*;

use crate::expression::evaluate;
use crate::grammar::SymbolString;
use crate::rules::{BranchCache, MatchScratch, RuleRecord, RuleTable};

// Spreads neighbouring positions across the seed space
const POSITION_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// Everything a worker needs to pick rules for its positions.
pub struct Dispatch<'a> {
    pub table: &'a RuleTable,
    pub string: &'a SymbolString,
    pub branches: &'a BranchCache,
    pub globals: &'a [f32],
    pub seed: u64,
}

impl<'a> Dispatch<'a> {
    /// Finds the first candidate of the symbol at `index` whose contexts,
    /// parameter count and conditional all hold, and picks its outcome.
    ///
    /// `captured` must be at least as long as the largest capture of any
    /// candidate. It holds the winner's parameters afterwards.
    pub fn select(&self, index: usize, captured: &mut [f32], scratch: &mut MatchScratch) -> Option<(u32, u16)> {
        let rules = self.table.rules_for(self.string.symbol(index))?;
        let parameters = self.string.parameters(index);

        for &candidate in &self.table.candidates[rules.candidates.range()] {
            let rule = &self.table.rules[candidate as usize];
            if !self.table.match_backward(rule, self.string, self.branches, index, captured) {
                continue;
            }
            if parameters.len() != rule.target_parameters as usize {
                continue;
            }
            let target = rule.target_offset as usize;
            captured[target..target + parameters.len()].copy_from_slice(parameters);
            if !self.table.match_forward(rule, self.string, self.branches, index, captured, scratch) {
                continue;
            }
            if let Some(conditional) = rule.conditional {
                let locals = &captured[..rule.captured as usize];
                if evaluate(self.table.ops(conditional), self.globals, locals) == 0.0 {
                    continue;
                }
            }
            return Some((candidate, self.choose_outcome(rule, index)));
        }
        None
    }

    // Depends only on the step seed and the position, so batching and
    // thread count never change the result
    fn choose_outcome(&self, rule: &RuleRecord, index: usize) -> u16 {
        if !rule.is_stochastic() {
            return 0;
        }
        let position_seed = self.seed.wrapping_add((index as u64 + 1).wrapping_mul(POSITION_MIX));
        let sample: f64 = StdRng::seed_from_u64(position_seed).gen();

        let outcomes = &self.table.outcomes[rule.outcomes.range()];
        let mut cumulative = 0.0;
        for (outcome, record) in outcomes.iter().enumerate() {
            cumulative += f64::from(record.probability);
            if sample < cumulative {
                return outcome as u16;
            }
        }
        // Rounding can leave the weights a hair under 1
        (outcomes.len() - 1) as u16
    }
}
