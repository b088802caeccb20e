/*
    This module steps compiled grammars from one generation to the next
*/

mod batch;
mod dispatch;
mod policy;
mod step;

use std::collections::HashMap;

use rand::prelude::*;
use tracing::debug;

use crate::error_handling::LSystemError;
use crate::grammar::{Symbol, SymbolString};
use crate::linker::{CustomRuleSymbols, LinkedFileSet};
use crate::rules::{InvariantViolation, RuleTable};
use step::{evaluate_step, StepInput};

pub use batch::run_batches;
pub use policy::{DiffusionPassthrough, KeepAllParameters, ParameterPassthrough};

/// A `#runtime` parameter, readable by every rule expression.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalParameter {
    pub name: String,
    pub default: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepOptions {
    // Positions handed to a worker at once
    pub batch_size: usize,
    pub parallel: bool,
}

impl Default for StepOptions {
    fn default() -> Self {
        StepOptions {
            batch_size: 128,
            parallel: true,
        }
    }
}

/// One generation plus the random state that produces the next.
///
/// Cloning a state and stepping the clone gives the same generations as
/// stepping the original.
#[derive(Debug, Clone)]
pub struct LSystemState {
    pub symbols: SymbolString,
    pub random: StdRng,
    pub has_immature_symbols: bool,
    pub generation: u32,
}

impl LSystemState {
    pub fn new(symbols: SymbolString, seed: u64) -> Self {
        LSystemState {
            symbols,
            random: StdRng::seed_from_u64(seed),
            has_immature_symbols: false,
            generation: 0,
        }
    }

    pub fn has_immature_symbols(&self) -> bool {
        self.has_immature_symbols
    }
}

/// A linked, validated grammar ready to step.
#[derive(Debug)]
pub struct CompiledGrammar {
    table: RuleTable,
    axiom: SymbolString,
    iterations: u32,
    globals: Vec<GlobalParameter>,
    // Sorted
    immature: Vec<Symbol>,
    custom: CustomRuleSymbols,
    passthrough: Box<dyn ParameterPassthrough>,
    names: HashMap<Symbol, char>,
    file_symbols: HashMap<String, HashMap<char, Symbol>>,
    options: StepOptions,
}

impl CompiledGrammar {
    pub fn new(table: RuleTable, axiom: SymbolString, linked: LinkedFileSet, custom: CustomRuleSymbols, options: StepOptions) -> Self {
        let iterations = linked.origin().parsed.iterations.unwrap_or(0);
        let file_symbols = linked
            .files
            .iter()
            .map(|file| (file.parsed.identifier.clone(), file.symbols.clone()))
            .collect();
        CompiledGrammar {
            table,
            axiom,
            iterations,
            globals: linked.runtime,
            immature: linked.immature,
            passthrough: Box::new(DiffusionPassthrough::new(&custom)),
            custom,
            names: linked.names,
            file_symbols,
            options,
        }
    }

    /// Replaces how unmatched symbols carry their parameters forward.
    pub fn with_passthrough(mut self, passthrough: Box<dyn ParameterPassthrough>) -> Self {
        self.passthrough = passthrough;
        self
    }

    pub fn set_step_options(&mut self, options: StepOptions) {
        self.options = options;
    }

    pub fn axiom(&self) -> SymbolString {
        self.axiom.clone()
    }

    pub fn iterations(&self) -> u32 {
        self.iterations
    }

    pub fn global_parameters(&self) -> &[GlobalParameter] {
        &self.globals
    }

    pub fn default_globals(&self) -> Vec<f32> {
        self.globals.iter().map(|global| global.default).collect()
    }

    pub fn custom_symbols(&self) -> &CustomRuleSymbols {
        &self.custom
    }

    pub fn rule_table(&self) -> &RuleTable {
        &self.table
    }

    /// The symbol `c` stands for inside the file `identifier`.
    pub fn symbol_for(&self, identifier: &str, c: char) -> Option<Symbol> {
        self.file_symbols.get(identifier)?.get(&c).copied()
    }

    pub fn character_for(&self, symbol: Symbol) -> Option<char> {
        self.names.get(&symbol).copied()
    }

    pub fn render(&self, symbols: &SymbolString) -> String {
        symbols.render(|symbol| self.character_for(symbol).or(symbol.as_char()).unwrap_or('?'))
    }

    fn contains_immature(&self, symbols: &SymbolString) -> bool {
        !self.immature.is_empty()
            && symbols
                .symbols()
                .iter()
                .any(|symbol| self.immature.binary_search(symbol).is_ok())
    }

    pub fn initial_state(&self, seed: u64) -> LSystemState {
        let mut state = LSystemState::new(self.axiom.clone(), seed);
        state.has_immature_symbols = self.contains_immature(&state.symbols);
        state
    }

    /// Rewrites every symbol of `state` once.
    ///
    /// `globals` holds one value per runtime parameter, in declaration order.
    /// With `advance_random` unset the returned state keeps the input's
    /// random state, so stepping it again draws the same numbers.
    pub fn step(&self, state: &LSystemState, globals: &[f32], advance_random: bool) -> Result<LSystemState, LSystemError> {
        if globals.len() != self.globals.len() {
            return Err(InvariantViolation::GlobalParameterCount {
                expected: self.globals.len(),
                actual: globals.len(),
            }
            .into());
        }

        let mut random = state.random.clone();
        let seed: u64 = random.gen();
        let symbols = evaluate_step(&StepInput {
            table: &self.table,
            string: &state.symbols,
            globals,
            seed,
            passthrough: self.passthrough.as_ref(),
            batch_size: self.options.batch_size,
            parallel: self.options.parallel,
        })?;
        debug!(
            "generation {}: {} symbols and {} parameters became {} symbols and {} parameters",
            state.generation + 1,
            state.symbols.len(),
            state.symbols.total_parameters(),
            symbols.len(),
            symbols.total_parameters()
        );

        Ok(LSystemState {
            has_immature_symbols: self.contains_immature(&symbols),
            symbols,
            random: if advance_random { random } else { state.random.clone() },
            generation: state.generation + 1,
        })
    }

    /// Every generation after `state`, computed lazily. Stops after the
    /// first error.
    pub fn generations(&self, state: LSystemState, globals: Vec<f32>) -> Generations<'_> {
        Generations {
            grammar: self,
            state: Some(state),
            globals,
        }
    }

    /// Steps the axiom as many times as `#iterations` asks.
    pub fn run(&self, seed: u64, globals: &[f32]) -> Result<LSystemState, LSystemError> {
        let mut state = self.initial_state(seed);
        for _ in 0..self.iterations {
            state = self.step(&state, globals, true)?;
        }
        Ok(state)
    }
}

pub struct Generations<'g> {
    grammar: &'g CompiledGrammar,
    state: Option<LSystemState>,
    globals: Vec<f32>,
}

impl<'g> Iterator for Generations<'g> {
    type Item = Result<LSystemState, LSystemError>;

    fn next(&mut self) -> Option<Self::Item> {
        let state = self.state.take()?;
        match self.grammar.step(&state, &self.globals, true) {
            Ok(next) => {
                self.state = Some(next.clone());
                Some(Ok(next))
            }
            Err(error) => Some(Err(error)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linker::{compile, CompileOptions, FileSet};
    use std::iter::zip;

    fn system_with(header: &str, axiom: &str, rules: &[&str], options: &CompileOptions) -> CompiledGrammar {
        let source = format!("{}\n#axiom {}\n{}", header, axiom, rules.join("\n"));
        let mut files = FileSet::new();
        files.add_source("test.lsystem", &source).unwrap();
        compile(&files, "test.lsystem", options).unwrap()
    }

    fn system(header: &str, axiom: &str, rules: &[&str]) -> CompiledGrammar {
        system_with(header, axiom, rules, &CompileOptions::default())
    }

    fn assert_steps(grammar: &CompiledGrammar, answers: &[&str]) {
        let globals = grammar.default_globals();
        let generations = grammar.generations(grammar.initial_state(0), globals);
        for (state, answer) in zip(generations, answers) {
            assert_eq!(grammar.render(&state.unwrap().symbols), *answer);
        }
    }

    fn render_after(grammar: &CompiledGrammar, seed: u64, steps: usize) -> String {
        let state = grammar
            .generations(grammar.initial_state(seed), grammar.default_globals())
            .nth(steps - 1)
            .unwrap()
            .unwrap();
        grammar.render(&state.symbols)
    }

    #[test]
    fn rewrites_every_symbol() {
        let grammar = system("#symbols AB", "B", &["A -> AB", "B -> A"]);
        assert_steps(&grammar, &["A", "AB", "ABA", "ABAAB", "ABAABABA"]);
    }

    #[test]
    fn unmatched_symbols_are_copied() {
        let grammar = system("#symbols ABC", "B", &["A -> ACB", "B -> A"]);
        assert_steps(&grammar, &["A", "ACB", "ACBCA", "ACBCACACB"]);
    }

    #[test]
    fn context_matches_distinguish_origins() {
        let grammar = system("#symbols ABCD", "A", &["A -> AB", "B -> CDC", "D > C -> A", "D < C > D -> B"]);
        assert_steps(
            &grammar,
            &["AB", "ABCDC", "ABCDCCAC", "ABCDCCACCABC", "ABCDCCACCABCCABCDCC"],
        );
    }

    #[test]
    fn flat_contexts() {
        let grammar = system("#symbols AB", "B", &["A -> AB", "B -> A", "A > A ->", "A < A -> B"]);
        assert_steps(&grammar, &["A", "AB", "ABA", "ABAAB", "ABABA", "ABAABAAB", "ABABABA"]);

        let grammar = system("#symbols AB", "B", &["B -> ABA", "A > A ->", "A < A -> B"]);
        assert_steps(&grammar, &["ABA", "AABAA", "BABAB", "ABAAABAAABA"]);
    }

    #[test]
    fn ignored_symbols_are_invisible_to_contexts() {
        let grammar = system(
            "#symbols AB1234567\n#ignore 1234567",
            "B",
            &["A -> A1B2", "B -> 3A4", "A > A -> 5", "A < A -> 6B7"],
        );
        assert_steps(
            &grammar,
            &[
                "3A4",
                "3A1B24",
                "3A1B213A424",
                "3A1B213A4213A1B2424",
                "3A1B213A4213542136B713A42424",
            ],
        );
    }

    #[test]
    fn matches_limits_contexts_to_listed_symbols() {
        let grammar = system("#symbols ABX\n#matches AB", "AXB", &["A > B -> B"]);
        assert_steps(&grammar, &["BXB"]);
    }

    #[test]
    fn contexts_follow_branches() {
        let grammar = system("#symbols ABCXY", "A[B]C", &["A < B -> X", "A > C -> Y"]);
        assert_steps(&grammar, &["Y[X]C"]);
    }

    #[test]
    fn most_specific_rule_wins() {
        let grammar = system(
            "#symbols ABCDEF",
            "AABCD",
            &["A -> B", "A > A -> C", "A > AB -> D", "A > ABC -> E", "A > ABCD -> F"],
        );
        assert_steps(&grammar, &["FBBCD"]);
    }

    #[test]
    fn equal_specificity_uses_declaration_order() {
        let grammar = system("#symbols ABC", "AAA", &["A > A -> B", "A < A -> C"]);
        assert_steps(&grammar, &["BBC"]);

        let grammar = system("#symbols ABC", "AAA", &["A < A -> C", "A > A -> B"]);
        assert_steps(&grammar, &["BCC"]);
    }

    #[test]
    fn parameters_flow_through_expressions() {
        let grammar = system("#symbols A", "A(1)", &["A(x) -> A(x + 1)"]);
        assert_eq!(render_after(&grammar, 0, 4), "A(5)");

        let grammar = system("#symbols A", "A(1, 1)", &["A(x, y) -> A(x + y, x * y)"]);
        assert_steps(&grammar, &["A(2, 1)", "A(3, 2)", "A(5, 6)", "A(11, 30)"]);
    }

    #[test]
    fn context_parameters_are_captured() {
        let grammar = system("#symbols AB", "A(1)B(1)", &["A(x) > B(y) -> A(x + y)", "A(x) < B(y) -> B(x)"]);
        assert_steps(&grammar, &["A(2)B(1)", "A(3)B(2)", "A(5)B(3)", "A(8)B(5)", "A(13)B(8)"]);
    }

    #[test]
    fn conditionals_gate_rules() {
        let grammar = system("#symbols A", "A(2)", &["A(x): x<6 -> A(x+1)"]);
        assert_steps(&grammar, &["A(3)", "A(4)", "A(5)", "A(6)", "A(6)", "A(6)"]);
    }

    #[test]
    fn globals_are_read_at_step_time() {
        let grammar = system("#symbols A\n#runtime global 5", "A(1, 1)", &["A(x, y) -> A((x + y) - global, x * y + global)"]);
        assert_steps(&grammar, &["A(-3, 6)", "A(-2, -13)", "A(-20, 31)", "A(6, -615)"]);

        let grammar = system(
            "#symbols AB\n#runtime limit 4",
            "A(2)",
            &["A(x) : x < limit -> A(x + 1)", "A(x) : x >= limit -> B(x)"],
        );
        assert_steps(&grammar, &["A(3)", "A(4)", "B(4)"]);

        let state = grammar.step(&grammar.initial_state(0), &[1.0], true).unwrap();
        assert_eq!(grammar.render(&state.symbols), "B(2)");
    }

    #[test]
    fn wrong_global_count_is_rejected() {
        let grammar = system("#symbols A\n#runtime global 5", "A", &["A -> AA"]);
        match grammar.step(&grammar.initial_state(0), &[], true) {
            Err(LSystemError::Invariant(error)) => assert_eq!(
                error,
                InvariantViolation::GlobalParameterCount {
                    expected: 1,
                    actual: 0
                }
            ),
            other => panic!("expected an invariant violation, got {:?}", other.map(|_| ())),
        }
    }

    const STOCHASTIC: [&str; 3] = ["A -> AC", "P(0.5) | C -> A", "P(0.5) | C -> AB"];

    #[test]
    fn stochastic_rules_pick_every_outcome() {
        let grammar = system("#symbols ABC", "C", &STOCHASTIC);
        let outcomes: Vec<String> = (0..1000).map(|seed| render_after(&grammar, seed, 1)).collect();

        let short = outcomes.iter().filter(|outcome| *outcome == "A").count();
        let long = outcomes.iter().filter(|outcome| *outcome == "AB").count();
        assert_eq!(short + long, 1000);
        assert!((400..600).contains(&short), "{} of 1000 picked the first outcome", short);
    }

    #[test]
    fn stochastic_positions_are_independent() {
        let grammar = system("#symbols ABC", &"C".repeat(1000), &STOCHASTIC);
        let rendered = render_after(&grammar, 3, 1);
        let long = rendered.chars().filter(|&c| c == 'B').count();
        assert!((400..600).contains(&long), "{} of 1000 picked the second outcome", long);
    }

    #[test]
    fn same_seed_same_generations() {
        let grammar = system("#symbols ABC", "C", &STOCHASTIC);
        for seed in 0..20 {
            assert_eq!(render_after(&grammar, seed, 6), render_after(&grammar, seed, 6));
        }
    }

    #[test]
    fn saved_states_resume_identically() {
        let grammar = system("#symbols ABC", "C", &STOCHASTIC);
        let states: Vec<LSystemState> = grammar
            .generations(grammar.initial_state(11), Vec::new())
            .take(8)
            .map(Result::unwrap)
            .collect();

        let resumed: Vec<LSystemState> = grammar
            .generations(states[3].clone(), Vec::new())
            .take(4)
            .map(Result::unwrap)
            .collect();
        for (state, answer) in zip(&resumed, &states[4..]) {
            assert_eq!(state.symbols, answer.symbols);
            assert_eq!(state.generation, answer.generation);
        }
    }

    #[test]
    fn holding_the_random_state_repeats_a_step() {
        let grammar = system("#symbols ABC", &"C".repeat(64), &STOCHASTIC);
        let start = grammar.initial_state(5);

        let held = grammar.step(&start, &[], false).unwrap();
        let advanced = grammar.step(&start, &[], true).unwrap();
        assert_eq!(held.symbols, advanced.symbols);

        let first_draw = |random: &StdRng| random.clone().gen::<u64>();
        assert_eq!(first_draw(&held.random), first_draw(&start.random));
        assert_ne!(first_draw(&advanced.random), first_draw(&start.random));
    }

    #[test]
    fn batching_does_not_change_results() {
        let header = "#symbols FX+-";
        let rules = ["P(0.5) | X -> F[+X]F[-X]+X", "P(0.5) | X -> F[-X]F+X", "F -> FF"];
        let reference = system_with(
            header,
            "X",
            &rules,
            &CompileOptions {
                step: StepOptions {
                    batch_size: 128,
                    parallel: false,
                },
                ..CompileOptions::default()
            },
        );

        for (batch_size, parallel) in [(1, true), (3, true), (7, false), (1024, true)] {
            let options = CompileOptions {
                step: StepOptions { batch_size, parallel },
                ..CompileOptions::default()
            };
            let grammar = system_with(header, "X", &rules, &options);
            for seed in [0, 9] {
                assert_eq!(render_after(&grammar, seed, 5), render_after(&reference, seed, 5));
            }
        }
    }

    #[test]
    fn immature_symbols_are_flagged() {
        let grammar = system("#symbols AX\n#immature X", "AX", &["X -> A"]);
        let state = grammar.initial_state(0);
        assert!(state.has_immature_symbols());

        let state = grammar.step(&state, &[], true).unwrap();
        assert!(!state.has_immature_symbols());
        assert_eq!(grammar.render(&state.symbols), "AA");
    }

    #[test]
    fn diffusion_amounts_lose_parameters_when_unmatched() {
        let header = "#symbols Aa\n#include diffusion (amount->a)";
        let grammar = system(header, "A(1)a(5)", &["A(x) -> A(x + 1)"]);
        assert_steps(&grammar, &["A(2)a"]);

        let header = "#symbols Aa\n#include diffusion (amount->a)\n#define independentDiffusionStep true";
        let grammar = system(header, "A(1)a(5)", &["A(x) -> A(x + 1)"]);
        assert!(grammar.custom_symbols().independent_diffusion_update);
        assert_steps(&grammar, &["A(2)a(5)"]);

        let grammar = system("#symbols Aa\n#include diffusion (amount->a)", "a(5)", &[]).with_passthrough(Box::new(KeepAllParameters));
        assert_steps(&grammar, &["a(5)"]);
    }

    #[test]
    fn run_uses_the_iteration_count() {
        let grammar = system("#symbols AB\n#iterations 3", "B", &["A -> AB", "B -> A"]);
        assert_eq!(grammar.iterations(), 3);
        let state = grammar.run(0, &[]).unwrap();
        assert_eq!(grammar.render(&state.symbols), "ABA");
        assert_eq!(state.generation, 3);
    }

    #[test]
    fn symbols_are_looked_up_per_file() {
        let grammar = system("#symbols AB", "AB", &[]);
        assert_eq!(grammar.symbol_for("test.lsystem", 'A'), Some(Symbol::from_char('A')));
        assert_eq!(grammar.symbol_for("test.lsystem", 'Z'), None);
        assert_eq!(grammar.symbol_for("other.lsystem", 'A'), None);
        assert_eq!(grammar.character_for(Symbol::from_char('B')), Some('B'));
        assert_eq!(grammar.axiom().len(), 2);
    }
}
