use std::fmt::Display;

use itertools::Itertools;

use super::{JaggedIndex, Symbol};

/// A generation of the system: symbols with a jagged list of parameters each.
///
/// Parameters live contiguously in one buffer; `indexing[i]` locates the
/// parameters of `symbols[i]`. The two per-symbol vectors always have the
/// same length.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SymbolString {
    symbols: Vec<Symbol>,
    indexing: Vec<JaggedIndex>,
    parameters: Vec<f32>,
}

impl SymbolString {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(symbols: usize, parameters: usize) -> Self {
        SymbolString {
            symbols: Vec::with_capacity(symbols),
            indexing: Vec::with_capacity(symbols),
            parameters: Vec::with_capacity(parameters),
        }
    }

    // Builds a string where no symbol carries parameters
    pub fn from_symbols(symbols: &[Symbol]) -> Self {
        let mut result = Self::with_capacity(symbols.len(), 0);
        for &symbol in symbols {
            result.push(symbol, &[]);
        }
        result
    }

    // Assembles a string from buffers the step evaluator already filled in
    pub(crate) fn from_parts(symbols: Vec<Symbol>, indexing: Vec<JaggedIndex>, parameters: Vec<f32>) -> Self {
        debug_assert_eq!(symbols.len(), indexing.len());
        SymbolString {
            symbols,
            indexing,
            parameters,
        }
    }

    pub fn push(&mut self, symbol: Symbol, parameters: &[f32]) {
        self.indexing.push(JaggedIndex::new(self.parameters.len(), parameters.len()));
        self.parameters.extend_from_slice(parameters);
        self.symbols.push(symbol);
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn symbol(&self, index: usize) -> Symbol {
        self.symbols[index]
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    pub fn parameter_index(&self, index: usize) -> JaggedIndex {
        self.indexing[index]
    }

    pub fn parameters(&self, index: usize) -> &[f32] {
        &self.parameters[self.indexing[index].range()]
    }

    pub fn parameter_count(&self, index: usize) -> usize {
        self.indexing[index].len()
    }

    pub fn total_parameters(&self) -> usize {
        self.parameters.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Symbol, &[f32])> + '_ {
        self.symbols
            .iter()
            .zip(self.indexing.iter())
            .map(|(&symbol, index)| (symbol, &self.parameters[index.range()]))
    }

    /// Renders the string using `name` to turn symbols back into characters.
    pub fn render(&self, name: impl Fn(Symbol) -> char) -> String {
        let mut result = String::with_capacity(self.symbols.len());
        for (symbol, parameters) in self.iter() {
            result.push(name(symbol));
            if !parameters.is_empty() {
                result.push('(');
                result.push_str(&parameters.iter().join(", "));
                result.push(')');
            }
        }
        result
    }
}

impl Display for SymbolString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let rendered = self.render(|symbol| symbol.as_char().unwrap_or('?'));
        write!(f, "{}", rendered)
    }
}
