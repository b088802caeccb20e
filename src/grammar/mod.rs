/*
    This module holds the symbol-level data model shared by every stage:
    symbols, jagged parameter indexing and the flat symbol string
*/

mod symbol_string;

use std::fmt::Display;
use std::ops::Range;

pub use symbol_string::SymbolString;

// A grammar terminal or nonterminal after linking. Symbols declared global
// (including the branch brackets) keep their character code as their value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(pub u32);

pub const BRANCH_OPEN: Symbol = Symbol('[' as u32);
pub const BRANCH_CLOSE: Symbol = Symbol(']' as u32);

impl Symbol {
    pub fn from_char(c: char) -> Self {
        Symbol(c as u32)
    }

    // The character this symbol was declared with, if it kept its code
    pub fn as_char(self) -> Option<char> {
        char::from_u32(self.0)
    }

    pub fn is_branch(self) -> bool {
        self == BRANCH_OPEN || self == BRANCH_CLOSE
    }
}

impl Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.as_char() {
            Some(c) => write!(f, "{}", c),
            None => write!(f, "#{}", self.0),
        }
    }
}

/// Offset and length of one row inside a flat buffer.
///
/// Used for symbol parameters, captured match parameters and every jagged
/// table inside the compiled rule data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JaggedIndex {
    pub index: u32,
    pub length: u16,
}

impl JaggedIndex {
    pub const MAX_LENGTH: usize = u16::MAX as usize;

    /// Rows whose length the parser or the rule table already bounded.
    pub fn new(index: usize, length: usize) -> Self {
        debug_assert!(length <= Self::MAX_LENGTH, "row of {length} entries");
        JaggedIndex {
            index: index as u32,
            length: length.min(Self::MAX_LENGTH) as u16,
        }
    }

    /// `None` when the row does not fit the index or length fields.
    pub fn try_new(index: usize, length: usize) -> Option<Self> {
        Some(JaggedIndex {
            index: u32::try_from(index).ok()?,
            length: u16::try_from(length).ok()?,
        })
    }

    pub fn range(&self) -> Range<usize> {
        let start = self.index as usize;
        start..start + self.length as usize
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}
