use std::ops::Range;

use super::SyntaxErrorType;
use crate::error_handling::Spanned;
use crate::grammar::JaggedIndex;

// One symbol of a pattern or replacement with its raw argument list
#[derive(PartialEq, Debug, Clone)]
pub struct SymbolToken {
    pub character: char,
    pub span: Range<usize>,
    // Comma separated pieces between the parentheses, each with the offset
    // of its first character. `None` when the symbol had no parentheses
    pub arguments: Option<Vec<(String, usize)>>,
}

impl SymbolToken {
    pub fn argument_count(&self) -> usize {
        self.arguments.as_ref().map_or(0, Vec::len)
    }
}

pub fn is_separator(c: char) -> bool {
    matches!(c, '(' | ')' | ',')
}

// Index of the closing parenthesis matching the one at `open`
pub fn matching_paren(chars: &[char], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (index, &c) in chars.iter().enumerate().skip(open) {
        match c {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return Some(index);
                }
            }
            _ => {}
        }
    }
    None
}

/// Finds the first occurrence of `pattern` outside of any parentheses.
pub fn find_top_level(chars: &[char], pattern: &[char]) -> Option<usize> {
    let mut depth = 0isize;
    for index in 0..chars.len() {
        match chars[index] {
            '(' => depth += 1,
            ')' => depth -= 1,
            _ => {}
        }
        if depth == 0 && chars[index..].starts_with(pattern) {
            return Some(index);
        }
    }
    None
}

fn split_arguments(chars: &[char], offset: usize) -> Vec<(String, usize)> {
    if chars.iter().all(|c| c.is_whitespace()) {
        return Vec::new();
    }

    let mut arguments = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (index, &c) in chars.iter().enumerate() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                arguments.push((chars[start..index].iter().collect(), offset + start));
                start = index + 1;
            }
            _ => {}
        }
    }
    arguments.push((chars[start..].iter().collect(), offset + start));
    arguments
}

/// Splits a series like `A(x, y)B[C(1+2)]` into symbol tokens.
///
/// `offset` is the position of `chars[0]` within the full line, so spans in
/// tokens and errors are line relative.
pub fn lex_symbols(chars: &[char], offset: usize) -> Result<Vec<SymbolToken>, Spanned<SyntaxErrorType>> {
    let mut tokens = Vec::new();
    let mut index = 0;

    while index < chars.len() {
        let c = chars[index];
        if c.is_whitespace() {
            index += 1;
            continue;
        }
        if is_separator(c) {
            let error = if c == ')' {
                SyntaxErrorType::UnmatchedParenthesis
            } else {
                SyntaxErrorType::UnexpectedCharacter(c)
            };
            return Err(Spanned::new(error, offset + index..offset + index + 1));
        }

        if chars.get(index + 1) != Some(&'(') {
            tokens.push(SymbolToken {
                character: c,
                span: offset + index..offset + index + 1,
                arguments: None,
            });
            index += 1;
            continue;
        }

        let open = index + 1;
        let close = matching_paren(chars, open).ok_or_else(|| {
            Spanned::new(SyntaxErrorType::UnmatchedParenthesis, offset + open..offset + open + 1)
        })?;
        let span = offset + index..offset + close + 1;
        let arguments = split_arguments(&chars[open + 1..close], offset + open + 1);
        if arguments.len() > JaggedIndex::MAX_LENGTH {
            return Err(Spanned::new(SyntaxErrorType::TooManyParameters(arguments.len()), span));
        }
        tokens.push(SymbolToken {
            character: c,
            span,
            arguments: Some(arguments),
        });
        index = close + 1;
    }

    Ok(tokens)
}
