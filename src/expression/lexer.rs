use std::ops::Range;

use itertools::{Itertools, PeekingNext};

use crate::error_handling::Spanned;
use crate::parser::SyntaxErrorType;

#[derive(PartialEq, Debug, Clone)]
pub enum Token {
    Number(f32),
    Identifier(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    EqualEqual,
    BangEqual,
    Bang,
    AndAnd,
    OrOr,
    OpenParen,
    CloseParen,
}

pub type SpannedToken = (Token, Range<usize>);

type CharStream<I> = std::iter::Peekable<I>;

fn lex_number<I>(chars: &mut CharStream<I>, start: usize) -> Result<SpannedToken, Spanned<SyntaxErrorType>>
where
    I: Iterator<Item = (usize, char)>,
{
    let text: String = chars
        .peeking_take_while(|(_, c)| c.is_ascii_digit() || *c == '.')
        .map(|(_, c)| c)
        .collect();
    let end = start + text.chars().count();
    text.parse::<f32>()
        .map(|value| (Token::Number(value), start..end))
        .map_err(|_| Spanned::new(SyntaxErrorType::InvalidNumber(text.clone()), start..end))
}

fn lex_identifier<I>(chars: &mut CharStream<I>, start: usize) -> SpannedToken
where
    I: Iterator<Item = (usize, char)>,
{
    let text: String = chars
        .peeking_take_while(|(_, c)| c.is_alphanumeric() || *c == '_')
        .map(|(_, c)| c)
        .collect();
    let end = start + text.chars().count();
    (Token::Identifier(text), start..end)
}

// Consumes the second half of a two character operator if it is present
fn lex_pair(chars: &mut impl PeekingNext<Item = (usize, char)>, second: char, single: Token, double: Token, start: usize) -> SpannedToken {
    match chars.peeking_next(|(_, c)| *c == second) {
        Some(_) => (double, start..start + 2),
        None => (single, start..start + 1),
    }
}

pub fn lex_expression(text: &str) -> Result<Vec<SpannedToken>, Spanned<SyntaxErrorType>> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().enumerate().peekable();

    while let Some(&(index, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c.is_ascii_digit() || c == '.' {
            tokens.push(lex_number(&mut chars, index)?);
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            tokens.push(lex_identifier(&mut chars, index));
            continue;
        }

        chars.next();
        let token = match c {
            '+' => (Token::Plus, index..index + 1),
            '-' => (Token::Minus, index..index + 1),
            '*' => (Token::Star, index..index + 1),
            '/' => (Token::Slash, index..index + 1),
            '%' => (Token::Percent, index..index + 1),
            '(' => (Token::OpenParen, index..index + 1),
            ')' => (Token::CloseParen, index..index + 1),
            '<' => lex_pair(&mut chars, '=', Token::Less, Token::LessEqual, index),
            '>' => lex_pair(&mut chars, '=', Token::Greater, Token::GreaterEqual, index),
            '!' => lex_pair(&mut chars, '=', Token::Bang, Token::BangEqual, index),
            '=' if chars.peeking_next(|(_, c)| *c == '=').is_some() => (Token::EqualEqual, index..index + 2),
            '&' if chars.peeking_next(|(_, c)| *c == '&').is_some() => (Token::AndAnd, index..index + 2),
            '|' if chars.peeking_next(|(_, c)| *c == '|').is_some() => (Token::OrOr, index..index + 2),
            other => {
                return Err(Spanned::new(
                    SyntaxErrorType::UnexpectedCharacter(other),
                    index..index + 1,
                ))
            }
        };
        tokens.push(token);
    }

    Ok(tokens)
}
