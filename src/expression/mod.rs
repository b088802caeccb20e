/*
    This module compiles parameter expressions into flat op sequences and
    evaluates them against global and local parameter arrays
*/

mod lexer;

use std::fmt::Display;
use std::ops::Range;

use crate::error_handling::Spanned;
use crate::parser::SyntaxErrorType;
use lexer::{lex_expression, SpannedToken, Token};

// Compiled expressions never need more evaluation slots than this
pub const MAX_STACK_DEPTH: usize = 32;

// Parentheses and prefix operators open at most this many levels
const MAX_NESTING: usize = MAX_STACK_DEPTH * 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    Constant(f32),
    Global(u16),
    Local(u16),
    Negate,
    Not,
    Add,
    Subtract,
    Multiply,
    Divide,
    Remainder,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,
    And,
    Or,
}

impl Op {
    // Net change to the evaluation stack after this op runs
    fn stack_effect(&self) -> isize {
        match self {
            Op::Constant(_) | Op::Global(_) | Op::Local(_) => 1,
            Op::Negate | Op::Not => 0,
            _ => -1,
        }
    }
}

/// Names visible to an expression, resolved to slots at compile time.
///
/// Locals shadow globals of the same name.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParameterScope<'a> {
    pub globals: &'a [String],
    pub locals: &'a [String],
}

impl<'a> ParameterScope<'a> {
    pub fn new(globals: &'a [String], locals: &'a [String]) -> Self {
        ParameterScope { globals, locals }
    }

    fn resolve(&self, name: &str) -> Option<Op> {
        if let Some(slot) = self.locals.iter().position(|local| local == name) {
            return Some(Op::Local(slot as u16));
        }
        self.globals
            .iter()
            .position(|global| global == name)
            .map(|slot| Op::Global(slot as u16))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    ops: Vec<Op>,
    source: String,
}

impl Expression {
    pub fn compile(text: &str, scope: &ParameterScope) -> Result<Expression, Spanned<SyntaxErrorType>> {
        let tokens = lex_expression(text)?;
        let end = text.chars().count();
        if tokens.is_empty() {
            return Err(Spanned::new(SyntaxErrorType::EmptyExpression, 0..end));
        }

        let mut compiler = Compiler {
            tokens: &tokens,
            position: 0,
            scope,
            ops: Vec::new(),
            end,
            nesting: 0,
        };
        compiler.expression(0)?;
        if let Some((token, span)) = tokens.get(compiler.position) {
            let error = match token {
                Token::CloseParen => SyntaxErrorType::UnmatchedParenthesis,
                other => SyntaxErrorType::UnexpectedToken(format!("{:?}", other)),
            };
            return Err(Spanned::new(error, span.clone()));
        }

        if max_stack_depth(&compiler.ops) > MAX_STACK_DEPTH {
            return Err(Spanned::new(SyntaxErrorType::ExpressionTooDeep, 0..end));
        }

        Ok(Expression {
            ops: compiler.ops,
            source: text.trim().to_string(),
        })
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, globals: &[f32], locals: &[f32]) -> f32 {
        evaluate(&self.ops, globals, locals)
    }

    // True when the expression reads no parameters at all
    pub fn is_constant(&self) -> bool {
        !self.ops.iter().any(|op| matches!(op, Op::Global(_) | Op::Local(_)))
    }
}

impl Display for Expression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

fn max_stack_depth(ops: &[Op]) -> usize {
    let mut depth = 0isize;
    let mut deepest = 0isize;
    for op in ops {
        depth += op.stack_effect();
        deepest = deepest.max(depth);
    }
    deepest as usize
}

fn truth(value: bool) -> f32 {
    if value {
        1.0
    } else {
        0.0
    }
}

/// Runs a compiled op sequence.
///
/// Ops come from [`Expression::compile`], which guarantees a balanced stack
/// no deeper than [`MAX_STACK_DEPTH`] and slots that exist in the scope the
/// expression was compiled against.
pub fn evaluate(ops: &[Op], globals: &[f32], locals: &[f32]) -> f32 {
    let mut stack = [0f32; MAX_STACK_DEPTH];
    let mut top = 0usize;

    for op in ops {
        match *op {
            Op::Constant(value) => {
                stack[top] = value;
                top += 1;
            }
            Op::Global(slot) => {
                stack[top] = globals[slot as usize];
                top += 1;
            }
            Op::Local(slot) => {
                stack[top] = locals[slot as usize];
                top += 1;
            }
            Op::Negate => stack[top - 1] = -stack[top - 1],
            Op::Not => stack[top - 1] = truth(stack[top - 1] == 0.0),
            binary => {
                let right = stack[top - 1];
                let left = stack[top - 2];
                top -= 1;
                stack[top - 1] = match binary {
                    Op::Add => left + right,
                    Op::Subtract => left - right,
                    Op::Multiply => left * right,
                    Op::Divide => left / right,
                    Op::Remainder => left % right,
                    Op::Less => truth(left < right),
                    Op::LessEqual => truth(left <= right),
                    Op::Greater => truth(left > right),
                    Op::GreaterEqual => truth(left >= right),
                    Op::Equal => truth(left == right),
                    Op::NotEqual => truth(left != right),
                    Op::And => truth(left != 0.0 && right != 0.0),
                    Op::Or => truth(left != 0.0 || right != 0.0),
                    _ => unreachable!("unary and push ops are handled above"),
                };
            }
        }
    }

    if top == 0 {
        0.0
    } else {
        stack[top - 1]
    }
}

const PREFIX_BINDING: u8 = 13;

// Left and right binding power of an infix operator
fn infix_binding(token: &Token) -> Option<(u8, u8, Op)> {
    let binding = match token {
        Token::OrOr => (1, 2, Op::Or),
        Token::AndAnd => (3, 4, Op::And),
        Token::EqualEqual => (5, 6, Op::Equal),
        Token::BangEqual => (5, 6, Op::NotEqual),
        Token::Less => (7, 8, Op::Less),
        Token::LessEqual => (7, 8, Op::LessEqual),
        Token::Greater => (7, 8, Op::Greater),
        Token::GreaterEqual => (7, 8, Op::GreaterEqual),
        Token::Plus => (9, 10, Op::Add),
        Token::Minus => (9, 10, Op::Subtract),
        Token::Star => (11, 12, Op::Multiply),
        Token::Slash => (11, 12, Op::Divide),
        Token::Percent => (11, 12, Op::Remainder),
        _ => return None,
    };
    Some(binding)
}

// Pratt parser that emits postfix ops as it goes
struct Compiler<'t, 's> {
    tokens: &'t [SpannedToken],
    position: usize,
    scope: &'s ParameterScope<'s>,
    ops: Vec<Op>,
    end: usize,
    nesting: usize,
}

impl<'t, 's> Compiler<'t, 's> {
    fn next(&mut self) -> Option<&'t SpannedToken> {
        let token = self.tokens.get(self.position);
        self.position += 1;
        token
    }

    fn peek(&self) -> Option<&'t Token> {
        self.tokens.get(self.position).map(|(token, _)| token)
    }

    fn end_span(&self) -> Range<usize> {
        self.end..self.end
    }

    fn expression(&mut self, min_binding: u8) -> Result<(), Spanned<SyntaxErrorType>> {
        self.prefix()?;

        while let Some(token) = self.peek() {
            let Some((left, right, op)) = infix_binding(token) else {
                break;
            };
            if left < min_binding {
                break;
            }
            self.position += 1;
            self.expression(right)?;
            self.ops.push(op);
        }
        Ok(())
    }

    fn nested(&mut self, min_binding: u8, span: &Range<usize>) -> Result<(), Spanned<SyntaxErrorType>> {
        if self.nesting == MAX_NESTING {
            return Err(Spanned::new(SyntaxErrorType::ExpressionTooDeep, span.clone()));
        }
        self.nesting += 1;
        self.expression(min_binding)?;
        self.nesting -= 1;
        Ok(())
    }

    fn prefix(&mut self) -> Result<(), Spanned<SyntaxErrorType>> {
        let Some((token, span)) = self.next() else {
            return Err(Spanned::new(SyntaxErrorType::EmptyExpression, self.end_span()));
        };

        match token {
            Token::Number(value) => self.ops.push(Op::Constant(*value)),
            Token::Identifier(name) => {
                let op = self
                    .scope
                    .resolve(name)
                    .ok_or_else(|| Spanned::new(SyntaxErrorType::UnknownParameter(name.clone()), span.clone()))?;
                self.ops.push(op);
            }
            Token::Minus => {
                self.nested(PREFIX_BINDING, span)?;
                self.ops.push(Op::Negate);
            }
            Token::Bang => {
                self.nested(PREFIX_BINDING, span)?;
                self.ops.push(Op::Not);
            }
            Token::OpenParen => {
                self.nested(0, span)?;
                match self.next() {
                    Some((Token::CloseParen, _)) => {}
                    _ => return Err(Spanned::new(SyntaxErrorType::UnmatchedParenthesis, span.clone())),
                }
            }
            other => {
                return Err(Spanned::new(
                    SyntaxErrorType::UnexpectedToken(format!("{:?}", other)),
                    span.clone(),
                ))
            }
        }
        Ok(())
    }
}
