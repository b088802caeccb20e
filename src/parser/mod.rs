/*
    This module parses rule lines and grammar files
*/

mod directives;
mod lexer;
mod verifier;

use std::fmt::Display;
use std::ops::Range;

use crate::error_handling::*;
use crate::expression::{Expression, ParameterScope};
use crate::grammar::{Symbol, SymbolString};
use lexer::{find_top_level, lex_symbols, SymbolToken};

pub use directives::{DefineDirective, ExportDirective, IncludeLink, ParsedFile, RuleLine, RuntimeParameter};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SyntaxErrorType {
    #[error("Unexpected character `{0}`")]
    UnexpectedCharacter(char),
    #[error("Unexpected token {0}")]
    UnexpectedToken(String),
    #[error("Unmatched parenthesis")]
    UnmatchedParenthesis,
    #[error("Could not parse number `{0}`")]
    InvalidNumber(String),
    #[error("Unknown parameter `{0}`")]
    UnknownParameter(String),
    #[error("Expected an expression")]
    EmptyExpression,
    #[error("Expression nests too deeply to evaluate")]
    ExpressionTooDeep,
    #[error("Symbol has {0} parameters, more than the 65535 allowed")]
    TooManyParameters(usize),
    // A rule line without `->`
    #[error("Expected `->` between the matched symbol and its replacement")]
    MissingArrow,
    #[error("Rule has no target symbol")]
    MissingTargetSymbol,
    #[error("Rule targets more than one symbol, move the extra symbols into a context")]
    MultipleTargetSymbols,
    #[error("Symbol `{0}` is not declared in this file's #symbols")]
    UndeclaredSymbol(char),
    #[error("Parameter `{0}` is bound more than once")]
    DuplicateParameterName(String),
    #[error("Invalid name `{0}` in a matched symbol's parameter list")]
    InvalidParameterName(String),
    #[error("Probability `{0}` must be a number in (0, 1]")]
    InvalidProbability(String),
    #[error("Backward context cannot contain branches")]
    BranchInBackwardContext,
    #[error("Forward context has unbalanced branches")]
    UnbalancedContextBranch,
    #[error("Directive #{0} is missing an argument")]
    MissingDirectiveArgument(String),
    #[error("Unrecognized directive #{0}")]
    UnrecognizedDirective(String),
    #[error("Symbol `{0}` declared twice")]
    DuplicateSymbol(char),
    #[error("File must declare its alphabet with #symbols")]
    MissingSymbolsDirective,
    #[error("File must define an #axiom unless it is a library")]
    MissingAxiom,
    #[error("#{0} can only be used in a library file")]
    LibraryOnlyDirective(String),
    #[error("#{0} cannot be used in a library file")]
    OriginOnlyDirective(String),
    #[error("#iterations must be a whole number, found `{0}`")]
    InvalidIterations(String),
    #[error("Runtime parameter must default to a number, found `{0}`")]
    InvalidRuntimeDefault(String),
    // There was an issue with reading a file
    #[error("File error: {0}")]
    FileError(String),
}

impl ErrorType for SyntaxErrorType {}

pub type SyntaxError = Error<SyntaxErrorType>;
pub type SyntaxErrors = Errors<SyntaxErrorType>;

pub type SpannedResult<T> = std::result::Result<T, Spanned<SyntaxErrorType>>;
pub type FileResult<T> = std::result::Result<T, SyntaxErrors>;

// A matched symbol and the names its parameters bind to
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolMatcher {
    pub symbol: Symbol,
    pub parameter_names: Vec<String>,
}

impl SymbolMatcher {
    pub fn parameter_count(&self) -> usize {
        self.parameter_names.len()
    }
}

// Forward contexts keep their bracket structure; the rule table turns them
// into a tree
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardToken {
    Symbol(SymbolMatcher),
    BranchOpen,
    BranchClose,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplacementSymbol {
    pub symbol: Symbol,
    pub parameters: Vec<Expression>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRule {
    pub probability: Option<f32>,
    pub backward: Vec<SymbolMatcher>,
    pub target: SymbolMatcher,
    pub forward: Vec<ForwardToken>,
    pub conditional: Option<Expression>,
    pub replacement: Vec<ReplacementSymbol>,
    // Index of the linked file the rule came from
    pub file: usize,
    pub location: Location,
}

impl ParsedRule {
    pub fn forward_symbols(&self) -> impl Iterator<Item = &SymbolMatcher> {
        self.forward.iter().filter_map(|token| match token {
            ForwardToken::Symbol(matcher) => Some(matcher),
            _ => None,
        })
    }

    /// Names bound by the rule in capture order: backward context, target,
    /// forward context.
    pub fn local_parameter_names(&self) -> Vec<String> {
        self.backward
            .iter()
            .chain(std::iter::once(&self.target))
            .chain(self.forward_symbols())
            .flat_map(|matcher| matcher.parameter_names.iter().cloned())
            .collect()
    }

    pub fn context_size(&self) -> usize {
        self.backward.len() + self.forward_symbols().count()
    }
}

impl Display for SymbolMatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol)?;
        if !self.parameter_names.is_empty() {
            write!(f, "({})", self.parameter_names.join(", "))?;
        }
        Ok(())
    }
}

impl Display for ParsedRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for matcher in &self.backward {
            write!(f, "{}", matcher)?;
        }
        if !self.backward.is_empty() {
            write!(f, " < ")?;
        }
        write!(f, "{}", self.target)?;
        if !self.forward.is_empty() {
            write!(f, " > ")?;
        }
        for token in &self.forward {
            match token {
                ForwardToken::Symbol(matcher) => write!(f, "{}", matcher)?,
                ForwardToken::BranchOpen => write!(f, "[")?,
                ForwardToken::BranchClose => write!(f, "]")?,
            }
        }
        if let Some(conditional) = &self.conditional {
            write!(f, " : {}", conditional)?;
        }
        Ok(())
    }
}

fn text(chars: &[char]) -> String {
    chars.iter().collect()
}

fn lookup(token: &SymbolToken, symbols: &impl Fn(char) -> Option<Symbol>) -> SpannedResult<Symbol> {
    symbols(token.character)
        .ok_or_else(|| Spanned::new(SyntaxErrorType::UndeclaredSymbol(token.character), token.span.clone()))
}

fn is_parameter_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn parse_matcher(token: &SymbolToken, symbols: &impl Fn(char) -> Option<Symbol>) -> SpannedResult<SymbolMatcher> {
    let symbol = lookup(token, symbols)?;
    let mut parameter_names = Vec::with_capacity(token.argument_count());
    for (argument, offset) in token.arguments.iter().flatten() {
        let name = argument.trim();
        if !is_parameter_name(name) {
            let start = offset + argument.chars().take_while(|c| c.is_whitespace()).count();
            let end = start + name.chars().count().max(1);
            return Err(Spanned::new(SyntaxErrorType::InvalidParameterName(name.to_string()), start..end));
        }
        parameter_names.push(name.to_string());
    }
    Ok(SymbolMatcher { symbol, parameter_names })
}

fn parse_matchers(chars: &[char], offset: usize, symbols: &impl Fn(char) -> Option<Symbol>) -> SpannedResult<Vec<(SymbolMatcher, Range<usize>)>> {
    lex_symbols(chars, offset)?
        .iter()
        .map(|token| parse_matcher(token, symbols).map(|matcher| (matcher, token.span.clone())))
        .collect()
}

fn parse_forward(chars: &[char], offset: usize, symbols: &impl Fn(char) -> Option<Symbol>) -> SpannedResult<Vec<ForwardToken>> {
    let mut depth = 0isize;
    let mut tokens = Vec::new();
    for (matcher, span) in parse_matchers(chars, offset, symbols)? {
        let token = match matcher.symbol.as_char() {
            Some('[') if matcher.parameter_names.is_empty() => {
                depth += 1;
                ForwardToken::BranchOpen
            }
            Some(']') if matcher.parameter_names.is_empty() => {
                depth -= 1;
                if depth < 0 {
                    return Err(Spanned::new(SyntaxErrorType::UnbalancedContextBranch, span));
                }
                ForwardToken::BranchClose
            }
            _ => ForwardToken::Symbol(matcher),
        };
        tokens.push(token);
    }
    if depth != 0 {
        return Err(Spanned::new(SyntaxErrorType::UnbalancedContextBranch, offset..offset + chars.len()));
    }
    Ok(tokens)
}

fn parse_replacement(chars: &[char], offset: usize, symbols: &impl Fn(char) -> Option<Symbol>, scope: &ParameterScope) -> SpannedResult<Vec<ReplacementSymbol>> {
    let mut replacement = Vec::new();
    for token in lex_symbols(chars, offset)? {
        let symbol = lookup(&token, symbols)?;
        let mut parameters = Vec::with_capacity(token.argument_count());
        for (argument, argument_offset) in token.arguments.iter().flatten() {
            let expression = Expression::compile(argument, scope).map_err(|error| error.offset(*argument_offset))?;
            parameters.push(expression);
        }
        replacement.push(ReplacementSymbol { symbol, parameters });
    }
    Ok(replacement)
}

// Reads `P(0.5) |` or `(P0.5)` from the start of a rule. Returns the
// probability and the index where the rest of the rule starts
fn parse_probability(chars: &[char]) -> SpannedResult<(Option<f32>, usize)> {
    let start = chars.iter().take_while(|c| c.is_whitespace()).count();
    let rest = &chars[start..];

    let (number, after) = if rest.starts_with(&['(', 'P']) {
        let close = lexer::matching_paren(chars, start)
            .ok_or_else(|| Spanned::new(SyntaxErrorType::UnmatchedParenthesis, start..start + 1))?;
        (start + 2..close, close + 1)
    } else if rest.starts_with(&['P', '(']) {
        let Some(close) = lexer::matching_paren(chars, start + 1) else {
            return Ok((None, 0));
        };
        let bar = close + 1 + chars[close + 1..].iter().take_while(|c| c.is_whitespace()).count();
        if chars.get(bar) != Some(&'|') {
            // A symbol named P with parameters, not a probability
            return Ok((None, 0));
        }
        (start + 2..close, bar + 1)
    } else {
        return Ok((None, 0));
    };

    let raw = text(&chars[number.clone()]);
    match raw.trim().parse::<f32>() {
        Ok(probability) if probability > 0.0 && probability <= 1.0 => Ok((Some(probability), after)),
        _ => Err(Spanned::new(SyntaxErrorType::InvalidProbability(raw.trim().to_string()), number)),
    }
}

fn check_unique_names(rule: &ParsedRule, pattern_span: Range<usize>) -> SpannedResult<()> {
    let names = rule.local_parameter_names();
    for (index, name) in names.iter().enumerate() {
        if names[..index].contains(name) {
            return Err(Spanned::new(SyntaxErrorType::DuplicateParameterName(name.clone()), pattern_span));
        }
    }
    Ok(())
}

/// Parses one rule line.
///
/// `symbols` maps the characters of the owning file to linked symbols and
/// `globals` lists the runtime parameters expressions may read. Errors carry
/// character spans relative to `line`.
pub fn parse_rule(line: &str, symbols: &impl Fn(char) -> Option<Symbol>, globals: &[String]) -> SpannedResult<ParsedRule> {
    let chars: Vec<char> = line.chars().collect();

    let arrow = find_top_level(&chars, &['-', '>'])
        .ok_or_else(|| Spanned::new(SyntaxErrorType::MissingArrow, 0..chars.len()))?;
    let (probability, pattern_start) = parse_probability(&chars[..arrow])?;

    let (pattern_end, conditional_range) = match find_top_level(&chars[pattern_start..arrow], &[':']) {
        Some(colon) => (pattern_start + colon, Some(pattern_start + colon + 1..arrow)),
        None => (arrow, None),
    };
    let pattern = &chars[pattern_start..pattern_end];

    let (backward_end, target_start) = match find_top_level(pattern, &['<']) {
        Some(less) => (Some(less), less + 1),
        None => (None, 0),
    };
    let (target_end, forward_start) = match find_top_level(&pattern[target_start..], &['>']) {
        Some(greater) => (target_start + greater, Some(target_start + greater + 1)),
        None => (pattern.len(), None),
    };

    let backward = match backward_end {
        Some(end) => parse_matchers(&pattern[..end], pattern_start, symbols)?,
        None => Vec::new(),
    };
    if let Some((_, span)) = backward.iter().find(|(matcher, _)| matcher.symbol.is_branch()) {
        return Err(Spanned::new(SyntaxErrorType::BranchInBackwardContext, span.clone()));
    }

    let mut targets = parse_matchers(&pattern[target_start..target_end], pattern_start + target_start, symbols)?;
    let target_span = pattern_start + target_start..pattern_start + target_end;
    let target = match targets.len() {
        0 => return Err(Spanned::new(SyntaxErrorType::MissingTargetSymbol, target_span)),
        1 => targets.remove(0).0,
        _ => return Err(Spanned::new(SyntaxErrorType::MultipleTargetSymbols, targets[1].1.clone())),
    };

    let forward = match forward_start {
        Some(start) => parse_forward(&pattern[start..], pattern_start + start, symbols)?,
        None => Vec::new(),
    };

    let mut rule = ParsedRule {
        probability,
        backward: backward.into_iter().map(|(matcher, _)| matcher).collect(),
        target,
        forward,
        conditional: None,
        replacement: Vec::new(),
        file: 0,
        location: Location::default(),
    };
    check_unique_names(&rule, pattern_start..pattern_end)?;

    let locals = rule.local_parameter_names();
    let scope = ParameterScope::new(globals, &locals);
    if let Some(range) = conditional_range {
        let source = text(&chars[range.clone()]);
        let conditional = Expression::compile(&source, &scope).map_err(|error| error.offset(range.start))?;
        rule.conditional = Some(conditional);
    }
    rule.replacement = parse_replacement(&chars[arrow + 2..], arrow + 2, symbols, &scope)?;

    Ok(rule)
}

/// Parses an axiom such as `A(1)B(2, 3)` into a symbol string. Parameters
/// may be any expression without names.
pub fn parse_symbol_string(line: &str, symbols: &impl Fn(char) -> Option<Symbol>) -> SpannedResult<SymbolString> {
    let chars: Vec<char> = line.chars().collect();
    let scope = ParameterScope::default();
    let replacement = parse_replacement(&chars, 0, symbols, &scope)?;

    let mut result = SymbolString::with_capacity(replacement.len(), 0);
    for symbol in replacement {
        let parameters: Vec<f32> = symbol
            .parameters
            .iter()
            .map(|expression| expression.evaluate(&[], &[]))
            .collect();
        result.push(symbol.symbol, &parameters);
    }
    Ok(result)
}

/// Replaces whole identifier tokens named by `#define` directives.
///
/// Defines apply in order, so a replacement may name a define listed after it.
pub fn substitute_defines<'a>(line: &str, defines: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
    let mut result = line.to_string();
    for (name, replacement) in defines {
        if !result.contains(name) {
            continue;
        }
        let mut substituted = String::with_capacity(result.len());
        let mut word = String::new();
        for c in result.chars().chain(std::iter::once('\n')) {
            if c.is_alphanumeric() || c == '_' {
                word.push(c);
                continue;
            }
            if word == name {
                substituted.push_str(replacement);
            } else {
                substituted.push_str(&word);
            }
            word.clear();
            substituted.push(c);
        }
        substituted.pop();
        result = substituted;
    }
    result
}

#[cfg(test)]
mod tests {
    use std::iter::zip;

    use super::*;

    fn alphabet(declared: &'static str) -> impl Fn(char) -> Option<Symbol> {
        move |c| declared.contains(c).then(|| Symbol::from_char(c))
    }

    fn parse(line: &str) -> SpannedResult<ParsedRule> {
        parse_rule(line, &alphabet("ABCDF+-[]"), &["global".to_string()])
    }

    fn matcher(c: char, names: &[&str]) -> SymbolMatcher {
        SymbolMatcher {
            symbol: Symbol::from_char(c),
            parameter_names: names.iter().map(|name| name.to_string()).collect(),
        }
    }

    #[test]
    fn parse_basic_rule() {
        let rule = parse("A -> AB").unwrap();
        assert_eq!(rule.probability, None);
        assert_eq!(rule.target, matcher('A', &[]));
        assert!(rule.backward.is_empty() && rule.forward.is_empty());
        let replaced: Vec<_> = rule.replacement.iter().map(|symbol| symbol.symbol).collect();
        assert_eq!(replaced, vec![Symbol::from_char('A'), Symbol::from_char('B')]);
    }

    #[test]
    fn parse_contexts_and_parameters() {
        let rule = parse("A(a) < B(x) > C(y)[D(z)] : x < y && a > 0 -> B(x + y)").unwrap();
        assert_eq!(rule.backward, vec![matcher('A', &["a"])]);
        assert_eq!(rule.target, matcher('B', &["x"]));
        assert_eq!(
            rule.forward,
            vec![
                ForwardToken::Symbol(matcher('C', &["y"])),
                ForwardToken::BranchOpen,
                ForwardToken::Symbol(matcher('D', &["z"])),
                ForwardToken::BranchClose,
            ]
        );
        assert_eq!(rule.local_parameter_names(), vec!["a", "x", "y", "z"]);
        assert_eq!(rule.context_size(), 3);

        let conditional = rule.conditional.as_ref().unwrap();
        assert_eq!(conditional.evaluate(&[0.0], &[1.0, 2.0, 3.0, 0.0]), 1.0);
        assert_eq!(conditional.evaluate(&[0.0], &[0.0, 2.0, 3.0, 0.0]), 0.0);
        assert_eq!(rule.replacement[0].parameters[0].evaluate(&[0.0], &[1.0, 2.0, 3.0, 0.0]), 5.0);
    }

    #[test]
    fn parse_probability_prefixes() {
        let lines = vec!["P(0.25) | A -> B", "(P0.75) A -> B", "(P1)A->B", "A -> B"];
        let answers = vec![Some(0.25), Some(0.75), Some(1.0), None];

        for (line, answer) in zip(lines, answers) {
            assert_eq!(parse(line).unwrap().probability, answer, "{}", line);
        }
    }

    #[test]
    fn symbol_named_p_is_not_a_probability() {
        let rule = parse_rule("P(x) -> P(x + 1)", &alphabet("P"), &[]).unwrap();
        assert_eq!(rule.probability, None);
        assert_eq!(rule.target, matcher('P', &["x"]));
    }

    #[test]
    fn reads_globals_in_expressions() {
        let rule = parse("A(x) : x < global -> A(x + global)").unwrap();
        assert_eq!(rule.conditional.unwrap().evaluate(&[3.0], &[2.0]), 1.0);
        assert_eq!(rule.replacement[0].parameters[0].evaluate(&[3.0], &[2.0]), 5.0);
    }

    #[test]
    fn empty_replacement_is_allowed() {
        assert!(parse("A > A ->").unwrap().replacement.is_empty());
    }

    #[test]
    fn parse_malformed_rules() {
        let lines = vec![
            "A B",
            "A -> E",
            "AB -> A",
            "A < -> B",
            "A(x) -> A(y)",
            "A(x) > B(x) -> A",
            "P(1.5) | A -> B",
            "A[ < B -> B",
            "A > B[C -> A",
            "A(x) : x +  -> A",
            "A(2) -> A",
        ];
        let answers = vec![
            Spanned::new(SyntaxErrorType::MissingArrow, 0..3),
            Spanned::new(SyntaxErrorType::UndeclaredSymbol('E'), 5..6),
            Spanned::new(SyntaxErrorType::MultipleTargetSymbols, 1..2),
            Spanned::new(SyntaxErrorType::MissingTargetSymbol, 3..4),
            Spanned::new(SyntaxErrorType::UnknownParameter("y".to_string()), 10..11),
            Spanned::new(SyntaxErrorType::DuplicateParameterName("x".to_string()), 0..12),
            Spanned::new(SyntaxErrorType::InvalidProbability("1.5".to_string()), 2..5),
            Spanned::new(SyntaxErrorType::BranchInBackwardContext, 1..2),
            Spanned::new(SyntaxErrorType::UnbalancedContextBranch, 3..8),
            Spanned::new(SyntaxErrorType::EmptyExpression, 12..12),
            Spanned::new(SyntaxErrorType::InvalidParameterName("2".to_string()), 2..3),
        ];

        for (line, answer) in zip(lines, answers) {
            assert_eq!(parse(line).unwrap_err(), answer, "{}", line);
        }
    }

    #[test]
    fn parse_axiom_strings() {
        let axiom = parse_symbol_string("A(1)B(2 * 3, -1)[C]", &alphabet("ABC[]")).unwrap();
        assert_eq!(axiom.to_string(), "A(1)B(6, -1)[C]");
        assert_eq!(
            parse_symbol_string("AX", &alphabet("A")).unwrap_err(),
            Spanned::new(SyntaxErrorType::UndeclaredSymbol('X'), 1..2)
        );
    }

    #[test]
    fn substitutes_whole_words_only() {
        let defines = vec![("angle", "size * 2"), ("size", "4")];
        assert_eq!(
            substitute_defines("A(x) -> A(x + size)+(angle)", defines.iter().map(|(a, b)| (*a, *b))),
            "A(x) -> A(x + 4)+(4 * 2)"
        );
        assert_eq!(substitute_defines("A(sizes) -> A(size)", [("size", "2")]), "A(sizes) -> A(2)");
    }
}
