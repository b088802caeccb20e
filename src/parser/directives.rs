use std::ops::Range;
use std::path::Path;

use tracing::warn;

use super::verifier::verify_symbols;
use super::{FileResult, SpannedResult, SyntaxError, SyntaxErrorType, SyntaxErrors};
use crate::error_handling::{Location, Spanned};
use crate::linker::is_builtin_library;

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeParameter {
    pub name: String,
    pub default: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DefineDirective {
    pub name: String,
    pub replacement: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportDirective {
    pub name: String,
    pub symbol: char,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IncludeLink {
    // Builtin library name or a path resolved against the including file
    pub identifier: String,
    // Export name and the local character it is bound to
    pub imports: Vec<(String, char)>,
    pub line: usize,
}

// A line of text along with where it sits in the file
#[derive(Debug, Clone, PartialEq)]
pub struct RuleLine {
    pub text: String,
    pub line: usize,
    pub column: usize,
}

/// One grammar file after its directives have been read. Rule lines are
/// kept as text until linking, when symbols and defines are known.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFile {
    pub identifier: String,
    pub is_library: bool,
    pub symbols: Vec<char>,
    pub global_symbols: Vec<char>,
    pub matches: Option<Vec<char>>,
    pub ignored: Vec<char>,
    pub immature: Vec<char>,
    pub axiom: Option<RuleLine>,
    pub iterations: Option<u32>,
    pub runtime: Vec<RuntimeParameter>,
    pub defines: Vec<DefineDirective>,
    pub exports: Vec<ExportDirective>,
    pub includes: Vec<IncludeLink>,
    pub rule_lines: Vec<RuleLine>,
    // Directive errors that were skipped over
    pub warnings: SyntaxErrors,
    declared_symbols: bool,
    pub(super) references: Vec<(char, usize)>,
}

fn add_unique(set: &mut Vec<char>, characters: &str) {
    for c in characters.chars().filter(|c| !c.is_whitespace()) {
        if !set.contains(&c) {
            set.push(c);
        }
    }
}

// Splits off the first whitespace separated word. Returns the word, the rest
// and the character offset of the rest
fn split_word(text: &str) -> (&str, &str, usize) {
    let word_end = text.find(char::is_whitespace).unwrap_or(text.len());
    let (word, rest) = text.split_at(word_end);
    let trimmed = rest.trim_start();
    let offset = text[..text.len() - trimmed.len()].chars().count();
    (word, trimmed.trim_end(), offset)
}

fn char_range(start: usize, text: &str) -> Range<usize> {
    start..start + text.chars().count()
}

// Reads `(name->c)` pairs following an include path
fn parse_imports(text: &str, offset: usize) -> SpannedResult<Vec<(String, char)>> {
    let mut imports = Vec::new();
    let mut rest = text;
    let mut consumed = offset;
    while let Some(open) = rest.find('(') {
        let close = rest[open..]
            .find(')')
            .map(|close| open + close)
            .ok_or_else(|| Spanned::new(SyntaxErrorType::UnmatchedParenthesis, char_range(consumed, &rest[..open + 1])))?;
        let pair = &rest[open + 1..close];
        let span = char_range(consumed + rest[..open].chars().count(), &rest[open..=close]);
        let (name, symbol) = pair
            .split_once("->")
            .ok_or_else(|| Spanned::new(SyntaxErrorType::MissingArrow, span.clone()))?;
        let mut symbol_chars = symbol.trim().chars();
        match (symbol_chars.next(), symbol_chars.next()) {
            (Some(c), None) if !name.trim().is_empty() => imports.push((name.trim().to_string(), c)),
            _ => return Err(Spanned::new(SyntaxErrorType::MissingDirectiveArgument("include".to_string()), span)),
        }
        consumed += rest[..=close].chars().count();
        rest = &rest[close + 1..];
    }
    Ok(imports)
}

fn resolve_include(includer: &str, path: &str) -> String {
    if is_builtin_library(path) {
        return path.to_string();
    }
    match Path::new(includer).parent() {
        Some(parent) => parent.join(path).to_string_lossy().into_owned(),
        None => path.to_string(),
    }
}

impl ParsedFile {
    fn empty(identifier: &str, is_library: bool) -> Self {
        ParsedFile {
            identifier: identifier.to_string(),
            is_library,
            symbols: vec!['[', ']'],
            global_symbols: vec!['[', ']'],
            matches: None,
            ignored: Vec::new(),
            immature: Vec::new(),
            axiom: None,
            iterations: None,
            runtime: Vec::new(),
            defines: Vec::new(),
            exports: Vec::new(),
            includes: Vec::new(),
            rule_lines: Vec::new(),
            warnings: Vec::new(),
            declared_symbols: false,
            references: Vec::new(),
        }
    }

    fn reference(&mut self, characters: &str, line: usize) {
        self.references
            .extend(characters.chars().filter(|c| !c.is_whitespace()).map(|c| (c, line)));
    }

    // `text` is the directive without its leading `#`; spans are relative to
    // it. `column` is where the `#` sits in the line
    fn parse_directive(&mut self, text: &str, line: usize, column: usize) -> SpannedResult<()> {
        let (name, arguments, offset) = split_word(text);
        let name_span = char_range(0, name);
        let arguments_span = char_range(offset, arguments);
        if name.is_empty() {
            return Err(Spanned::new(SyntaxErrorType::MissingDirectiveArgument(String::new()), 0..1));
        }
        if arguments.is_empty() {
            return Err(Spanned::new(SyntaxErrorType::MissingDirectiveArgument(name.to_string()), name_span));
        }

        match name {
            "symbols" => {
                self.declared_symbols = true;
                let mut duplicate = None;
                for c in arguments.chars().filter(|c| !c.is_whitespace()) {
                    if self.symbols.contains(&c) {
                        duplicate.get_or_insert(c);
                    } else {
                        self.symbols.push(c);
                    }
                }
                if let Some(c) = duplicate {
                    return Err(Spanned::new(SyntaxErrorType::DuplicateSymbol(c), arguments_span));
                }
            }
            "global" => {
                add_unique(&mut self.global_symbols, arguments);
                self.reference(arguments, line);
            }
            "matches" => {
                add_unique(self.matches.get_or_insert_with(Vec::new), arguments);
                self.reference(arguments, line);
            }
            "ignore" => {
                add_unique(&mut self.ignored, arguments);
                self.reference(arguments, line);
            }
            "immature" => {
                add_unique(&mut self.immature, arguments);
                self.reference(arguments, line);
            }
            "axiom" | "iterations" if self.is_library => {
                return Err(Spanned::new(SyntaxErrorType::OriginOnlyDirective(name.to_string()), name_span));
            }
            "axiom" => {
                self.axiom = Some(RuleLine {
                    text: arguments.to_string(),
                    line,
                    column: column + 1 + offset,
                });
            }
            "iterations" => {
                let iterations = arguments
                    .parse::<u32>()
                    .map_err(|_| Spanned::new(SyntaxErrorType::InvalidIterations(arguments.to_string()), arguments_span))?;
                self.iterations = Some(iterations);
            }
            "runtime" => {
                let (variable, value, value_offset) = split_word(arguments);
                if value.is_empty() {
                    return Err(Spanned::new(SyntaxErrorType::MissingDirectiveArgument(name.to_string()), arguments_span));
                }
                let default = value.parse::<f32>().map_err(|_| {
                    Spanned::new(
                        SyntaxErrorType::InvalidRuntimeDefault(value.to_string()),
                        char_range(offset + value_offset, value),
                    )
                })?;
                self.runtime.push(RuntimeParameter {
                    name: variable.to_string(),
                    default,
                });
            }
            "define" => {
                let (variable, replacement, _) = split_word(arguments);
                if replacement.is_empty() {
                    return Err(Spanned::new(SyntaxErrorType::MissingDirectiveArgument(name.to_string()), arguments_span));
                }
                self.defines.push(DefineDirective {
                    name: variable.to_string(),
                    replacement: replacement.to_string(),
                });
            }
            "export" if !self.is_library => {
                return Err(Spanned::new(SyntaxErrorType::LibraryOnlyDirective(name.to_string()), name_span));
            }
            "export" => {
                let (export_name, symbol, _) = split_word(arguments);
                let Some(c) = symbol.chars().next() else {
                    return Err(Spanned::new(SyntaxErrorType::MissingDirectiveArgument(name.to_string()), arguments_span));
                };
                self.exports.push(ExportDirective {
                    name: export_name.to_string(),
                    symbol: c,
                });
                self.references.push((c, line));
            }
            "include" => {
                let (path, remapping, remap_offset) = split_word(arguments);
                let imports = parse_imports(remapping, offset + remap_offset)?;
                self.references.extend(imports.iter().map(|(_, c)| (*c, line)));
                self.includes.push(IncludeLink {
                    identifier: resolve_include(&self.identifier, path),
                    imports,
                    line,
                });
            }
            other => {
                return Err(Spanned::new(SyntaxErrorType::UnrecognizedDirective(other.to_string()), name_span));
            }
        }
        Ok(())
    }

    /// Reads the directives and rule lines of one file.
    ///
    /// Malformed directives are logged, kept in `warnings` and skipped.
    /// Directives used in the wrong kind of file, a missing `#symbols` or
    /// `#axiom`, and references to undeclared characters fail the file.
    pub fn parse(identifier: &str, text: &str, is_library: bool) -> FileResult<ParsedFile> {
        let mut file = ParsedFile::empty(identifier, is_library);
        let mut errors: SyntaxErrors = Vec::new();

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with("##") {
                continue;
            }
            let column = raw.chars().take_while(|c| c.is_whitespace()).count();

            let Some(directive) = trimmed.strip_prefix('#') else {
                file.rule_lines.push(RuleLine {
                    text: trimmed.to_string(),
                    line,
                    column,
                });
                continue;
            };

            if let Err(error) = file.parse_directive(directive, line, column) {
                let error = error.offset(column + 1).at(identifier, line);
                match error.error {
                    SyntaxErrorType::LibraryOnlyDirective(_) | SyntaxErrorType::OriginOnlyDirective(_) => errors.push(error),
                    _ => {
                        warn!("skipping directive: {}", error);
                        file.warnings.push(error);
                    }
                }
            }
        }

        if !file.declared_symbols {
            errors.push(SyntaxError {
                location: Location::file(identifier),
                error: SyntaxErrorType::MissingSymbolsDirective,
            });
        }
        if !file.is_library && file.axiom.is_none() {
            errors.push(SyntaxError {
                location: Location::file(identifier),
                error: SyntaxErrorType::MissingAxiom,
            });
        }
        errors.extend(verify_symbols(&file));

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(file)
    }

    pub fn declares(&self, c: char) -> bool {
        self.symbols.contains(&c)
    }

    /// Characters context patterns in this file can see. Brackets are always
    /// included since they give the string its shape.
    pub fn contextual_characters(&self) -> Vec<char> {
        match &self.matches {
            Some(matches) => {
                let mut contextual = vec!['[', ']'];
                add_unique(&mut contextual, &matches.iter().collect::<String>());
                contextual
            }
            None => self
                .symbols
                .iter()
                .copied()
                .filter(|c| !self.ignored.contains(c) || matches!(c, '[' | ']'))
                .collect(),
        }
    }

    pub fn exported(&self, name: &str) -> Option<char> {
        self.exports
            .iter()
            .find(|export| export.name == name)
            .map(|export| export.symbol)
    }
}

#[cfg(test)]
mod tests {
    use std::iter::zip;

    use super::*;

    const PLANT: &str = "\
## A small plant
#symbols FXL+-
#global +-
#ignore +-
#immature X
#axiom X(1)
#iterations 5
#runtime growth 0.5
#define branchAngle 22.5
#include lib/leaves.lsyslib (leaf->L)
#include diffusion (node->F) (amount->L)

X(x) -> F[+X(x)][-X(x)]
    F -> FF
";

    #[test]
    fn parse_origin_file() {
        let file = ParsedFile::parse("plants/plant.lsystem", PLANT, false).unwrap();

        assert_eq!(file.symbols, vec!['[', ']', 'F', 'X', 'L', '+', '-']);
        assert_eq!(file.global_symbols, vec!['[', ']', '+', '-']);
        assert_eq!(file.immature, vec!['X']);
        assert_eq!(file.axiom.as_ref().unwrap().text, "X(1)");
        assert_eq!(file.axiom.as_ref().unwrap().column, 7);
        assert_eq!(file.iterations, Some(5));
        assert_eq!(
            file.runtime,
            vec![RuntimeParameter {
                name: "growth".to_string(),
                default: 0.5
            }]
        );
        assert_eq!(file.defines[0].replacement, "22.5");
        assert_eq!(
            file.includes,
            vec![
                IncludeLink {
                    identifier: "plants/lib/leaves.lsyslib".to_string(),
                    imports: vec![("leaf".to_string(), 'L')],
                    line: 10,
                },
                IncludeLink {
                    identifier: "diffusion".to_string(),
                    imports: vec![("node".to_string(), 'F'), ("amount".to_string(), 'L')],
                    line: 11,
                },
            ]
        );

        let rules: Vec<_> = file.rule_lines.iter().map(|rule| (rule.text.as_str(), rule.line, rule.column)).collect();
        assert_eq!(rules, vec![("X(x) -> F[+X(x)][-X(x)]", 13, 0), ("F -> FF", 14, 4)]);
        assert!(file.warnings.is_empty());
    }

    #[test]
    fn contextual_characters_follow_matches_or_ignore() {
        let file = ParsedFile::parse("plant.lsystem", PLANT, false).unwrap();
        assert_eq!(file.contextual_characters(), vec!['[', ']', 'F', 'X', 'L']);

        let matching = ParsedFile::parse("m.lsystem", "#symbols ABC\n#matches B\n#axiom A", false).unwrap();
        assert_eq!(matching.contextual_characters(), vec!['[', ']', 'B']);
    }

    #[test]
    fn malformed_directives_are_skipped() {
        let text = "#symbols AB\n#symbols A\n#axiom A\n#iterations many\n#runtime speed\n#frobnicate A\nA -> B";
        let file = ParsedFile::parse("bad.lsystem", text, false).unwrap();

        let answers = vec![
            (2, SyntaxErrorType::DuplicateSymbol('A')),
            (4, SyntaxErrorType::InvalidIterations("many".to_string())),
            (5, SyntaxErrorType::MissingDirectiveArgument("runtime".to_string())),
            (6, SyntaxErrorType::UnrecognizedDirective("frobnicate".to_string())),
        ];
        for (warning, (line, error)) in zip(&file.warnings, answers) {
            assert_eq!(warning.location.line, line);
            assert_eq!(warning.error, error);
        }
        assert_eq!(file.warnings.len(), 4);
        assert_eq!(file.rule_lines.len(), 1);
    }

    #[test]
    fn warning_spans_point_into_the_line() {
        let file = ParsedFile::parse("bad.lsystem", "#symbols A\n#axiom A\n  #iterations x", false).unwrap();
        assert_eq!(file.warnings[0].location.span, Some(14..15));
    }

    #[test]
    fn misplaced_and_missing_directives_fail_the_file() {
        let texts = vec![
            ("#symbols A\n#axiom A\n#iterations 2", true),
            ("#symbols A\n#axiom A\n#export thing A", false),
            ("#axiom A", false),
            ("#symbols A", false),
            ("#symbols A\n#axiom A\n#global B", false),
        ];
        let answers = vec![
            vec![
                SyntaxErrorType::OriginOnlyDirective("axiom".to_string()),
                SyntaxErrorType::OriginOnlyDirective("iterations".to_string()),
            ],
            vec![SyntaxErrorType::LibraryOnlyDirective("export".to_string())],
            vec![SyntaxErrorType::MissingSymbolsDirective],
            vec![SyntaxErrorType::MissingAxiom],
            vec![SyntaxErrorType::UndeclaredSymbol('B')],
        ];

        for ((text, is_library), answer) in zip(texts, answers) {
            let errors = ParsedFile::parse("file", text, is_library).unwrap_err();
            let kinds: Vec<_> = errors.into_iter().map(|error| error.error).collect();
            assert_eq!(kinds, answer, "{}", text);
        }
    }

    #[test]
    fn library_exports() {
        let file = ParsedFile::parse("leaves.lsyslib", "#symbols LS\n#export leaf L\n#export stem S\nL -> LS", true).unwrap();
        assert_eq!(file.exported("leaf"), Some('L'));
        assert_eq!(file.exported("stem"), Some('S'));
        assert_eq!(file.exported("root"), None);
    }

    #[test]
    fn parse_include_remaps() {
        let lines = vec!["", "(a->B)", " (a->B)  (long_name->C)", "(a->BC)", "(a->B"];
        let answers = vec![
            Ok(vec![]),
            Ok(vec![("a".to_string(), 'B')]),
            Ok(vec![("a".to_string(), 'B'), ("long_name".to_string(), 'C')]),
            Err(Spanned::new(SyntaxErrorType::MissingDirectiveArgument("include".to_string()), 0..7)),
            Err(Spanned::new(SyntaxErrorType::UnmatchedParenthesis, 0..1)),
        ];

        for (line, answer) in zip(lines, answers) {
            assert_eq!(parse_imports(line, 0), answer, "{}", line);
        }
    }
}
