/*
    This module links a set of grammar files into one symbol space and
    compiles their rules into a runnable grammar
*/

mod builtin;
mod loader;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use itertools::{Either, Itertools};
use tracing::{debug, warn};

use crate::error_handling::*;
use crate::generator::{CompiledGrammar, GlobalParameter, StepOptions};
use crate::grammar::{Symbol, SymbolString};
use crate::parser::{parse_rule, parse_symbol_string, substitute_defines, FileResult, ParsedFile, ParsedRule, SyntaxErrors};
use crate::rules::RuleTable;

pub use builtin::{builtin_library, is_builtin_library, CustomRuleSymbols, DiffusionSymbols};
pub use builtin::{DIFFUSION, DIFFUSION_STEPS_DEFINE, IDENTIFIERS, INDEPENDENT_DIFFUSION_DEFINE, SUNLIGHT};

pub const LIBRARY_EXTENSION: &str = "lsyslib";

// Symbols private to one file are numbered from here so they never collide
// with a character code
pub const FIRST_PRIVATE_SYMBOL: u32 = 0x110000;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LinkErrorType {
    #[error("Global parameter `{0}` is declared by more than one file")]
    DuplicateGlobalParameter(String),
    #[error("Origin file is not part of the file set")]
    MissingOriginFile,
    #[error("Origin file is a library")]
    OriginIsLibrary,
    #[error("`{name}` is not exported by {file}")]
    MissingExport { name: String, file: String },
    #[error("Included file {0} could not be found")]
    MissingInclude(String),
    #[error("Tried to import from {0} before it was linked, check for circular includes")]
    LinkOrder(String),
    #[error("Invalid custom symbol configuration: {0}")]
    InvalidCustomSymbolConfiguration(String),
    #[error("`{name}` cannot be set to `{value}`")]
    BadGlobalParameter { name: String, value: String },
}

impl ErrorType for LinkErrorType {}

pub type LinkError = Error<LinkErrorType>;

fn link_error(location: Location, error: LinkErrorType) -> LinkError {
    LinkError { location, error }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompileOptions {
    // Replacement text for `#define` names, taking precedence over the files
    pub overrides: HashMap<String, String>,
    pub step: StepOptions,
}

impl CompileOptions {
    pub fn with_override(mut self, name: &str, value: &str) -> Self {
        self.overrides.insert(name.to_string(), value.to_string());
        self
    }
}

/// Parsed grammar files keyed by identifier.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileSet {
    files: BTreeMap<String, ParsedFile>,
}

pub fn is_library_path(identifier: &str) -> bool {
    Path::new(identifier)
        .extension()
        .is_some_and(|extension| extension == LIBRARY_EXTENSION)
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, file: ParsedFile) {
        self.files.insert(file.identifier.clone(), file);
    }

    /// Parses `text` and adds it. Files ending in `.lsyslib` are libraries.
    pub fn add_source(&mut self, identifier: &str, text: &str) -> FileResult<()> {
        let file = ParsedFile::parse(identifier, text, is_library_path(identifier))?;
        self.insert(file);
        Ok(())
    }

    pub fn get(&self, identifier: &str) -> Option<&ParsedFile> {
        self.files.get(identifier)
    }

    pub fn contains(&self, identifier: &str) -> bool {
        self.files.contains_key(identifier)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LinkedFile {
    pub parsed: ParsedFile,
    pub symbols: HashMap<char, Symbol>,
}

impl LinkedFile {
    pub fn symbol(&self, c: char) -> Option<Symbol> {
        self.symbols.get(&c).copied()
    }

    pub fn contextual_symbols(&self) -> Vec<Symbol> {
        self.parsed
            .contextual_characters()
            .into_iter()
            .filter_map(|c| self.symbol(c))
            .collect()
    }
}

/// Files in link order, leaves first and the origin last, each with its
/// characters mapped into the shared symbol space.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedFileSet {
    pub files: Vec<LinkedFile>,
    pub runtime: Vec<GlobalParameter>,
    pub defines: Vec<(String, String)>,
    pub immature: Vec<Symbol>,
    pub names: HashMap<Symbol, char>,
}

// Depth first over includes, pushing each file after everything it includes
fn visit(
    files: &FileSet,
    identifier: &str,
    included_from: Location,
    visiting: &mut HashSet<String>,
    order: &mut Vec<ParsedFile>,
) -> Result<(), LinkError> {
    if order.iter().any(|file| file.identifier == identifier) {
        return Ok(());
    }
    if !visiting.insert(identifier.to_string()) {
        return Err(link_error(included_from, LinkErrorType::LinkOrder(identifier.to_string())));
    }

    let file = match files.get(identifier) {
        Some(file) => file.clone(),
        None => builtin_library(identifier)
            .ok_or_else(|| link_error(included_from, LinkErrorType::MissingInclude(identifier.to_string())))?,
    };
    for include in &file.includes {
        let location = Location::line(&file.identifier, include.line);
        visit(files, &include.identifier, location, visiting, order)?;
    }

    visiting.remove(identifier);
    order.push(file);
    Ok(())
}

impl LinkedFileSet {
    pub fn link(files: &FileSet, origin: &str) -> Result<LinkedFileSet, LinkError> {
        let origin_file = files
            .get(origin)
            .ok_or_else(|| link_error(Location::file(origin), LinkErrorType::MissingOriginFile))?;
        if origin_file.is_library {
            return Err(link_error(Location::file(origin), LinkErrorType::OriginIsLibrary));
        }

        let mut order = Vec::new();
        visit(files, origin, Location::file(origin), &mut HashSet::new(), &mut order)?;
        for unreachable in files.identifiers().filter(|id| !order.iter().any(|file| file.identifier == *id)) {
            warn!("{} is not included from {} and will not be linked", unreachable, origin);
        }
        debug!(
            "link order: {}",
            order.iter().map(|file| file.identifier.as_str()).collect::<Vec<_>>().join(", ")
        );

        let runtime = Self::collect_runtime(&order)?;
        let defines = Self::collect_defines(&order)?;

        let global_characters: HashSet<char> = order
            .iter()
            .flat_map(|file| file.global_symbols.iter().copied())
            .collect();
        let mut next_private = FIRST_PRIVATE_SYMBOL;
        let mut linked: Vec<LinkedFile> = Vec::with_capacity(order.len());
        for file in order {
            let symbols = Self::assign_symbols(&file, &linked, &global_characters, file.identifier == origin, &mut next_private)?;
            linked.push(LinkedFile { parsed: file, symbols });
        }

        let mut names = HashMap::new();
        for file in &linked {
            names.extend(file.symbols.iter().map(|(&c, &symbol)| (symbol, c)));
        }
        let immature = linked
            .iter()
            .flat_map(|file| file.parsed.immature.iter().filter_map(|&c| file.symbol(c)))
            .sorted()
            .dedup()
            .collect();

        Ok(LinkedFileSet {
            files: linked,
            runtime,
            defines,
            immature,
            names,
        })
    }

    fn collect_runtime(order: &[ParsedFile]) -> Result<Vec<GlobalParameter>, LinkError> {
        let mut runtime: Vec<GlobalParameter> = Vec::new();
        for file in order {
            for parameter in &file.runtime {
                if runtime.iter().any(|existing| existing.name == parameter.name) {
                    return Err(link_error(
                        Location::file(&file.identifier),
                        LinkErrorType::DuplicateGlobalParameter(parameter.name.clone()),
                    ));
                }
                runtime.push(GlobalParameter {
                    name: parameter.name.clone(),
                    default: parameter.default,
                });
            }
        }
        Ok(runtime)
    }

    fn collect_defines(order: &[ParsedFile]) -> Result<Vec<(String, String)>, LinkError> {
        let mut defines: Vec<(String, String)> = Vec::new();
        for file in order {
            for define in &file.defines {
                if defines.iter().any(|(name, _)| *name == define.name) {
                    return Err(link_error(
                        Location::file(&file.identifier),
                        LinkErrorType::DuplicateGlobalParameter(define.name.clone()),
                    ));
                }
                defines.push((define.name.clone(), define.replacement.clone()));
            }
        }
        Ok(defines)
    }

    fn assign_symbols(
        file: &ParsedFile,
        linked: &[LinkedFile],
        global_characters: &HashSet<char>,
        is_origin: bool,
        next_private: &mut u32,
    ) -> Result<HashMap<char, Symbol>, LinkError> {
        let mut symbols = HashMap::new();

        for include in &file.includes {
            let location = Location::line(&file.identifier, include.line);
            let exporter = linked
                .iter()
                .find(|linked| linked.parsed.identifier == include.identifier)
                .ok_or_else(|| link_error(location.clone(), LinkErrorType::LinkOrder(include.identifier.clone())))?;
            for (name, c) in &include.imports {
                let symbol = exporter
                    .parsed
                    .exported(name)
                    .and_then(|exported| exporter.symbol(exported))
                    .ok_or_else(|| {
                        link_error(
                            location.clone(),
                            LinkErrorType::MissingExport {
                                name: name.clone(),
                                file: include.identifier.clone(),
                            },
                        )
                    })?;
                symbols.insert(*c, symbol);
            }
        }

        for &c in &file.symbols {
            if symbols.contains_key(&c) {
                continue;
            }
            let symbol = if file.global_symbols.contains(&c) || (is_origin && !global_characters.contains(&c)) {
                Symbol::from_char(c)
            } else {
                *next_private += 1;
                Symbol(*next_private - 1)
            };
            symbols.insert(c, symbol);
        }
        Ok(symbols)
    }

    pub fn file(&self, identifier: &str) -> Option<&LinkedFile> {
        self.files.iter().find(|file| file.parsed.identifier == identifier)
    }

    // Linking always places the origin last
    pub fn origin(&self) -> &LinkedFile {
        &self.files[self.files.len() - 1]
    }
}

/// Links `origin` and everything it includes, then parses and freezes every
/// rule into a [`CompiledGrammar`].
pub fn compile(files: &FileSet, origin: &str, options: &CompileOptions) -> Result<CompiledGrammar, LSystemError> {
    let linked = LinkedFileSet::link(files, origin)?;

    let defines: Vec<(String, String)> = linked
        .defines
        .iter()
        .map(|(name, replacement)| {
            let value = options.overrides.get(name).unwrap_or(replacement);
            (name.clone(), value.clone())
        })
        .collect();
    let define_lookup: HashMap<String, String> = defines.iter().cloned().collect();
    let custom = CustomRuleSymbols::resolve(&linked, &define_lookup)?;

    let substitute = |text: &str| substitute_defines(text, defines.iter().map(|(name, value)| (name.as_str(), value.as_str())));
    let substitute = &substitute;
    let global_names: Vec<String> = linked.runtime.iter().map(|parameter| parameter.name.clone()).collect();
    let global_names = &global_names;

    let parsed_rules = linked.files.iter().enumerate().flat_map(move |(index, file)| {
        let identifier = file.parsed.identifier.as_str();
        let remap = move |c: char| file.symbol(c);
        file.parsed.rule_lines.iter().map(move |line| {
            parse_rule(&substitute(&line.text), &remap, global_names)
                .map(|mut rule| {
                    rule.file = index;
                    rule.location = Location::line(identifier, line.line);
                    rule
                })
                .map_err(|error| error.offset(line.column).at(identifier, line.line))
        })
    });
    let (rules, mut errors): (Vec<ParsedRule>, SyntaxErrors) = parsed_rules.partition_map(|rule| match rule {
        Ok(rule) => Either::Left(rule),
        Err(error) => Either::Right(error),
    });

    let origin_file = linked.origin();
    let mut axiom = SymbolString::new();
    if let Some(line) = origin_file.parsed.axiom.as_ref() {
        match parse_symbol_string(&substitute(&line.text), &|c| origin_file.symbol(c)) {
            Ok(symbols) => axiom = symbols,
            Err(error) => errors.push(error.offset(line.column).at(origin, line.line)),
        }
    }

    if !errors.is_empty() {
        return Err(LSystemError::Syntax(errors));
    }

    for (index, file) in linked.files.iter().enumerate() {
        let count = rules.iter().filter(|rule| rule.file == index).count();
        debug!("{}: {} rules", file.parsed.identifier, count);
    }

    let contextual = linked.files.iter().map(LinkedFile::contextual_symbols).collect();
    let table = RuleTable::build(rules, contextual)?;

    Ok(CompiledGrammar::new(table, axiom, linked, custom, options.step.clone()))
}
