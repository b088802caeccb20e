use super::SyntaxErrorType::UndeclaredSymbol;
use super::{ParsedFile, SyntaxError, SyntaxErrors};
use crate::error_handling::Location;

fn get_undeclared_references(file: &ParsedFile) -> SyntaxErrors {
    // Every character a directive mentions has to be part of the alphabet.
    // Repeats on the same line are reported once
    let mut seen: Vec<(char, usize)> = Vec::new();
    file.references
        .iter()
        .filter(|(c, _)| !file.declares(*c))
        .filter(|reference| {
            let repeated = seen.contains(reference);
            seen.push(**reference);
            !repeated
        })
        .map(|(c, line)| SyntaxError {
            location: Location::line(&file.identifier, *line),
            error: UndeclaredSymbol(*c),
        })
        .collect()
}

pub fn verify_symbols(file: &ParsedFile) -> SyntaxErrors {
    let mut errors = Vec::new();

    errors.extend(get_undeclared_references(file));

    errors
}
