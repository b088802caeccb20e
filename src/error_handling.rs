use std::fmt::{Debug, Display};
use std::ops::Range;

use itertools::Itertools;

use crate::linker::LinkError;
use crate::parser::SyntaxErrors;
use crate::rules::InvariantViolation;

pub trait ErrorType: Display + Debug + PartialEq {}

#[derive(Debug, PartialEq, Clone, Default)]
pub struct Location {
    pub file: String,
    pub line: usize,
    // Character offsets within the line
    pub span: Option<Range<usize>>,
}

impl Location {
    pub fn file(file: &str) -> Self {
        Location {
            file: file.to_string(),
            line: 0,
            span: None,
        }
    }

    pub fn line(file: &str, line: usize) -> Self {
        Location {
            file: file.to_string(),
            line,
            span: None,
        }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.line, &self.span) {
            (0, _) => write!(f, "{}", self.file),
            (line, None) => write!(f, "{}:{}", self.file, line),
            (line, Some(span)) => write!(f, "{}:{}:{}", self.file, line, span.start + 1),
        }
    }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Error<T: ErrorType> {
    pub location: Location,
    pub error: T,
}

impl<T: ErrorType> Display for Error<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "\x1b[31;49;1m[{}]\x1b[39;49;1m  {}\x1b[0m", self.location, self.error)
    }
}

impl<T: ErrorType> std::error::Error for Error<T> {}

pub type Errors<T> = Vec<Error<T>>;

/// An error kind tied to a character range of the text that produced it.
///
/// Parsers working on a slice of a line report spans relative to that slice;
/// callers shift them with [`Spanned::offset`] until they are relative to the
/// whole line, then pin them to a file with [`Spanned::at`].
#[derive(Debug, PartialEq, Clone)]
pub struct Spanned<T> {
    pub error: T,
    pub span: Range<usize>,
}

impl<T: ErrorType> Spanned<T> {
    pub fn new(error: T, span: Range<usize>) -> Self {
        Spanned { error, span }
    }

    pub fn offset(self, by: usize) -> Self {
        Spanned {
            error: self.error,
            span: (self.span.start + by)..(self.span.end + by),
        }
    }

    pub fn at(self, file: &str, line: usize) -> Error<T> {
        Error {
            location: Location {
                file: file.to_string(),
                line,
                span: Some(self.span),
            },
            error: self.error,
        }
    }
}

fn display_all<T: ErrorType>(errors: &Errors<T>) -> String {
    errors.iter().join("\n")
}

/// Everything `compile` or `step` can fail with.
#[derive(Debug, thiserror::Error)]
pub enum LSystemError {
    #[error("{}", display_all(.0))]
    Syntax(SyntaxErrors),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),
}

impl From<SyntaxErrors> for LSystemError {
    fn from(errors: SyntaxErrors) -> Self {
        LSystemError::Syntax(errors)
    }
}
