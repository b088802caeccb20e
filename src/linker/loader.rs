use std::collections::VecDeque;
use std::path::Path;

use tracing::debug;

use super::{is_builtin_library, is_library_path, FileSet};
use crate::error_handling::Location;
use crate::parser::{FileResult, ParsedFile, SyntaxError, SyntaxErrorType, SyntaxErrors};

fn io_error(error: std::io::Error, identifier: &str) -> SyntaxError {
    SyntaxError {
        location: Location::file(identifier),
        error: SyntaxErrorType::FileError(error.to_string()),
    }
}

impl FileSet {
    /// Reads `origin` and every file it includes, directly or through other
    /// includes. Errors from all files are reported together.
    pub fn load(origin: impl AsRef<Path>) -> FileResult<FileSet> {
        let mut files = FileSet::new();
        let mut errors: SyntaxErrors = Vec::new();
        let mut queue = VecDeque::from([origin.as_ref().to_string_lossy().into_owned()]);

        while let Some(identifier) = queue.pop_front() {
            if files.contains(&identifier) || is_builtin_library(&identifier) {
                continue;
            }
            let text = match std::fs::read_to_string(&identifier) {
                Ok(text) => text,
                Err(error) => {
                    errors.push(io_error(error, &identifier));
                    continue;
                }
            };

            match ParsedFile::parse(&identifier, &text, is_library_path(&identifier)) {
                Ok(file) => {
                    debug!("loaded {} with {} rule lines", identifier, file.rule_lines.len());
                    queue.extend(file.includes.iter().map(|include| include.identifier.clone()));
                    files.insert(file);
                }
                Err(file_errors) => errors.extend(file_errors),
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }
        Ok(files)
    }
}
