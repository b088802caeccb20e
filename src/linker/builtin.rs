use std::collections::HashMap;

use super::{LinkError, LinkErrorType, LinkedFileSet};
use crate::error_handling::Location;
use crate::grammar::{Symbol, BRANCH_CLOSE, BRANCH_OPEN};
use crate::parser::ParsedFile;

pub const DIFFUSION: &str = "diffusion";
pub const SUNLIGHT: &str = "sunlight";
pub const IDENTIFIERS: &str = "identifiers";

// Defines the linker reads for itself
pub const DIFFUSION_STEPS_DEFINE: &str = "diffusionStepsPerStep";
pub const INDEPENDENT_DIFFUSION_DEFINE: &str = "independentDiffusionStep";

// Synthesized sources of the libraries an include can name directly
const BUILTIN_LIBRARIES: [(&str, &str); 3] = [
    (DIFFUSION, "#symbols na\n#export node n\n#export amount a\n"),
    (SUNLIGHT, "#symbols s\n#export sunlight s\n"),
    (IDENTIFIERS, "#symbols i\n#export identifier i\n"),
];

pub fn is_builtin_library(name: &str) -> bool {
    BUILTIN_LIBRARIES.iter().any(|(builtin, _)| *builtin == name)
}

pub fn builtin_library(name: &str) -> Option<ParsedFile> {
    let (_, source) = BUILTIN_LIBRARIES.iter().find(|(builtin, _)| *builtin == name)?;
    ParsedFile::parse(name, source, true).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffusionSymbols {
    pub node: Symbol,
    pub amount: Symbol,
}

/// Symbols the outer simulation layers treat specially, resolved from the
/// builtin libraries that were linked in.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomRuleSymbols {
    pub branch_open: Symbol,
    pub branch_close: Symbol,
    pub diffusion: Option<DiffusionSymbols>,
    pub diffusion_steps_per_step: u32,
    pub independent_diffusion_update: bool,
    pub sunlight: Option<Symbol>,
    pub identifier: Option<Symbol>,
}

impl Default for CustomRuleSymbols {
    fn default() -> Self {
        CustomRuleSymbols {
            branch_open: BRANCH_OPEN,
            branch_close: BRANCH_CLOSE,
            diffusion: None,
            diffusion_steps_per_step: 1,
            independent_diffusion_update: false,
            sunlight: None,
            identifier: None,
        }
    }
}

fn bad_parameter(name: &str, value: &str) -> LinkError {
    LinkError {
        location: Location::default(),
        error: LinkErrorType::BadGlobalParameter {
            name: name.to_string(),
            value: value.to_string(),
        },
    }
}

impl CustomRuleSymbols {
    /// Reads the linked builtin libraries and the reserved defines.
    pub fn resolve(linked: &LinkedFileSet, defines: &HashMap<String, String>) -> Result<Self, LinkError> {
        let mut custom = CustomRuleSymbols::default();

        if let Some(diffusion) = linked.file(DIFFUSION) {
            custom.diffusion = diffusion
                .symbol('n')
                .zip(diffusion.symbol('a'))
                .map(|(node, amount)| DiffusionSymbols { node, amount });
        }
        custom.sunlight = linked.file(SUNLIGHT).and_then(|file| file.symbol('s'));
        custom.identifier = linked.file(IDENTIFIERS).and_then(|file| file.symbol('i'));

        if custom.sunlight.is_some() && custom.identifier.is_none() {
            return Err(LinkError {
                location: Location::file(&linked.origin().parsed.identifier),
                error: LinkErrorType::InvalidCustomSymbolConfiguration(format!(
                    "`{}` needs `{}` to be included as well",
                    SUNLIGHT, IDENTIFIERS
                )),
            });
        }

        if let Some(value) = defines.get(DIFFUSION_STEPS_DEFINE) {
            custom.diffusion_steps_per_step = value
                .trim()
                .parse()
                .map_err(|_| bad_parameter(DIFFUSION_STEPS_DEFINE, value))?;
        }
        if let Some(value) = defines.get(INDEPENDENT_DIFFUSION_DEFINE) {
            custom.independent_diffusion_update = match value.trim() {
                "true" => true,
                "false" => false,
                _ => return Err(bad_parameter(INDEPENDENT_DIFFUSION_DEFINE, value)),
            };
        }

        Ok(custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_sources_parse() {
        for (name, _) in BUILTIN_LIBRARIES {
            let library = builtin_library(name).unwrap();
            assert!(library.is_library);
            assert!(!library.exports.is_empty());
        }
        assert!(builtin_library("leaves.lsyslib").is_none());
        assert!(is_builtin_library("diffusion"));
        assert!(!is_builtin_library("diffusion.lsyslib"));
    }
}
