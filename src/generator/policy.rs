use std::fmt::Debug;

use crate::grammar::Symbol;
use crate::linker::CustomRuleSymbols;

/// Decides whether a symbol no rule matched carries its parameters into the
/// next generation.
pub trait ParameterPassthrough: Debug + Send + Sync {
    fn keeps_parameters(&self, symbol: Symbol) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct KeepAllParameters;

impl ParameterPassthrough for KeepAllParameters {
    fn keeps_parameters(&self, _symbol: Symbol) -> bool {
        true
    }
}

/// Drops the parameters of the diffusion amount symbol. The diffusion
/// simulation rewrites those values itself between steps unless it was
/// configured to run independently.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffusionPassthrough {
    dropped: Option<Symbol>,
}

impl DiffusionPassthrough {
    pub fn new(custom: &CustomRuleSymbols) -> Self {
        let dropped = custom
            .diffusion
            .filter(|_| !custom.independent_diffusion_update)
            .map(|diffusion| diffusion.amount);
        DiffusionPassthrough { dropped }
    }
}

impl ParameterPassthrough for DiffusionPassthrough {
    fn keeps_parameters(&self, symbol: Symbol) -> bool {
        self.dropped != Some(symbol)
    }
}
