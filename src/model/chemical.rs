//! Chemical species
//!
//! A chemical is a name plus an output-visibility flag. Chemicals are
//! global to the model; each compartment type keeps its own ordered list
//! of the chemicals that exist inside compartments of that type.

use serde::{Deserialize, Serialize};

/// Index of a chemical in the model's global chemical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChemicalId(pub u32);

/// A chemical species. Immutable once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chemical {
    name: String,
    output: bool,
}

impl Chemical {
    pub fn new(name: impl Into<String>, output: bool) -> Self {
        Self {
            name: name.into(),
            output,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Should this chemical appear in output records?
    pub fn is_output(&self) -> bool {
        self.output
    }
}
