//! Decoded inbound messages, tagged with the module that handles them.

use std::fmt;

use serde_json::Value;

/// Domain a decoded message belongs to. Each module has exactly one handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Module {
    Direct,
    Live,
    Iris,
    Graphql,
    RegionHint,
}

impl Module {
    pub const fn name(self) -> &'static str {
        match self {
            Module::Direct => "direct",
            Module::Live => "live",
            Module::Iris => "iris",
            Module::Graphql => "graphql",
            Module::RegionHint => "region_hint",
        }
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One parsed unit of inbound data.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub module: Module,
    pub data: Value,
}

impl Message {
    pub fn new(module: Module, data: Value) -> Self {
        Self { module, data }
    }
}
