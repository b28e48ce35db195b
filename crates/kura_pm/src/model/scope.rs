use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Named partition of a build's dependencies.
///
/// Each scope is valid as a source scope (a place code lives), as a dependency
/// scope (a place dependencies are declared), or both. Some scopes also
/// include others: a `test` classpath sees every `compile` and `runtime`
/// dependency as well.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Compile,
    Runtime,
    Test,
    Build,
    Site,
    Import,
    Assimilate,
    System,
}

impl Scope {
    pub const ALL: [Scope; 8] = [
        Scope::Compile,
        Scope::Runtime,
        Scope::Test,
        Scope::Build,
        Scope::Site,
        Scope::Import,
        Scope::Assimilate,
        Scope::System,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Scope::Compile => "compile",
            Scope::Runtime => "runtime",
            Scope::Test => "test",
            Scope::Build => "build",
            Scope::Site => "site",
            Scope::Import => "import",
            Scope::Assimilate => "assimilate",
            Scope::System => "system",
        }
    }

    pub const fn is_valid_source_scope(self) -> bool {
        matches!(self, Scope::Compile | Scope::Test | Scope::Site)
    }

    pub const fn is_valid_dependency_scope(self) -> bool {
        !matches!(self, Scope::Site)
    }

    /// Scopes whose declarations are consumed before solving and never reach a
    /// classpath.
    pub const fn is_preprocessing(self) -> bool {
        matches!(self, Scope::Import | Scope::Assimilate)
    }

    /// Returns true when dependencies declared in `other` are visible when
    /// solving `self`.
    pub fn includes(self, other: Scope) -> bool {
        if self == other {
            return true;
        }
        match self {
            Scope::Compile => matches!(other, Scope::System),
            Scope::Runtime => matches!(other, Scope::Compile | Scope::System),
            Scope::Test => matches!(other, Scope::Compile | Scope::Runtime | Scope::System),
            _ => false,
        }
    }

    pub fn variants() -> &'static [&'static str] {
        &[
            "compile",
            "runtime",
            "test",
            "build",
            "site",
            "import",
            "assimilate",
            "system",
        ]
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown scope '{value}' (available: {available:?})")]
pub struct ScopeParseError {
    pub value: String,
    pub available: &'static [&'static str],
}

impl FromStr for Scope {
    type Err = ScopeParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            // `provided` artifacts are needed to compile but are supplied at run time.
            "compile" | "provided" => Ok(Scope::Compile),
            "runtime" => Ok(Scope::Runtime),
            "test" => Ok(Scope::Test),
            "build" => Ok(Scope::Build),
            "site" => Ok(Scope::Site),
            "import" => Ok(Scope::Import),
            "assimilate" => Ok(Scope::Assimilate),
            "system" => Ok(Scope::System),
            _ => Err(ScopeParseError {
                value: value.to_string(),
                available: Scope::variants(),
            }),
        }
    }
}
