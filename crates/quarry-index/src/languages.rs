//! Language detection, tree-sitter grammars and the chunk-type taxonomy.
//!
//! Everything here is data: adding a language means adding table rows,
//! not new chunking code.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Supported language with its tree-sitter grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
    Bash,
    Toml,
    Json,
    Markdown,
}

/// Normalized kind of a chunk, shared across languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkType {
    Function,
    Method,
    Class,
    Interface,
    Type,
    Enum,
    Struct,
    Union,
    Namespace,
    Impl,
    Trait,
    Module,
    Macro,
    Constructor,
    Destructor,
    Property,
    Event,
    Template,
    Annotation,
    Variable,
    Define,
    Block,
    File,
}

impl ChunkType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Method => "method",
            Self::Class => "class",
            Self::Interface => "interface",
            Self::Type => "type",
            Self::Enum => "enum",
            Self::Struct => "struct",
            Self::Union => "union",
            Self::Namespace => "namespace",
            Self::Impl => "impl",
            Self::Trait => "trait",
            Self::Module => "module",
            Self::Macro => "macro",
            Self::Constructor => "constructor",
            Self::Destructor => "destructor",
            Self::Property => "property",
            Self::Event => "event",
            Self::Template => "template",
            Self::Annotation => "annotation",
            Self::Variable => "variable",
            Self::Define => "define",
            Self::Block => "block",
            Self::File => "file",
        }
    }

    /// Containers whose function-typed children are methods.
    #[must_use]
    pub fn holds_methods(self) -> bool {
        matches!(
            self,
            Self::Class | Self::Struct | Self::Impl | Self::Trait | Self::Interface | Self::Enum
        )
    }
}

impl std::fmt::Display for ChunkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fields probed, in order, for a node's declared name.
/// tree-sitter-rust: `impl_item` uses "type", most others use "name".
pub const NAME_FIELDS: &[&str] = &["name", "type"];

/// Method names that mark constructors inside a class-like container.
pub const CONSTRUCTOR_NAMES: &[&str] = &["constructor", "__init__", "new"];

/// Method names that mark destructors inside a class-like container.
pub const DESTRUCTOR_NAMES: &[&str] = &["__del__", "drop"];

const RUST_KINDS: &[(&str, ChunkType)] = &[
    ("function_item", ChunkType::Function),
    ("function_signature_item", ChunkType::Function),
    ("struct_item", ChunkType::Struct),
    ("enum_item", ChunkType::Enum),
    ("union_item", ChunkType::Union),
    ("trait_item", ChunkType::Trait),
    ("impl_item", ChunkType::Impl),
    ("type_item", ChunkType::Type),
    ("const_item", ChunkType::Variable),
    ("static_item", ChunkType::Variable),
    ("macro_definition", ChunkType::Macro),
    ("mod_item", ChunkType::Module),
];

const PYTHON_KINDS: &[(&str, ChunkType)] = &[
    ("function_definition", ChunkType::Function),
    ("class_definition", ChunkType::Class),
];

const JAVASCRIPT_KINDS: &[(&str, ChunkType)] = &[
    ("function_declaration", ChunkType::Function),
    ("generator_function_declaration", ChunkType::Function),
    ("class_declaration", ChunkType::Class),
    ("method_definition", ChunkType::Method),
];

const TYPESCRIPT_KINDS: &[(&str, ChunkType)] = &[
    ("function_declaration", ChunkType::Function),
    ("generator_function_declaration", ChunkType::Function),
    ("class_declaration", ChunkType::Class),
    ("abstract_class_declaration", ChunkType::Class),
    ("method_definition", ChunkType::Method),
    ("interface_declaration", ChunkType::Interface),
    ("type_alias_declaration", ChunkType::Type),
    ("enum_declaration", ChunkType::Enum),
    ("internal_module", ChunkType::Namespace),
];

const GO_KINDS: &[(&str, ChunkType)] = &[
    ("function_declaration", ChunkType::Function),
    ("method_declaration", ChunkType::Method),
    ("type_spec", ChunkType::Type),
    ("const_spec", ChunkType::Variable),
];

const BASH_KINDS: &[(&str, ChunkType)] = &[("function_definition", ChunkType::Function)];

const EXTENSIONS: &[(&str, Lang)] = &[
    ("rs", Lang::Rust),
    ("py", Lang::Python),
    ("pyi", Lang::Python),
    ("js", Lang::JavaScript),
    ("jsx", Lang::JavaScript),
    ("mjs", Lang::JavaScript),
    ("cjs", Lang::JavaScript),
    ("ts", Lang::TypeScript),
    ("tsx", Lang::TypeScript),
    ("mts", Lang::TypeScript),
    ("cts", Lang::TypeScript),
    ("go", Lang::Go),
    ("sh", Lang::Bash),
    ("bash", Lang::Bash),
    ("zsh", Lang::Bash),
    ("toml", Lang::Toml),
    ("json", Lang::Json),
    ("jsonc", Lang::Json),
    ("md", Lang::Markdown),
    ("markdown", Lang::Markdown),
];

impl Lang {
    /// Identifier used in persisted chunk records and config.
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Go => "go",
            Self::Bash => "bash",
            Self::Toml => "toml",
            Self::Json => "json",
            Self::Markdown => "markdown",
        }
    }

    /// Get the tree-sitter grammar. Returns `None` if the
    /// corresponding feature is not enabled.
    #[must_use]
    pub fn grammar(self) -> Option<tree_sitter::Language> {
        match self {
            #[cfg(feature = "lang-rust")]
            Self::Rust => Some(tree_sitter_rust::LANGUAGE.into()),
            #[cfg(feature = "lang-python")]
            Self::Python => Some(tree_sitter_python::LANGUAGE.into()),
            #[cfg(feature = "lang-js")]
            Self::JavaScript => Some(tree_sitter_javascript::LANGUAGE.into()),
            #[cfg(feature = "lang-js")]
            Self::TypeScript => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
            #[cfg(feature = "lang-go")]
            Self::Go => Some(tree_sitter_go::LANGUAGE.into()),
            #[cfg(feature = "lang-config")]
            Self::Bash => Some(tree_sitter_bash::LANGUAGE.into()),
            #[cfg(feature = "lang-config")]
            Self::Toml => Some(tree_sitter_toml_ng::LANGUAGE.into()),
            #[cfg(feature = "lang-config")]
            Self::Json => Some(tree_sitter_json::LANGUAGE.into()),
            #[cfg(feature = "lang-config")]
            Self::Markdown => Some(tree_sitter_md::LANGUAGE.into()),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    /// Grammar node kinds that become chunks, with their normalized type.
    /// Config and markup languages have none and chunk as whole files.
    #[must_use]
    pub fn chunk_kinds(self) -> &'static [(&'static str, ChunkType)] {
        match self {
            Self::Rust => RUST_KINDS,
            Self::Python => PYTHON_KINDS,
            Self::JavaScript => JAVASCRIPT_KINDS,
            Self::TypeScript => TYPESCRIPT_KINDS,
            Self::Go => GO_KINDS,
            Self::Bash => BASH_KINDS,
            Self::Toml | Self::Json | Self::Markdown => &[],
        }
    }

    /// Chunk type for a grammar node kind, if it is a chunk boundary.
    #[must_use]
    pub fn chunk_type_of(self, kind: &str) -> Option<ChunkType> {
        self.chunk_kinds()
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, t)| *t)
    }
}

impl std::fmt::Display for Lang {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Detect language from file extension.
#[must_use]
pub fn detect_language(path: &Path) -> Option<Lang> {
    let ext = path.extension()?.to_str()?;
    EXTENSIONS
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, lang)| *lang)
}

/// Check if a file should be indexed (has a supported language with grammar).
#[must_use]
pub fn is_indexable(path: &Path) -> bool {
    detect_language(path).and_then(Lang::grammar).is_some()
}
