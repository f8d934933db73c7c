// Decompiler configuration
use crate::decompiler::passes::PassRegistry;
use anyhow::{Context, Result};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use thiserror::Error;

/// Passes run when the configuration does not name any.
pub const DEFAULT_PASSES: &[&str] = &[
    "stack-recovery",
    "merge-returns",
    "type-inference",
    "dead-code",
    "coalesce-variables",
    "resolve-calls",
    "structure",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecompilerConfig {
    pub pipeline: PipelineConfig,
    /// Worker threads for per-function work (1 = run on the calling thread)
    pub threads: usize,
    pub emitter: EmitterConfig,
    pub abi: Abi,
}

impl Default for DecompilerConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            threads: 1,
            emitter: EmitterConfig::default(),
            abi: Abi::default(),
        }
    }
}

impl DecompilerConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_json_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let config: DecompilerConfig =
            serde_json::from_str(content).context("Invalid decompiler configuration")?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).context("Failed to create config directory")?;
            }
        }
        let content = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    /// Check pass options against the option schemas of `registry`.
    ///
    /// Unknown pass names are left alone here: the pipeline reports them as
    /// `UnknownPass` when it is constructed.
    pub fn validate(&self, registry: &PassRegistry) -> Result<(), ConfigError> {
        if self.threads == 0 {
            return Err(ConfigError::InvalidThreads);
        }
        for spec in self.pipeline.passes.iter() {
            let Some(descriptor) = registry.descriptor(&spec.name) else {
                continue;
            };
            for (key, value) in spec.options.iter() {
                let Some(option) = descriptor.options.iter().find(|o| o.name == key) else {
                    return Err(ConfigError::UnknownOption {
                        pass: spec.name.clone(),
                        option: key.clone(),
                        known: descriptor
                            .options
                            .iter()
                            .map(|o| o.name)
                            .collect::<Vec<_>>()
                            .join(", "),
                    });
                };
                if value.kind() != option.kind {
                    return Err(ConfigError::InvalidOptionType {
                        pass: spec.name.clone(),
                        option: key.clone(),
                        expected: option.kind,
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Pass `{pass}` has no option `{option}` (known options: [{known}])")]
    UnknownOption {
        pass: String,
        option: String,
        known: String,
    },
    #[error("Option `{option}` of pass `{pass}` must be a {expected}")]
    InvalidOptionType {
        pass: String,
        option: String,
        expected: OptionKind,
    },
    #[error("`threads` must be at least 1")]
    InvalidThreads,
}

/// Register conventions of the decoded architecture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Abi {
    pub stack_pointer: String,
    pub frame_pointer: String,
    pub return_register: String,
    /// Size of a stack slot and of the return value in bytes
    pub word_size: u8,
    /// Registers a callee saves and restores through the stack
    pub callee_saved: Vec<String>,
}

impl Default for Abi {
    fn default() -> Self {
        Self {
            stack_pointer: "esp".to_string(),
            frame_pointer: "ebp".to_string(),
            return_register: "eax".to_string(),
            word_size: 4,
            callee_saved: ["ebx", "esi", "edi", "ebp"]
                .iter()
                .map(|r| r.to_string())
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeclarationPlacement {
    /// All locals at the top of the function body
    Top,
    /// Each local right before the first top-level statement that uses it
    FirstUse,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EmitterConfig {
    pub declarations: DeclarationPlacement,
    /// Spaces per nesting level
    pub indent: usize,
    /// Annotate every block with its address range
    pub show_addresses: bool,
}

impl Default for EmitterConfig {
    fn default() -> Self {
        Self {
            declarations: DeclarationPlacement::Top,
            indent: 4,
            show_addresses: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Bool,
    Int,
    Str,
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionKind::Bool => f.write_str("boolean"),
            OptionKind::Int => f.write_str("integer"),
            OptionKind::Str => f.write_str("string"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl OptionValue {
    pub fn kind(&self) -> OptionKind {
        match self {
            OptionValue::Bool(_) => OptionKind::Bool,
            OptionValue::Int(_) => OptionKind::Int,
            OptionValue::Str(_) => OptionKind::Str,
        }
    }
}

/// Per-pass key/value options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PassOptions(BTreeMap<String, OptionValue>);

impl PassOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: OptionValue) -> Self {
        self.0.insert(key.to_string(), value);
        self
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.0.get(key) {
            Some(OptionValue::Bool(b)) => *b,
            _ => default,
        }
    }

    pub fn get_int(&self, key: &str, default: i64) -> i64 {
        match self.0.get(key) {
            Some(OptionValue::Int(i)) => *i,
            _ => default,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OptionValue)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassSpec {
    pub name: String,
    pub options: PassOptions,
}

impl PassSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            options: PassOptions::new(),
        }
    }

    pub fn with_options(name: &str, options: PassOptions) -> Self {
        Self {
            name: name.to_string(),
            options,
        }
    }
}

/// Ordered list of passes.
///
/// Serialized as a JSON object whose keys are pass identifiers in execution order, e.g.
/// `{"stack-recovery": {}, "type-inference": {"widen-small-ints": true}}`. Document
/// order is preserved and a pass may appear more than once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    pub passes: Vec<PassSpec>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_names(DEFAULT_PASSES)
    }
}

impl PipelineConfig {
    pub fn from_names(names: &[&str]) -> Self {
        Self {
            passes: names.iter().map(|n| PassSpec::new(n)).collect(),
        }
    }

    pub fn names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name.as_str()).collect()
    }
}

impl Serialize for PipelineConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.passes.len()))?;
        for spec in self.passes.iter() {
            map.serialize_entry(&spec.name, &spec.options)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for PipelineConfig {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct PipelineVisitor;

        impl<'de> Visitor<'de> for PipelineVisitor {
            type Value = PipelineConfig;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("an object mapping pass identifiers to option objects")
            }

            fn visit_map<A: MapAccess<'de>>(
                self,
                mut access: A,
            ) -> std::result::Result<Self::Value, A::Error> {
                let mut passes: Vec<PassSpec> = Vec::with_capacity(access.size_hint().unwrap_or(8));
                while let Some((name, options)) = access.next_entry::<String, PassOptions>()? {
                    passes.push(PassSpec { name, options });
                }
                Ok(PipelineConfig { passes })
            }
        }

        deserializer.deserialize_map(PipelineVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_keeps_document_order() {
        let config = DecompilerConfig::from_json_str(
            r#"{"pipeline": {"structure": {}, "stack-recovery": {}, "dead-code": {}, "stack-recovery": {}}}"#,
        )
        .expect("valid config");
        assert_eq!(
            config.pipeline.names(),
            vec!["structure", "stack-recovery", "dead-code", "stack-recovery"]
        );
    }

    #[test]
    fn test_options_parse_typed_values() {
        let config = DecompilerConfig::from_json_str(
            r#"{"pipeline": {"type-inference": {"widen-small-ints": true}}, "threads": 4}"#,
        )
        .expect("valid config");
        assert_eq!(config.threads, 4);
        let spec = &config.pipeline.passes[0];
        assert!(spec.options.get_bool("widen-small-ints", false));
        assert!(!spec.options.get_bool("missing", false));
    }

    #[test]
    fn test_unknown_top_level_key_rejected() {
        let result = DecompilerConfig::from_json_str(r#"{"pipelines": {}}"#);
        assert!(result.is_err(), "misspelled key must be rejected");
    }

    #[test]
    fn test_defaults_and_roundtrip() {
        let config = DecompilerConfig::default();
        assert_eq!(config.pipeline.names(), DEFAULT_PASSES.to_vec());
        let text = serde_json::to_string(&config).expect("serialize");
        let back = DecompilerConfig::from_json_str(&text).expect("parse back");
        assert_eq!(config, back);
    }

    #[test]
    fn test_validate_rejects_unknown_option() {
        let registry = PassRegistry::with_builtin_passes();
        let config = DecompilerConfig::from_json_str(
            r#"{"pipeline": {"type-inference": {"widen-everything": true}}}"#,
        )
        .expect("syntactically valid");
        match config.validate(&registry) {
            Err(ConfigError::UnknownOption { pass, option, .. }) => {
                assert_eq!(pass, "type-inference");
                assert_eq!(option, "widen-everything");
            }
            other => panic!("expected UnknownOption, got {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_mistyped_option() {
        let registry = PassRegistry::with_builtin_passes();
        let config = DecompilerConfig::from_json_str(
            r#"{"pipeline": {"dead-code": {"remove-unreachable": "yes"}}}"#,
        )
        .expect("syntactically valid");
        assert!(matches!(
            config.validate(&registry),
            Err(ConfigError::InvalidOptionType { .. })
        ));
    }
}
