//! Compiled artifact descriptors and argument encoding.
//!
//! Hardhat (`artifacts/**/Name.json`, bytecode as a hex string) and Foundry
//! (`out/**/Name.json`, bytecode under `object`) layouts are both understood.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use alloy_core::{
    dyn_abi::{DynSolType, DynSolValue, JsonAbiExt, Specifier},
    json_abi::{JsonAbi, Param},
    primitives::{Address, Bytes},
};
use anyhow::Context;
use serde::Deserialize;
use serde_json::Value;

use crate::error::ConfigurationError;

/// The conventional initializer entry point of upgradeable artifacts.
pub const DEFAULT_INITIALIZER: &str = "initialize";

/// Compiler input needed to publish an artifact's source.
#[derive(Debug, Clone)]
pub struct BuildInfo {
    /// Full compiler version, e.g. `0.8.20+commit.a1b79de6`.
    pub solc_long_version: String,
    /// Standard-JSON compiler input.
    pub input: Value,
}

/// Everything the orchestrator needs to know about a compiled artifact.
#[derive(Debug, Clone)]
pub struct ArtifactDescriptor {
    pub name: String,
    /// Source file the artifact was compiled from, when known.
    pub source_name: Option<String>,
    pub abi: JsonAbi,
    pub bytecode: Bytes,
    pub build_info: Option<BuildInfo>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawBytecode {
    Hex(Bytes),
    Object { object: Bytes },
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawArtifact {
    contract_name: Option<String>,
    source_name: Option<String>,
    abi: JsonAbi,
    bytecode: RawBytecode,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDebugFile {
    build_info: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBuildInfo {
    solc_long_version: String,
    input: Value,
}

impl ArtifactDescriptor {
    pub fn new(name: impl Into<String>, abi: JsonAbi, bytecode: Bytes) -> Self {
        Self {
            name: name.into(),
            source_name: None,
            abi,
            bytecode,
            build_info: None,
        }
    }

    /// Load an artifact file, plus its Hardhat build-info if a `.dbg.json` sits beside it.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read artifact {}", path.display()))?;
        let raw: RawArtifact = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse artifact {}", path.display()))?;

        let name = match raw.contract_name {
            Some(name) => name,
            None => path
                .file_stem()
                .and_then(|s| s.to_str())
                .context("Artifact file name is not valid UTF-8")?
                .to_string(),
        };

        let bytecode = match raw.bytecode {
            RawBytecode::Hex(bytes) | RawBytecode::Object { object: bytes } => bytes,
        };

        let build_info = match Self::load_build_info(path) {
            Ok(info) => info,
            Err(e) => {
                tracing::debug!(artifact = %name, error = %e, "No usable build info");
                None
            }
        };

        Ok(Self {
            name,
            source_name: raw.source_name,
            abi: raw.abi,
            bytecode,
            build_info,
        })
    }

    fn load_build_info(path: &Path) -> anyhow::Result<Option<BuildInfo>> {
        let dbg_path = path.with_extension("dbg.json");
        if !dbg_path.exists() {
            return Ok(None);
        }

        let dbg: RawDebugFile = serde_json::from_str(&std::fs::read_to_string(&dbg_path)?)
            .context("Failed to parse debug file")?;
        let parent = dbg_path.parent().context("Debug file has no parent directory")?;
        let raw: RawBuildInfo =
            serde_json::from_str(&std::fs::read_to_string(parent.join(&dbg.build_info))?)
                .context("Failed to parse build info")?;

        Ok(Some(BuildInfo {
            solc_long_version: raw.solc_long_version,
            input: raw.input,
        }))
    }

    /// Fully qualified name as source-verification services expect it.
    pub fn qualified_name(&self) -> String {
        match &self.source_name {
            Some(source) => format!("{}:{}", source, self.name),
            None => self.name.clone(),
        }
    }

    /// ABI-encode constructor arguments (without the bytecode prefix).
    pub fn encode_constructor_args(&self, args: &[Value]) -> Result<Vec<u8>, ConfigurationError> {
        match &self.abi.constructor {
            Some(constructor) => {
                let values = coerce_args(&self.name, &constructor.inputs, args)?;
                constructor
                    .abi_encode_input(&values)
                    .map_err(|e| self.invalid(e.to_string()))
            }
            None if args.is_empty() => Ok(Vec::new()),
            None => Err(self.invalid(format!(
                "no constructor, but {} argument(s) supplied",
                args.len()
            ))),
        }
    }

    /// Creation code followed by the encoded constructor arguments.
    pub fn creation_code(&self, args: &[Value]) -> Result<Bytes, ConfigurationError> {
        let mut code = self.bytecode.to_vec();
        code.extend(self.encode_constructor_args(args)?);
        Ok(code.into())
    }

    /// Whether the ABI declares a function `name` taking `arity` arguments.
    pub fn has_function(&self, name: &str, arity: usize) -> bool {
        self.abi
            .function(name)
            .is_some_and(|overloads| overloads.iter().any(|f| f.inputs.len() == arity))
    }

    /// ABI-encode a call to `name` with `args`, selecting the overload by arity.
    pub fn encode_call(&self, name: &str, args: &[Value]) -> Result<Bytes, ConfigurationError> {
        let function = self
            .abi
            .function(name)
            .and_then(|overloads| overloads.iter().find(|f| f.inputs.len() == args.len()))
            .ok_or_else(|| ConfigurationError::UnknownInitializer {
                artifact: self.name.clone(),
                name: name.to_string(),
                arity: args.len(),
            })?;

        let values = coerce_args(&self.name, &function.inputs, args)?;
        function
            .abi_encode_input(&values)
            .map(Bytes::from)
            .map_err(|e| self.invalid(e.to_string()))
    }

    fn invalid(&self, reason: String) -> ConfigurationError {
        ConfigurationError::InvalidArgument {
            artifact: self.name.clone(),
            reason,
        }
    }
}

/// Coerce JSON arguments into typed ABI values.
fn coerce_args(
    artifact: &str,
    params: &[Param],
    args: &[Value],
) -> Result<Vec<DynSolValue>, ConfigurationError> {
    let invalid = |reason: String| ConfigurationError::InvalidArgument {
        artifact: artifact.to_string(),
        reason,
    };

    if params.len() != args.len() {
        return Err(invalid(format!(
            "expected {} argument(s), got {}",
            params.len(),
            args.len()
        )));
    }

    params
        .iter()
        .zip(args)
        .map(|(param, arg)| {
            let ty = param
                .resolve()
                .map_err(|e| invalid(format!("parameter `{}`: {}", param.name, e)))?;
            let literal = to_sol_literal(arg, &ty)
                .ok_or_else(|| invalid(format!("parameter `{}`: unsupported value {}", param.name, arg)))?;
            ty.coerce_str(&literal)
                .map_err(|e| invalid(format!("parameter `{}`: {}", param.name, e)))
        })
        .collect()
}

/// Render a JSON value as the textual literal the ABI coercer understands.
fn to_sol_literal(value: &Value, ty: &DynSolType) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Array(items) => {
            let (open, close, inner): (&str, &str, Vec<&DynSolType>) = match ty {
                DynSolType::Tuple(types) if types.len() == items.len() => {
                    ("(", ")", types.iter().collect())
                }
                DynSolType::Array(inner) | DynSolType::FixedArray(inner, _) => {
                    ("[", "]", vec![inner.as_ref(); items.len()])
                }
                _ => return None,
            };
            let parts = items
                .iter()
                .zip(inner)
                .map(|(item, ty)| to_sol_literal(item, ty))
                .collect::<Option<Vec<_>>>()?;
            Some(format!("{}{}{}", open, parts.join(","), close))
        }
        Value::Null | Value::Object(_) => None,
    }
}

/// If `arg` is a `"${Name}"` reference, return `Name`.
pub fn address_reference(arg: &Value) -> Option<&str> {
    arg.as_str()?
        .strip_prefix("${")?
        .strip_suffix('}')
        .filter(|name| !name.is_empty())
}

/// Replace every `"${Name}"` reference in `args` (recursively) using `lookup`.
pub fn resolve_references(
    artifact: &str,
    args: &[Value],
    lookup: &impl Fn(&str) -> Option<Address>,
) -> Result<Vec<Value>, ConfigurationError> {
    args.iter()
        .map(|arg| resolve_reference(artifact, arg, lookup))
        .collect()
}

fn resolve_reference(
    artifact: &str,
    arg: &Value,
    lookup: &impl Fn(&str) -> Option<Address>,
) -> Result<Value, ConfigurationError> {
    if let Some(reference) = address_reference(arg) {
        return lookup(reference)
            .map(|address| Value::String(address.to_checksum(None)))
            .ok_or_else(|| ConfigurationError::UnresolvedReference {
                artifact: artifact.to_string(),
                reference: reference.to_string(),
            });
    }

    match arg {
        Value::Array(items) => Ok(Value::Array(resolve_references(artifact, items, lookup)?)),
        other => Ok(other.clone()),
    }
}

/// Artifact descriptors indexed by name.
#[derive(Debug, Clone, Default)]
pub struct ArtifactStore {
    artifacts: BTreeMap<String, ArtifactDescriptor>,
}

impl ArtifactStore {
    pub fn from_descriptors(descriptors: impl IntoIterator<Item = ArtifactDescriptor>) -> Self {
        Self {
            artifacts: descriptors
                .into_iter()
                .map(|descriptor| (descriptor.name.clone(), descriptor))
                .collect(),
        }
    }

    /// Index every artifact below `dir`.
    ///
    /// Debug files, build-info and files without an ABI and bytecode are skipped.
    pub fn load_dir(dir: &Path) -> anyhow::Result<Self> {
        let mut files = Vec::new();
        collect_json_files(dir, &mut files)
            .with_context(|| format!("Failed to scan artifacts directory {}", dir.display()))?;

        let mut artifacts = BTreeMap::new();
        for file in files {
            match ArtifactDescriptor::load_from_file(&file) {
                Ok(descriptor) => {
                    if let Some(previous) = artifacts.insert(descriptor.name.clone(), descriptor) {
                        tracing::warn!(
                            artifact = %previous.name,
                            path = %file.display(),
                            "Duplicate artifact name, keeping the last one found"
                        );
                    }
                }
                Err(e) => tracing::trace!(path = %file.display(), error = %e, "Skipping file"),
            }
        }

        tracing::debug!(dir = %dir.display(), count = artifacts.len(), "Artifacts indexed");
        Ok(Self { artifacts })
    }

    pub fn insert(&mut self, descriptor: ArtifactDescriptor) {
        self.artifacts.insert(descriptor.name.clone(), descriptor);
    }

    pub fn get(&self, name: &str) -> Result<&ArtifactDescriptor, ConfigurationError> {
        self.artifacts
            .get(name)
            .ok_or_else(|| ConfigurationError::UnknownArtifact(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.artifacts.keys().map(String::as_str)
    }
}

fn collect_json_files(dir: &Path, out: &mut Vec<PathBuf>) -> std::io::Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            if path.file_name().is_some_and(|n| n == "build-info") {
                continue;
            }
            collect_json_files(&path, out)?;
        } else if path.extension().is_some_and(|e| e == "json")
            && !path.to_string_lossy().ends_with(".dbg.json")
        {
            out.push(path);
        }
    }
    Ok(())
}
