//! Flow definition files: TOML parsing, validation, and compilation into
//! the immutable flow registry.

pub mod parser;
pub mod toml_format;

pub use parser::{CompiledFlows, FlowDefError, compile, compile_flow_toml};
pub use toml_format::{EdgeToml, FailureToml, FallbackToml, FlowFile, FlowToml, PropagateToml, TaskToml};
