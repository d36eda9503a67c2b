//! `millrace validate` command: parse, validate, and summarize a flow
//! definition file.

use anyhow::{Context, Result};

use millrace_core::ConditionRegistry;
use millrace_core::flowdef::compile_flow_toml;

/// Run the validate command.
pub fn run_validate(path: &str) -> Result<()> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read flow definition {path}"))?;

    let compiled = compile_flow_toml(&content, &ConditionRegistry::with_builtins())
        .with_context(|| format!("invalid flow definition {path}"))?;

    let mut names: Vec<&str> = compiled.registry.flow_names().collect();
    names.sort_unstable();

    println!("Flow definition OK: {path}");
    for name in names {
        let flow = compiled.registry.flow(name)?;
        let start_edges = flow.edges.start_edges().count();
        println!(
            "  {name}: {} edges ({start_edges} start), {}",
            flow.edges.len(),
            if flow.failures.is_empty() {
                "no fallbacks"
            } else {
                "fallbacks registered"
            }
        );
    }
    if !compiled.task_storage.is_empty() {
        println!("  storage assignments: {}", compiled.task_storage.len());
    }

    Ok(())
}
