pub mod inspect;
pub mod simulate;
pub mod validate;

use std::path::Path;

use anyhow::{Context, Result};

use examflow_core::{BaseOrderTable, OrderEntry, TestDefinition};

pub fn load_definition(path: &Path) -> Result<TestDefinition> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read test definition: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse test definition: {}", path.display()))
}

pub fn load_order_entries(path: &Path) -> Result<Vec<OrderEntry>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read order table: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("failed to parse order table: {}", path.display()))
}

/// The order table at `path`, or an empty table when none was given.
pub fn load_order(path: Option<&Path>) -> Result<BaseOrderTable> {
    match path {
        Some(p) => Ok(BaseOrderTable::from_entries(load_order_entries(p)?)),
        None => Ok(BaseOrderTable::default()),
    }
}
