//! The `examflow validate` command.

use std::path::PathBuf;

use anyhow::Result;

pub fn execute(test_path: PathBuf, order_path: Option<PathBuf>) -> Result<()> {
    let definition = super::load_definition(&test_path)?;
    definition.validate()?;

    println!(
        "Test: {} ({} groups, {} questions, {:?} mode)",
        definition.test_name,
        definition.question_groups.len(),
        definition.total_questions(),
        definition.mode,
    );

    let Some(order_path) = order_path else {
        println!("Definition valid. No order table given; numbering will be contiguous.");
        return Ok(());
    };

    let table = super::load_order(Some(&order_path))?;
    let issues = table.audit(&definition);
    for issue in &issues {
        println!("  WARNING: {issue}");
    }

    if issues.is_empty() {
        println!("Definition and order table valid.");
    } else {
        println!("\n{} warning(s) found.", issues.len());
    }

    Ok(())
}
