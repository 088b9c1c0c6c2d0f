//! The `examflow inspect` command.

use std::path::PathBuf;

use anyhow::Result;
use comfy_table::{Cell, Table};

use examflow_core::navigation::Navigator;
use examflow_core::order::Numbering;

pub fn execute(test_path: PathBuf, order_path: Option<PathBuf>) -> Result<()> {
    let definition = super::load_definition(&test_path)?;
    definition.validate()?;
    let order = super::load_order(order_path.as_deref())?;
    let navigator = Navigator::new(&definition, &order);

    let mut table = Table::new();
    table.set_header(vec!["#", "Group", "Part", "Questions", "Audio", "Images"]);

    for (index, group) in definition.question_groups.iter().enumerate() {
        let numbers = navigator
            .group_range(index)
            .map(|r| format!("{}-{}", r.start(), r.end()))
            .unwrap_or_else(|| "-".to_string());
        table.add_row(vec![
            Cell::new(index),
            Cell::new(&group.id),
            Cell::new(group.question_part),
            Cell::new(numbers),
            Cell::new(if group.audio().is_some() { "yes" } else { "no" }),
            Cell::new(group.images().len()),
        ]);
    }

    println!("{} ({:?})", definition.test_name, definition.mode);
    println!("{table}");

    if navigator.numbering() == Numbering::Contiguous {
        println!("Numbering: contiguous (order table missing or unusable)");
    } else {
        println!("Numbering: order table");
    }

    Ok(())
}
