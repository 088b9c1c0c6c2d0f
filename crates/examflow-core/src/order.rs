//! Order resolver: maps question groups to their base question numbers.
//!
//! The order table is supplied by the question service. When it is missing
//! entries or its spans overlap, numbering falls back to contiguous source
//! order so the session can still run.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::DataIntegrityError;
use crate::model::{de_id, TestDefinition};

/// One row of the external order table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEntry {
    #[serde(deserialize_with = "de_id")]
    pub question_group_id: String,
    /// Absolute number of the group's first question.
    pub question_part_order: u32,
}

/// Group id → base order.
#[derive(Debug, Clone, Default)]
pub struct BaseOrderTable {
    bases: HashMap<String, u32>,
}

impl BaseOrderTable {
    pub fn from_entries(entries: impl IntoIterator<Item = OrderEntry>) -> Self {
        Self {
            bases: entries
                .into_iter()
                .map(|e| (e.question_group_id, e.question_part_order))
                .collect(),
        }
    }

    pub fn base_order(&self, group_id: &str) -> Option<u32> {
        self.bases.get(group_id).copied()
    }

    pub fn len(&self) -> usize {
        self.bases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bases.is_empty()
    }

    /// Check the table against a definition.
    ///
    /// For consecutive groups with entries, the next base must equal the
    /// previous base plus its question count. Larger values are gaps, smaller
    /// values are overlaps.
    pub fn audit(&self, definition: &TestDefinition) -> Vec<DataIntegrityError> {
        let mut issues = Vec::new();
        let mut previous: Option<(&str, u32, u32)> = None;

        for group in &definition.question_groups {
            let Some(base) = self.base_order(&group.id) else {
                issues.push(DataIntegrityError::MissingOrder {
                    group_id: group.id.clone(),
                });
                previous = None;
                continue;
            };

            let count = group.question_count();
            if base.checked_add(count.saturating_sub(1)).is_none() {
                issues.push(DataIntegrityError::SpanOverflow {
                    group_id: group.id.clone(),
                    base,
                    count,
                });
                previous = None;
                continue;
            }

            if let Some((prev_id, prev_base, prev_count)) = previous {
                match prev_base.checked_add(prev_count) {
                    Some(expected) if base > expected => {
                        issues.push(DataIntegrityError::Gap {
                            previous: prev_id.to_string(),
                            next: group.id.clone(),
                            expected,
                            found: base,
                        });
                    }
                    Some(expected) if base < expected => {
                        issues.push(DataIntegrityError::Overlap {
                            previous: prev_id.to_string(),
                            next: group.id.clone(),
                            previous_end: expected - 1,
                            found: base,
                        });
                    }
                    Some(_) => {}
                    // The previous span ends at the largest number, so
                    // anything after it overlaps.
                    None => {
                        issues.push(DataIntegrityError::Overlap {
                            previous: prev_id.to_string(),
                            next: group.id.clone(),
                            previous_end: u32::MAX,
                            found: base,
                        });
                    }
                }
            }

            previous = Some((group.id.as_str(), base, count));
        }

        issues
    }
}

/// Absolute span of one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupSpan {
    pub base: u32,
    pub count: u32,
}

impl GroupSpan {
    /// Last absolute number in the span. Only meaningful when `count > 0`.
    pub fn last(&self) -> u32 {
        self.base.saturating_add(self.count.saturating_sub(1))
    }

    pub fn contains(&self, number: u32) -> bool {
        self.count > 0 && number >= self.base && number <= self.last()
    }
}

/// Where absolute numbers came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Numbering {
    OrderTable,
    Contiguous,
}

/// Resolved spans for every group, in document order.
#[derive(Debug, Clone)]
pub struct Layout {
    pub spans: Vec<GroupSpan>,
    pub numbering: Numbering,
}

/// Resolve the layout, degrading to contiguous numbering on bad data.
pub fn resolve_layout(definition: &TestDefinition, table: &BaseOrderTable) -> Layout {
    let issues = table.audit(definition);
    let fatal = issues.iter().any(|issue| {
        matches!(
            issue,
            DataIntegrityError::MissingOrder { .. }
                | DataIntegrityError::Overlap { .. }
                | DataIntegrityError::SpanOverflow { .. }
        )
    });

    for issue in &issues {
        tracing::warn!(test_set = %definition.test_set_id, "data integrity: {issue}");
    }

    if fatal {
        tracing::warn!(
            test_set = %definition.test_set_id,
            "order table unusable, numbering groups contiguously in source order"
        );
        return contiguous_layout(definition);
    }

    let spans = definition
        .question_groups
        .iter()
        .map(|g| GroupSpan {
            base: table.base_order(&g.id).unwrap_or_default(),
            count: g.question_count(),
        })
        .collect();

    Layout {
        spans,
        numbering: Numbering::OrderTable,
    }
}

/// Number groups 1.. in source order, ignoring any table.
pub fn contiguous_layout(definition: &TestDefinition) -> Layout {
    let mut next = 1;
    let spans = definition
        .question_groups
        .iter()
        .map(|g| {
            let span = GroupSpan {
                base: next,
                count: g.question_count(),
            };
            next = next.saturating_add(g.question_count());
            span
        })
        .collect();

    Layout {
        spans,
        numbering: Numbering::Contiguous,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::test_support::{definition, group};

    fn entry(id: &str, base: u32) -> OrderEntry {
        OrderEntry {
            question_group_id: id.into(),
            question_part_order: base,
        }
    }

    #[test]
    fn valid_table_is_used_as_is() {
        let def = definition(
            vec![
                group("a", QuestionPart::Part3, 3, true),
                group("b", QuestionPart::Part3, 3, true),
            ],
            DeliveryMode::Exam,
        );
        let table = BaseOrderTable::from_entries(vec![entry("a", 95), entry("b", 98)]);

        assert!(table.audit(&def).is_empty());
        let layout = resolve_layout(&def, &table);
        assert_eq!(layout.numbering, Numbering::OrderTable);
        assert_eq!(layout.spans[0], GroupSpan { base: 95, count: 3 });
        assert_eq!(layout.spans[0].last(), 97);
        assert_eq!(layout.spans[1].base, 98);
    }

    #[test]
    fn base_orders_are_monotonic_for_valid_tables() {
        let def = definition(
            vec![
                group("a", QuestionPart::Part1, 2, true),
                group("b", QuestionPart::Part2, 1, true),
                group("c", QuestionPart::Part5, 4, false),
            ],
            DeliveryMode::Exam,
        );
        let table =
            BaseOrderTable::from_entries(vec![entry("a", 1), entry("b", 3), entry("c", 4)]);
        let layout = resolve_layout(&def, &table);
        for pair in layout.spans.windows(2) {
            assert!(pair[1].base >= pair[0].base + pair[0].count);
        }
    }

    #[test]
    fn missing_entry_falls_back_to_contiguous() {
        let def = definition(
            vec![
                group("a", QuestionPart::Part1, 2, true),
                group("b", QuestionPart::Part2, 3, true),
            ],
            DeliveryMode::Exam,
        );
        let table = BaseOrderTable::from_entries(vec![entry("a", 10)]);

        let issues = table.audit(&def);
        assert_eq!(
            issues,
            vec![DataIntegrityError::MissingOrder {
                group_id: "b".into()
            }]
        );

        let layout = resolve_layout(&def, &table);
        assert_eq!(layout.numbering, Numbering::Contiguous);
        assert_eq!(layout.spans[0].base, 1);
        assert_eq!(layout.spans[1].base, 3);
    }

    #[test]
    fn gap_is_reported_but_table_kept() {
        let def = definition(
            vec![
                group("a", QuestionPart::Part3, 3, true),
                group("b", QuestionPart::Part3, 3, true),
            ],
            DeliveryMode::Exam,
        );
        let table = BaseOrderTable::from_entries(vec![entry("a", 95), entry("b", 100)]);

        let issues = table.audit(&def);
        assert!(matches!(
            issues.as_slice(),
            [DataIntegrityError::Gap {
                expected: 98,
                found: 100,
                ..
            }]
        ));
        assert_eq!(resolve_layout(&def, &table).numbering, Numbering::OrderTable);
    }

    #[test]
    fn overlap_falls_back() {
        let def = definition(
            vec![
                group("a", QuestionPart::Part3, 3, true),
                group("b", QuestionPart::Part3, 3, true),
            ],
            DeliveryMode::Exam,
        );
        let table = BaseOrderTable::from_entries(vec![entry("a", 95), entry("b", 96)]);
        assert!(matches!(
            table.audit(&def).as_slice(),
            [DataIntegrityError::Overlap { previous_end: 97, .. }]
        ));
        assert_eq!(resolve_layout(&def, &table).numbering, Numbering::Contiguous);
    }

    #[test]
    fn base_near_the_top_of_the_range_falls_back() {
        let def = definition(
            vec![
                group("a", QuestionPart::Part3, 3, true),
                group("b", QuestionPart::Part3, 3, true),
            ],
            DeliveryMode::Exam,
        );
        let table =
            BaseOrderTable::from_entries(vec![entry("a", u32::MAX - 1), entry("b", 5)]);

        assert_eq!(
            table.audit(&def),
            vec![DataIntegrityError::SpanOverflow {
                group_id: "a".into(),
                base: u32::MAX - 1,
                count: 3,
            }]
        );
        let layout = resolve_layout(&def, &table);
        assert_eq!(layout.numbering, Numbering::Contiguous);
        assert_eq!(layout.spans[1], GroupSpan { base: 4, count: 3 });
    }

    #[test]
    fn span_ending_at_the_largest_number_overlaps_what_follows() {
        let def = definition(
            vec![
                group("a", QuestionPart::Part3, 2, true),
                group("b", QuestionPart::Part3, 1, true),
            ],
            DeliveryMode::Exam,
        );
        let table =
            BaseOrderTable::from_entries(vec![entry("a", u32::MAX - 1), entry("b", u32::MAX)]);

        assert!(matches!(
            table.audit(&def).as_slice(),
            [DataIntegrityError::Overlap { previous_end: u32::MAX, found: u32::MAX, .. }]
        ));
        assert_eq!(resolve_layout(&def, &table).numbering, Numbering::Contiguous);
    }

    #[test]
    fn entries_accept_numeric_ids() {
        let entries: Vec<OrderEntry> =
            serde_json::from_str(r#"[{"questionGroupId": 42, "questionPartOrder": 7}]"#).unwrap();
        assert_eq!(entries[0].question_group_id, "42");
        assert_eq!(entries[0].question_part_order, 7);
    }
}
