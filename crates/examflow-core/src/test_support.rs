//! Shared fixtures for unit tests.

use crate::model::*;

pub(crate) fn group(id: &str, part: QuestionPart, questions: u32, audio: bool) -> QuestionGroup {
    let files = if audio {
        vec![MediaAsset {
            url: format!("https://cdn.example/{id}.mp3"),
            file_type: MediaKind::Audio,
            display_order: 1,
        }]
    } else {
        vec![]
    };
    QuestionGroup {
        id: id.into(),
        question_part: part,
        passage_text: None,
        files,
        questions: (1..=questions)
            .map(|n| Question {
                id: format!("{id}-q{n}"),
                question_number: n,
                question_text: String::new(),
                answers: (1..=4)
                    .map(|o| AnswerOption {
                        id: format!("{id}-q{n}-a{o}"),
                        content: String::new(),
                        answer_order: o,
                    })
                    .collect(),
            })
            .collect(),
    }
}

pub(crate) fn definition(groups: Vec<QuestionGroup>, mode: DeliveryMode) -> TestDefinition {
    TestDefinition {
        collection_id: "c1".into(),
        test_set_id: "ts1".into(),
        test_name: "Sample".into(),
        mode,
        time_limit: None,
        question_groups: groups,
    }
}


/// An order table numbering the definition contiguously from `first`.
pub(crate) fn contiguous_table(
    definition: &TestDefinition,
    first: u32,
) -> crate::order::BaseOrderTable {
    let mut next = first;
    let entries: Vec<crate::order::OrderEntry> = definition
        .question_groups
        .iter()
        .map(|g| {
            let entry = crate::order::OrderEntry {
                question_group_id: g.id.clone(),
                question_part_order: next,
            };
            next += g.question_count();
            entry
        })
        .collect();
    crate::order::BaseOrderTable::from_entries(entries)
}
