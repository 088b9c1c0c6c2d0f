//! Submission assembler.
//!
//! Turns the in-memory answer sheet into the payload the grading service
//! expects. Assembly is pure; the controller runs it once per session.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::{DeliveryMode, QuestionPart, TestDefinition};
use crate::navigation::Navigator;

/// The payload sent to the grading service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmissionPayload {
    pub collection_id: String,
    pub testset_id: String,
    pub testset_name: String,
    pub is_fulltest: bool,
    pub parts_taken: Vec<QuestionPart>,
    pub user_answers: Vec<UserAnswer>,
    /// Total time spent, in seconds.
    pub completion_time: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAnswer {
    pub question_id: String,
    /// `None` for a skipped question.
    pub selected_answer_id: Option<String>,
}

impl SubmissionPayload {
    pub fn answered(&self) -> usize {
        self.user_answers
            .iter()
            .filter(|a| a.selected_answer_id.is_some())
            .count()
    }
}

/// Build the payload from the definition, the answer sheet and the total
/// elapsed time.
pub fn assemble(
    definition: &TestDefinition,
    navigator: &Navigator,
    elapsed: Duration,
) -> SubmissionPayload {
    let mut user_answers = Vec::with_capacity(definition.total_questions() as usize);

    for (group_index, group) in definition.question_groups.iter().enumerate() {
        for (local_index, question) in group.questions.iter().enumerate() {
            let letter = navigator
                .absolute_number(group_index, local_index)
                .and_then(|number| navigator.answer(number));

            let selected_answer_id = letter.and_then(|letter| {
                let options = question.ordered_answers();
                let option = options.get(letter.index());
                if option.is_none() {
                    tracing::warn!(
                        question = %question.id,
                        %letter,
                        options = options.len(),
                        "selected letter has no matching option, submitting as skipped"
                    );
                }
                option.map(|o| o.id.clone())
            });

            user_answers.push(UserAnswer {
                question_id: question.id.clone(),
                selected_answer_id,
            });
        }
    }

    SubmissionPayload {
        collection_id: definition.collection_id.clone(),
        testset_id: definition.test_set_id.clone(),
        testset_name: definition.test_name.clone(),
        is_fulltest: definition.mode == DeliveryMode::Exam,
        parts_taken: definition.parts(),
        user_answers,
        completion_time: elapsed.as_secs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OptionLetter, QuestionPart};
    use crate::test_support::{contiguous_table, definition, group};

    #[test]
    fn maps_letters_to_answer_ids_and_marks_skips() {
        let mut def = definition(
            vec![
                group("a", QuestionPart::Part1, 2, true),
                group("b", QuestionPart::Part5, 2, false),
            ],
            DeliveryMode::Exam,
        );
        // Options listed out of display order must still map by answerOrder.
        def.question_groups[1].questions[0].answers.reverse();

        let mut nav = Navigator::new(&def, &contiguous_table(&def, 1));
        nav.try_set_answer(1, OptionLetter::new('B').unwrap()).unwrap();
        nav.try_set_answer(3, OptionLetter::new('A').unwrap()).unwrap();
        nav.lock(0).unwrap();

        let payload = assemble(&def, &nav, Duration::from_secs(7_200));

        assert_eq!(payload.user_answers.len(), 4);
        assert_eq!(
            payload.user_answers[0],
            UserAnswer {
                question_id: "a-q1".into(),
                selected_answer_id: Some("a-q1-a2".into()),
            }
        );
        assert_eq!(payload.user_answers[1].selected_answer_id, None);
        assert_eq!(
            payload.user_answers[2].selected_answer_id.as_deref(),
            Some("b-q1-a1")
        );
        assert_eq!(payload.answered(), 2);
        assert!(payload.is_fulltest);
        assert_eq!(payload.parts_taken, vec![QuestionPart::Part1, QuestionPart::Part5]);
        assert_eq!(payload.completion_time, 7_200);
    }

    #[test]
    fn letter_beyond_options_is_skipped() {
        let def = definition(vec![group("a", QuestionPart::Part2, 1, true)], DeliveryMode::Practice);
        let mut nav = Navigator::new(&def, &contiguous_table(&def, 1));
        nav.try_set_answer(1, OptionLetter::new('F').unwrap()).unwrap();

        let payload = assemble(&def, &nav, Duration::ZERO);
        assert_eq!(payload.user_answers[0].selected_answer_id, None);
        assert!(!payload.is_fulltest);
    }

    #[test]
    fn serializes_with_wire_names() {
        let def = definition(vec![group("a", QuestionPart::Part1, 1, true)], DeliveryMode::Exam);
        let nav = Navigator::new(&def, &contiguous_table(&def, 1));
        let json = serde_json::to_value(assemble(&def, &nav, Duration::from_secs(5))).unwrap();

        assert_eq!(json["testsetId"], "ts1");
        assert_eq!(json["isFulltest"], true);
        assert_eq!(json["partsTaken"][0], "PART_1");
        assert!(json["userAnswers"][0]["selectedAnswerId"].is_null());
        assert_eq!(json["completionTime"], 5);
    }
}
