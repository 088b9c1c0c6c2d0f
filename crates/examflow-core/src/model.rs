//! Core data model types for examflow.
//!
//! A `TestDefinition` is supplied once by the host and never mutated. Field
//! names follow the camelCase JSON the question service emits.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::DefinitionError;

/// A complete test as delivered to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestDefinition {
    #[serde(deserialize_with = "de_id")]
    pub collection_id: String,
    #[serde(deserialize_with = "de_id")]
    pub test_set_id: String,
    pub test_name: String,
    pub mode: DeliveryMode,
    /// Overall time limit in minutes (practice mode only).
    #[serde(default)]
    pub time_limit: Option<u32>,
    pub question_groups: Vec<QuestionGroup>,
}

/// How the test is delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    /// Free navigation, one overall timer.
    Practice,
    /// Audio-paced listening, locked groups, phase-scoped timers.
    Exam,
}

/// A cluster of questions sharing a passage and/or media.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionGroup {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    pub question_part: QuestionPart,
    #[serde(default)]
    pub passage_text: Option<String>,
    #[serde(default)]
    pub files: Vec<MediaAsset>,
    pub questions: Vec<Question>,
}

impl QuestionGroup {
    /// The group's audio clip, if any.
    pub fn audio(&self) -> Option<&MediaAsset> {
        self.files.iter().find(|f| f.file_type == MediaKind::Audio)
    }

    /// Images in display order.
    pub fn images(&self) -> Vec<&MediaAsset> {
        let mut images: Vec<&MediaAsset> = self
            .files
            .iter()
            .filter(|f| f.file_type == MediaKind::Image)
            .collect();
        images.sort_by_key(|f| f.display_order);
        images
    }

    /// All media (audio first, then images) for preloading.
    pub fn media(&self) -> Vec<&MediaAsset> {
        let mut media: Vec<&MediaAsset> = self.audio().into_iter().collect();
        media.extend(self.images());
        media
    }

    pub fn question_count(&self) -> u32 {
        self.questions.len() as u32
    }

    pub fn is_listening(&self) -> bool {
        self.question_part.is_listening()
    }
}

/// A single question.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    /// 1-based number within the group.
    pub question_number: u32,
    #[serde(default)]
    pub question_text: String,
    #[serde(default)]
    pub answers: Vec<AnswerOption>,
}

impl Question {
    /// Answer options sorted by display order.
    pub fn ordered_answers(&self) -> Vec<&AnswerOption> {
        let mut answers: Vec<&AnswerOption> = self.answers.iter().collect();
        answers.sort_by_key(|a| a.answer_order);
        answers
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnswerOption {
    #[serde(deserialize_with = "de_id")]
    pub id: String,
    #[serde(default)]
    pub content: String,
    pub answer_order: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaAsset {
    pub url: String,
    pub file_type: MediaKind,
    #[serde(default)]
    pub display_order: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MediaKind {
    Audio,
    Image,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Image => write!(f, "image"),
        }
    }
}

/// The eight well-known test sections. Parts 1–4 are listening parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QuestionPart {
    /// Photographs.
    #[serde(rename = "PART_1")]
    Part1,
    /// Question–response.
    #[serde(rename = "PART_2")]
    Part2,
    /// Conversations.
    #[serde(rename = "PART_3")]
    Part3,
    /// Talks.
    #[serde(rename = "PART_4")]
    Part4,
    /// Incomplete sentences.
    #[serde(rename = "PART_5")]
    Part5,
    /// Text completion.
    #[serde(rename = "PART_6")]
    Part6,
    /// Single passages.
    #[serde(rename = "PART_7")]
    Part7,
    /// Multiple passages.
    #[serde(rename = "PART_8")]
    Part8,
}

impl QuestionPart {
    pub fn number(self) -> u8 {
        match self {
            QuestionPart::Part1 => 1,
            QuestionPart::Part2 => 2,
            QuestionPart::Part3 => 3,
            QuestionPart::Part4 => 4,
            QuestionPart::Part5 => 5,
            QuestionPart::Part6 => 6,
            QuestionPart::Part7 => 7,
            QuestionPart::Part8 => 8,
        }
    }

    pub fn is_listening(self) -> bool {
        self.number() <= 4
    }
}

impl fmt::Display for QuestionPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Part {}", self.number())
    }
}

impl FromStr for QuestionPart {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .trim()
            .to_uppercase()
            .trim_start_matches("PART")
            .trim_start_matches(['_', ' '])
            .to_string();
        match digits.as_str() {
            "1" => Ok(QuestionPart::Part1),
            "2" => Ok(QuestionPart::Part2),
            "3" => Ok(QuestionPart::Part3),
            "4" => Ok(QuestionPart::Part4),
            "5" => Ok(QuestionPart::Part5),
            "6" => Ok(QuestionPart::Part6),
            "7" => Ok(QuestionPart::Part7),
            "8" => Ok(QuestionPart::Part8),
            _ => Err(format!("unknown question part: {s}")),
        }
    }
}

/// A selected option, `A` for the first option in display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "char", into = "char")]
pub struct OptionLetter(char);

impl OptionLetter {
    pub fn new(letter: char) -> Option<Self> {
        let upper = letter.to_ascii_uppercase();
        upper.is_ascii_uppercase().then_some(Self(upper))
    }

    /// 0-based index into the display-ordered options.
    pub fn index(self) -> usize {
        (self.0 as u8 - b'A') as usize
    }

    pub fn as_char(self) -> char {
        self.0
    }
}

impl TryFrom<char> for OptionLetter {
    type Error = String;

    fn try_from(c: char) -> Result<Self, Self::Error> {
        OptionLetter::new(c).ok_or_else(|| format!("invalid option letter: {c}"))
    }
}

impl From<OptionLetter> for char {
    fn from(letter: OptionLetter) -> char {
        letter.0
    }
}

impl fmt::Display for OptionLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TestDefinition {
    /// Check structural invariants the engine relies on.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.question_groups.is_empty() {
            return Err(DefinitionError::NoGroups);
        }

        let mut seen = HashSet::new();
        for group in &self.question_groups {
            if !seen.insert(group.id.as_str()) {
                return Err(DefinitionError::DuplicateGroup(group.id.clone()));
            }
            if group.questions.is_empty() {
                return Err(DefinitionError::EmptyGroup(group.id.clone()));
            }
            let audio_count = group
                .files
                .iter()
                .filter(|f| f.file_type == MediaKind::Audio)
                .count();
            if audio_count > 1 {
                return Err(DefinitionError::MultipleAudio(group.id.clone()));
            }
            if let Some(q) = group.questions.iter().find(|q| q.answers.is_empty()) {
                return Err(DefinitionError::NoAnswers(q.id.clone()));
            }
        }

        Ok(())
    }

    pub fn total_questions(&self) -> u32 {
        self.question_groups.iter().map(|g| g.question_count()).sum()
    }

    /// Distinct parts in document order.
    pub fn parts(&self) -> Vec<QuestionPart> {
        let mut parts = Vec::new();
        for group in &self.question_groups {
            if !parts.contains(&group.question_part) {
                parts.push(group.question_part);
            }
        }
        parts
    }

    /// Index of the first group that is not a listening group.
    pub fn first_reading_group(&self) -> Option<usize> {
        self.question_groups.iter().position(|g| !g.is_listening())
    }
}

/// Accept identifiers as JSON strings or integers.
pub(crate) fn de_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(i64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(s) => s,
        RawId::Number(n) => n.to_string(),
    })
}
