//! Dietary advice knowledge base: keys, the built-in default set, editor
//! helpers, the printable report and parsing of generated entries.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::Write as _;
use thiserror::Error;

use crate::model::{AdviceMap, ConditionAdvice};

pub const MAX_KEY_LENGTH: usize = 64;

pub const STANDARD_DISCLAIMER: &str =
    "This information is for guidance only and does not replace a consultation with your doctor.";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AdviceError {
    #[error("advice key cannot be empty")]
    EmptyKey,

    #[error("advice key exceeds maximum length of {max} bytes")]
    KeyTooLong { max: usize },

    #[error("advice key '{key}' already exists")]
    DuplicateKey { key: AdviceKey },

    #[error("no advice entry with key '{key}'")]
    UnknownKey { key: AdviceKey },

    #[error("condition name cannot be empty")]
    EmptyCondition,

    #[error("generated advice is malformed: {reason}")]
    Malformed { reason: String },

    #[error("advice generation failed: {message}")]
    Generation { message: String },
}

/// Slug identifying one advice entry: lowercase, whitespace runs folded
/// into single underscores.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct AdviceKey(String);

impl AdviceKey {
    pub fn normalize(raw: &str) -> Result<Self, AdviceError> {
        let key = raw
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join("_");

        if key.is_empty() {
            return Err(AdviceError::EmptyKey);
        }
        if key.len() > MAX_KEY_LENGTH {
            return Err(AdviceError::KeyTooLong {
                max: MAX_KEY_LENGTH,
            });
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AdviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ConditionAdvice {
    /// Empty entry as created from the admin editor before any editing.
    pub fn blank(condition: impl Into<String>) -> Self {
        Self {
            condition: condition.into(),
            allowed_foods: Vec::new(),
            forbidden_foods: Vec::new(),
            tips: Vec::new(),
            disclaimer: STANDARD_DISCLAIMER.to_string(),
        }
    }
}

/// Textarea contents to list items: one per line, blank lines dropped.
pub fn lines_to_list(text: &str) -> Vec<String> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

pub fn list_to_lines(items: &[String]) -> String {
    items.join("\n")
}

fn entry(
    condition: &str,
    allowed: &[&str],
    forbidden: &[&str],
    tips: &[&str],
) -> ConditionAdvice {
    let owned = |items: &[&str]| items.iter().map(|s| (*s).to_string()).collect();
    ConditionAdvice {
        condition: condition.to_string(),
        allowed_foods: owned(allowed),
        forbidden_foods: owned(forbidden),
        tips: owned(tips),
        disclaimer: STANDARD_DISCLAIMER.to_string(),
    }
}

/// Built-in knowledge base used to seed an empty remote collection and as
/// the initial offline map.
#[must_use]
pub fn default_advice() -> AdviceMap {
    let entries = [
        (
            "diabetes",
            entry(
                "Diabetes",
                &["Whole grains", "Leafy vegetables", "Legumes", "Fresh fish"],
                &["Sugary drinks", "White bread", "Sweets and pastries"],
                &[
                    "Eat small meals at regular times",
                    "Check blood glucose as advised by your doctor",
                ],
            ),
        ),
        (
            "hypertension",
            entry(
                "High blood pressure",
                &["Fresh fruit", "Vegetables", "Low-fat dairy", "Oats"],
                &["Salted snacks", "Pickles", "Processed meats"],
                &["Limit salt to under one teaspoon a day", "Walk for 30 minutes daily"],
            ),
        ),
        (
            "gout",
            entry(
                "Gout",
                &["Cherries", "Low-fat dairy", "Water"],
                &["Red meat", "Organ meats", "Shellfish"],
                &["Drink at least eight glasses of water a day"],
            ),
        ),
        (
            "kidney_disease",
            entry(
                "Chronic kidney disease",
                &["Apples", "Cabbage", "Egg whites"],
                &["Bananas", "Potatoes", "Cola drinks"],
                &["Follow the fluid limit set by your nephrologist"],
            ),
        ),
    ];

    entries
        .into_iter()
        .map(|(key, advice)| (AdviceKey(key.to_string()), advice))
        .collect()
}

/// Plain-text print variant of an advice entry.
#[must_use]
pub fn render_printable(key: &AdviceKey, advice: &ConditionAdvice) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", advice.condition);
    let _ = writeln!(out, "{}", "=".repeat(advice.condition.chars().count().max(1)));
    let _ = writeln!(out, "Reference: {key}");

    for (title, items) in [
        ("Recommended foods", &advice.allowed_foods),
        ("Foods to avoid", &advice.forbidden_foods),
        ("Tips", &advice.tips),
    ] {
        let _ = writeln!(out);
        let _ = writeln!(out, "{title}:");
        if items.is_empty() {
            let _ = writeln!(out, "  (none)");
        }
        for item in items {
            let _ = writeln!(out, "  - {item}");
        }
    }

    let _ = writeln!(out);
    let _ = write!(out, "{}", advice.disclaimer);
    out
}

// --- Generated advice ---

/// External collaborator that drafts an entry from a free-text condition.
#[async_trait]
pub trait AdviceGenerator: Send + Sync {
    async fn generate(&self, condition: &str) -> Result<ConditionAdvice, AdviceError>;
}

/// Validates the fixed JSON shape returned by the generator.
pub fn parse_generated_advice(raw: &str) -> Result<ConditionAdvice, AdviceError> {
    let advice: ConditionAdvice =
        serde_json::from_str(raw).map_err(|e| AdviceError::Malformed {
            reason: e.to_string(),
        })?;

    if advice.condition.trim().is_empty() {
        return Err(AdviceError::EmptyCondition);
    }
    Ok(advice)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn normalizes_surrounding_and_inner_whitespace() {
        assert_eq!(AdviceKey::normalize(" Flu ").unwrap().as_str(), "flu");
        assert_eq!(
            AdviceKey::normalize("Heart  Failure\tStage 2").unwrap().as_str(),
            "heart_failure_stage_2"
        );
    }

    #[test]
    fn rejects_blank_and_oversized_keys() {
        assert_eq!(AdviceKey::normalize("   "), Err(AdviceError::EmptyKey));
        let long = "a".repeat(MAX_KEY_LENGTH + 1);
        assert!(matches!(
            AdviceKey::normalize(&long),
            Err(AdviceError::KeyTooLong { .. })
        ));
    }

    #[test]
    fn default_set_keys_are_already_normalized() {
        for key in default_advice().keys() {
            assert_eq!(&AdviceKey::normalize(key.as_str()).unwrap(), key);
        }
    }

    #[test]
    fn textarea_lines_skip_blanks() {
        let items = lines_to_list("Oats\n\n  \nFish\n");
        assert_eq!(items, vec!["Oats".to_string(), "Fish".to_string()]);
        assert_eq!(list_to_lines(&items), "Oats\nFish");
    }

    #[test]
    fn printable_report_lists_every_section() {
        let map = default_advice();
        let key = AdviceKey::normalize("gout").unwrap();
        let text = render_printable(&key, &map[&key]);
        assert!(text.starts_with("Gout\n===="));
        assert!(text.contains("  - Cherries"));
        assert!(text.contains("Foods to avoid:"));
        assert!(text.ends_with(STANDARD_DISCLAIMER));
    }

    #[test]
    fn blank_entry_carries_disclaimer() {
        let advice = ConditionAdvice::blank("Flu");
        assert!(advice.tips.is_empty());
        assert_eq!(advice.disclaimer, STANDARD_DISCLAIMER);
    }

    #[test]
    fn generated_advice_requires_all_fields() {
        let ok = r#"{"condition":"Flu","allowedFoods":["Soup"],"forbiddenFoods":[],"tips":["Rest"],"disclaimer":"AI"}"#;
        assert_eq!(parse_generated_advice(ok).unwrap().condition, "Flu");

        let missing = r#"{"condition":"Flu","allowedFoods":[]}"#;
        assert!(matches!(
            parse_generated_advice(missing),
            Err(AdviceError::Malformed { .. })
        ));

        let blank = r#"{"condition":" ","allowedFoods":[],"forbiddenFoods":[],"tips":[],"disclaimer":""}"#;
        assert_eq!(parse_generated_advice(blank), Err(AdviceError::EmptyCondition));
    }

    proptest! {
        #[test]
        fn normalized_keys_have_no_whitespace_or_uppercase(raw in "[ A-Za-z0-9\t]{0,40}") {
            if let Ok(key) = AdviceKey::normalize(&raw) {
                prop_assert!(!key.as_str().chars().any(char::is_whitespace));
                prop_assert_eq!(key.as_str().to_lowercase(), key.as_str());
                prop_assert_eq!(AdviceKey::normalize(key.as_str()).unwrap(), key.clone());
            }
        }
    }
}
