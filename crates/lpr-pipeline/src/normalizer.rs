//! Plate text normalization.
//!
//! Raw recognizer output is reconciled against the canonical plate shape
//! `\d{4}[A-Z]{2}\d{2}` through an ordered chain of pure passes. Each pass only runs
//! when the previous ones produced no canonical match:
//!
//! 1. strip: uppercase, keep `[A-Z0-9]`
//! 2. drop the known region prefix once
//! 3. direct search for a canonical substring
//! 4. positional confusable correction (exactly 8 characters)
//! 5. segment reconstruction from the digit and letter subsequences
//! 6. best effort: the stripped text unchanged
//!
//! Confusable table (digit slots 0-3 and 6-7, letter slots 4-5):
//!
//! | slot   | substitutions                                        |
//! |--------|------------------------------------------------------|
//! | digit  | O->0 Q->0 D->0 I->1 L->1 Z->2 S->5 G->6 B->8 A->4    |
//! | letter | 0->O 1->I 2->Z 4->A 5->S 6->G 8->B                   |
//!
//! `Z` resolves to `2` (never `3`) and `H` is left unmapped.

#![allow(clippy::expect_used)]

use crate::error::{PipelineError, Result};
use common::detections::NormalizationPass;
use common::validation::validate_plate_prefix;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Length of a canonical plate.
pub const PLATE_LENGTH: usize = 8;

/// Positions that must hold letters; every other position holds a digit.
const LETTER_SLOTS: [usize; 2] = [4, 5];

static CANONICAL_PLATE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]{4}[A-Z]{2}[0-9]{2}$").expect("valid plate regex"));

static PLATE_SEARCH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[0-9]{4}[A-Z]{2}[0-9]{2}").expect("valid plate regex"));

fn default_prefix() -> Option<String> {
    Some("CGO".to_string())
}

/// Look-alike substitutions applied by slot type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfusableTable {
    /// Letters read where a digit is expected
    pub digit_slot: BTreeMap<char, char>,

    /// Digits read where a letter is expected
    pub letter_slot: BTreeMap<char, char>,
}

impl Default for ConfusableTable {
    fn default() -> Self {
        let digit_slot = [
            ('O', '0'),
            ('Q', '0'),
            ('D', '0'),
            ('I', '1'),
            ('L', '1'),
            ('Z', '2'),
            ('S', '5'),
            ('G', '6'),
            ('B', '8'),
            ('A', '4'),
        ];
        let letter_slot = [
            ('0', 'O'),
            ('1', 'I'),
            ('2', 'Z'),
            ('4', 'A'),
            ('5', 'S'),
            ('6', 'G'),
            ('8', 'B'),
        ];

        Self {
            digit_slot: digit_slot.into_iter().collect(),
            letter_slot: letter_slot.into_iter().collect(),
        }
    }
}

impl ConfusableTable {
    /// Digit slots must map letters to digits and letter slots digits to letters.
    pub fn validate(&self) -> Result<()> {
        for (&from, &to) in &self.digit_slot {
            if !from.is_ascii_uppercase() || !to.is_ascii_digit() {
                return Err(PipelineError::Config(format!(
                    "digit slot confusable must map a letter to a digit, got '{}' -> '{}'",
                    from, to
                )));
            }
        }
        for (&from, &to) in &self.letter_slot {
            if !from.is_ascii_digit() || !to.is_ascii_uppercase() {
                return Err(PipelineError::Config(format!(
                    "letter slot confusable must map a digit to a letter, got '{}' -> '{}'",
                    from, to
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizerConfig {
    /// Region prefix stripped once from the front of the text
    #[serde(default = "default_prefix")]
    pub prefix: Option<String>,

    #[serde(default)]
    pub confusables: ConfusableTable,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            confusables: ConfusableTable::default(),
        }
    }
}

impl NormalizerConfig {
    pub fn validate(&self) -> Result<()> {
        if let Some(prefix) = &self.prefix {
            validate_plate_prefix(prefix).map_err(PipelineError::config)?;
        }
        self.confusables.validate()
    }
}

/// Outcome of a normalization run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalization {
    pub text: String,
    pub pass: NormalizationPass,
}

impl Normalization {
    pub fn is_canonical(&self) -> bool {
        self.pass.is_canonical()
    }
}

#[derive(Debug, Clone, Default)]
pub struct PlateNormalizer {
    config: NormalizerConfig,
}

impl PlateNormalizer {
    pub fn new(config: NormalizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Normalize raw text into a canonical plate, or the stripped text as best effort.
    pub fn normalize(&self, raw: &str) -> String {
        self.normalize_detailed(raw).text
    }

    pub fn normalize_detailed(&self, raw: &str) -> Normalization {
        let cleaned = strip(raw);
        let body = self.strip_prefix(&cleaned);

        if let Some(found) = find_canonical(body) {
            return Normalization {
                text: found.to_string(),
                pass: NormalizationPass::Direct,
            };
        }

        if let Some(corrected) = self.correct_positional(body) {
            return Normalization {
                text: corrected,
                pass: NormalizationPass::Positional,
            };
        }

        if let Some(rebuilt) = reconstruct_segments(body) {
            return Normalization {
                text: rebuilt,
                pass: NormalizationPass::Segments,
            };
        }

        Normalization {
            text: cleaned,
            pass: NormalizationPass::BestEffort,
        }
    }

    fn strip_prefix<'a>(&self, cleaned: &'a str) -> &'a str {
        match self.config.prefix.as_deref() {
            Some(prefix) => cleaned.strip_prefix(prefix).unwrap_or(cleaned),
            None => cleaned,
        }
    }

    /// Substitute confusables slot by slot; only a canonical result is returned.
    pub fn correct_positional(&self, text: &str) -> Option<String> {
        if text.len() != PLATE_LENGTH {
            return None;
        }

        let table = &self.config.confusables;
        let corrected: String = text
            .chars()
            .enumerate()
            .map(|(position, c)| {
                if LETTER_SLOTS.contains(&position) {
                    if c.is_ascii_digit() {
                        return table.letter_slot.get(&c).copied().unwrap_or(c);
                    }
                } else if c.is_ascii_alphabetic() {
                    return table.digit_slot.get(&c).copied().unwrap_or(c);
                }
                c
            })
            .collect();

        is_canonical(&corrected).then_some(corrected)
    }
}

/// Uppercase and drop everything outside `[A-Z0-9]`.
pub fn strip(raw: &str) -> String {
    raw.chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        .collect()
}

/// Whether `text` is exactly one canonical plate.
pub fn is_canonical(text: &str) -> bool {
    CANONICAL_PLATE.is_match(text)
}

/// First canonical substring of `text`.
pub fn find_canonical(text: &str) -> Option<&str> {
    PLATE_SEARCH.find(text).map(|m| m.as_str())
}

/// Rebuild `dddd LL dd` from the digit and letter subsequences of `text`.
///
/// Needs at least six digits and two letters; interleaving is ignored.
pub fn reconstruct_segments(text: &str) -> Option<String> {
    let digits: Vec<char> = text.chars().filter(|c| c.is_ascii_digit()).collect();
    let letters: Vec<char> = text.chars().filter(|c| c.is_ascii_uppercase()).collect();

    if digits.len() < 6 || letters.len() < 2 {
        return None;
    }

    let candidate: String = digits[..4]
        .iter()
        .chain(&letters[..2])
        .chain(&digits[4..6])
        .collect();

    is_canonical(&candidate).then_some(candidate)
}

/// Key used by registry lookups of user-corrected plates: uppercase, no whitespace.
pub fn lookup_key(text: &str) -> String {
    text.split_whitespace()
        .flat_map(|part| part.chars())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> PlateNormalizer {
        PlateNormalizer::default()
    }

    #[test]
    fn test_strip() {
        assert_eq!(strip("ab-12 cd"), "AB12CD");
        assert_eq!(strip("  "), "");
        assert_eq!(strip("1234·ab·56"), "1234AB56");
    }

    #[test]
    fn test_prefix_is_stripped_once() {
        assert_eq!(normalizer().normalize("CGO1234AB56"), "1234AB56");
        assert_eq!(normalizer().normalize("cgo 1234 ab 56"), "1234AB56");
        // Second CGO stays; the direct search still finds the plate behind it
        assert_eq!(normalizer().normalize("CGOCGO1234AB56"), "1234AB56");
    }

    #[test]
    fn test_direct_match_priority() {
        let n = normalizer().normalize_detailed("XX1234AB56YY");
        assert_eq!(n.text, "1234AB56");
        assert_eq!(n.pass, NormalizationPass::Direct);
    }

    #[test]
    fn test_positional_digit_slot() {
        let n = normalizer().normalize_detailed("12O4AB56");
        assert_eq!(n.text, "1204AB56");
        assert_eq!(n.pass, NormalizationPass::Positional);
    }

    #[test]
    fn test_positional_letter_slot() {
        assert_eq!(normalizer().normalize("123408S6"), "1234OB56");
        assert_eq!(normalizer().normalize("1234A856"), "1234AB56");
    }

    #[test]
    fn test_positional_z_resolves_to_two() {
        assert_eq!(normalizer().normalize("1Z34AB56"), "1234AB56");
    }

    #[test]
    fn test_positional_h_is_not_mapped() {
        let n = normalizer().normalize_detailed("12H4AB56");
        assert_eq!(n.pass, NormalizationPass::BestEffort);
        assert_eq!(n.text, "12H4AB56");
    }

    #[test]
    fn test_positional_requires_exact_length() {
        assert_eq!(normalizer().correct_positional("12O4AB5"), None);
        assert_eq!(normalizer().correct_positional("12O4AB567"), None);
    }

    #[test]
    fn test_segment_reconstruction() {
        let n = normalizer().normalize_detailed("1A2B3456");
        assert_eq!(n.text, "1234AB56");
        assert_eq!(n.pass, NormalizationPass::Segments);
    }

    #[test]
    fn test_segment_reconstruction_needs_enough_characters() {
        assert_eq!(reconstruct_segments("1A2B345"), None);
        assert_eq!(reconstruct_segments("1A23456"), None);
        assert_eq!(reconstruct_segments("X1Y2Z3W456"), Some("1234XY56".to_string()));
    }

    #[test]
    fn test_best_effort_returns_stripped_text() {
        let n = normalizer().normalize_detailed("ab 12");
        assert_eq!(n.text, "AB12");
        assert_eq!(n.pass, NormalizationPass::BestEffort);
        assert!(!n.is_canonical());

        // Prefix stays in the best-effort result
        assert_eq!(normalizer().normalize("CGO12"), "CGO12");
    }

    #[test]
    fn test_empty_input() {
        let n = normalizer().normalize_detailed("");
        assert_eq!(n.text, "");
        assert_eq!(n.pass, NormalizationPass::BestEffort);
    }

    #[test]
    fn test_idempotence_on_samples() {
        let n = normalizer();
        for raw in [
            "",
            "CGO1234AB56",
            "XX1234AB56YY",
            "12O4AB56",
            "1A2B3456",
            "CGO12",
            "CGOCGO",
            "ZZZZZZZZ",
            "88888888",
            "0000OO00",
            "garbage !!",
        ] {
            let once = n.normalize(raw);
            assert_eq!(n.normalize(&once), once, "not idempotent for {:?}", raw);
        }
    }

    #[test]
    fn test_without_prefix() {
        let n = PlateNormalizer::new(NormalizerConfig {
            prefix: None,
            confusables: ConfusableTable::default(),
        })
        .unwrap();
        // Without the prefix rule "CGO1234AB56" still has a direct match
        assert_eq!(n.normalize("CGO1234AB56"), "1234AB56");
        assert_eq!(n.normalize("CGO12"), "CGO12");
    }

    #[test]
    fn test_custom_table_can_resolve_z_to_three() {
        let mut confusables = ConfusableTable::default();
        confusables.digit_slot.insert('Z', '3');
        let n = PlateNormalizer::new(NormalizerConfig {
            prefix: None,
            confusables,
        })
        .unwrap();
        assert_eq!(n.normalize("12Z4AB56"), "1234AB56");
    }

    #[test]
    fn test_invalid_table_rejected() {
        let mut confusables = ConfusableTable::default();
        confusables.digit_slot.insert('O', 'X');
        let result = PlateNormalizer::new(NormalizerConfig {
            prefix: None,
            confusables,
        });
        assert!(matches!(result, Err(PipelineError::Config(_))));
    }

    #[test]
    fn test_invalid_prefix_rejected() {
        let result = PlateNormalizer::new(NormalizerConfig {
            prefix: Some("cg".to_string()),
            confusables: ConfusableTable::default(),
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_lookup_key() {
        assert_eq!(lookup_key(" 1234 ab\t56 "), "1234AB56");
        assert_eq!(lookup_key("ab-12"), "AB-12");
        assert_eq!(lookup_key(""), "");
    }
}
