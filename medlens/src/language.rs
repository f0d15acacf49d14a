use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{LensError, Result};

const MAX_TAG_LEN: usize = 35;

/// Normalized output-language tag such as `en`, `vi` or `pt-br`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Language(String);

impl Language {
    pub fn parse(tag: &str) -> Result<Self> {
        let normalized = tag.trim().to_ascii_lowercase().replace('_', "-");
        let valid = !normalized.is_empty()
            && normalized.len() <= MAX_TAG_LEN
            && !normalized.starts_with('-')
            && !normalized.ends_with('-')
            && normalized
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-');

        if valid {
            Ok(Self(normalized))
        } else {
            Err(LensError::InvalidLanguage(tag.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// English name used inside model prompts.
    pub fn display_name(&self) -> &str {
        let primary = self.0.split('-').next().unwrap_or(&self.0);
        match primary {
            "en" => "English",
            "vi" => "Vietnamese",
            "fr" => "French",
            "es" => "Spanish",
            "de" => "German",
            "it" => "Italian",
            "pt" => "Portuguese",
            "nl" => "Dutch",
            "ru" => "Russian",
            "uk" => "Ukrainian",
            "pl" => "Polish",
            "tr" => "Turkish",
            "ar" => "Arabic",
            "he" => "Hebrew",
            "hi" => "Hindi",
            "th" => "Thai",
            "id" => "Indonesian",
            "zh" => "Chinese",
            "ja" => "Japanese",
            "ko" => "Korean",
            _ => &self.0,
        }
    }
}

impl FromStr for Language {
    type Err = LensError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// Persisted tags go through the same normalization as user input.
impl<'de> Deserialize<'de> for Language {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Language::parse(&raw).map_err(serde::de::Error::custom)
    }
}
