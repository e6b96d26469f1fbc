//! Style presets appended to user prompts.

use std::collections::BTreeMap;
use std::path::Path;

use crate::ThemeError;

pub const DEFAULT_THEME: &str = "default";

const DEFAULT_FRAGMENT: &str = "high quality, detailed image";

const BUILTIN_THEMES: &[(&str, &str)] = &[
    (DEFAULT_THEME, DEFAULT_FRAGMENT),
    (
        "historic",
        "vintage photograph, historical style, aged, antique appearance, sepia tones",
    ),
    (
        "funky",
        "psychedelic, vibrant colors, funky style, retro pop art, creative and bold",
    ),
    (
        "abstract",
        "abstract art style, non-representational, geometric shapes, modern art",
    ),
    ("pixelart", "pixel art style, 8-bit graphics, retro gaming aesthetic"),
    (
        "modern",
        "contemporary art style, minimalist, clean lines, modern aesthetic",
    ),
    ("anime", "anime style, detailed, vibrant, manga-inspired"),
    (
        "watercolor",
        "watercolor painting style, artistic, soft edges, flowing colors",
    ),
    (
        "sketch",
        "pencil sketch style, detailed drawing, hand-drawn appearance",
    ),
    (
        "oil_painting",
        "oil painting style, artistic, detailed, textured brushstrokes",
    ),
];

/// Immutable mapping from theme key to prompt fragment.
///
/// A table always carries a `default` entry, so [`ThemeTable::resolve`]
/// cannot fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThemeTable {
    entries: BTreeMap<String, String>,
}

impl ThemeTable {
    pub fn from_entries<I, K, V>(entries: I) -> Result<Self, ThemeError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let entries: BTreeMap<String, String> = entries
            .into_iter()
            .map(|(key, fragment)| (key.into(), fragment.into()))
            .collect();
        if !entries.contains_key(DEFAULT_THEME) {
            return Err(ThemeError::MissingDefault);
        }
        Ok(Self { entries })
    }

    /// Loads a JSON object of `"theme": "fragment"` pairs.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ThemeError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ThemeError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let entries: BTreeMap<String, String> =
            serde_json::from_str(&raw).map_err(|source| ThemeError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        Self::from_entries(entries)
    }

    /// Returns the fragment for `key`, or the default fragment for unknown keys.
    pub fn resolve(&self, key: &str) -> &str {
        self.entries
            .get(key)
            .or_else(|| self.entries.get(DEFAULT_THEME))
            .map(String::as_str)
            .unwrap_or(DEFAULT_FRAGMENT)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(key, fragment)| (key.as_str(), fragment.as_str()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ThemeTable {
    fn default() -> Self {
        Self {
            entries: BUILTIN_THEMES
                .iter()
                .map(|(key, fragment)| (key.to_string(), fragment.to_string()))
                .collect(),
        }
    }
}
