//! Sign Lookup Index
//!
//! Maps normalized words to pre-recorded sign clips. The index is built from
//! the asset directory in one scan and is read-only afterwards, so requests
//! never touch the filesystem.

use serde::Serialize;
use std::{
    collections::{HashMap, hash_map::Entry},
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, info, warn};

/// Clip container formats, declared in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetFormat {
    Mp4,
    Webm,
    Gif,
}

impl AssetFormat {
    pub const PREFERENCE: [AssetFormat; 3] = [AssetFormat::Mp4, AssetFormat::Webm, AssetFormat::Gif];

    pub fn extension(self) -> &'static str {
        match self {
            AssetFormat::Mp4 => "mp4",
            AssetFormat::Webm => "webm",
            AssetFormat::Gif => "gif",
        }
    }

    /// Matches a file extension, ignoring case.
    pub fn from_extension(ext: &str) -> Option<Self> {
        Self::PREFERENCE
            .into_iter()
            .find(|format| format.extension().eq_ignore_ascii_case(ext))
    }
}

/// A clip that signs one word.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignAsset {
    pub word: String,
    /// Public URL path the client fetches the clip from.
    pub clip_path: String,
    pub format: AssetFormat,
}

/// Splits free text into lookup tokens.
///
/// Removes everything that is neither a word character (alphanumeric or `_`)
/// nor whitespace, lowercases, and splits on whitespace. Lowercasing can
/// itself produce marks that are not word characters (`İ` becomes `i` plus a
/// combining dot); those are dropped too, so feeding the joined output back
/// in yields the same tokens.
pub fn normalize(text: &str) -> Vec<String> {
    let cleaned: String = text.chars().filter(|c| is_token_char(*c)).collect();
    let lowered: String = cleaned
        .to_lowercase()
        .chars()
        .filter(|c| is_token_char(*c))
        .collect();
    lowered.split_whitespace().map(str::to_owned).collect()
}

fn is_token_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c.is_whitespace()
}

fn is_normalized_word(word: &str) -> bool {
    matches!(normalize(word).as_slice(), [token] if token == word)
}

#[derive(Debug, Clone, Default)]
pub struct SignIndex {
    assets: HashMap<String, SignAsset>,
    root: PathBuf,
    url_prefix: String,
}

impl SignIndex {
    /// Scans `dir` (non-recursively) and indexes every clip whose file stem is
    /// a normalized word. When several formats exist for a word, the first in
    /// [`AssetFormat::PREFERENCE`] wins. A missing directory produces an empty
    /// index.
    pub fn build(dir: impl AsRef<Path>, url_prefix: &str) -> io::Result<Self> {
        let root = dir.as_ref().to_path_buf();
        let url_prefix = url_prefix.trim_end_matches('/').to_string();
        let mut assets: HashMap<String, SignAsset> = HashMap::new();

        let entries = match fs::read_dir(&root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(path = %root.display(), "Sign asset directory not found; index is empty");
                return Ok(Self {
                    assets,
                    root,
                    url_prefix,
                });
            }
            Err(e) => return Err(e),
        };

        for entry in entries {
            let path = entry?.path();
            if !path.is_file() {
                continue;
            }
            let Some(format) = path
                .extension()
                .and_then(|ext| ext.to_str())
                .and_then(AssetFormat::from_extension)
            else {
                continue;
            };
            let (Some(stem), Some(file_name)) = (
                path.file_stem().and_then(|s| s.to_str()),
                path.file_name().and_then(|s| s.to_str()),
            ) else {
                continue;
            };
            if !is_normalized_word(stem) {
                debug!(file = %path.display(), "Skipping clip whose name is not a normalized word");
                continue;
            }

            let asset = SignAsset {
                word: stem.to_string(),
                clip_path: format!("{url_prefix}/{file_name}"),
                format,
            };
            match assets.entry(asset.word.clone()) {
                Entry::Occupied(mut existing) => {
                    if asset.format < existing.get().format {
                        existing.insert(asset);
                    }
                }
                Entry::Vacant(slot) => {
                    slot.insert(asset);
                }
            }
        }

        info!(path = %root.display(), signs = assets.len(), "Sign index built");
        Ok(Self {
            assets,
            root,
            url_prefix,
        })
    }

    /// Builds a fresh index from the same directory and prefix.
    pub fn rebuild(&self) -> io::Result<Self> {
        Self::build(&self.root, &self.url_prefix)
    }

    /// Resolves `text` to clips, one per matched token, in input order.
    /// Unknown tokens are skipped.
    pub fn resolve(&self, text: &str) -> Vec<SignAsset> {
        normalize(text)
            .iter()
            .filter_map(|word| self.assets.get(word).cloned())
            .collect()
    }

    /// Like [`SignIndex::resolve`], returning only the clip URLs.
    pub fn resolve_urls(&self, text: &str) -> Vec<String> {
        self.resolve(text)
            .into_iter()
            .map(|asset| asset.clip_path)
            .collect()
    }

    pub fn get(&self, word: &str) -> Option<&SignAsset> {
        self.assets.get(word)
    }

    /// All indexed words, sorted.
    pub fn words(&self) -> Vec<&str> {
        let mut words: Vec<&str> = self.assets.keys().map(String::as_str).collect();
        words.sort_unstable();
        words
    }

    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}
