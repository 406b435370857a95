//! Pure helpers for classifying audio files and inferring book metadata from
//! paths. Tag parsing proper is out of core scope; these functions stand in
//! front of it and never touch the filesystem.

use std::path::{Component, Path};

/// File extensions the scanner treats as audiobook audio.
pub const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "m4b", "flac", "ogg", "opus", "aac", "wma"];

pub fn is_audio_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_ascii_lowercase();
            AUDIO_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

/// Metadata inferred from a file's location and name.
#[derive(Debug, Clone, PartialEq)]
pub struct InferredMeta {
    pub title: String,
    pub author: String,
    pub series: Option<String>,
    pub series_index: Option<f64>,
}

/// Infer title/author/series from path layout.
///
/// Recognized layouts, relative to the walked base directory:
/// `Author/Series/Title.ext`, `Author/Title.ext`, and a bare
/// `Author - Title.ext` file name. A leading `NN - ` on a title inside a
/// series directory is read as the series index.
pub fn infer_book_meta(path: &Path, base: &Path) -> InferredMeta {
    let rel = path.strip_prefix(base).unwrap_or(path);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("Unknown")
        .to_owned();

    let dirs: Vec<String> = rel
        .parent()
        .map(|p| {
            p.components()
                .filter_map(|c| match c {
                    Component::Normal(os) => os.to_str().map(str::to_owned),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    match dirs.len() {
        0 => {
            // Bare file: try "Author - Title".
            if let Some((author, title)) = stem.split_once(" - ") {
                InferredMeta {
                    title: title.trim().to_owned(),
                    author: author.trim().to_owned(),
                    series: None,
                    series_index: None,
                }
            } else {
                InferredMeta {
                    title: stem,
                    author: "Unknown".into(),
                    series: None,
                    series_index: None,
                }
            }
        }
        1 => InferredMeta {
            title: stem,
            author: dirs[0].clone(),
            series: None,
            series_index: None,
        },
        _ => {
            let (series_index, title) = split_series_index(&stem);
            InferredMeta {
                title,
                author: dirs[0].clone(),
                series: Some(dirs[1].clone()),
                series_index,
            }
        }
    }
}

/// Split a leading `NN - ` ordinal off a title.
fn split_series_index(stem: &str) -> (Option<f64>, String) {
    if let Some((prefix, rest)) = stem.split_once(" - ") {
        if let Ok(index) = prefix.trim().parse::<f64>() {
            return (Some(index), rest.trim().to_owned());
        }
    }
    (None, stem.to_owned())
}

/// Make a string safe to use as a single path component.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let trimmed = cleaned.trim().trim_end_matches('.').to_owned();
    if trimmed.is_empty() { "_".into() } else { trimmed }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn audio_extension_detection() {
        assert!(is_audio_file(Path::new("/x/book.m4b")));
        assert!(is_audio_file(Path::new("/x/book.MP3")));
        assert!(!is_audio_file(Path::new("/x/cover.jpg")));
        assert!(!is_audio_file(Path::new("/x/noext")));
    }

    #[test]
    fn author_series_title_layout() {
        let base = PathBuf::from("/library");
        let meta = infer_book_meta(
            Path::new("/library/Ursula K. Le Guin/Earthsea/1 - A Wizard of Earthsea.m4b"),
            &base,
        );
        assert_eq!(meta.author, "Ursula K. Le Guin");
        assert_eq!(meta.series.as_deref(), Some("Earthsea"));
        assert_eq!(meta.series_index, Some(1.0));
        assert_eq!(meta.title, "A Wizard of Earthsea");
    }

    #[test]
    fn author_title_layout() {
        let base = PathBuf::from("/library");
        let meta = infer_book_meta(Path::new("/library/Ann Leckie/Ancillary Justice.mp3"), &base);
        assert_eq!(meta.author, "Ann Leckie");
        assert_eq!(meta.series, None);
        assert_eq!(meta.title, "Ancillary Justice");
    }

    #[test]
    fn bare_file_with_dash() {
        let base = PathBuf::from("/import");
        let meta = infer_book_meta(Path::new("/import/Frank Herbert - Dune.mp3"), &base);
        assert_eq!(meta.author, "Frank Herbert");
        assert_eq!(meta.title, "Dune");
    }

    #[test]
    fn sanitize_strips_separators() {
        assert_eq!(sanitize_component("AC/DC: Live?"), "AC_DC_ Live_");
        assert_eq!(sanitize_component("  ."), "_");
    }
}
