//! iTunes library import and write-back.
//!
//! Both operations are two-phase: validate the property-list library file
//! (parse, count missing files and duplicates) and report what was found,
//! then either import tracks as books or rewrite `Location` entries to the
//! organized paths. Write-back archives the prior XML before mutating it
//! when requested.

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesText, Event as XmlEvent};
use serde_json::json;
use talekeep_model::{Book, BookId, BookLocation, LogLevel};
use url::Url;

use crate::queue::{OperationFunc, ProgressReporter};
use crate::store::Store;
use crate::{CoreError, Result, hashing, media};

use super::PROGRESS_BATCH;
use super::backup::archive_single_file;

/// One track pulled out of the library plist.
#[derive(Debug, Clone, PartialEq)]
pub struct ItunesTrack {
    pub name: Option<String>,
    pub artist: Option<String>,
    pub album: Option<String>,
    pub persistent_id: Option<String>,
    pub location: Option<PathBuf>,
}

pub struct ItunesImportArgs {
    pub store: Arc<dyn Store>,
    pub xml_path: PathBuf,
    pub root: Option<PathBuf>,
}

pub struct ItunesWritebackArgs {
    pub store: Arc<dyn Store>,
    pub xml_path: PathBuf,
    pub make_backup: bool,
}

pub fn import(args: ItunesImportArgs) -> OperationFunc {
    Box::new(move |_token, reporter| Box::pin(run_import(args, reporter)))
}

pub fn writeback(args: ItunesWritebackArgs) -> OperationFunc {
    Box::new(move |_token, reporter| Box::pin(run_writeback(args, reporter)))
}

async fn run_import(args: ItunesImportArgs, reporter: Arc<ProgressReporter>) -> Result<()> {
    let store = args.store;
    let xml = tokio::fs::read_to_string(&args.xml_path).await?;
    let tracks = parse_library(&xml)?;

    // Phase 1: validate and report.
    let total = tracks.len() as u64;
    reporter
        .update_progress(0, total, &format!("validating {total} iTunes tracks"))
        .await?;

    let mut missing = 0u64;
    let mut not_audio = 0u64;
    for track in &tracks {
        match &track.location {
            Some(path) if !path.exists() => missing += 1,
            Some(path) if !media::is_audio_file(path) => not_audio += 1,
            Some(_) => {}
            None => missing += 1,
        }
    }
    reporter
        .log(
            LogLevel::Info,
            "iTunes library validated",
            Some(json!({
                "tracks": total,
                "missing_files": missing,
                "not_audio": not_audio,
            })),
        )
        .await?;

    // Phase 2: import.
    let mut imported = 0u64;
    let mut duplicates = 0u64;
    let mut blocked = 0u64;
    let mut processed = 0u64;

    for track in tracks {
        if reporter.is_canceled().await {
            reporter
                .log(LogLevel::Info, "iTunes import canceled", None)
                .await
                .ok();
            return Ok(());
        }
        processed += 1;

        let Some(path) = track.location.clone().filter(|p| p.exists()) else {
            continue;
        };
        if !media::is_audio_file(&path) {
            continue;
        }

        let hash_path = path.clone();
        let hash = tokio::task::spawn_blocking(move || hashing::sha256_file(&hash_path))
            .await
            .map_err(|e| CoreError::Internal(format!("hash task: {e}")))??;

        if store.is_hash_blocked(&hash).await? {
            blocked += 1;
            continue;
        }
        if store.book_by_hash(&hash).await?.is_some() {
            duplicates += 1;
            continue;
        }

        let location = match &args.root {
            Some(root) if path.starts_with(root) => BookLocation::Library,
            _ => BookLocation::Import,
        };
        let size = tokio::fs::metadata(&path).await?.len();
        let now = Utc::now();
        let fallback = media::infer_book_meta(&path, path.parent().unwrap_or(&path));
        store
            .upsert_book(&Book {
                id: BookId::new(),
                title: track.name.clone().unwrap_or(fallback.title),
                author: track.artist.clone().unwrap_or(fallback.author),
                series: track.album.clone(),
                series_index: None,
                path: path.display().to_string(),
                size_bytes: size,
                content_hash: hash,
                location,
                work_key: None,
                description: None,
                created_at: now,
                updated_at: now,
            })
            .await?;
        imported += 1;

        if processed % PROGRESS_BATCH == 0 {
            reporter
                .update_progress(
                    processed,
                    total,
                    &format!("imported {imported}/{processed} tracks"),
                )
                .await?;
        }
    }

    reporter
        .update_progress(total, total, "iTunes import complete")
        .await?;
    reporter
        .log(
            LogLevel::Info,
            "iTunes import finished",
            Some(json!({
                "imported": imported,
                "duplicates": duplicates,
                "blocked": blocked,
            })),
        )
        .await?;
    Ok(())
}

async fn run_writeback(args: ItunesWritebackArgs, reporter: Arc<ProgressReporter>) -> Result<()> {
    let store = args.store;
    let xml = tokio::fs::read_to_string(&args.xml_path).await?;
    let tracks = parse_library(&xml)?;

    let total = tracks.len() as u64;
    reporter
        .update_progress(0, total, &format!("resolving {total} track locations"))
        .await?;

    // Old location -> current book path, for every track whose file the
    // library now knows under a different path.
    let mut replacements: HashMap<PathBuf, PathBuf> = HashMap::new();
    let mut processed = 0u64;
    for track in &tracks {
        if reporter.is_canceled().await {
            return Ok(());
        }
        processed += 1;
        let Some(old) = &track.location else { continue };

        let book = match store.book_by_path(&old.display().to_string()).await? {
            Some(book) => Some(book),
            None if old.exists() => {
                let hash_path = old.clone();
                let hash = tokio::task::spawn_blocking(move || hashing::sha256_file(&hash_path))
                    .await
                    .map_err(|e| CoreError::Internal(format!("hash task: {e}")))??;
                store.book_by_hash(&hash).await?
            }
            None => None,
        };

        if let Some(book) = book {
            let current = PathBuf::from(&book.path);
            if &current != old {
                replacements.insert(old.clone(), current);
            }
        }

        if processed % PROGRESS_BATCH == 0 {
            reporter
                .update_progress(processed, total, "resolving track locations")
                .await?;
        }
    }

    if replacements.is_empty() {
        reporter
            .update_progress(total, total, "iTunes library already up to date")
            .await?;
        return Ok(());
    }

    if args.make_backup {
        let archive = archive_single_file(&args.xml_path).await?;
        reporter
            .log(
                LogLevel::Info,
                "archived iTunes library before write-back",
                Some(json!({ "archive": archive.display().to_string() })),
            )
            .await?;
    }

    let rewritten = rewrite_locations(&xml, &replacements)?;
    tokio::fs::write(&args.xml_path, rewritten).await?;

    reporter
        .update_progress(total, total, "iTunes write-back complete")
        .await?;
    reporter
        .log(
            LogLevel::Info,
            "iTunes write-back finished",
            Some(json!({ "updated_locations": replacements.len() })),
        )
        .await?;
    Ok(())
}

/// Parse the `Tracks` dictionary out of an iTunes library plist.
pub fn parse_library(xml: &str) -> Result<Vec<ItunesTrack>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut tracks = Vec::new();
    let mut in_tracks = false;
    // Dict nesting depth relative to the Tracks dict: 1 = the id->track map,
    // 2 = a single track's fields.
    let mut depth = 0usize;
    let mut current: Option<ItunesTrack> = None;
    let mut pending_key: Option<String> = None;
    let mut text = String::new();

    let mut buf = Vec::new();
    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| CoreError::invalid(format!("malformed plist: {e}")))?
        {
            XmlEvent::Start(start) => {
                let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                if name == "dict" {
                    if in_tracks {
                        depth += 1;
                        if depth == 2 {
                            current = Some(ItunesTrack {
                                name: None,
                                artist: None,
                                album: None,
                                persistent_id: None,
                                location: None,
                            });
                        }
                    }
                } else {
                    text.clear();
                }
            }
            XmlEvent::Text(t) => {
                text.push_str(
                    &t.unescape()
                        .map_err(|e| CoreError::invalid(format!("malformed plist text: {e}")))?,
                );
            }
            XmlEvent::End(end) => {
                let name = String::from_utf8_lossy(end.name().as_ref()).into_owned();
                match name.as_str() {
                    "dict" => {
                        if in_tracks {
                            if depth == 2 {
                                if let Some(track) = current.take() {
                                    tracks.push(track);
                                }
                            }
                            depth = depth.saturating_sub(1);
                            // The Tracks map itself closed; playlist dicts
                            // further down must not be read as tracks.
                            if depth == 0 {
                                in_tracks = false;
                            }
                        }
                    }
                    "key" => {
                        let key = std::mem::take(&mut text);
                        if !in_tracks && key == "Tracks" {
                            in_tracks = true;
                            depth = 0;
                        } else {
                            pending_key = Some(key);
                        }
                    }
                    "string" | "integer" | "date" => {
                        let value = std::mem::take(&mut text);
                        if let (Some(track), Some(key)) = (current.as_mut(), pending_key.take()) {
                            apply_field(track, &key, &value);
                        }
                    }
                    _ => {
                        pending_key = None;
                    }
                }
            }
            XmlEvent::Empty(_) => {
                // <true/>, <false/>, <data/> values: consume the key.
                pending_key = None;
            }
            XmlEvent::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(tracks)
}

fn apply_field(track: &mut ItunesTrack, key: &str, value: &str) {
    match key {
        "Name" => track.name = Some(value.to_owned()),
        "Artist" => track.artist = Some(value.to_owned()),
        "Album" => track.album = Some(value.to_owned()),
        "Persistent ID" => track.persistent_id = Some(value.to_owned()),
        "Location" => track.location = location_to_path(value),
        _ => {}
    }
}

/// `file://localhost/...` and `file:///...` URLs to filesystem paths.
pub fn location_to_path(location: &str) -> Option<PathBuf> {
    let url = Url::parse(location).ok()?;
    if url.scheme() != "file" {
        return None;
    }
    // iTunes writes file://localhost/ URLs; strip the host before
    // converting.
    let mut url = url;
    let _ = url.set_host(None);
    url.to_file_path().ok()
}

pub fn path_to_location(path: &Path) -> Option<String> {
    Url::from_file_path(path).ok().map(|u| u.to_string())
}

/// Stream the plist and replace the text of every `Location` string that
/// has a mapping, leaving everything else byte-identical where possible.
fn rewrite_locations(xml: &str, replacements: &HashMap<PathBuf, PathBuf>) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    let mut writer = Writer::new(Cursor::new(Vec::new()));

    let mut last_key = String::new();
    let mut element = String::new();
    let mut in_location_string = false;

    let mut buf = Vec::new();
    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| CoreError::invalid(format!("malformed plist: {e}")))?;
        match &event {
            XmlEvent::Start(start) => {
                element = String::from_utf8_lossy(start.name().as_ref()).into_owned();
                in_location_string = element == "string" && last_key == "Location";
            }
            XmlEvent::Text(t) => {
                let value = t
                    .unescape()
                    .map_err(|e| CoreError::invalid(format!("malformed plist text: {e}")))?
                    .into_owned();
                if element == "key" {
                    last_key = value.clone();
                } else if in_location_string {
                    if let Some(new_path) = location_to_path(&value)
                        .and_then(|old| replacements.get(&old))
                        .and_then(|new| path_to_location(new))
                    {
                        writer
                            .write_event(XmlEvent::Text(BytesText::new(&new_path)))
                            .map_err(|e| CoreError::Internal(format!("plist rewrite: {e}")))?;
                        buf.clear();
                        continue;
                    }
                }
            }
            XmlEvent::End(_) => {
                in_location_string = false;
                element.clear();
            }
            XmlEvent::Eof => break,
            _ => {}
        }
        writer
            .write_event(event.borrow())
            .map_err(|e| CoreError::Internal(format!("plist rewrite: {e}")))?;
        buf.clear();
    }

    String::from_utf8(writer.into_inner().into_inner())
        .map_err(|e| CoreError::Internal(format!("plist rewrite utf8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIBRARY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Major Version</key><integer>1</integer>
    <key>Tracks</key>
    <dict>
        <key>1001</key>
        <dict>
            <key>Track ID</key><integer>1001</integer>
            <key>Name</key><string>A Wizard of Earthsea</string>
            <key>Artist</key><string>Ursula K. Le Guin</string>
            <key>Album</key><string>Earthsea</string>
            <key>Persistent ID</key><string>ABCDEF0123456789</string>
            <key>Location</key><string>file:///audio/earthsea/wizard.m4b</string>
        </dict>
        <key>1002</key>
        <dict>
            <key>Track ID</key><integer>1002</integer>
            <key>Name</key><string>Podcast Episode</string>
            <key>Podcast</key><true/>
        </dict>
    </dict>
    <key>Playlists</key>
    <array/>
</dict>
</plist>
"#;

    #[test]
    fn parses_tracks_with_fields() {
        let tracks = parse_library(LIBRARY).unwrap();
        assert_eq!(tracks.len(), 2);

        let wizard = &tracks[0];
        assert_eq!(wizard.name.as_deref(), Some("A Wizard of Earthsea"));
        assert_eq!(wizard.artist.as_deref(), Some("Ursula K. Le Guin"));
        assert_eq!(wizard.album.as_deref(), Some("Earthsea"));
        assert_eq!(wizard.persistent_id.as_deref(), Some("ABCDEF0123456789"));
        assert_eq!(
            wizard.location.as_deref(),
            Some(Path::new("/audio/earthsea/wizard.m4b"))
        );

        // The second track has no location and a boolean field.
        assert_eq!(tracks[1].name.as_deref(), Some("Podcast Episode"));
        assert_eq!(tracks[1].location, None);
    }

    #[test]
    fn location_url_forms() {
        assert_eq!(
            location_to_path("file:///a/b%20c.mp3").as_deref(),
            Some(Path::new("/a/b c.mp3"))
        );
        assert_eq!(
            location_to_path("file://localhost/a/b.mp3").as_deref(),
            Some(Path::new("/a/b.mp3"))
        );
        assert_eq!(location_to_path("https://example.com/x.mp3"), None);
    }

    #[test]
    fn rewrite_replaces_only_mapped_locations() {
        let mut replacements = HashMap::new();
        replacements.insert(
            PathBuf::from("/audio/earthsea/wizard.m4b"),
            PathBuf::from("/library/Ursula K. Le Guin/Earthsea/01 - A Wizard of Earthsea.m4b"),
        );

        let rewritten = rewrite_locations(LIBRARY, &replacements).unwrap();
        assert!(rewritten.contains("01%20-%20A%20Wizard%20of%20Earthsea.m4b"));
        assert!(!rewritten.contains("file:///audio/earthsea/wizard.m4b"));
        // Untouched content survives.
        assert!(rewritten.contains("<key>Persistent ID</key>"));
        assert!(rewritten.contains("Podcast Episode"));

        // The rewritten document still parses, and the new location lands.
        let tracks = parse_library(&rewritten).unwrap();
        assert_eq!(
            tracks[0].location.as_deref(),
            Some(Path::new(
                "/library/Ursula K. Le Guin/Earthsea/01 - A Wizard of Earthsea.m4b"
            ))
        );
    }
}
