//! Filename derivation, sanitization, and path resolution for artifacts.
//!
//! An artifact is named after the item title plus an extension detected from
//! the response. Without a usable title the server-suggested name is used.

use std::path::{Component, Path, PathBuf};

use url::Url;

use super::constants::PART_SUFFIX;

/// Extensions recognized as book formats.
pub const BOOK_EXTENSIONS: &[&str] = &[
    ".epub", ".pdf", ".mobi", ".azw3", ".azw", ".cbr", ".cbz", ".djvu", ".fb2", ".zip", ".rar",
];

/// Longest stem kept when naming a file after a title.
const MAX_STEM_CHARS: usize = 150;

/// Everything the filename is derived from.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameHints<'a> {
    pub title: Option<&'a str>,
    pub url: Option<&'a Url>,
    pub content_type: Option<&'a str>,
    pub content_disposition: Option<&'a str>,
}

/// Derives the artifact filename: `title + extension`, else the suggested name.
///
/// The extension comes from the content type, then the URL path, then the
/// `Content-Disposition` filename, else `.bin`.
#[must_use]
pub fn derive_filename(hints: &NameHints<'_>) -> String {
    let disposition_name = hints
        .content_disposition
        .and_then(parse_content_disposition)
        .map(|name| strip_archive_suffix(&name));

    let extension = hints
        .content_type
        .and_then(extension_from_content_type)
        .map(ToString::to_string)
        .or_else(|| hints.url.and_then(|u| extension_from_url(u.as_str())))
        .or_else(|| disposition_name.as_deref().and_then(extension_of))
        .unwrap_or_else(|| ".bin".to_string());

    if let Some(title) = hints.title.map(str::trim).filter(|t| !t.is_empty()) {
        let stem: String = sanitize_filename(title).chars().take(MAX_STEM_CHARS).collect();
        return format!("{}{extension}", stem.trim_end());
    }

    let suggested = disposition_name.or_else(|| {
        hints
            .url
            .and_then(last_url_segment)
            .map(|segment| strip_archive_suffix(&segment))
    });

    match suggested {
        Some(name) if extension_of(&name).is_some() => sanitize_filename(&name),
        Some(name) => format!("{}{extension}", sanitize_filename(&name)),
        None => format!("download{extension}"),
    }
}

/// Name of the in-flight file for an item.
///
/// Keyed by the item identifier, never the title: two items sharing a title
/// must not resume each other's bytes.
#[must_use]
pub fn part_file_name(item_key: &str) -> String {
    format!("{}{PART_SUFFIX}", sanitize_filename(item_key))
}

/// Strips the `" -- <md5> -- Anna's Archive"` tail of fast-download file names.
///
/// The extension is kept: `Title -- abc... -- Anna's Archive.epub` becomes `Title.epub`.
#[must_use]
pub fn strip_archive_suffix(name: &str) -> String {
    let (stem, ext) = split_extension(name);
    let mut segments: Vec<&str> = stem.split(" -- ").collect();
    let Some(last) = segments.last() else {
        return name.to_string();
    };
    if !(last.starts_with("Anna") && last.ends_with("Archive")) || segments.len() < 2 {
        return name.to_string();
    }
    segments.pop();
    if segments.len() > 1
        && segments
            .last()
            .is_some_and(|s| s.len() == 32 && s.chars().all(|c| c.is_ascii_hexdigit()))
    {
        segments.pop();
    }
    format!("{}{ext}", segments.join(" -- ").trim())
}

pub(crate) fn extension_from_url(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let last_segment = parsed.path_segments()?.next_back()?;
    let dot_index = last_segment.rfind('.')?;
    let ext = &last_segment[dot_index..];
    if ext.len() <= 1 || ext.len() > 12 {
        return None;
    }
    let ext = ext.to_lowercase();
    // Script endpoints like get.php are not the artifact's type.
    BOOK_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

fn extension_of(name: &str) -> Option<String> {
    let (_, ext) = split_extension(name);
    let ext = ext.to_lowercase();
    (ext.len() > 1 && ext.len() <= 12).then_some(ext)
}

fn split_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 && !name[pos..].contains(' ') => (&name[..pos], &name[pos..]),
        _ => (name, ""),
    }
}

fn last_url_segment(url: &Url) -> Option<String> {
    let last = url.path_segments()?.next_back()?;
    if last.is_empty() {
        return None;
    }
    let decoded = urlencoding::decode(last).map_or_else(|_| last.to_string(), |d| d.into_owned());
    Some(decoded)
}

/// Guess a book extension from the Content-Type header.
pub(crate) fn extension_from_content_type(content_type: &str) -> Option<&'static str> {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase();

    match mime.as_str() {
        "application/pdf" => Some(".pdf"),
        "application/epub+zip" => Some(".epub"),
        "application/x-mobipocket-ebook" => Some(".mobi"),
        "application/vnd.amazon.ebook" => Some(".azw3"),
        "application/x-cbr" | "application/vnd.comicbook-rar" => Some(".cbr"),
        "application/x-cbz" | "application/vnd.comicbook+zip" => Some(".cbz"),
        "image/vnd.djvu" | "image/x-djvu" => Some(".djvu"),
        "application/x-fictionbook+xml" => Some(".fb2"),
        "application/zip" => Some(".zip"),
        "application/x-rar-compressed" | "application/vnd.rar" => Some(".rar"),
        _ => None,
    }
}

/// Parses Content-Disposition header to extract filename.
///
/// Handles both:
/// - `attachment; filename="example.pdf"`
/// - `attachment; filename=example.pdf`
/// - `attachment; filename*=UTF-8''example.pdf` (RFC 5987)
pub(crate) fn parse_content_disposition(header: &str) -> Option<String> {
    if let Some(pos) = header.find("filename*=") {
        let start = pos + 10;
        let value = header[start..].trim();
        // charset'language'encoded_value
        if let Some(quote_pos) = value.find("''") {
            let encoded = &value[quote_pos + 2..];
            let end = encoded.find(';').unwrap_or(encoded.len());
            let encoded_name = &encoded[..end].trim();
            if let Ok(decoded) = urlencoding::decode(encoded_name) {
                return Some(decoded.into_owned());
            }
        }
    }

    if let Some(pos) = header.find("filename=") {
        let start = pos + 9;
        let value = header[start..].trim();

        if let Some(stripped) = value.strip_prefix('"') {
            if let Some(end) = stripped.find('"') {
                return Some(stripped[..end].to_string());
            }
        } else {
            let end = value.find(';').unwrap_or(value.len());
            let filename = value[..end].trim();
            if !filename.is_empty() {
                return Some(filename.to_string());
            }
        }
    }

    None
}

/// Sanitizes filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems:
/// / \ : * ? " < > |
pub(crate) fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

/// Resolves a unique file path, adding numeric suffix if file exists.
///
/// `book.epub`, then `book_1.epub`, `book_2.epub`, ...
pub(crate) fn resolve_unique_path(dir: &Path, filename: &str) -> PathBuf {
    let filename = {
        let sanitized = sanitize_filename(filename);
        if sanitized.contains('/')
            || sanitized.contains('\\')
            || sanitized.trim_matches('_').is_empty()
        {
            "download.bin".to_string()
        } else {
            sanitized
        }
    };
    let base_path = dir.join(&filename);

    if !base_path.exists() {
        return base_path;
    }

    let (stem, ext) = split_extension(&filename);

    for i in 1..1000 {
        let new_path = dir.join(format!("{stem}_{i}{ext}"));
        if !new_path.exists() {
            return new_path;
        }
    }

    dir.join(format!("{stem}_{}{ext}", crate::clock::unix_millis()))
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}
