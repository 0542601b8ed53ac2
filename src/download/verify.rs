//! Artifact verification and promotion into the output directory.
//!
//! A finished transfer is only trusted after [`inspect_file`] accepts it:
//! the file must be non-empty, match the advertised size, and not look like
//! an error page. Accepted files are moved out of the incomplete directory
//! by [`promote`].

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, instrument, warn};

use super::constants::SNIFF_BYTES;
use super::filename::resolve_unique_path;
use crate::failure::{ErrorKind, JobError};

/// A verified file in the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedArtifact {
    pub path: PathBuf,
    pub size: u64,
}

/// Why a finished transfer was rejected.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VerificationError {
    /// The file is shorter or longer than the server advertised.
    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// The file is empty, unreadable, or an error page.
    #[error("invalid content: {reason}")]
    InvalidContent { reason: String },
}

impl VerificationError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidContent {
            reason: reason.into(),
        }
    }

    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SizeMismatch { .. } => ErrorKind::SizeMismatch,
            Self::InvalidContent { .. } => ErrorKind::InvalidContent,
        }
    }

    #[must_use]
    pub fn to_job_error(&self) -> JobError {
        JobError::new(self.kind(), self.to_string())
    }
}

/// The stored first entry of every EPUB container, right after the zip header.
const EPUB_MIMETYPE: &[u8] = b"mimetypeapplication/epub+zip";

/// What the head of a file looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentSniff {
    /// A recognized book or archive signature.
    Known(&'static str),
    /// HTML, XML, or JSON text: an error page, not a book.
    Markup(&'static str),
    /// Anything else.
    Unknown,
}

/// Classifies the first bytes of a file.
#[must_use]
pub fn sniff(head: &[u8]) -> ContentSniff {
    if head.starts_with(b"PK\x03\x04") && head.len() >= 58 && &head[30..58] == EPUB_MIMETYPE {
        return ContentSniff::Known("epub");
    }
    if head.starts_with(b"PK\x03\x04") {
        return ContentSniff::Known("zip");
    }
    if head.starts_with(b"%PDF") {
        return ContentSniff::Known("pdf");
    }
    if head.len() >= 68 && &head[60..68] == b"BOOKMOBI" {
        return ContentSniff::Known("mobi");
    }
    if head.starts_with(b"AT&TFORM") {
        return ContentSniff::Known("djvu");
    }
    if head.starts_with(b"Rar!") {
        return ContentSniff::Known("rar");
    }

    let text = String::from_utf8_lossy(head);
    let trimmed = text.trim_start_matches('\u{feff}').trim_start();
    let lowered: String = trimmed.chars().take(256).collect::<String>().to_lowercase();
    if lowered.starts_with("<!doctype html")
        || lowered.starts_with("<html")
        || lowered.starts_with("<head")
        || lowered.starts_with("<body")
        || lowered.contains("<title>")
    {
        return ContentSniff::Markup("html");
    }
    if lowered.starts_with("<?xml") && !lowered.contains("fictionbook") {
        return ContentSniff::Markup("xml");
    }
    if (lowered.starts_with('{') || lowered.starts_with('['))
        && serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
    {
        return ContentSniff::Markup("json");
    }
    if lowered.starts_with("{\"error") || lowered.starts_with("{ \"error") {
        return ContentSniff::Markup("json");
    }
    ContentSniff::Unknown
}

/// Checks a finished file against its expected size and content rules.
///
/// # Errors
///
/// [`VerificationError::InvalidContent`] for empty, unreadable, or markup
/// files; [`VerificationError::SizeMismatch`] when `expected_size` is known
/// and differs from the file size.
pub async fn inspect_file(path: &Path, expected_size: Option<u64>) -> Result<u64, VerificationError> {
    inspect(path, expected_size).await.map(|(size, _)| size)
}

#[instrument(level = "debug", skip(path), fields(path = %path.display()))]
async fn inspect(
    path: &Path,
    expected_size: Option<u64>,
) -> Result<(u64, ContentSniff), VerificationError> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| VerificationError::invalid(format!("cannot stat artifact: {e}")))?;
    let actual = metadata.len();
    if actual == 0 {
        return Err(VerificationError::invalid("empty file"));
    }
    if let Some(expected) = expected_size
        && expected > 0
        && expected != actual
    {
        warn!(expected, actual, "artifact size mismatch");
        return Err(VerificationError::SizeMismatch { expected, actual });
    }

    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| VerificationError::invalid(format!("cannot open artifact: {e}")))?;
    let mut head = vec![0_u8; SNIFF_BYTES];
    let mut filled = 0;
    while filled < head.len() {
        let read = file
            .read(&mut head[filled..])
            .await
            .map_err(|e| VerificationError::invalid(format!("cannot read artifact: {e}")))?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    head.truncate(filled);

    let sniffed = sniff(&head);
    match sniffed {
        ContentSniff::Markup(kind) => {
            warn!(kind, "artifact is an error page");
            return Err(VerificationError::invalid(format!("file is {kind} text, not a book")));
        }
        ContentSniff::Known(kind) => debug!(kind, size = actual, "artifact signature recognized"),
        ContentSniff::Unknown => debug!(size = actual, "artifact accepted without known signature"),
    }
    Ok((actual, sniffed))
}

/// Swaps the `.bin` fallback for the extension the file signature names.
fn refine_extension(filename: &str, sniffed: ContentSniff) -> String {
    match (filename.strip_suffix(".bin"), sniffed) {
        (Some(stem), ContentSniff::Known(kind)) if !stem.is_empty() => format!("{stem}.{kind}"),
        _ => filename.to_string(),
    }
}

/// Verifies `part_path` and moves it into `output_dir` as `filename`.
///
/// The final name gets a numeric suffix when `filename` already exists.
/// A `.bin` name takes the extension of a recognized signature.
/// A rejected file is removed unless it may still be resumed.
///
/// # Errors
///
/// Returns the [`VerificationError`] from [`inspect_file`], or
/// `InvalidContent` when the file cannot be moved.
#[instrument(skip(part_path, output_dir), fields(part = %part_path.display()))]
pub async fn promote(
    part_path: &Path,
    output_dir: &Path,
    filename: &str,
    expected_size: Option<u64>,
) -> Result<VerifiedArtifact, VerificationError> {
    let (size, sniffed) = match inspect(part_path, expected_size).await {
        Ok(inspected) => inspected,
        Err(error) => {
            if matches!(error, VerificationError::InvalidContent { .. }) {
                let _ = tokio::fs::remove_file(part_path).await;
            }
            return Err(error);
        }
    };

    tokio::fs::create_dir_all(output_dir)
        .await
        .map_err(|e| VerificationError::invalid(format!("cannot create output dir: {e}")))?;
    let filename = refine_extension(filename, sniffed);
    let destination = resolve_unique_path(output_dir, &filename);
    move_file(part_path, &destination)
        .await
        .map_err(|e| VerificationError::invalid(format!("cannot move artifact: {e}")))?;

    info!(path = %destination.display(), size, "artifact verified");
    Ok(VerifiedArtifact {
        path: destination,
        size,
    })
}

async fn move_file(from: &Path, to: &Path) -> std::io::Result<()> {
    match tokio::fs::rename(from, to).await {
        Ok(()) => Ok(()),
        // Cross-device: copy then delete.
        Err(_) => {
            tokio::fs::copy(from, to).await?;
            tokio::fs::remove_file(from).await
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mobi_header() -> Vec<u8> {
        let mut bytes = vec![0_u8; 60];
        bytes.extend_from_slice(b"BOOKMOBI");
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        bytes
    }

    fn epub_header() -> Vec<u8> {
        let mut bytes = b"PK\x03\x04".to_vec();
        bytes.resize(30, 0);
        bytes.extend_from_slice(EPUB_MIMETYPE);
        bytes.extend_from_slice(b"PK\x03\x04");
        bytes
    }

    // ==================== Sniff Tests ====================

    #[test]
    fn test_sniff_known_signatures() {
        assert_eq!(sniff(b"PK\x03\x04rest"), ContentSniff::Known("zip"));
        assert_eq!(sniff(b"%PDF-1.7\n"), ContentSniff::Known("pdf"));
        assert_eq!(sniff(&mobi_header()), ContentSniff::Known("mobi"));
        assert_eq!(sniff(b"AT&TFORM\0\0"), ContentSniff::Known("djvu"));
        assert_eq!(sniff(b"Rar!\x1a\x07"), ContentSniff::Known("rar"));
    }

    #[test]
    fn test_sniff_epub_container() {
        assert_eq!(sniff(&epub_header()), ContentSniff::Known("epub"));
    }

    #[test]
    fn test_sniff_markup() {
        assert_eq!(
            sniff(b"  <!DOCTYPE html><html><body>Not found</body></html>"),
            ContentSniff::Markup("html")
        );
        assert_eq!(
            sniff(b"<?xml version=\"1.0\"?><Error/>"),
            ContentSniff::Markup("xml")
        );
        assert_eq!(
            sniff(br#"{"error":"Not a member"}"#),
            ContentSniff::Markup("json")
        );
    }

    #[test]
    fn test_sniff_fictionbook_xml_is_not_markup() {
        assert_eq!(
            sniff(b"<?xml version=\"1.0\"?><FictionBook xmlns=\"x\">"),
            ContentSniff::Unknown
        );
    }

    #[test]
    fn test_sniff_unknown_binary() {
        assert_eq!(sniff(&[0xde, 0xad, 0xbe, 0xef]), ContentSniff::Unknown);
    }

    // ==================== Inspect Tests ====================

    #[tokio::test]
    async fn test_inspect_empty_file_is_invalid() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("empty.part");
        std::fs::write(&path, b"").unwrap();
        let result = inspect_file(&path, None).await;
        assert!(matches!(result, Err(VerificationError::InvalidContent { .. })));
    }

    #[tokio::test]
    async fn test_inspect_size_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.part");
        std::fs::write(&path, b"%PDF-1.4 partial").unwrap();
        let result = inspect_file(&path, Some(1000)).await;
        assert_eq!(
            result,
            Err(VerificationError::SizeMismatch {
                expected: 1000,
                actual: 16
            })
        );
    }

    #[tokio::test]
    async fn test_inspect_html_error_page() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("page.part");
        std::fs::write(&path, b"<html><title>Error</title></html>").unwrap();
        let result = inspect_file(&path, None).await;
        assert!(matches!(result, Err(VerificationError::InvalidContent { .. })));
    }

    #[tokio::test]
    async fn test_inspect_accepts_matching_epub() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.part");
        std::fs::write(&path, b"PK\x03\x04mimetypeapplication/epub+zip").unwrap();
        assert_eq!(inspect_file(&path, Some(36)).await, Ok(36));
    }

    // ==================== Promote Tests ====================

    #[tokio::test]
    async fn test_promote_moves_into_output_with_unique_name() {
        let dir = TempDir::new().unwrap();
        let incomplete = dir.path().join("incomplete");
        let output = dir.path().join("out");
        std::fs::create_dir_all(&incomplete).unwrap();
        std::fs::create_dir_all(&output).unwrap();
        std::fs::write(output.join("Dune.pdf"), b"older").unwrap();
        let part = incomplete.join("Dune.pdf.part");
        std::fs::write(&part, b"%PDF-1.4 body").unwrap();

        let artifact = promote(&part, &output, "Dune.pdf", None).await.unwrap();

        assert_eq!(artifact.path, output.join("Dune_1.pdf"));
        assert_eq!(artifact.size, 13);
        assert!(!part.exists());
    }

    #[tokio::test]
    async fn test_promote_rejected_content_never_reaches_output() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out");
        let part = dir.path().join("bad.part");
        std::fs::write(&part, b"<!doctype html><p>quota exceeded</p>").unwrap();

        let result = promote(&part, &output, "bad.epub", None).await;

        assert!(matches!(result, Err(VerificationError::InvalidContent { .. })));
        assert!(!output.join("bad.epub").exists());
        assert!(!part.exists());
    }

    #[tokio::test]
    async fn test_promote_size_mismatch_keeps_part_for_resume() {
        let dir = TempDir::new().unwrap();
        let part = dir.path().join("short.part");
        std::fs::write(&part, b"%PDF").unwrap();

        let result = promote(&part, &dir.path().join("out"), "x.pdf", Some(10)).await;

        assert!(matches!(result, Err(VerificationError::SizeMismatch { .. })));
        assert!(part.exists());
    }

    #[tokio::test]
    async fn test_promote_names_bin_artifact_after_signature() {
        let dir = TempDir::new().unwrap();
        let output = dir.path().join("out");
        let pdf = dir.path().join("a.part");
        std::fs::write(&pdf, b"%PDF-1.7 body").unwrap();
        let epub = dir.path().join("b.part");
        std::fs::write(&epub, epub_header()).unwrap();

        let first = promote(&pdf, &output, "Dune.bin", None).await.unwrap();
        let second = promote(&epub, &output, "Emma.bin", None).await.unwrap();

        assert_eq!(first.path, output.join("Dune.pdf"));
        assert_eq!(second.path, output.join("Emma.epub"));
    }

    #[tokio::test]
    async fn test_promote_keeps_bin_for_unknown_signature() {
        let dir = TempDir::new().unwrap();
        let part = dir.path().join("c.part");
        std::fs::write(&part, [0xde, 0xad, 0xbe, 0xef]).unwrap();

        let artifact = promote(&part, &dir.path().join("out"), "blob.bin", None)
            .await
            .unwrap();

        assert_eq!(artifact.path, dir.path().join("out").join("blob.bin"));
    }

    #[test]
    fn test_verification_error_kinds() {
        assert_eq!(
            VerificationError::SizeMismatch {
                expected: 1,
                actual: 2
            }
            .kind(),
            ErrorKind::SizeMismatch
        );
        assert_eq!(
            VerificationError::invalid("html").kind(),
            ErrorKind::InvalidContent
        );
    }
}
