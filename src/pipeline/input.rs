//! Input resolution: normalise a path, URL or uploaded bytes to a local PDF file.
//!
//! ## Why a temp file for downloads and uploads?
//!
//! pdfium opens documents by path. Writing remote or uploaded bytes into a
//! `TempDir` gives it a path while guaranteeing cleanup when the
//! [`ResolvedInput`] is dropped, which the orchestrator does once the task
//! ends on any path. The `%PDF` magic is checked up front so a bad upload
//! is rejected before a task is even queued.

use crate::error::Pdf2HtmlError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

const PDF_MAGIC: &[u8; 4] = b"%PDF";

/// A PDF on local disk, possibly owned by a temp directory.
#[derive(Debug)]
pub enum ResolvedInput {
    /// Input was already a local file.
    Local(PathBuf),
    /// Input was a URL; the PDF was downloaded into `_temp_dir`.
    Downloaded {
        url: String,
        path: PathBuf,
        _temp_dir: TempDir,
    },
    /// Input arrived as bytes (e.g. an HTTP upload).
    Uploaded {
        name: String,
        path: PathBuf,
        _temp_dir: TempDir,
    },
}

impl ResolvedInput {
    /// Path to the PDF file regardless of how it was resolved.
    pub fn path(&self) -> &Path {
        match self {
            ResolvedInput::Local(p) => p,
            ResolvedInput::Downloaded { path, .. } | ResolvedInput::Uploaded { path, .. } => path,
        }
    }

    /// What the user supplied, for logs and task listings.
    pub fn label(&self) -> String {
        match self {
            ResolvedInput::Local(p) => p.display().to_string(),
            ResolvedInput::Downloaded { url, .. } => url.clone(),
            ResolvedInput::Uploaded { name, .. } => name.clone(),
        }
    }

    /// Write `bytes` to a managed temp file after checking they are a PDF.
    pub async fn from_bytes(
        bytes: &[u8],
        name: &str,
        max_bytes: usize,
    ) -> Result<Self, Pdf2HtmlError> {
        if bytes.len() > max_bytes {
            return Err(Pdf2HtmlError::PayloadTooLarge {
                size: bytes.len(),
                limit: max_bytes,
            });
        }
        let file_name = sanitise_file_name(name);
        check_magic(bytes, Path::new(&file_name))?;

        let temp_dir = TempDir::new().map_err(|e| Pdf2HtmlError::Internal(e.to_string()))?;
        let path = temp_dir.path().join(&file_name);
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| Pdf2HtmlError::Internal(format!("Failed to write temp file: {}", e)))?;
        debug!("Stored upload '{}' ({} bytes)", file_name, bytes.len());

        Ok(ResolvedInput::Uploaded {
            name: file_name,
            path,
            _temp_dir: temp_dir,
        })
    }
}

/// Check if the input string looks like a URL.
pub fn is_url(input: &str) -> bool {
    input.starts_with("http://") || input.starts_with("https://")
}

/// Resolve the input string to a local PDF file path.
///
/// URLs are downloaded to a temporary directory; local files are checked
/// for existence, readability and PDF magic bytes.
pub async fn resolve_input(input: &str, timeout_secs: u64) -> Result<ResolvedInput, Pdf2HtmlError> {
    if input.trim().is_empty() {
        return Err(Pdf2HtmlError::InvalidInput {
            input: input.to_string(),
        });
    }
    if is_url(input) {
        download_url(input, timeout_secs).await
    } else {
        resolve_local(input)
    }
}

fn check_magic(bytes: &[u8], path: &Path) -> Result<(), Pdf2HtmlError> {
    if bytes.len() < 4 || &bytes[..4] != PDF_MAGIC {
        let mut magic = [0u8; 4];
        let n = bytes.len().min(4);
        magic[..n].copy_from_slice(&bytes[..n]);
        return Err(Pdf2HtmlError::NotAPdf {
            path: path.to_path_buf(),
            magic,
        });
    }
    Ok(())
}

/// Resolve a local file path, validating existence and PDF magic bytes.
fn resolve_local(path_str: &str) -> Result<ResolvedInput, Pdf2HtmlError> {
    let path = PathBuf::from(path_str);

    if !path.exists() {
        return Err(Pdf2HtmlError::FileNotFound { path });
    }

    match std::fs::File::open(&path) {
        Ok(mut f) => {
            use std::io::Read;
            let mut magic = [0u8; 4];
            let n = f.read(&mut magic).unwrap_or(0);
            check_magic(&magic[..n], &path)?;
        }
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            return Err(Pdf2HtmlError::PermissionDenied { path });
        }
        Err(_) => {
            return Err(Pdf2HtmlError::FileNotFound { path });
        }
    }

    debug!("Resolved local PDF: {}", path.display());
    Ok(ResolvedInput::Local(path))
}

/// Download a URL to a temporary directory.
async fn download_url(url: &str, timeout_secs: u64) -> Result<ResolvedInput, Pdf2HtmlError> {
    info!("Downloading PDF from: {}", url);
    let failed = |reason: String| Pdf2HtmlError::DownloadFailed {
        url: url.to_string(),
        reason,
    };

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| failed(e.to_string()))?;

    let response = client.get(url).send().await.map_err(|e| {
        if e.is_timeout() {
            Pdf2HtmlError::DownloadTimeout {
                url: url.to_string(),
                secs: timeout_secs,
            }
        } else {
            failed(e.to_string())
        }
    })?;

    if !response.status().is_success() {
        return Err(failed(format!("HTTP {}", response.status())));
    }

    let filename = filename_from_url(url);
    let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;

    let temp_dir = TempDir::new().map_err(|e| Pdf2HtmlError::Internal(e.to_string()))?;
    let file_path = temp_dir.path().join(&filename);
    check_magic(&bytes, &file_path)?;

    tokio::fs::write(&file_path, &bytes)
        .await
        .map_err(|e| Pdf2HtmlError::Internal(format!("Failed to write temp file: {}", e)))?;

    info!("Downloaded to: {}", file_path.display());

    Ok(ResolvedInput::Downloaded {
        url: url.to_string(),
        path: file_path,
        _temp_dir: temp_dir,
    })
}

/// Last path segment of the URL if it looks like a file name.
fn filename_from_url(url: &str) -> String {
    if let Ok(parsed) = reqwest::Url::parse(url) {
        if let Some(mut segments) = parsed.path_segments() {
            if let Some(last) = segments.next_back() {
                if !last.is_empty() && last.contains('.') {
                    return sanitise_file_name(last);
                }
            }
        }
    }
    "downloaded.pdf".to_string()
}

/// Keep only a safe basename; never let a client-supplied name escape the temp dir.
fn sanitise_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("");
    let cleaned: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "upload.pdf".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_url() {
        assert!(is_url("https://example.com/doc.pdf"));
        assert!(is_url("http://example.com/doc.pdf"));
        assert!(!is_url("/tmp/doc.pdf"));
        assert!(!is_url("doc.pdf"));
        assert!(!is_url(""));
    }

    #[test]
    fn filename_from_url_path() {
        assert_eq!(filename_from_url("https://x.org/papers/a.pdf"), "a.pdf");
        assert_eq!(filename_from_url("https://x.org/papers/"), "downloaded.pdf");
        assert_eq!(filename_from_url("https://x.org/abs/1706"), "downloaded.pdf");
    }

    #[test]
    fn sanitise_strips_directories_and_oddities() {
        assert_eq!(sanitise_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitise_file_name("my report (v2).pdf"), "my_report__v2_.pdf");
        assert_eq!(sanitise_file_name(""), "upload.pdf");
        assert_eq!(sanitise_file_name(".."), "upload.pdf");
    }

    #[tokio::test]
    async fn from_bytes_checks_magic_and_size() {
        let err = ResolvedInput::from_bytes(b"GIF89a", "x.pdf", 1024).await.unwrap_err();
        assert!(matches!(err, Pdf2HtmlError::NotAPdf { magic, .. } if &magic == b"GIF8"));

        let err = ResolvedInput::from_bytes(b"%PDF-1.7 ....", "x.pdf", 4).await.unwrap_err();
        assert!(matches!(err, Pdf2HtmlError::PayloadTooLarge { .. }));

        let input = ResolvedInput::from_bytes(b"%PDF-1.7\n%%EOF", "doc.pdf", 1024)
            .await
            .unwrap();
        let path = input.path().to_path_buf();
        assert!(path.exists());
        assert_eq!(input.label(), "doc.pdf");
        drop(input);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn local_file_checks() {
        let err = resolve_input("/definitely/not/here.pdf", 5).await.unwrap_err();
        assert!(matches!(err, Pdf2HtmlError::FileNotFound { .. }));

        let dir = tempfile::tempdir().unwrap();
        let txt = dir.path().join("notes.txt");
        std::fs::write(&txt, "hello").unwrap();
        let err = resolve_input(txt.to_str().unwrap(), 5).await.unwrap_err();
        assert!(matches!(err, Pdf2HtmlError::NotAPdf { .. }));

        let pdf = dir.path().join("ok.pdf");
        std::fs::write(&pdf, b"%PDF-1.4\n").unwrap();
        let input = resolve_input(pdf.to_str().unwrap(), 5).await.unwrap();
        assert_eq!(input.path(), pdf.as_path());

        assert!(matches!(
            resolve_input("  ", 5).await.unwrap_err(),
            Pdf2HtmlError::InvalidInput { .. }
        ));
    }
}
