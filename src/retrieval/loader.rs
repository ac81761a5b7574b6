//! Document loading into page segments

use super::RetrievalError;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Raw text segment of a loaded document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSegment {
    pub text: String,
    /// 1-based page number
    pub page: u32,
}

/// Load a document into one segment per page.
///
/// PDFs are text-extracted and split on form feeds; `.txt`/`.md` and other
/// plain-text files become a single segment. Blank pages are dropped.
pub async fn load_document(path: &Path) -> Result<Vec<DocumentSegment>, RetrievalError> {
    if !path.is_file() {
        return Err(RetrievalError::NotFound(path.to_path_buf()));
    }

    let is_pdf = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));

    let owned = path.to_path_buf();
    let text = if is_pdf {
        tokio::task::spawn_blocking(move || pdf_extract::extract_text(&owned))
            .await
            .map_err(|e| RetrievalError::load(path, e))?
            .map_err(|e| RetrievalError::load(path, e))?
    } else {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|e| RetrievalError::load(path, e))?
    };

    Ok(split_pages(&text))
}

/// Split extracted text into page segments on form-feed characters
pub fn split_pages(text: &str) -> Vec<DocumentSegment> {
    text.split('\u{000C}')
        .zip(1u32..)
        .filter(|(page, _)| !page.trim().is_empty())
        .map(|(page, number)| DocumentSegment {
            text: page.trim().to_string(),
            page: number,
        })
        .collect()
}
