use std::fs;
use std::path::{Path, PathBuf};

/// A source document read from a subject directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDocument {
    pub source: String,
    pub text: String,
}

/// Windows-1252 code points for bytes 0x80..=0x9F. `None` marks bytes the
/// code page leaves undefined.
const CP1252_HIGH: [Option<char>; 32] = [
    Some('\u{20AC}'), None, Some('\u{201A}'), Some('\u{0192}'),
    Some('\u{201E}'), Some('\u{2026}'), Some('\u{2020}'), Some('\u{2021}'),
    Some('\u{02C6}'), Some('\u{2030}'), Some('\u{0160}'), Some('\u{2039}'),
    Some('\u{0152}'), None, Some('\u{017D}'), None,
    None, Some('\u{2018}'), Some('\u{2019}'), Some('\u{201C}'),
    Some('\u{201D}'), Some('\u{2022}'), Some('\u{2013}'), Some('\u{2014}'),
    Some('\u{02DC}'), Some('\u{2122}'), Some('\u{0161}'), Some('\u{203A}'),
    Some('\u{0153}'), None, Some('\u{017E}'), Some('\u{0178}'),
];

/// Reads every `*.pdf` and `*.txt` file directly inside `dir`, sorted by file
/// name. Files that cannot be read or decoded are logged and skipped.
pub fn load_documents(dir: &Path) -> Vec<SourceDocument> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            tracing::warn!("Cannot list documents in {}: {}", dir.display(), err);
            return Vec::new();
        }
    };

    let mut files: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && document_kind(path).is_some())
        .collect();
    files.sort_by(|a, b| a.file_name().cmp(&b.file_name()));

    let pdfs = files.iter().filter(|p| document_kind(p) == Some(Kind::Pdf)).count();
    tracing::info!(
        "[{}] Found {} PDFs and {} text files",
        dir.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
        pdfs,
        files.len() - pdfs
    );

    files
        .iter()
        .filter_map(|path| {
            let text = match read_document(path) {
                Ok(text) => text,
                Err(reason) => {
                    tracing::warn!("Skipping {}: {}", path.display(), reason);
                    return None;
                }
            };
            if text.is_empty() {
                tracing::warn!("Skipping {}: no text", path.display());
                return None;
            }
            let source = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string());
            Some(SourceDocument { source, text })
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Pdf,
    Text,
}

fn document_kind(path: &Path) -> Option<Kind> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some(Kind::Pdf),
        "txt" => Some(Kind::Text),
        _ => None,
    }
}

fn read_document(path: &Path) -> Result<String, String> {
    match document_kind(path) {
        // pdf-extract panics on some malformed font tables
        Some(Kind::Pdf) => std::panic::catch_unwind(|| pdf_extract::extract_text(path))
            .map_err(|_| "PDF parser panicked".to_string())?
            .map_err(|e| e.to_string()),
        Some(Kind::Text) => {
            let bytes = fs::read(path).map_err(|e| e.to_string())?;
            Ok(decode_text(&bytes))
        }
        None => Err("unsupported document type".to_string()),
    }
}

/// Decodes plain text trying UTF-8, BOM-marked UTF-16, Windows-1252 and
/// finally Latin-1, which accepts any byte sequence.
pub fn decode_text(bytes: &[u8]) -> String {
    if let Ok(text) = std::str::from_utf8(bytes) {
        return text.strip_prefix('\u{FEFF}').unwrap_or(text).to_string();
    }
    if let Some(text) = decode_utf16_with_bom(bytes) {
        return text;
    }
    if let Some(text) = decode_cp1252(bytes) {
        return text;
    }
    bytes.iter().map(|&b| char::from(b)).collect()
}

fn decode_utf16_with_bom(bytes: &[u8]) -> Option<String> {
    let (body, little_endian) = match bytes {
        [0xFF, 0xFE, rest @ ..] => (rest, true),
        [0xFE, 0xFF, rest @ ..] => (rest, false),
        _ => return None,
    };
    if body.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = body
        .chunks_exact(2)
        .map(|pair| {
            if little_endian {
                u16::from_le_bytes([pair[0], pair[1]])
            } else {
                u16::from_be_bytes([pair[0], pair[1]])
            }
        })
        .collect();
    String::from_utf16(&units).ok()
}

fn decode_cp1252(bytes: &[u8]) -> Option<String> {
    bytes
        .iter()
        .map(|&b| match b {
            0x80..=0x9F => CP1252_HIGH[usize::from(b - 0x80)],
            _ => Some(char::from(b)),
        })
        .collect()
}

/// Fixed-size character windows; each window starts `size - overlap`
/// characters after the previous one.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let step = size.saturating_sub(overlap).max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        chunks.push(chars[start..end].iter().collect());
        start += step;
    }
    chunks
}
