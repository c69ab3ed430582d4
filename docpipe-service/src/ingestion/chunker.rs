//! Overlapping character-window chunking.

use crate::error::ProcessingError;

/// One window over the cleaned text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub index: usize,
    pub content: String,
    /// Byte offsets into the source text, end exclusive
    pub start_offset: usize,
    pub end_offset: usize,
    /// Character offsets into the source text, end exclusive
    pub start_char: usize,
    pub end_char: usize,
}

/// Split `text` into windows of `size` characters sharing `overlap` characters.
///
/// The final window may be shorter. Empty input yields no chunks.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Result<Vec<TextChunk>, ProcessingError> {
    if size == 0 || overlap >= size {
        return Err(ProcessingError::InvalidChunking { size, overlap });
    }

    // Byte offset of every char boundary, including the end of the text
    let boundaries: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();
    let total_chars = boundaries.len() - 1;
    let step = size - overlap;

    let mut chunks = Vec::new();
    let mut start = 0;
    while start < total_chars {
        let end = (start + size).min(total_chars);
        let (start_offset, end_offset) = (boundaries[start], boundaries[end]);
        chunks.push(TextChunk {
            index: chunks.len(),
            content: text[start_offset..end_offset].to_string(),
            start_offset,
            end_offset,
            start_char: start,
            end_char: end,
        });
        if end == total_chars {
            break;
        }
        start += step;
    }

    Ok(chunks)
}

/// Markdown-style `# heading` lines with their byte offsets, in order.
pub fn heading_offsets(text: &str) -> Vec<(usize, String)> {
    let mut headings = Vec::new();
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        if let Some(rest) = line.strip_prefix('#') {
            let rest = rest.trim_start_matches('#');
            if rest.starts_with(' ') {
                let title = rest.trim();
                if !title.is_empty() {
                    headings.push((offset, title.to_string()));
                }
            }
        }
        offset += line.len();
    }
    headings
}

/// Title of the last heading at or before `offset`.
pub fn section_at(headings: &[(usize, String)], offset: usize) -> Option<&str> {
    let idx = headings.partition_point(|(start, _)| *start <= offset);
    idx.checked_sub(1).map(|i| headings[i].1.as_str())
}
