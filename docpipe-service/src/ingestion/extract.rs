//! Raw text extraction by document format.

use std::io::Cursor;
use std::path::Path;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::error::ProcessingError;

use super::Section;

/// Separator between PDF pages in extracted text; the clean stage uses it to find page edges
pub const PAGE_BREAK: &str = "\u{c}";

/// Formats the parse stage understands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    PlainText,
    Csv,
    Log,
    Json,
    Markdown,
    Html,
    Xml,
    Pdf,
    Epub,
}

impl DocumentFormat {
    /// Resolve the format from the declared MIME type, falling back to the
    /// file extension for generic types.
    pub fn detect(mime_type: &str, file_name: &str) -> Option<Self> {
        let essence = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        let by_mime = match essence.as_str() {
            "text/plain" => Some(Self::PlainText),
            "text/csv" => Some(Self::Csv),
            "application/json" | "text/json" => Some(Self::Json),
            "text/markdown" | "text/x-markdown" => Some(Self::Markdown),
            "text/html" | "application/xhtml+xml" => Some(Self::Html),
            "application/xml" | "text/xml" => Some(Self::Xml),
            "application/pdf" => Some(Self::Pdf),
            "application/epub+zip" => Some(Self::Epub),
            _ => None,
        };

        by_mime.or_else(|| {
            let generic = essence.is_empty() || essence == "application/octet-stream";
            if generic || essence.starts_with("text/") {
                Self::from_extension(file_name)
            } else {
                None
            }
        })
    }

    fn from_extension(file_name: &str) -> Option<Self> {
        let ext = Path::new(file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())?;

        match ext.as_str() {
            "txt" | "text" => Some(Self::PlainText),
            "csv" => Some(Self::Csv),
            "log" => Some(Self::Log),
            "json" => Some(Self::Json),
            "md" | "markdown" => Some(Self::Markdown),
            "html" | "htm" | "xhtml" => Some(Self::Html),
            "xml" => Some(Self::Xml),
            "pdf" => Some(Self::Pdf),
            "epub" => Some(Self::Epub),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::PlainText | Self::Log => "text/plain",
            Self::Csv => "text/csv",
            Self::Json => "application/json",
            Self::Markdown => "text/markdown",
            Self::Html => "text/html",
            Self::Xml => "application/xml",
            Self::Pdf => "application/pdf",
            Self::Epub => "application/epub+zip",
        }
    }
}

/// MIME type for an upload that did not declare one.
pub fn guess_mime_type(file_name: &str) -> String {
    DocumentFormat::from_extension(file_name)
        .map(|f| f.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}

static SCRIPT_OR_STYLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)\s*>")
        .expect("script/style pattern is valid")
});

/// Extract raw text. Markup is left in place for the clean stage.
pub fn extract_text(
    format: DocumentFormat,
    mime_type: &str,
    bytes: &[u8],
) -> Result<String, ProcessingError> {
    let text = match format {
        DocumentFormat::PlainText
        | DocumentFormat::Csv
        | DocumentFormat::Log
        | DocumentFormat::Json
        | DocumentFormat::Xml => String::from_utf8_lossy(bytes).into_owned(),
        DocumentFormat::Markdown => {
            let content = String::from_utf8_lossy(bytes);
            render_sections(&parse_markdown_sections(&content))
        }
        DocumentFormat::Html => {
            let content = String::from_utf8_lossy(bytes);
            SCRIPT_OR_STYLE.replace_all(&content, " ").into_owned()
        }
        DocumentFormat::Pdf => pdf_extract::extract_text_from_mem_by_pages(bytes)
            .map_err(|e| ProcessingError::TextExtraction {
                message: format!("PDF: {}", e),
            })?
            .join(PAGE_BREAK),
        DocumentFormat::Epub => render_sections(&extract_epub(bytes)?),
    };

    debug!(mime_type, chars = text.len(), "Extracted raw text");
    Ok(text)
}

/// Extract chapters from an EPUB in spine order.
fn extract_epub(bytes: &[u8]) -> Result<Vec<Section>, ProcessingError> {
    let mut archive = epub::doc::EpubDoc::from_reader(Cursor::new(bytes.to_vec())).map_err(|e| {
        ProcessingError::TextExtraction {
            message: format!("EPUB: {}", e),
        }
    })?;

    let mut sections = Vec::new();
    let mut chapter_index = 0u32;

    loop {
        if let Some((content, _mime)) = archive.get_current_str() {
            let body = SCRIPT_OR_STYLE.replace_all(&content, " ");
            let text = super::clean::strip_markup(&body).trim().to_string();
            if !text.is_empty() {
                chapter_index += 1;
                sections.push(Section {
                    title: archive.get_current_id().map(|id| format!("Chapter {}: {}", chapter_index, id)),
                    content: text,
                });
            }
        }
        if !archive.go_next() {
            break;
        }
    }

    if sections.is_empty() {
        return Err(ProcessingError::TextExtraction {
            message: "EPUB: no readable chapters".to_string(),
        });
    }

    debug!(chapters = sections.len(), "EPUB extracted");
    Ok(sections)
}

/// Parse markdown into sections based on headers.
pub fn parse_markdown_sections(content: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut current_section = String::new();
    let mut current_title: Option<String> = None;
    let mut in_code_block = false;

    for line in content.lines() {
        if line.trim_start().starts_with("```") {
            in_code_block = !in_code_block;
        }

        let heading = (!in_code_block)
            .then(|| line.strip_prefix('#'))
            .flatten()
            .map(|rest| rest.trim_start_matches('#'))
            .filter(|rest| rest.is_empty() || rest.starts_with(char::is_whitespace));

        if let Some(rest) = heading {
            if !current_section.trim().is_empty() || current_title.is_some() {
                sections.push(Section {
                    title: current_title.take(),
                    content: current_section.trim().to_string(),
                });
                current_section = String::new();
            }
            current_title = Some(rest.trim().to_string()).filter(|t| !t.is_empty());
        } else {
            current_section.push_str(line);
            current_section.push('\n');
        }
    }

    if !current_section.trim().is_empty() || current_title.is_some() {
        sections.push(Section {
            title: current_title,
            content: current_section.trim().to_string(),
        });
    }

    sections
}

/// Flatten sections into text, one `# title` heading line per titled section.
fn render_sections(sections: &[Section]) -> String {
    let mut out = String::new();
    for section in sections {
        if !out.is_empty() {
            out.push_str("\n\n");
        }
        if let Some(title) = &section.title {
            out.push_str("# ");
            out.push_str(title);
            out.push('\n');
        }
        out.push_str(&section.content);
    }
    out
}
