//! Built-in renderer producing a plain Courier PDF with one `field: value`
//! line per column.

use lopdf::{dictionary, Document, Object, ObjectId, Stream};

use super::Renderer;
use crate::error::RenderError;
use crate::model::RowData;

const LINES_PER_PAGE: usize = 60;
const MAX_LINE_CHARS: usize = 90;

pub struct PdfRenderer {
    title: String,
}

impl PdfRenderer {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
        }
    }
}

impl Default for PdfRenderer {
    fn default() -> Self {
        Self::new("Document")
    }
}

impl Renderer for PdfRenderer {
    fn render(&self, row: &RowData) -> Result<Vec<u8>, RenderError> {
        let mut lines = vec![self.title.clone(), String::new()];
        for (field, value) in row.iter() {
            lines.extend(wrap_line(&format!("{}: {}", field, value)));
        }
        create_pdf(&lines)
    }
}

/// Splits a line into chunks that fit the page width.
fn wrap_line(line: &str) -> Vec<String> {
    let chars: Vec<char> = line.chars().collect();
    if chars.is_empty() {
        return vec![String::new()];
    }
    chars
        .chunks(MAX_LINE_CHARS)
        .map(|chunk| chunk.iter().collect())
        .collect()
}

fn create_pdf(lines: &[String]) -> Result<Vec<u8>, RenderError> {
    let mut doc = Document::with_version("1.5");

    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! {
            "F1" => font_id,
        },
    });

    let mut kids: Vec<Object> = Vec::new();
    for page_lines in lines.chunks(LINES_PER_PAGE) {
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            format_page_content(page_lines).into_bytes(),
        ));
        let page_id: ObjectId = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
            "Resources" => resources_id,
            "Contents" => content_id,
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );

    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut buffer = Vec::new();
    doc.save_to(&mut buffer)
        .map_err(|e| RenderError::Pdf(e.to_string()))?;

    Ok(buffer)
}

fn format_page_content(lines: &[String]) -> String {
    let mut content = String::new();
    content.push_str("BT\n");
    content.push_str("/F1 10 Tf\n");
    content.push_str("50 742 Td\n");
    content.push_str("12 TL\n");

    for line in lines {
        content.push_str(&format!("({}) Tj T*\n", escape_pdf_string(line)));
    }

    content.push_str("ET\n");
    content
}

fn escape_pdf_string(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '(' => "\\(".to_string(),
            ')' => "\\)".to_string(),
            '\\' => "\\\\".to_string(),
            c if c.is_ascii() && !c.is_control() => c.to_string(),
            // Courier Type1 only covers ASCII here.
            _ => "?".to_string(),
        })
        .collect()
}
