use scraper::{ElementRef, Html, Node, Selector};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExtractionError {
    #[error("section #{0} not found in document")]
    SectionNotFound(String),
    #[error("invalid section selector: {0}")]
    InvalidSelector(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extracted {
    /// Markup of the section (or whole document), whitespace preserved.
    pub raw_view: String,
    pub normalized_text: String,
    pub title: String,
}

/// Elements whose text never reaches the reader.
const HIDDEN_ELEMENTS: &[&str] = &["script", "style", "noscript", "template"];

/// Elements that separate words when rendered.
const BLOCK_ELEMENTS: &[&str] = &[
    "address", "article", "aside", "blockquote", "br", "dd", "div", "dl", "dt", "fieldset",
    "figcaption", "figure", "footer", "form", "h1", "h2", "h3", "h4", "h5", "h6", "header", "hr",
    "li", "main", "nav", "ol", "p", "pre", "section", "table", "td", "th", "tr", "ul",
];

/// Narrows `html` to the element whose id is `section` and derives the text
/// and title views. Falls back to `address` when the document has no title.
pub fn extract(
    html: &str,
    section: Option<&str>,
    address: &str,
) -> Result<Extracted, ExtractionError> {
    let document = Html::parse_document(html);
    let title = document_title(&document).unwrap_or_else(|| address.to_owned());

    let section = section.map(str::trim).filter(|s| !s.is_empty());
    let (raw_view, text) = match section {
        Some(id) => {
            let selector = section_selector(id)?;
            let element = document
                .select(&selector)
                .next()
                .ok_or_else(|| ExtractionError::SectionNotFound(id.to_owned()))?;
            (element.html(), rendered_text(element))
        }
        None => (html.to_owned(), visible_text(&document)),
    };

    Ok(Extracted {
        raw_view,
        normalized_text: collapse_whitespace(&text),
        title,
    })
}

fn section_selector(id: &str) -> Result<Selector, ExtractionError> {
    let escaped = id.replace('\\', "\\\\").replace('"', "\\\"");
    Selector::parse(&format!("[id=\"{escaped}\"]"))
        .map_err(|_| ExtractionError::InvalidSelector(id.to_owned()))
}

fn document_title(document: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    document
        .select(&selector)
        .next()
        .map(|el| collapse_whitespace(&el.text().collect::<String>()))
        .filter(|title| !title.is_empty())
}

fn visible_text(document: &Html) -> String {
    let Ok(body) = Selector::parse("body") else {
        return String::new();
    };
    match document.select(&body).next() {
        Some(body) => rendered_text(body),
        None => rendered_text(document.root_element()),
    }
}

/// Text as a reader sees it: inline markup does not split words, block
/// boundaries do, hidden elements contribute nothing.
fn rendered_text(element: ElementRef<'_>) -> String {
    let mut out = String::new();
    push_rendered_text(element, &mut out);
    out
}

fn push_rendered_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => {
                let name = el.name();
                if HIDDEN_ELEMENTS.contains(&name) {
                    continue;
                }
                let block = BLOCK_ELEMENTS.contains(&name);
                if block {
                    out.push(' ');
                }
                if let Some(child) = ElementRef::wrap(child) {
                    push_rendered_text(child, out);
                }
                if block {
                    out.push(' ');
                }
            }
            _ => {}
        }
    }
}

pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
