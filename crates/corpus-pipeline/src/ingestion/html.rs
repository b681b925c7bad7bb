//! HTML to markdown
//!
//! Keeps document structure that matters for language modelling (headings,
//! paragraphs, lists, preformatted blocks, tables) and drops everything a
//! reader would not see. Links keep their text; images are dropped.

use scraper::{ElementRef, Html, Node, Selector};

/// Rendered page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlDocument {
    pub title: Option<String>,
    pub markdown: String,
}

const SKIPPED: &[&str] = &[
    "script", "style", "head", "noscript", "template", "svg", "iframe", "img", "object",
    "canvas", "button", "select", "option", "input", "form",
];

const BLOCKS: &[&str] = &[
    "p", "div", "section", "article", "main", "header", "footer", "aside", "nav", "blockquote",
    "figure", "figcaption", "dl", "dt", "dd", "address", "center", "body", "html", "font",
    "hr", "tbody", "thead",
];

pub fn html_to_markdown(html: &str) -> HtmlDocument {
    let document = Html::parse_document(html);

    let title = Selector::parse("title").ok().and_then(|selector| {
        document
            .select(&selector)
            .next()
            .map(|t| collapse_whitespace(&t.text().collect::<String>()))
            .filter(|t| !t.is_empty())
    });

    let mut writer = MarkdownWriter::default();
    writer.walk(document.root_element());
    writer.flush();

    HtmlDocument {
        title,
        markdown: writer.blocks.join("\n\n"),
    }
}

#[derive(Default)]
struct MarkdownWriter {
    blocks: Vec<String>,
    inline: String,
    list_items: Vec<String>,
}

impl MarkdownWriter {
    fn flush(&mut self) {
        self.flush_list();
        let text = collapse_whitespace(&self.inline);
        self.inline.clear();
        if !text.is_empty() {
            self.blocks.push(text);
        }
    }

    fn flush_list(&mut self) {
        if !self.list_items.is_empty() {
            self.blocks.push(self.list_items.join("\n"));
            self.list_items.clear();
        }
    }

    fn walk(&mut self, element: ElementRef<'_>) {
        for child in element.children() {
            match child.value() {
                Node::Text(text) => self.inline.push_str(text),
                Node::Element(_) => {
                    if let Some(child) = ElementRef::wrap(child) {
                        self.element(child);
                    }
                }
                _ => {}
            }
        }
    }

    fn element(&mut self, element: ElementRef<'_>) {
        let tag = element.value().name().to_ascii_lowercase();
        match tag.as_str() {
            t if SKIPPED.contains(&t) => {}
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                self.flush();
                let level = tag[1..].parse::<usize>().unwrap_or(1);
                let text = inline_text(element);
                if !text.is_empty() {
                    self.blocks.push(format!("{} {}", "#".repeat(level), text));
                }
            }
            "li" => {
                if !self.inline.trim().is_empty() {
                    let pending = collapse_whitespace(&self.inline);
                    self.inline.clear();
                    self.flush_list();
                    self.blocks.push(pending);
                }
                self.inline.clear();
                let text = inline_text(element);
                if !text.is_empty() {
                    self.list_items.push(format!("- {}", text));
                }
            }
            "ul" | "ol" => {
                self.flush();
                self.walk(element);
                self.flush();
            }
            "pre" => {
                self.flush();
                let code: String = element.text().collect();
                let code = code.trim_matches('\n');
                if !code.trim().is_empty() {
                    self.blocks.push(format!("```\n{}\n```", code));
                }
            }
            "table" => {
                self.flush();
                let rows = table_rows(element);
                if !rows.is_empty() {
                    self.blocks.push(rows.join("\n"));
                }
            }
            "br" => self.inline.push('\n'),
            t if BLOCKS.contains(&t) => {
                self.flush();
                self.walk(element);
                self.flush();
            }
            _ => self.walk(element),
        }
    }
}

/// Visible text of an element, skipping hidden children
fn inline_text(element: ElementRef<'_>) -> String {
    let mut text = String::new();
    collect_text(element, &mut text);
    collapse_whitespace(&text)
}

fn collect_text(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(el) => {
                if SKIPPED.contains(&el.name()) {
                    continue;
                }
                if let Some(child) = ElementRef::wrap(child) {
                    out.push(' ');
                    collect_text(child, out);
                }
            }
            _ => {}
        }
    }
}

fn table_rows(table: ElementRef<'_>) -> Vec<String> {
    let (Ok(rows), Ok(cells)) = (Selector::parse("tr"), Selector::parse("th, td")) else {
        return Vec::new();
    };
    table
        .select(&rows)
        .map(|row| {
            row.select(&cells)
                .map(inline_text)
                .collect::<Vec<_>>()
                .join(" | ")
        })
        .filter(|line| !line.replace('|', "").trim().is_empty())
        .collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
