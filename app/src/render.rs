use markdown::{mdast, to_mdast, ParseOptions};
use panelchat_core::render::{MarkupRenderer, RenderedTurn};
use panelchat_core::TurnRole;

const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const ITALIC: &str = "\x1b[3m";
const UNDERLINE: &str = "\x1b[4m";
const STRIKE: &str = "\x1b[9m";
const CODE: &str = "\x1b[36m";
const RESET: &str = "\x1b[0m";

/// Renders assistant markdown (GFM) for a terminal. The text is parsed into
/// an mdast tree and walked block by block; with `ansi` off only the layout
/// survives, which keeps the output stable for tests and pipes.
#[derive(Debug, Clone, Copy)]
pub struct TerminalRenderer {
    pub ansi: bool,
}

impl Default for TerminalRenderer {
    fn default() -> Self {
        Self { ansi: true }
    }
}

impl TerminalRenderer {
    pub fn plain() -> Self {
        Self { ansi: false }
    }

    pub fn frame(&self, turn: &RenderedTurn) -> String {
        let label = match turn.role {
            TurnRole::User => "you",
            TurnRole::Assistant => "assistant",
        };
        let mut out = String::new();
        for (index, line) in turn.body.lines().enumerate() {
            if index == 0 {
                out.push_str(&format!("{label:>9} │ {line}"));
            } else {
                out.push_str(&format!("\n{:>9} │ {line}", ""));
            }
        }
        if out.is_empty() {
            out = format!("{label:>9} │");
        }
        out
    }

    pub fn pending_indicator(&self) -> String {
        self.dim(&format!("{:>9} │ …", "assistant"))
    }

    /// Erases the pending indicator when it is still the current line.
    pub fn clear_pending(&self) -> &'static str {
        if self.ansi {
            "\r\x1b[2K"
        } else {
            "\n"
        }
    }

    pub fn error_bubble(&self, notice: &str) -> String {
        self.dim(&format!("{:>9} │ {notice}", "!"))
    }

    fn dim(&self, text: &str) -> String {
        self.styled(DIM, text, "")
    }

    /// Wraps `text` in `code`, then restores the enclosing `outer` styles.
    fn styled(&self, code: &str, text: &str, outer: &str) -> String {
        if self.ansi {
            format!("{code}{text}{RESET}{outer}")
        } else {
            text.to_string()
        }
    }

    fn nested(&self, outer: &str, code: &str) -> String {
        if self.ansi {
            format!("{outer}{code}")
        } else {
            String::new()
        }
    }

    fn blocks(&self, nodes: &[mdast::Node]) -> Vec<Vec<String>> {
        nodes
            .iter()
            .map(|node| self.block_lines(node))
            .filter(|lines| !lines.is_empty())
            .collect()
    }

    fn block_lines(&self, node: &mdast::Node) -> Vec<String> {
        match node {
            mdast::Node::Heading(heading) => {
                let text = self.inline(&heading.children, BOLD);
                vec![self.styled(BOLD, &text, "")]
            }
            mdast::Node::Paragraph(paragraph) => split_lines(&self.inline(&paragraph.children, "")),
            mdast::Node::List(list) => {
                let mut lines = Vec::new();
                self.list_lines(list, 0, &mut lines);
                lines
            }
            mdast::Node::Code(code) => code
                .value
                .split('\n')
                .map(|line| format!("    {}", self.styled(CODE, line, "")))
                .collect(),
            mdast::Node::Blockquote(quote) => self
                .blocks(&quote.children)
                .join(&[String::new()][..])
                .into_iter()
                .map(|line| format!("{} {line}", self.dim("│")))
                .collect(),
            mdast::Node::ThematicBreak(_) => vec![self.dim(&"─".repeat(40))],
            mdast::Node::Table(table) => self.table_lines(table),
            mdast::Node::Html(html) => split_lines(html.value.trim()),
            mdast::Node::Text(text) => split_lines(&text.value),
            _ => Vec::new(),
        }
    }

    fn list_lines(&self, list: &mdast::List, depth: usize, out: &mut Vec<String>) {
        let indent = "  ".repeat(depth);
        let start = list.start.unwrap_or(1);
        for (index, node) in list.children.iter().enumerate() {
            let mdast::Node::ListItem(item) = node else {
                continue;
            };
            let mut marker = if list.ordered {
                format!("{}. ", start + index as u32)
            } else {
                "• ".to_string()
            };
            match item.checked {
                Some(true) => marker.push_str("[x] "),
                Some(false) => marker.push_str("[ ] "),
                None => {}
            }
            let hanging = " ".repeat(marker.chars().count());

            let mut first = true;
            for child in &item.children {
                if let mdast::Node::List(inner) = child {
                    self.list_lines(inner, depth + 1, out);
                    continue;
                }
                for line in self.block_lines(child) {
                    if first {
                        out.push(format!("{indent}{marker}{line}"));
                        first = false;
                    } else {
                        out.push(format!("{indent}{hanging}{line}"));
                    }
                }
            }
            if first {
                out.push(format!("{indent}{}", marker.trim_end()));
            }
        }
    }

    fn table_lines(&self, table: &mdast::Table) -> Vec<String> {
        let plain = Self::plain();
        let rows: Vec<Vec<(String, usize)>> = table
            .children
            .iter()
            .filter_map(|row| match row {
                mdast::Node::TableRow(row) => Some(row),
                _ => None,
            })
            .map(|row| {
                row.children
                    .iter()
                    .map(|cell| {
                        let children = match cell {
                            mdast::Node::TableCell(cell) => cell.children.as_slice(),
                            _ => &[],
                        };
                        let width = plain.inline(children, "").chars().count();
                        (self.inline(children, ""), width)
                    })
                    .collect()
            })
            .collect();

        let columns = rows.iter().map(Vec::len).max().unwrap_or(0);
        let widths: Vec<usize> = (0..columns)
            .map(|col| {
                rows.iter()
                    .filter_map(|row| row.get(col).map(|(_, width)| *width))
                    .max()
                    .unwrap_or(0)
            })
            .collect();

        rows.iter()
            .enumerate()
            .map(|(index, row)| {
                let cells: Vec<String> = row
                    .iter()
                    .zip(&widths)
                    .map(|((text, width), column)| {
                        let padded = format!("{text}{}", " ".repeat(column - width));
                        if index == 0 {
                            self.styled(BOLD, &padded, "")
                        } else {
                            padded
                        }
                    })
                    .collect();
                cells.join(" │ ").trim_end().to_string()
            })
            .collect()
    }

    /// `outer` holds the escape codes active around these nodes, re-emitted
    /// after every nested span so a closing reset does not end them early.
    fn inline(&self, nodes: &[mdast::Node], outer: &str) -> String {
        let mut out = String::new();
        for node in nodes {
            match node {
                mdast::Node::Text(text) => out.push_str(&text.value),
                mdast::Node::Strong(strong) => {
                    let inner = self.inline(&strong.children, &self.nested(outer, BOLD));
                    out.push_str(&self.styled(BOLD, &inner, outer));
                }
                mdast::Node::Emphasis(emphasis) => {
                    let inner = self.inline(&emphasis.children, &self.nested(outer, ITALIC));
                    out.push_str(&self.styled(ITALIC, &inner, outer));
                }
                mdast::Node::Delete(delete) => {
                    let inner = self.inline(&delete.children, &self.nested(outer, STRIKE));
                    out.push_str(&self.styled(STRIKE, &inner, outer));
                }
                mdast::Node::InlineCode(code) => {
                    out.push_str(&self.styled(CODE, &code.value, outer));
                }
                mdast::Node::Link(link) => {
                    let text = self.inline(&link.children, &self.nested(outer, UNDERLINE));
                    let visible = Self::plain().inline(&link.children, "");
                    out.push_str(&self.styled(UNDERLINE, &text, outer));
                    let bare = link.url.strip_prefix("mailto:").unwrap_or(&link.url);
                    if visible != link.url && visible != bare {
                        out.push_str(&format!(" ({})", link.url));
                    }
                }
                mdast::Node::Image(image) => {
                    let alt = if image.alt.is_empty() {
                        &image.url
                    } else {
                        &image.alt
                    };
                    out.push_str(alt);
                }
                mdast::Node::Break(_) => out.push('\n'),
                mdast::Node::Html(html) => out.push_str(&html.value),
                _ => {}
            }
        }
        out
    }
}

fn split_lines(text: &str) -> Vec<String> {
    text.split('\n').map(str::to_string).collect()
}

impl MarkupRenderer for TerminalRenderer {
    fn render(&self, markup: &str) -> String {
        let root = match to_mdast(markup, &ParseOptions::gfm()) {
            Ok(node) => node,
            Err(_) => {
                tracing::debug!("markup did not parse; showing it verbatim");
                return markup.to_string();
            }
        };
        let nodes = match root {
            mdast::Node::Root(root) => root.children,
            other => vec![other],
        };
        self.blocks(&nodes)
            .into_iter()
            .map(|lines| lines.join("\n"))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
