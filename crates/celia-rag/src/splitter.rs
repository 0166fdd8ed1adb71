//! Heading-aware markdown chunking.
//!
//! Every ATX heading (`#` .. `######`) opens a section. A section becomes one
//! chunk whose text is prefixed with its heading path (`FAQ > Payments`), so a
//! retrieved chunk still says what it is about. Text before the first heading
//! becomes a preamble chunk. Headings with no body of their own (pure parents)
//! produce no chunk. Sections longer than `max_chunk_chars` are split on
//! paragraph boundaries.

/// A retrievable slice of a markdown document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkdownChunk {
    pub index: usize,
    /// Innermost heading, `None` for the preamble.
    pub heading: Option<String>,
    /// Heading titles from outermost to innermost.
    pub path: Vec<String>,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct MarkdownSplitter {
    max_chunk_chars: usize,
}

impl Default for MarkdownSplitter {
    fn default() -> Self {
        Self::new(2000)
    }
}

struct Section {
    path: Vec<String>,
    body: Vec<String>,
}

impl MarkdownSplitter {
    pub fn new(max_chunk_chars: usize) -> Self {
        Self {
            max_chunk_chars: max_chunk_chars.max(64),
        }
    }

    pub fn max_chunk_chars(&self) -> usize {
        self.max_chunk_chars
    }

    pub fn split(&self, markdown: &str) -> Vec<MarkdownChunk> {
        let mut sections: Vec<Section> = Vec::new();
        let mut stack: Vec<(usize, String)> = Vec::new();
        let mut current = Section {
            path: Vec::new(),
            body: Vec::new(),
        };
        let mut fence: Option<&str> = None;

        for line in markdown.lines() {
            let trimmed = line.trim_start();

            if let Some(marker) = fence {
                if trimmed.starts_with(marker) {
                    fence = None;
                }
                current.body.push(line.to_string());
                continue;
            }
            if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
                fence = Some(&trimmed[..3]);
                current.body.push(line.to_string());
                continue;
            }

            match parse_heading(line) {
                Some((level, title)) => {
                    sections.push(current);
                    while stack.last().is_some_and(|(l, _)| *l >= level) {
                        stack.pop();
                    }
                    stack.push((level, title));
                    current = Section {
                        path: stack.iter().map(|(_, t)| t.clone()).collect(),
                        body: Vec::new(),
                    };
                }
                None => current.body.push(line.to_string()),
            }
        }
        sections.push(current);

        let mut chunks = Vec::new();
        for section in sections {
            let body = section.body.join("\n").trim().to_string();
            if body.is_empty() {
                continue;
            }

            let prefix = section.path.join(" > ");
            for part in self.split_body(&body, prefix.chars().count()) {
                let text = if prefix.is_empty() {
                    part
                } else {
                    format!("{prefix}\n\n{part}")
                };
                chunks.push(MarkdownChunk {
                    index: chunks.len(),
                    heading: section.path.last().cloned(),
                    path: section.path.clone(),
                    text,
                });
            }
        }

        chunks
    }

    /// Pack paragraphs into parts that fit the budget left after the heading prefix.
    fn split_body(&self, body: &str, prefix_chars: usize) -> Vec<String> {
        let budget = self
            .max_chunk_chars
            .saturating_sub(prefix_chars + 2)
            .max(32);
        if body.chars().count() <= budget {
            return vec![body.to_string()];
        }

        let mut parts = Vec::new();
        let mut current = String::new();

        for paragraph in body.split("\n\n").map(str::trim).filter(|p| !p.is_empty()) {
            for piece in hard_wrap(paragraph, budget) {
                let needed = if current.is_empty() {
                    piece.chars().count()
                } else {
                    current.chars().count() + 2 + piece.chars().count()
                };
                if needed > budget && !current.is_empty() {
                    parts.push(std::mem::take(&mut current));
                }
                if !current.is_empty() {
                    current.push_str("\n\n");
                }
                current.push_str(piece);
            }
        }
        if !current.is_empty() {
            parts.push(current);
        }

        parts
    }
}

/// Split an oversized paragraph at char boundaries, preferring whitespace.
fn hard_wrap(paragraph: &str, budget: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut rest = paragraph;

    while rest.chars().count() > budget {
        let limit = rest
            .char_indices()
            .nth(budget)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let cut = rest[..limit]
            .rfind(char::is_whitespace)
            .filter(|&i| i > 0)
            .unwrap_or(limit);
        pieces.push(rest[..cut].trim_end());
        rest = rest[cut..].trim_start();
    }
    if !rest.is_empty() {
        pieces.push(rest);
    }

    pieces
}

fn parse_heading(line: &str) -> Option<(usize, String)> {
    let trimmed = line.trim_start();
    if line.len() - trimmed.len() > 3 {
        return None;
    }

    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }

    let rest = &trimmed[level..];
    if !rest.is_empty() && !rest.starts_with(' ') && !rest.starts_with('\t') {
        return None;
    }

    let title = rest.trim().trim_end_matches('#').trim();
    if title.is_empty() {
        return None;
    }
    Some((level, title.to_string()))
}
