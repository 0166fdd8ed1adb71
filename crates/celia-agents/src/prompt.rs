use std::collections::HashMap;

/// Instruction text with optional `{name}` placeholders.
///
/// Rendering replaces only placeholders that have a value; everything else,
/// including unknown placeholders and stray braces, is copied through.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    template: String,
}

impl PromptTemplate {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.template
    }

    /// Placeholder names in order of first appearance.
    pub fn placeholders(&self) -> Vec<&str> {
        let mut names = Vec::new();
        let mut rest = self.template.as_str();
        while let Some((name, after)) = next_placeholder(rest) {
            if let Some(name) = name
                && !names.contains(&name)
            {
                names.push(name);
            }
            rest = after;
        }
        names
    }

    pub fn render(&self, vars: &HashMap<&str, String>) -> String {
        let mut out = String::with_capacity(self.template.len());
        let mut rest = self.template.as_str();

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let candidate = &rest[open..];
            match placeholder_at(candidate) {
                Some((name, len)) => {
                    match vars.get(name) {
                        Some(value) => out.push_str(value),
                        None => out.push_str(&candidate[..len]),
                    }
                    rest = &candidate[len..];
                }
                None => {
                    out.push('{');
                    rest = &candidate[1..];
                }
            }
        }
        out.push_str(rest);
        out
    }
}

impl From<&str> for PromptTemplate {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// `{ident}` at the start of `s`: the name and the byte length of the placeholder.
fn placeholder_at(s: &str) -> Option<(&str, usize)> {
    let inner = s.strip_prefix('{')?;
    let close = inner.find('}')?;
    let name = &inner[..close];
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then_some((name, close + 2))
}

/// Scan to the next `{`; returns the placeholder there (if valid) and the remaining text.
fn next_placeholder(s: &str) -> Option<(Option<&str>, &str)> {
    let open = s.find('{')?;
    let candidate = &s[open..];
    Some(match placeholder_at(candidate) {
        Some((name, len)) => (Some(name), &candidate[len..]),
        None => (None, &candidate[1..]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use celia_config::DEFAULT_PROMPT;

    fn vars(pairs: &[(&'static str, &str)]) -> HashMap<&'static str, String> {
        pairs.iter().map(|(k, v)| (*k, v.to_string())).collect()
    }

    #[test]
    fn template_without_placeholders_renders_verbatim() {
        let prompt = PromptTemplate::new(DEFAULT_PROMPT);
        let rendered = prompt.render(&vars(&[("name", "Celia")]));

        assert_eq!(rendered, DEFAULT_PROMPT);
        assert!(rendered.contains("You can help a user to send money."));
        assert!(rendered.contains("Don't use markdown formatting in your responses."));
        assert!(prompt.placeholders().is_empty());
    }

    #[test]
    fn known_placeholders_are_substituted() {
        let prompt = PromptTemplate::new("You are {name}. Today is {date}. Ask {name}.");
        let rendered = prompt.render(&vars(&[("name", "Celia"), ("date", "2024-05-01")]));
        assert_eq!(rendered, "You are Celia. Today is 2024-05-01. Ask Celia.");
        assert_eq!(prompt.placeholders(), vec!["name", "date"]);
    }

    #[test]
    fn unknown_placeholders_and_braces_pass_through() {
        let prompt = PromptTemplate::new("Hi {user}! JSON looks like {\"a\": 1} and {} or {name");
        let rendered = prompt.render(&vars(&[("name", "Celia")]));
        assert_eq!(rendered, prompt.as_str());
    }
}
