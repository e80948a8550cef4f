//! Minimal ordered INI model for NetworkManager.conf style files.
//!
//! Parses a file into ordered sections of ordered lines, mutates key=value
//! entries in memory, and rewrites the whole file. Comments, blank lines and
//! unknown sections/keys survive a round trip byte for byte.

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    /// `key=value`; rendered exactly as parsed unless the value is replaced
    Pair { key: String, value: String },
    /// Anything else: comments, blanks, malformed lines
    Raw(String),
}

#[derive(Debug, Clone)]
struct Section {
    /// None for the headerless prologue before the first `[section]`
    name: Option<String>,
    lines: Vec<Line>,
}

/// An ordered, mutation-friendly view of an INI document.
#[derive(Debug, Clone, Default)]
pub struct IniDocument {
    sections: Vec<Section>,
}

impl IniDocument {
    pub fn parse(text: &str) -> Self {
        let mut sections = vec![Section {
            name: None,
            lines: Vec::new(),
        }];

        for raw in text.lines() {
            let trimmed = raw.trim();
            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                sections.push(Section {
                    name: Some(trimmed[1..trimmed.len() - 1].to_string()),
                    lines: Vec::new(),
                });
                continue;
            }
            let current = sections.last_mut().expect("prologue section always present");
            if !trimmed.starts_with('#') && !trimmed.starts_with(';') {
                if let Some(eq) = raw.find('=') {
                    current.lines.push(Line::Pair {
                        key: raw[..eq].to_string(),
                        value: raw[eq + 1..].to_string(),
                    });
                    continue;
                }
            }
            current.lines.push(Line::Raw(raw.to_string()));
        }

        Self { sections }
    }

    fn section(&self, name: &str) -> Option<&Section> {
        self.sections
            .iter()
            .find(|s| s.name.as_deref() == Some(name))
    }

    fn section_mut(&mut self, name: &str) -> Option<&mut Section> {
        self.sections
            .iter_mut()
            .find(|s| s.name.as_deref() == Some(name))
    }

    /// Value of `key` in `[section]`, with surrounding whitespace trimmed.
    pub fn get(&self, section: &str, key: &str) -> Option<&str> {
        self.section(section)?.lines.iter().find_map(|l| match l {
            Line::Pair { key: k, value } if k.trim() == key => Some(value.trim()),
            _ => None,
        })
    }

    /// Set `key` in `[section]`, creating the section (at the end of the
    /// document) or the key (at the end of the section) as needed.
    pub fn set(&mut self, section: &str, key: &str, value: &str) {
        if self.section(section).is_none() {
            self.sections.push(Section {
                name: Some(section.to_string()),
                lines: Vec::new(),
            });
        }
        let sec = self.section_mut(section).expect("section just ensured");
        for line in &mut sec.lines {
            if let Line::Pair { key: k, value: v } = line {
                if k.trim() == key {
                    *v = value.to_string();
                    return;
                }
            }
        }
        sec.lines.push(Line::Pair {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    /// Remove `key` from `[section]`. Returns true when a line was dropped.
    pub fn remove(&mut self, section: &str, key: &str) -> bool {
        if let Some(sec) = self.section_mut(section) {
            let before = sec.lines.len();
            sec.lines
                .retain(|l| !matches!(l, Line::Pair { key: k, .. } if k.trim() == key));
            return sec.lines.len() != before;
        }
        false
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for section in &self.sections {
            if let Some(name) = &section.name {
                out.push('[');
                out.push_str(name);
                out.push_str("]\n");
            }
            for line in &section.lines {
                match line {
                    Line::Pair { key, value } => {
                        out.push_str(key);
                        out.push('=');
                        out.push_str(value);
                        out.push('\n');
                    }
                    Line::Raw(raw) => {
                        out.push_str(raw);
                        out.push('\n');
                    }
                }
            }
        }
        out
    }
}
