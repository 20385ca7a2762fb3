//! UIDL document writer.
//!
//! Components paint themselves into a [`UidlWriter`]; the closed
//! [`UidlDocument`] is what a pooled transformer renders. Rules:
//! - attributes only right after `start_tag`, before any content or child
//! - sections close in strict reverse order of opening
//! - `invisible=true` suppresses the section and its whole subtree, but the
//!   open/close calls must still balance

use std::borrow::Cow;
use std::fmt;

const XML_DECL: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\n";
const ROOT_TAG: &str = "uidl";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UidlError {
    #[error("Attempted to write to a closed UIDL writer")]
    Closed,
    #[error("attribute '{name}' added after content; the argument list is closed")]
    AttributeListClosed { name: String },
    #[error("wrong ending tag: '{found}', expected '{expected}'")]
    MismatchedEnd { expected: String, found: String },
    #[error("ending tag '{found}' with no open section")]
    UnexpectedEnd { found: String },
    #[error("sections left open: {}", .open.join(", "))]
    Unclosed { open: Vec<String> },
    #[error("invalid tag or attribute name: {0:?}")]
    InvalidName(String),
}

pub type Result<T> = std::result::Result<T, UidlError>;

/// Replace the five XML-sensitive characters with their entities.
pub fn escape_xml(text: &str) -> Cow<'_, str> {
    if !text.contains(['&', '<', '>', '"', '\'']) {
        return Cow::Borrowed(text);
    }

    let mut out = String::with_capacity(text.len() + text.len() / 4);
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    Cow::Owned(out)
}

fn check_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '<' | '>' | '&' | '"' | '\'' | '/' | '='));
    if valid {
        Ok(())
    } else {
        Err(UidlError::InvalidName(name.to_string()))
    }
}

/// A finished, well-formed UIDL document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UidlDocument {
    theme: String,
    xml: String,
}

impl UidlDocument {
    pub fn theme(&self) -> &str {
        &self.theme
    }

    pub fn as_str(&self) -> &str {
        &self.xml
    }

    pub fn into_string(self) -> String {
        self.xml
    }
}

impl fmt::Display for UidlDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.xml)
    }
}

pub struct UidlWriter {
    theme: String,
    out: String,
    open: Vec<String>,
    /// Pending start tag, written once its argument list closes.
    tag: String,
    arg_list_open: bool,
    /// Depth of the outermost invisible section, if inside one.
    hidden_from: Option<usize>,
    next_variable: u32,
    closed: bool,
}

impl UidlWriter {
    /// Start a document for `theme`: XML declaration plus the open root element.
    pub fn new(theme: impl Into<String>) -> Self {
        let theme = theme.into();
        let mut writer = Self {
            theme: String::new(),
            out: String::from(XML_DECL),
            open: Vec::new(),
            tag: String::new(),
            arg_list_open: false,
            hidden_from: None,
            next_variable: 0,
            closed: false,
        };
        writer.open_tag(ROOT_TAG);
        writer.push_attribute("theme", &theme);
        writer.theme = theme;
        writer
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(UidlError::Closed)
        } else {
            Ok(())
        }
    }

    fn append(&mut self, data: &str) {
        if self.hidden_from.is_none() {
            self.out.push_str(data);
        }
    }

    fn ensure_closed_tag(&mut self) {
        if self.arg_list_open {
            self.arg_list_open = false;
            self.tag.push('>');
            if self.hidden_from.is_none() {
                self.out.push_str(&self.tag);
            }
            self.tag.clear();
        }
    }

    fn open_tag(&mut self, name: &str) {
        self.ensure_closed_tag();
        self.open.push(name.to_string());
        self.tag.clear();
        self.tag.push('<');
        self.tag.push_str(name);
        self.arg_list_open = true;
    }

    fn push_attribute(&mut self, name: &str, value: &str) {
        self.tag.push(' ');
        self.tag.push_str(name);
        self.tag.push_str("=\"");
        self.tag.push_str(&escape_xml(value));
        self.tag.push('"');
    }

    pub fn start_tag(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        check_name(name)?;
        self.open_tag(name);
        Ok(())
    }

    pub fn end_tag(&mut self, name: &str) -> Result<()> {
        self.ensure_open()?;
        // The root is closed by `close()` only.
        if self.open.len() <= 1 {
            return Err(UidlError::UnexpectedEnd {
                found: name.to_string(),
            });
        }
        self.close_tag(name)
    }

    fn close_tag(&mut self, name: &str) -> Result<()> {
        let expected = self.open.last().map(String::as_str).unwrap_or_default();
        if !expected.eq_ignore_ascii_case(name) {
            return Err(UidlError::MismatchedEnd {
                expected: expected.to_string(),
                found: name.to_string(),
            });
        }

        self.ensure_closed_tag();
        if let Some(last) = self.open.pop() {
            self.append(&format!("</{last}>"));
        }
        if self.hidden_from.is_some_and(|depth| depth >= self.open.len()) {
            self.hidden_from = None;
        }
        Ok(())
    }

    pub fn add_attribute(&mut self, name: &str, value: &str) -> Result<()> {
        self.ensure_open()?;
        check_name(name)?;
        if !self.arg_list_open {
            return Err(UidlError::AttributeListClosed {
                name: name.to_string(),
            });
        }
        self.push_attribute(name, value);
        Ok(())
    }

    /// `invisible=true` hides the current section instead of being written.
    pub fn add_attribute_bool(&mut self, name: &str, value: bool) -> Result<()> {
        if name == "invisible" && value {
            self.ensure_open()?;
            if !self.arg_list_open {
                return Err(UidlError::AttributeListClosed {
                    name: name.to_string(),
                });
            }
            if self.hidden_from.is_none() {
                self.hidden_from = Some(self.open.len() - 1);
            }
            return Ok(());
        }
        self.add_attribute(name, if value { "true" } else { "false" })
    }

    pub fn add_attribute_int(&mut self, name: &str, value: i64) -> Result<()> {
        self.add_attribute(name, &value.to_string())
    }

    /// Escaped character data.
    pub fn add_text(&mut self, text: &str) -> Result<()> {
        self.add_raw(&escape_xml(text))
    }

    /// Pre-formed UIDL, written verbatim.
    pub fn add_raw(&mut self, xml: &str) -> Result<()> {
        self.ensure_open()?;
        self.ensure_closed_tag();
        self.append(xml);
        Ok(())
    }

    pub fn add_cdata(&mut self, text: &str) -> Result<()> {
        self.add_raw(&format!("<![CDATA[{text}]]>"))
    }

    /// `<tag>escaped text</tag>`
    pub fn add_section(&mut self, tag: &str, text: &str) -> Result<()> {
        self.start_tag(tag)?;
        self.add_text(text)?;
        self.end_tag(tag)
    }

    /// `<tag xmlns="namespace">raw xml</tag>`
    pub fn add_xml_section(&mut self, tag: &str, xml: &str, namespace: Option<&str>) -> Result<()> {
        self.start_tag(tag)?;
        if let Some(ns) = namespace {
            self.add_attribute("xmlns", ns)?;
        }
        self.add_raw(xml)?;
        self.end_tag(tag)
    }

    fn variable_id(&mut self) -> String {
        self.next_variable += 1;
        format!("v{}", self.next_variable)
    }

    fn begin_variable(&mut self, kind: &str, name: &str) -> Result<String> {
        let id = self.variable_id();
        self.start_tag(kind)?;
        self.add_attribute("id", &id)?;
        self.add_attribute("name", name)?;
        Ok(id)
    }

    /// Returns the generated variable id.
    pub fn add_string_variable(&mut self, name: &str, value: &str) -> Result<String> {
        let id = self.begin_variable("string", name)?;
        self.add_text(value)?;
        self.end_tag("string")?;
        Ok(id)
    }

    pub fn add_int_variable(&mut self, name: &str, value: i64) -> Result<String> {
        let id = self.begin_variable("integer", name)?;
        self.add_attribute_int("value", value)?;
        self.end_tag("integer")?;
        Ok(id)
    }

    pub fn add_bool_variable(&mut self, name: &str, value: bool) -> Result<String> {
        let id = self.begin_variable("boolean", name)?;
        self.add_attribute("value", if value { "true" } else { "false" })?;
        self.end_tag("boolean")?;
        Ok(id)
    }

    pub fn add_array_variable<S: AsRef<str>>(&mut self, name: &str, items: &[S]) -> Result<String> {
        let id = self.begin_variable("array", name)?;
        for item in items {
            self.add_section("ai", item.as_ref())?;
        }
        self.end_tag("array")?;
        Ok(id)
    }

    /// Sections currently open, root included.
    pub fn depth(&self) -> usize {
        self.open.len()
    }

    /// Close the root element and hand out the document.
    ///
    /// The writer stays behind, closed: any further call is [`UidlError::Closed`].
    /// With sections still open nothing changes, so they can be ended and
    /// `close` retried.
    pub fn close(&mut self) -> Result<UidlDocument> {
        self.ensure_open()?;
        if self.open.len() > 1 {
            return Err(UidlError::Unclosed {
                open: self.open[1..].to_vec(),
            });
        }
        self.close_tag(ROOT_TAG)?;
        self.closed = true;
        Ok(UidlDocument {
            theme: self.theme.clone(),
            xml: std::mem::take(&mut self.out),
        })
    }
}
