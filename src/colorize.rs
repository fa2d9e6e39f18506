//! Purpose: Render pretty JSON and BibXML with optional ANSI colorization.
//! Exports: `colorize_json`, `colorize_xml`.
//! Role: Small, pure formatters used by CLI emission paths.
//! Invariants: When color is disabled, JSON output equals serde_json::to_string_pretty
//! Invariants: and XML output equals the input; ANSI escapes appear only when enabled.
use serde_json::Value;

const INDENT: &str = "  ";

// Conservative 8/16-color palette for broad terminal compatibility.
// Avoid bright variants that can lose contrast on themes like Solarized.
const COLOR_KEY: &str = "36";
const COLOR_STRING: &str = "32";
const COLOR_NUMBER: &str = "33";
const COLOR_BOOL: &str = "35";
const COLOR_NULL: &str = "39";
const COLOR_PUNCT: &str = "39";

const COLOR_TAG: &str = "36";
const COLOR_ATTR: &str = "33";
const COLOR_ATTR_VALUE: &str = "32";

pub fn colorize_json(value: &Value, use_color: bool) -> String {
    let mut out = String::new();
    Painter::new(use_color, &mut out).value(value, 0);
    out
}

/// Colorize serialized BibXML for terminal display. Markup outside ordinary
/// element tags (comments, processing instructions, doctypes) passes through
/// with punctuation coloring only.
pub fn colorize_xml(input: &str, use_color: bool) -> String {
    if !use_color {
        return input.to_string();
    }
    let mut out = String::with_capacity(input.len() + input.len() / 4);
    let mut painter = Painter::new(true, &mut out);
    let mut rest = input;
    while let Some(start) = rest.find('<') {
        painter.plain(&rest[..start]);
        let tag = &rest[start..];
        let Some(end) = tag.find('>') else {
            painter.plain(tag);
            return out;
        };
        painter.tag(&tag[..=end]);
        rest = &tag[end + 1..];
    }
    painter.plain(rest);
    out
}

struct Painter<'a> {
    color: bool,
    out: &'a mut String,
}

impl<'a> Painter<'a> {
    fn new(color: bool, out: &'a mut String) -> Self {
        Self { color, out }
    }

    fn plain(&mut self, text: &str) {
        self.out.push_str(text);
    }

    fn paint(&mut self, text: &str, color: &str) {
        if !self.color {
            self.out.push_str(text);
            return;
        }
        self.out.push_str("\u{1b}[");
        self.out.push_str(color);
        self.out.push('m');
        self.out.push_str(text);
        self.out.push_str("\u{1b}[0m");
    }

    fn break_line(&mut self, depth: usize) {
        self.out.push('\n');
        for _ in 0..depth {
            self.out.push_str(INDENT);
        }
    }

    fn value(&mut self, value: &Value, depth: usize) {
        match value {
            Value::Null => self.paint("null", COLOR_NULL),
            Value::Bool(true) => self.paint("true", COLOR_BOOL),
            Value::Bool(false) => self.paint("false", COLOR_BOOL),
            Value::Number(num) => self.paint(&num.to_string(), COLOR_NUMBER),
            Value::String(text) => self.paint(&encode_string(text), COLOR_STRING),
            Value::Array(items) => self.array(items, depth),
            Value::Object(map) => self.object(map, depth),
        }
    }

    fn array(&mut self, items: &[Value], depth: usize) {
        if items.is_empty() {
            self.paint("[]", COLOR_PUNCT);
            return;
        }
        self.paint("[", COLOR_PUNCT);
        for (idx, item) in items.iter().enumerate() {
            if idx > 0 {
                self.paint(",", COLOR_PUNCT);
            }
            self.break_line(depth + 1);
            self.value(item, depth + 1);
        }
        self.break_line(depth);
        self.paint("]", COLOR_PUNCT);
    }

    fn object(&mut self, map: &serde_json::Map<String, Value>, depth: usize) {
        if map.is_empty() {
            self.paint("{}", COLOR_PUNCT);
            return;
        }
        self.paint("{", COLOR_PUNCT);
        for (idx, (key, value)) in map.iter().enumerate() {
            if idx > 0 {
                self.paint(",", COLOR_PUNCT);
            }
            self.break_line(depth + 1);
            self.paint(&encode_string(key), COLOR_KEY);
            self.paint(":", COLOR_PUNCT);
            self.plain(" ");
            self.value(value, depth + 1);
        }
        self.break_line(depth);
        self.paint("}", COLOR_PUNCT);
    }

    fn tag(&mut self, tag: &str) {
        let inner = &tag[1..tag.len() - 1];
        if inner.starts_with('!') || inner.starts_with('?') {
            self.paint(tag, COLOR_PUNCT);
            return;
        }
        self.paint("<", COLOR_PUNCT);
        let inner = match inner.strip_prefix('/') {
            Some(name) => {
                self.paint("/", COLOR_PUNCT);
                name
            }
            None => inner,
        };
        let name_end = inner
            .find(|c: char| c.is_whitespace() || c == '/')
            .unwrap_or(inner.len());
        self.paint(&inner[..name_end], COLOR_TAG);
        self.attrs(&inner[name_end..]);
        self.paint(">", COLOR_PUNCT);
    }

    fn attrs(&mut self, attrs: &str) {
        let mut rest = attrs;
        loop {
            let skip = rest.len() - rest.trim_start().len();
            self.plain(&rest[..skip]);
            rest = &rest[skip..];
            if rest.is_empty() {
                return;
            }
            if rest == "/" {
                self.paint("/", COLOR_PUNCT);
                return;
            }
            let Some(eq) = rest.find('=') else {
                self.plain(rest);
                return;
            };
            self.paint(&rest[..eq], COLOR_ATTR);
            self.paint("=", COLOR_PUNCT);
            rest = &rest[eq + 1..];
            let quote = match rest.chars().next() {
                Some(q @ ('"' | '\'')) => q,
                _ => {
                    self.plain(rest);
                    return;
                }
            };
            let Some(close) = rest[1..].find(quote) else {
                self.plain(rest);
                return;
            };
            self.paint(&rest[..=close + 1], COLOR_ATTR_VALUE);
            rest = &rest[close + 2..];
        }
    }
}

fn encode_string(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}

#[cfg(test)]
mod tests {
    use super::{colorize_json, colorize_xml};
    use serde_json::json;

    #[test]
    fn colorize_json_matches_pretty_when_disabled() {
        let value = json!({
            "docid": [{"id": "RFC 1234", "type": "IETF"}],
            "title": null
        });
        let plain = colorize_json(&value, false);
        let pretty = serde_json::to_string_pretty(&value).expect("pretty");
        assert_eq!(plain, pretty);
    }

    #[test]
    fn colorize_json_emits_ansi_when_enabled() {
        let value = json!({"k":"v","n":1,"b":true,"z":null});
        let colored = colorize_json(&value, true);
        assert!(colored.contains("\u{1b}["));
        assert!(colored.contains("\u{1b}[36m\"k\"\u{1b}[0m"));
        assert!(colored.contains("\u{1b}[32m\"v\"\u{1b}[0m"));
        assert!(colored.contains("\u{1b}[33m1\u{1b}[0m"));
        assert!(colored.contains("\u{1b}[35mtrue\u{1b}[0m"));
        assert!(colored.contains("\u{1b}[39mnull\u{1b}[0m"));
    }

    #[test]
    fn colorize_xml_is_identity_when_disabled() {
        let xml = "<reference anchor=\"RFC.1234\"><front><title>T</title></front></reference>";
        assert_eq!(colorize_xml(xml, false), xml);
    }

    #[test]
    fn colorize_xml_highlights_tags_and_attributes() {
        let xml = "<reference anchor=\"RFC.1234\"><title>T</title></reference>";
        let colored = colorize_xml(xml, true);
        assert!(colored.contains("\u{1b}[36mreference\u{1b}[0m"));
        assert!(colored.contains("\u{1b}[33manchor\u{1b}[0m"));
        assert!(colored.contains("\u{1b}[32m\"RFC.1234\"\u{1b}[0m"));
        assert!(colored.contains("\u{1b}[0mT\u{1b}["));
    }

    #[test]
    fn colorize_xml_passes_declarations_through() {
        let xml = "<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<x/>";
        let colored = colorize_xml(xml, true);
        assert!(colored.contains("<?xml version=\"1.0\" encoding=\"utf-8\"?>"));
    }
}
