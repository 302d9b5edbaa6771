//! Element tree codec.
//!
//! Frame payloads are XML-shaped element trees in a deliberately small
//! dialect: tags and attribute names are ASCII identifiers, attribute
//! values may be bare (`h=5`) or double-quoted (`dir="work dir"`), text
//! content is raw bytes with five named entities plus `&#NN;` numeric
//! escapes for control and high bytes. No comments, no processing
//! instructions, no namespaces.

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum ElementError {
    #[error("payload ended inside an element")]
    UnexpectedEof,

    #[error("bad entity escape at byte {0}")]
    BadEntity(usize),

    #[error("malformed element syntax at byte {0}")]
    BadSyntax(usize),

    #[error("close tag </{found}> does not match <{expected}>")]
    MismatchedClose { expected: String, found: String },
}

/// A child of an element: nested element or a run of text bytes.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Elem(Element),
    Text(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Element {
    pub tag: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn attr(mut self, name: &str, value: impl ToString) -> Self {
        self.attrs.push((name.to_string(), value.to_string()));
        self
    }

    pub fn text(mut self, text: impl AsRef<[u8]>) -> Self {
        self.children.push(Node::Text(text.as_ref().to_vec()));
        self
    }

    pub fn child(mut self, elem: Element) -> Self {
        self.children.push(Node::Elem(elem));
        self
    }

    pub fn get_attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Attribute parsed as an integer, `None` if absent or non-numeric.
    pub fn int_attr(&self, name: &str) -> Option<i32> {
        self.get_attr(name).and_then(|v| v.parse().ok())
    }

    /// Concatenated text bytes of the direct children.
    pub fn text_content(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for node in &self.children {
            if let Node::Text(t) = node {
                out.extend_from_slice(t);
            }
        }
        out
    }

    pub fn first_elem(&self) -> Option<&Element> {
        self.children.iter().find_map(|n| match n {
            Node::Elem(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn child_elems(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|n| match n {
            Node::Elem(e) => Some(e),
            Node::Text(_) => None,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.serialize_into(&mut out);
        out
    }

    pub fn serialize_into(&self, out: &mut Vec<u8>) {
        out.push(b'<');
        out.extend_from_slice(self.tag.as_bytes());
        for (name, value) in &self.attrs {
            out.push(b' ');
            out.extend_from_slice(name.as_bytes());
            out.push(b'=');
            if value.is_empty() || value.bytes().any(|b| b == b' ' || b == b'"') {
                out.push(b'"');
                escape_into(value.as_bytes(), out);
                out.push(b'"');
            } else {
                escape_into(value.as_bytes(), out);
            }
        }
        if self.children.is_empty() {
            out.extend_from_slice(b"/>");
            return;
        }
        out.push(b'>');
        for node in &self.children {
            match node {
                Node::Elem(e) => e.serialize_into(out),
                Node::Text(t) => escape_into(t, out),
            }
        }
        out.extend_from_slice(b"</");
        out.extend_from_slice(self.tag.as_bytes());
        out.push(b'>');
    }
}

/// Append `bytes` to `out` with protocol entity escaping applied.
pub fn escape_into(bytes: &[u8], out: &mut Vec<u8>) {
    for &b in bytes {
        match b {
            b'<' => out.extend_from_slice(b"&lt;"),
            b'>' => out.extend_from_slice(b"&gt;"),
            b'&' => out.extend_from_slice(b"&amp;"),
            b'"' => out.extend_from_slice(b"&quot;"),
            b'\'' => out.extend_from_slice(b"&apos;"),
            0x20..=0x7E => out.push(b),
            _ => {
                out.push(b'&');
                out.push(b'#');
                out.extend_from_slice(b.to_string().as_bytes());
                out.push(b';');
            }
        }
    }
}

/// Parse a complete payload into its top-level nodes.
///
/// Frame boundaries guarantee completeness, so a payload that ends
/// mid-element is an error, not a partial parse. Bare text between
/// top-level elements is legal; display runs travel that way.
pub fn parse(input: &[u8]) -> Result<Vec<Node>, ElementError> {
    let mut parser = Parser { input, pos: 0 };
    let mut nodes = Vec::new();
    let mut text = Vec::new();
    while parser.pos < input.len() {
        match parser.peek() {
            Some(b'<') => {
                if !text.is_empty() {
                    nodes.push(Node::Text(std::mem::take(&mut text)));
                }
                nodes.push(Node::Elem(parser.element()?));
            }
            Some(b'&') => {
                parser.pos += 1;
                text.push(parser.entity()?);
            }
            Some(b) => {
                parser.pos += 1;
                text.push(b);
            }
            None => break,
        }
    }
    if !text.is_empty() {
        nodes.push(Node::Text(text));
    }
    Ok(nodes)
}

/// First element among top-level nodes, skipping text.
pub fn first_element(nodes: &[Node]) -> Option<&Element> {
    nodes.iter().find_map(|n| match n {
        Node::Elem(e) => Some(e),
        Node::Text(_) => None,
    })
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn bump(&mut self) -> Result<u8, ElementError> {
        let b = self.peek().ok_or(ElementError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, want: u8) -> Result<(), ElementError> {
        let at = self.pos;
        if self.bump()? == want {
            Ok(())
        } else {
            Err(ElementError::BadSyntax(at))
        }
    }

    fn name(&mut self) -> Result<String, ElementError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if b.is_ascii_alphanumeric() || b == b'_' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(ElementError::BadSyntax(start));
        }
        // identifier bytes only, always valid UTF-8
        Ok(String::from_utf8_lossy(&self.input[start..self.pos]).into_owned())
    }

    fn element(&mut self) -> Result<Element, ElementError> {
        self.expect(b'<')?;
        let mut elem = Element::new(&self.name()?);
        loop {
            match self.peek().ok_or(ElementError::UnexpectedEof)? {
                b' ' => {
                    self.pos += 1;
                }
                b'/' => {
                    self.pos += 1;
                    self.expect(b'>')?;
                    return Ok(elem);
                }
                b'>' => {
                    self.pos += 1;
                    self.children(&mut elem)?;
                    return Ok(elem);
                }
                _ => {
                    let name = self.name()?;
                    self.expect(b'=')?;
                    let value = self.attr_value()?;
                    elem.attrs.push((name, value));
                }
            }
        }
    }

    fn attr_value(&mut self) -> Result<String, ElementError> {
        let start = self.pos;
        let mut raw = Vec::new();
        if self.peek() == Some(b'"') {
            self.pos += 1;
            loop {
                match self.bump()? {
                    b'"' => break,
                    b'&' => raw.push(self.entity()?),
                    b => raw.push(b),
                }
            }
        } else {
            while let Some(b) = self.peek() {
                match b {
                    b' ' | b'/' | b'>' => break,
                    b'&' => {
                        self.pos += 1;
                        raw.push(self.entity()?);
                    }
                    _ => {
                        self.pos += 1;
                        raw.push(b);
                    }
                }
            }
        }
        // attribute values stay ASCII on this wire; a high byte would
        // widen to two bytes on re-serialization
        if raw.iter().any(|&b| b >= 0x80) {
            return Err(ElementError::BadSyntax(start));
        }
        Ok(raw.iter().map(|&b| b as char).collect())
    }

    fn children(&mut self, elem: &mut Element) -> Result<(), ElementError> {
        let mut text = Vec::new();
        loop {
            match self.peek().ok_or(ElementError::UnexpectedEof)? {
                b'<' => {
                    if !text.is_empty() {
                        elem.children.push(Node::Text(std::mem::take(&mut text)));
                    }
                    if self.input.get(self.pos + 1) == Some(&b'/') {
                        self.pos += 2;
                        let found = self.name()?;
                        self.expect(b'>')?;
                        if found != elem.tag {
                            return Err(ElementError::MismatchedClose {
                                expected: elem.tag.clone(),
                                found,
                            });
                        }
                        return Ok(());
                    }
                    elem.children.push(Node::Elem(self.element()?));
                }
                b'&' => {
                    self.pos += 1;
                    text.push(self.entity()?);
                }
                _ => {
                    text.push(self.bump()?);
                }
            }
        }
    }

    /// Called with `pos` just past the `&`.
    fn entity(&mut self) -> Result<u8, ElementError> {
        let start = self.pos - 1;
        let rest = &self.input[self.pos..];
        for (pat, byte) in [
            (&b"lt;"[..], b'<'),
            (&b"gt;"[..], b'>'),
            (&b"amp;"[..], b'&'),
            (&b"quot;"[..], b'"'),
            (&b"apos;"[..], b'\''),
        ] {
            if rest.starts_with(pat) {
                self.pos += pat.len();
                return Ok(byte);
            }
        }
        if rest.first() == Some(&b'#') {
            self.pos += 1;
            let mut value: u32 = 0;
            let mut digits = 0;
            while let Some(b) = self.peek() {
                if b.is_ascii_digit() {
                    value = value * 10 + (b - b'0') as u32;
                    digits += 1;
                    self.pos += 1;
                } else {
                    break;
                }
            }
            if digits == 0 || value > 255 || self.peek() != Some(b';') {
                return Err(ElementError::BadEntity(start));
            }
            self.pos += 1;
            return Ok(value as u8);
        }
        Err(ElementError::BadEntity(start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn one(input: &[u8]) -> Element {
        let nodes = parse(input).unwrap();
        match nodes.as_slice() {
            [Node::Elem(e)] => e.clone(),
            other => panic!("expected one element, got {:?}", other),
        }
    }

    #[test]
    fn test_empty_element_with_bare_attrs() {
        let p = one(b"<p h=12 v=3/>");
        assert_eq!(p.tag, "p");
        assert_eq!(p.int_attr("h"), Some(12));
        assert_eq!(p.int_attr("v"), Some(3));
        assert!(p.children.is_empty());
    }

    #[test]
    fn test_nested_elements_and_text() {
        let k = one(b"<k><eon/><cf w=5 edit=y>ABCDE</cf></k>");
        assert_eq!(k.tag, "k");
        let kids: Vec<&Element> = k.child_elems().collect();
        assert_eq!(kids.len(), 2);
        assert_eq!(kids[0].tag, "eon");
        assert_eq!(kids[1].tag, "cf");
        assert_eq!(kids[1].get_attr("edit"), Some("y"));
        assert_eq!(kids[1].text_content(), b"ABCDE");
    }

    #[test]
    fn test_entity_round_trip() {
        let elem = Element::new("r").text(b"a<b>&\"'\x01\xfe".as_ref());
        let bytes = elem.to_bytes();
        assert_eq!(
            bytes,
            b"<r>a&lt;b&gt;&amp;&quot;&apos;&#1;&#254;</r>".to_vec()
        );
        assert_eq!(one(&bytes), elem);
    }

    #[test]
    fn test_quoted_attr_with_spaces() {
        let elem = Element::new("start")
            .attr("port", 3000)
            .attr("dir", "work dir");
        let bytes = elem.to_bytes();
        assert_eq!(bytes, b"<start port=3000 dir=\"work dir\"/>".to_vec());
        assert_eq!(one(&bytes).get_attr("dir"), Some("work dir"));
    }

    #[test]
    fn test_mixed_top_level_text_and_elements() {
        let nodes = parse(b"<revon/>hi &amp; bye<revoff/>").unwrap();
        assert_eq!(
            nodes,
            vec![
                Node::Elem(Element::new("revon")),
                Node::Text(b"hi & bye".to_vec()),
                Node::Elem(Element::new("revoff")),
            ]
        );
        assert_eq!(first_element(&nodes).map(|e| e.tag.as_str()), Some("revon"));
    }

    #[test]
    fn test_high_byte_attr_rejected() {
        assert!(matches!(
            parse(b"<start dir=\"a&#200;b\"/>"),
            Err(ElementError::BadSyntax(_))
        ));
        assert!(matches!(
            parse(b"<start dir=a\xc8b/>"),
            Err(ElementError::BadSyntax(_))
        ));
        // control bytes survive the round trip as entities
        let elem = one(b"<start dir=\"a&#9;b\"/>");
        assert_eq!(elem.get_attr("dir"), Some("a\tb"));
        assert_eq!(elem.to_bytes(), b"<start dir=a&#9;b/>".to_vec());
    }

    #[test]
    fn test_mismatched_close_rejected() {
        let err = parse(b"<a><b></a></b>").unwrap_err();
        assert_eq!(
            err,
            ElementError::MismatchedClose {
                expected: "b".to_string(),
                found: "a".to_string(),
            }
        );
    }

    #[test]
    fn test_truncated_payload_rejected() {
        assert_eq!(parse(b"<cursor>on").unwrap_err(), ElementError::UnexpectedEof);
        assert_eq!(parse(b"<k>text").unwrap_err(), ElementError::UnexpectedEof);
    }
}
