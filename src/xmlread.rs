/// Streaming, namespace-tolerant XML reading for the disc catalog files.
///
/// Catalog XMLs (`songs_*_0.xml`, `acts_*_0.xml`, `covers.xml`,
/// `melody_1.xml`, `config.xml`) come from several generations of discs with
/// inconsistent casing and optional namespace prefixes. Everything here
/// matches on local names case-insensitively and keeps memory bounded by
/// materializing one element subtree at a time.
use std::io::Write;
use std::path::Path;

use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Reader;

use crate::error::{Result, SpcdbError};

/// A lightweight owned element subtree.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlElem {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlElem>,
}

impl XmlElem {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn name_is(&self, tag: &str) -> bool {
        self.name.eq_ignore_ascii_case(tag)
    }

    /// First attribute value matching any of `keys` exactly, in key order.
    pub fn attr(&self, keys: &[&str]) -> Option<&str> {
        for key in keys {
            if let Some((_, v)) = self.attrs.iter().find(|(k, _)| k == key) {
                return Some(v.as_str());
            }
        }
        None
    }

    /// First attribute value matching any of `keys` case-insensitively.
    pub fn attr_ci(&self, keys: &[&str]) -> Option<&str> {
        for key in keys {
            if let Some((_, v)) = self.attrs.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)) {
                return Some(v.as_str());
            }
        }
        None
    }

    fn walk<'a>(&'a self, out: &mut Vec<&'a XmlElem>) {
        out.push(self);
        for ch in &self.children {
            ch.walk(out);
        }
    }

    /// Self plus all descendants, document order.
    pub fn descendants(&self) -> Vec<&XmlElem> {
        let mut out = Vec::new();
        self.walk(&mut out);
        out
    }

    /// First non-empty text among descendants whose tag matches, probing the
    /// candidate tags in order.
    pub fn find_text_by_tags_ci(&self, tags: &[&str]) -> Option<String> {
        for tag in tags {
            for el in self.descendants() {
                if el.name_is(tag) {
                    let t = el.text.trim();
                    if !t.is_empty() {
                        return Some(t.to_string());
                    }
                }
            }
        }
        None
    }

    /// Parse the element's numeric identifier from the conventional attribute
    /// spellings, falling back to an immediate child element's text.
    pub fn parse_id(&self) -> Option<u32> {
        if let Some(v) = self.attr(&["ID", "id", "SONG_ID", "song_id"]) {
            return v.trim().parse().ok();
        }
        for ch in &self.children {
            if ch.name_is("ID") || ch.name_is("SONG_ID") {
                if let Ok(v) = ch.text.trim().parse() {
                    return Some(v);
                }
            }
        }
        None
    }

    /// Serialize this subtree into a quick-xml writer.
    pub fn write_into<W: Write>(&self, writer: &mut quick_xml::Writer<W>) -> Result<()> {
        let mut start = BytesStart::new(self.name.as_str());
        for (k, v) in &self.attrs {
            start.push_attribute((k.as_str(), v.as_str()));
        }
        if self.children.is_empty() && self.text.trim().is_empty() {
            writer
                .write_event(Event::Empty(start))
                .map_err(|e| SpcdbError::Generic(format!("XML write failed: {e}")))?;
            return Ok(());
        }
        writer
            .write_event(Event::Start(start))
            .map_err(|e| SpcdbError::Generic(format!("XML write failed: {e}")))?;
        let text = self.text.trim();
        if !text.is_empty() {
            writer
                .write_event(Event::Text(BytesText::new(text)))
                .map_err(|e| SpcdbError::Generic(format!("XML write failed: {e}")))?;
        }
        for ch in &self.children {
            ch.write_into(writer)?;
        }
        writer
            .write_event(Event::End(BytesEnd::new(self.name.as_str())))
            .map_err(|e| SpcdbError::Generic(format!("XML write failed: {e}")))?;
        Ok(())
    }
}

fn local_name(raw: &[u8]) -> String {
    let raw = match raw.iter().rposition(|&b| b == b':') {
        Some(pos) => &raw[pos + 1..],
        None => raw,
    };
    String::from_utf8_lossy(raw).into_owned()
}

fn parse_err(path: &Path, e: impl std::fmt::Display) -> SpcdbError {
    SpcdbError::Parse {
        path: path.to_path_buf(),
        reason: e.to_string(),
    }
}

fn start_to_elem(path: &Path, e: &BytesStart<'_>) -> Result<XmlElem> {
    let mut elem = XmlElem::new(local_name(e.name().as_ref()));
    for attr in e.attributes().with_checks(false) {
        let attr = attr.map_err(|err| parse_err(path, err))?;
        let key = local_name(attr.key.as_ref());
        let value = attr.unescape_value().map_err(|err| parse_err(path, err))?.into_owned();
        elem.attrs.push((key, value));
    }
    Ok(elem)
}

/// Stream every element whose local name matches `wanted_tag`
/// (case-insensitive), materializing one subtree at a time. When
/// `header_tag` is non-empty, the attributes of the first matching container
/// element are reported through `on_header` before any subtree callback.
pub fn stream_elements_with_header(
    path: &Path,
    header_tag: &str,
    wanted_tag: &str,
    on_header: &mut dyn FnMut(&XmlElem),
    on_elem: &mut dyn FnMut(XmlElem) -> Result<()>,
) -> Result<()> {
    let mut reader = Reader::from_file(path).map_err(|e| parse_err(path, e))?;
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    // Stack of partially built elements while capturing a wanted subtree.
    let mut capture: Vec<XmlElem> = Vec::new();
    let mut header_seen = header_tag.is_empty();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| parse_err(path, e))?;
        match event {
            Event::Start(ref e) => {
                let name = local_name(e.name().as_ref());
                if !header_seen && name.eq_ignore_ascii_case(header_tag) {
                    header_seen = true;
                    on_header(&start_to_elem(path, e)?);
                }
                if !capture.is_empty() || name.eq_ignore_ascii_case(wanted_tag) {
                    capture.push(start_to_elem(path, e)?);
                }
            }
            Event::Empty(ref e) => {
                let name = local_name(e.name().as_ref());
                if !header_seen && name.eq_ignore_ascii_case(header_tag) {
                    header_seen = true;
                    on_header(&start_to_elem(path, e)?);
                }
                if let Some(parent) = capture.last_mut() {
                    parent.children.push(start_to_elem(path, e)?);
                } else if name.eq_ignore_ascii_case(wanted_tag) {
                    on_elem(start_to_elem(path, e)?)?;
                }
            }
            Event::Text(ref e) => {
                if let Some(top) = capture.last_mut() {
                    let t = e.unescape().map_err(|err| parse_err(path, err))?;
                    top.text.push_str(&t);
                }
            }
            Event::CData(ref e) => {
                if let Some(top) = capture.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(e));
                }
            }
            Event::End(_) => {
                if let Some(done) = capture.pop() {
                    match capture.last_mut() {
                        Some(parent) => parent.children.push(done),
                        None => on_elem(done)?,
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

/// Stream every element whose local name matches `wanted_tag`.
pub fn stream_elements(path: &Path, wanted_tag: &str, on_elem: &mut dyn FnMut(XmlElem) -> Result<()>) -> Result<()> {
    stream_elements_with_header(path, "", wanted_tag, &mut |_| {}, on_elem)
}

/// Read just the root element's name and attributes (no children), for
/// copying a document's envelope when rewriting it.
pub fn read_root_meta(path: &Path) -> Result<XmlElem> {
    let mut reader = Reader::from_file(path).map_err(|e| parse_err(path, e))?;
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(|e| parse_err(path, e))? {
            Event::Start(ref e) | Event::Empty(ref e) => return start_to_elem(path, e),
            Event::Eof => return Err(parse_err(path, "no root element")),
            _ => {}
        }
    }
}

/// Read a whole (small) XML document into an element tree.
pub fn read_document(path: &Path) -> Result<XmlElem> {
    let mut reader = Reader::from_file(path).map_err(|e| parse_err(path, e))?;
    reader.config_mut().trim_text(true);

    let mut buf = Vec::new();
    let mut stack: Vec<XmlElem> = Vec::new();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| parse_err(path, e))?;
        match event {
            Event::Start(ref e) => stack.push(start_to_elem(path, e)?),
            Event::Empty(ref e) => {
                let child = start_to_elem(path, e)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(child),
                    None => return Ok(child),
                }
            }
            Event::Text(ref e) => {
                if let Some(top) = stack.last_mut() {
                    let t = e.unescape().map_err(|err| parse_err(path, err))?;
                    top.text.push_str(&t);
                }
            }
            Event::CData(ref e) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(e));
                }
            }
            Event::End(_) => {
                if let Some(done) = stack.pop() {
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(done),
                        None => return Ok(done),
                    }
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Err(parse_err(path, "no root element"))
}
