//! A small owned XML tree on top of quick-xml's event reader and writer.
//!
//! Domain templates are parsed into [`Element`]s, edited in place and
//! written back out. Anything the editor does not touch (unknown elements,
//! text, comments, processing instructions, CDATA, attribute order)
//! round-trips unchanged. Whitespace-only text between child elements is
//! layout and is regenerated by the indenting writer.

use quick_xml::events::{BytesCData, BytesEnd, BytesPI, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};

/// Errors from reading or writing XML documents.
#[derive(Debug, thiserror::Error)]
pub enum XmlError {
    #[error(transparent)]
    Syntax(#[from] quick_xml::Error),
    #[error(transparent)]
    Attribute(#[from] quick_xml::events::attributes::AttrError),
    #[error(transparent)]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("document has no root element")]
    NoRoot,
    #[error("document has more than one root element")]
    MultipleRoots,
    #[error("text outside of the root element")]
    StrayText,
    #[error("element <{0}> is not closed")]
    Unclosed(String),
    #[error("expected root element <{expected}>, found <{found}>")]
    UnexpectedRoot { expected: String, found: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Node {
    Element(Element),
    Text(String),
    CData(String),
    Comment(String),
    /// `target content` of a processing instruction
    PI(String),
}

impl Node {
    fn is_layout(&self) -> bool {
        matches!(self, Node::Text(t) if t.trim().is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Element {
    pub(crate) name: String,
    pub(crate) attrs: Vec<(String, String)>,
    pub(crate) children: Vec<Node>,
}

/// A named child position inside a parent element: either the first
/// existing child with that name, or the place where one would be appended.
#[derive(Debug)]
pub(crate) enum Slot<'a> {
    Present {
        children: &'a mut Vec<Node>,
        index: usize,
    },
    Absent {
        children: &'a mut Vec<Node>,
        name: String,
    },
}

impl<'a> Slot<'a> {
    /// Return the existing child, or append an empty one.
    pub(crate) fn or_insert(self) -> &'a mut Element {
        match self {
            Slot::Present { children, index } => element_at(children, index),
            Slot::Absent { children, name } => {
                children.push(Node::Element(Element::new(name)));
                let index = children.len() - 1;
                element_at(children, index)
            }
        }
    }

    /// Put `element` in this position, replacing whatever was there.
    pub(crate) fn replace(self, element: Element) -> &'a mut Element {
        match self {
            Slot::Present { children, index } => {
                children[index] = Node::Element(element);
                element_at(children, index)
            }
            Slot::Absent { children, .. } => {
                children.push(Node::Element(element));
                let index = children.len() - 1;
                element_at(children, index)
            }
        }
    }
}

fn element_at(children: &mut [Node], index: usize) -> &mut Element {
    match &mut children[index] {
        Node::Element(e) => e,
        _ => unreachable!("slot index always refers to an element"),
    }
}

impl Element {
    pub(crate) fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attrs: Vec::new(),
            children: Vec::new(),
        }
    }

    pub(crate) fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.set_attr(key, value);
        self
    }

    pub(crate) fn with_text(mut self, text: impl Into<String>) -> Self {
        self.set_text(text);
        self
    }

    pub(crate) fn with_child(mut self, child: Element) -> Self {
        self.push(child);
        self
    }

    pub(crate) fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, keeping its position if it already exists.
    pub(crate) fn set_attr(&mut self, key: &str, value: impl Into<String>) {
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.attrs.push((key.to_owned(), value)),
        }
    }

    /// Concatenated text content of direct text children.
    pub(crate) fn text(&self) -> Option<String> {
        let mut out: Option<String> = None;
        for child in &self.children {
            if let Node::Text(t) | Node::CData(t) = child {
                out.get_or_insert_with(String::new).push_str(t);
            }
        }
        out
    }

    /// Replace all text content with `text`.
    pub(crate) fn set_text(&mut self, text: impl Into<String>) {
        self.children
            .retain(|c| !matches!(c, Node::Text(_) | Node::CData(_)));
        self.children.push(Node::Text(text.into()));
    }

    pub(crate) fn elements(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(|c| match c {
            Node::Element(e) => Some(e),
            _ => None,
        })
    }

    pub(crate) fn children_named<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a Element> + 'a {
        self.elements().filter(move |e| e.name == name)
    }

    pub(crate) fn child(&self, name: &str) -> Option<&Element> {
        self.elements().find(|e| e.name == name)
    }

    /// Follow a `/`-separated path of child names, taking the first match
    /// at each step.
    pub(crate) fn find(&self, path: &str) -> Option<&Element> {
        path.split('/')
            .try_fold(self, |el, name| el.child(name))
    }

    /// All elements reached by `path`, e.g. every `disk` under every
    /// `devices`.
    pub(crate) fn find_all<'a>(&'a self, path: &str) -> Vec<&'a Element> {
        let mut current = vec![self];
        for name in path.split('/') {
            current = current
                .into_iter()
                .flat_map(|el| el.elements().filter(move |e| e.name == name))
                .collect();
        }
        current
    }

    pub(crate) fn slot(&mut self, name: &str) -> Slot<'_> {
        let index = self
            .children
            .iter()
            .position(|c| matches!(c, Node::Element(e) if e.name == name));
        match index {
            Some(index) => Slot::Present {
                children: &mut self.children,
                index,
            },
            None => Slot::Absent {
                children: &mut self.children,
                name: name.to_owned(),
            },
        }
    }

    pub(crate) fn push(&mut self, child: Element) {
        self.children.push(Node::Element(child));
    }

    pub(crate) fn prepend(&mut self, child: Element) {
        self.children.insert(0, Node::Element(child));
    }

    /// Remove every direct child element named `name`, returning how many
    /// were removed.
    pub(crate) fn remove_children(&mut self, name: &str) -> usize {
        let before = self.children.len();
        self.children
            .retain(|c| !matches!(c, Node::Element(e) if e.name == name));
        before - self.children.len()
    }

    pub(crate) fn parse(input: &str) -> Result<Element, XmlError> {
        let mut reader = Reader::from_str(input);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;
        loop {
            match reader.read_event()? {
                Event::Start(e) => stack.push(Element::from_start(&e)?),
                Event::Empty(e) => attach(&mut stack, &mut root, Element::from_start(&e)?)?,
                Event::End(_) => {
                    // quick-xml already rejects mismatched end tags
                    if let Some(mut el) = stack.pop() {
                        el.drop_layout();
                        attach(&mut stack, &mut root, el)?;
                    }
                }
                Event::Text(t) => {
                    let text = t.unescape()?.into_owned();
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(Node::Text(text)),
                        None if text.trim().is_empty() => {}
                        None => return Err(XmlError::StrayText),
                    }
                }
                Event::CData(c) => {
                    if let Some(parent) = stack.last_mut() {
                        let text = String::from_utf8(c.into_inner().into_owned())?;
                        parent.children.push(Node::CData(text));
                    }
                }
                Event::Comment(c) => {
                    if let Some(parent) = stack.last_mut() {
                        let text = String::from_utf8(c.into_inner().into_owned())?;
                        parent.children.push(Node::Comment(text));
                    }
                }
                Event::PI(pi) => {
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(Node::PI(String::from_utf8(pi.to_vec())?));
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }

        if let Some(open) = stack.pop() {
            return Err(XmlError::Unclosed(open.name));
        }
        root.ok_or(XmlError::NoRoot)
    }

    /// Whether any child is markup rather than character data.
    fn has_markup(&self) -> bool {
        self.children
            .iter()
            .any(|c| !matches!(c, Node::Text(_) | Node::CData(_)))
    }

    /// Drop whitespace-only text next to child markup. Text-only content,
    /// whitespace included, is kept as is.
    fn drop_layout(&mut self) {
        if self.has_markup() {
            self.children.retain(|c| !c.is_layout());
        }
    }

    fn from_start(start: &BytesStart<'_>) -> Result<Element, XmlError> {
        let mut el = Element::new(String::from_utf8(start.name().as_ref().to_vec())?);
        for attr in start.attributes() {
            let attr = attr?;
            let key = String::from_utf8(attr.key.as_ref().to_vec())?;
            let value = attr.unescape_value()?.into_owned();
            el.attrs.push((key, value));
        }
        Ok(el)
    }

    /// Serialize with two-space indentation and no XML declaration.
    pub(crate) fn to_xml(&self) -> Result<String, XmlError> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        self.write(&mut writer)?;
        Ok(String::from_utf8(writer.into_inner())?)
    }

    fn write<W: std::io::Write>(&self, writer: &mut Writer<W>) -> Result<(), XmlError> {
        let start = BytesStart::new(self.name.as_str()).with_attributes(
            self.attrs
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str())),
        );
        if self.children.is_empty() {
            writer.write_event(Event::Empty(start))?;
            return Ok(());
        }
        writer.write_event(Event::Start(start))?;
        let skip_layout = self.has_markup();
        for child in &self.children {
            if skip_layout && child.is_layout() {
                continue;
            }
            match child {
                Node::Element(e) => e.write(writer)?,
                Node::Text(t) => writer.write_event(Event::Text(BytesText::new(t)))?,
                Node::CData(t) => writer.write_event(Event::CData(BytesCData::new(t.as_str())))?,
                Node::Comment(t) => {
                    writer.write_event(Event::Comment(BytesText::from_escaped(t.as_str())))?
                }
                Node::PI(t) => writer.write_event(Event::PI(BytesPI::new(t.as_str())))?,
            }
        }
        writer.write_event(Event::End(BytesEnd::new(self.name.as_str())))?;
        Ok(())
    }
}

fn attach(
    stack: &mut [Element],
    root: &mut Option<Element>,
    el: Element,
) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(parent) => parent.push(el),
        None if root.is_none() => *root = Some(el),
        None => return Err(XmlError::MultipleRoots),
    }
    Ok(())
}
