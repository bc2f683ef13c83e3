//! Minimal XML document model with the path-query subset used by mapping
//! definitions: absolute or descendant paths of element names, attribute
//! predicates (`[@tag='200']`) and one-based position predicates (`[1]`).

use quick_xml::events::Event;
use quick_xml::Reader;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum XmlError {
    #[error("malformed xml: {0}")]
    Parse(String),
    #[error("document has no root element")]
    NoRoot,
    #[error("malformed path query {query:?}: {reason}")]
    BadQuery { query: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub children: Vec<Node>,
    text: String,
}

impl Node {
    fn new(name: String, attrs: Vec<(String, String)>) -> Self {
        Self {
            name,
            attrs,
            children: Vec::new(),
            text: String::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Concatenated text of this element and all descendants, in document
    /// order (the DOM `nodeValue` of an element).
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        out.push_str(&self.text);
        for child in &self.children {
            child.collect_text(out);
        }
    }
}

/// An immutable parsed authority record.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    root: Node,
}

impl Document {
    pub fn parse(xml: &str) -> Result<Self, XmlError> {
        let mut reader = Reader::from_reader(xml.as_bytes());
        reader.config_mut().trim_text(true);

        let mut stack: Vec<Node> = Vec::new();
        let mut root: Option<Node> = None;
        let mut buf = Vec::new();
        loop {
            match reader
                .read_event_into(&mut buf)
                .map_err(|e| XmlError::Parse(e.to_string()))?
            {
                Event::Start(start) => {
                    let node = Node::new(
                        String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                        read_attrs(&start)?,
                    );
                    stack.push(node);
                }
                Event::Empty(start) => {
                    let node = Node::new(
                        String::from_utf8_lossy(start.name().as_ref()).into_owned(),
                        read_attrs(&start)?,
                    );
                    attach(&mut stack, &mut root, node)?;
                }
                Event::Text(text) => {
                    if let Some(top) = stack.last_mut() {
                        let unescaped =
                            text.unescape().map_err(|e| XmlError::Parse(e.to_string()))?;
                        top.text.push_str(&unescaped);
                    }
                }
                Event::CData(data) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&String::from_utf8_lossy(&data));
                    }
                }
                Event::End(_) => {
                    let node = stack.pop().ok_or_else(|| {
                        XmlError::Parse("closing tag without opening tag".to_string())
                    })?;
                    attach(&mut stack, &mut root, node)?;
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        if !stack.is_empty() {
            return Err(XmlError::Parse("unclosed element".to_string()));
        }
        Ok(Self {
            root: root.ok_or(XmlError::NoRoot)?,
        })
    }

    pub fn root(&self) -> &Node {
        &self.root
    }

    /// All nodes matching the path query, in document order.
    pub fn query(&self, path: &str) -> Result<Vec<&Node>, XmlError> {
        let steps = parse_query(path)?;

        // The first step is evaluated against the virtual document node,
        // whose only child is the root element.
        let first = &steps[0];
        let matched: Vec<&Node> = match first.axis {
            Axis::Child => {
                if first.matches(&self.root) {
                    vec![&self.root]
                } else {
                    Vec::new()
                }
            }
            Axis::Descendant => {
                let mut found = Vec::new();
                if first.matches(&self.root) {
                    found.push(&self.root);
                }
                collect_descendants(&self.root, first, &mut found);
                found
            }
        };
        let mut current = position_filter(matched, first.index.unwrap_or(0));

        for step in &steps[1..] {
            if current.is_empty() {
                break;
            }
            current = eval_step(&current, step);
        }
        Ok(current)
    }

    /// First match of the path query, if any.
    pub fn query_first(&self, path: &str) -> Result<Option<&Node>, XmlError> {
        Ok(self.query(path)?.into_iter().next())
    }
}

fn attach(stack: &mut Vec<Node>, root: &mut Option<Node>, node: Node) -> Result<(), XmlError> {
    match stack.last_mut() {
        Some(parent) => parent.children.push(node),
        None => {
            if root.is_some() {
                return Err(XmlError::Parse("multiple root elements".to_string()));
            }
            *root = Some(node);
        }
    }
    Ok(())
}

fn read_attrs(start: &quick_xml::events::BytesStart<'_>) -> Result<Vec<(String, String)>, XmlError> {
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(|e| XmlError::Parse(e.to_string()))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).into_owned();
        let value = attr
            .unescape_value()
            .map_err(|e| XmlError::Parse(e.to_string()))?
            .into_owned();
        attrs.push((key, value));
    }
    Ok(attrs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Axis {
    Child,
    Descendant,
}

#[derive(Debug, Clone, PartialEq)]
struct Step {
    axis: Axis,
    name: String,
    attr_preds: Vec<(String, String)>,
    index: Option<usize>,
}

impl Step {
    fn matches(&self, node: &Node) -> bool {
        (self.name == "*" || node.name == self.name)
            && self
                .attr_preds
                .iter()
                .all(|(k, v)| node.attr(k) == Some(v.as_str()))
    }
}

fn parse_query(path: &str) -> Result<Vec<Step>, XmlError> {
    let bad = |reason: &str| XmlError::BadQuery {
        query: path.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = path.trim();
    if trimmed.is_empty() {
        return Err(bad("empty query"));
    }

    let mut rest = trimmed;
    let mut steps = Vec::new();
    let mut axis = if let Some(after) = rest.strip_prefix("//") {
        rest = after;
        Axis::Descendant
    } else {
        rest = rest.strip_prefix('/').unwrap_or(rest);
        Axis::Child
    };

    while !rest.is_empty() {
        let end = rest.find('/').unwrap_or(rest.len());
        let raw_step = &rest[..end];
        if raw_step.is_empty() {
            return Err(bad("empty step"));
        }
        steps.push(parse_step(raw_step, axis, path)?);

        rest = &rest[end..];
        if let Some(after) = rest.strip_prefix("//") {
            rest = after;
            axis = Axis::Descendant;
        } else if let Some(after) = rest.strip_prefix('/') {
            rest = after;
            axis = Axis::Child;
            if rest.is_empty() {
                return Err(bad("trailing slash"));
            }
        }
    }

    if steps.is_empty() {
        return Err(bad("no steps"));
    }
    Ok(steps)
}

fn parse_step(raw: &str, axis: Axis, path: &str) -> Result<Step, XmlError> {
    let bad = |reason: String| XmlError::BadQuery {
        query: path.to_string(),
        reason,
    };

    let name_end = raw.find('[').unwrap_or(raw.len());
    let name = raw[..name_end].trim();
    if name.is_empty() {
        return Err(bad("step without element name".to_string()));
    }

    let mut step = Step {
        axis,
        name: name.to_string(),
        attr_preds: Vec::new(),
        index: None,
    };

    let mut preds = &raw[name_end..];
    while !preds.is_empty() {
        let Some(stripped) = preds.strip_prefix('[') else {
            return Err(bad(format!("unexpected characters {preds:?}")));
        };
        let Some(close) = stripped.find(']') else {
            return Err(bad("unclosed predicate".to_string()));
        };
        let pred = stripped[..close].trim();
        if let Some(attr) = pred.strip_prefix('@') {
            let (key, value) = attr
                .split_once('=')
                .ok_or_else(|| bad(format!("attribute predicate without value: {pred:?}")))?;
            let value = value.trim();
            let value = value
                .strip_prefix('\'')
                .and_then(|v| v.strip_suffix('\''))
                .or_else(|| value.strip_prefix('"').and_then(|v| v.strip_suffix('"')))
                .ok_or_else(|| bad(format!("unquoted attribute value: {pred:?}")))?;
            step.attr_preds.push((key.trim().to_string(), value.to_string()));
        } else {
            let index: usize = pred
                .parse()
                .map_err(|_| bad(format!("unsupported predicate {pred:?}")))?;
            if index == 0 {
                return Err(bad("positions are one-based".to_string()));
            }
            step.index = Some(index);
        }
        preds = &stripped[close + 1..];
    }

    Ok(step)
}

fn eval_step<'a>(context: &[&'a Node], step: &Step) -> Vec<&'a Node> {
    let mut out = Vec::new();
    for node in context {
        let matched: Vec<&Node> = match step.axis {
            Axis::Child => node.children.iter().filter(|n| step.matches(n)).collect(),
            Axis::Descendant => {
                let mut found = Vec::new();
                collect_descendants(node, step, &mut found);
                found
            }
        };
        out.extend(position_filter(matched, step.index.unwrap_or(0)));
    }
    out
}

fn position_filter(matched: Vec<&Node>, index: usize) -> Vec<&Node> {
    if index == 0 {
        matched
    } else {
        matched.into_iter().nth(index - 1).into_iter().collect()
    }
}

fn collect_descendants<'a>(node: &'a Node, step: &Step, out: &mut Vec<&'a Node>) {
    for child in &node.children {
        if step.matches(child) {
            out.push(child);
        }
        collect_descendants(child, step, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERSON_XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<record>
    <leader>001cx  a22001573n 45  </leader>
    <controlfield tag="001">028377788</controlfield>
    <controlfield tag="003">http://www.idref.fr/028377788</controlfield>
    <datafield tag="101" ind1=" " ind2=" ">
        <subfield code="a">fre</subfield>
    </datafield>
    <datafield tag="103" ind1=" " ind2=" ">
        <subfield code="a">19480520</subfield>
        <subfield code="b">        </subfield>
    </datafield>
    <datafield tag="200" ind1="1" ind2=" ">
        <subfield code="a">Durand</subfield>
        <subfield code="b">Jean</subfield>
        <subfield code="c">écrivain</subfield>
    </datafield>
    <datafield tag="900" ind1=" " ind2=" ">
        <subfield code="a">Jean Durand</subfield>
    </datafield>
</record>"#;

    #[test]
    fn absolute_path_with_attribute_predicates() {
        let doc = Document::parse(PERSON_XML).unwrap();
        let node = doc
            .query_first("/record/datafield[@tag='200']/subfield[@code='a']")
            .unwrap()
            .unwrap();
        assert_eq!(node.text_content().trim(), "Durand");
    }

    #[test]
    fn position_predicate_is_one_based() {
        let doc = Document::parse(PERSON_XML).unwrap();
        let node = doc
            .query_first("/record/datafield[@tag='103']/subfield[@code='a'][1]")
            .unwrap()
            .unwrap();
        assert_eq!(node.text_content().trim(), "19480520");

        let second = doc
            .query_first("/record/datafield[@tag='200']/subfield[2]")
            .unwrap()
            .unwrap();
        assert_eq!(second.text_content().trim(), "Jean");
    }

    #[test]
    fn descendant_axis_searches_the_whole_tree() {
        let doc = Document::parse(PERSON_XML).unwrap();
        let all = doc.query("//subfield[@code='a']").unwrap();
        assert_eq!(all.len(), 4);
        let first = doc.query_first("//controlfield[@tag='003']").unwrap().unwrap();
        assert_eq!(first.text_content(), "http://www.idref.fr/028377788");
    }

    #[test]
    fn no_match_yields_empty_result_not_error() {
        let doc = Document::parse(PERSON_XML).unwrap();
        assert!(doc
            .query_first("/record/datafield[@tag='999']/subfield[@code='a']")
            .unwrap()
            .is_none());
    }

    #[test]
    fn malformed_queries_are_rejected() {
        let doc = Document::parse(PERSON_XML).unwrap();
        assert!(doc.query("").is_err());
        assert!(doc.query("/record/datafield[@tag=200]").is_err());
        assert!(doc.query("/record/datafield[last()]").is_err());
    }

    #[test]
    fn parse_rejects_broken_xml() {
        assert!(Document::parse("<record><unclosed></record>").is_err());
        assert!(Document::parse("no markup at all").is_err());
        assert!(Document::parse("").is_err());
    }

    #[test]
    fn text_content_concatenates_descendants() {
        let doc = Document::parse("<a>x<b>y</b>z</a>").unwrap();
        assert_eq!(doc.root().text_content(), "xyz");
    }
}
