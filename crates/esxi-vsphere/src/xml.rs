//! Minimal XML element tree for vim25 SOAP payloads.
//!
//! Responses are read with `quick_xml` into [`XmlNode`]s, then either decoded
//! into typed values or converted to JSON for callers that just want to see
//! the remote data. Request bodies are built as strings with the escaping
//! helpers at the bottom.

use crate::error::{VsphereError, VsphereResult};
use crate::types::ObjectRef;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use serde_json::{Map, Value};

/// One element. Attribute keys keep their prefix (`xsi:type` vs `type`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct XmlNode {
    pub name: String,
    pub attrs: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<XmlNode>,
}

impl XmlNode {
    pub fn child(&self, name: &str) -> Option<&XmlNode> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a XmlNode> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    /// `xsi:type` without its namespace prefix.
    pub fn xsi_type(&self) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k.ends_with(":type"))
            .map(|(_, v)| local_name(v))
    }

    /// Text of a direct child.
    pub fn text_of(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    /// First descendant (depth-first, self excluded) with this name.
    pub fn find(&self, name: &str) -> Option<&XmlNode> {
        for c in &self.children {
            if c.name == name {
                return Some(c);
            }
            if let Some(hit) = c.find(name) {
                return Some(hit);
            }
        }
        None
    }

    /// Managed object reference encoded as `<x type="Kind">value</x>`.
    pub fn to_object_ref(&self) -> Option<ObjectRef> {
        if !self.children.is_empty() {
            return None;
        }
        let kind = self.attr("type")?;
        Some(ObjectRef::new(kind, self.text.clone()))
    }

    /// Convert to JSON.
    ///
    /// Object references become `{"type", "value"}`, typed scalars are
    /// converted by their `xsi:type`, `ArrayOf*` wrappers become arrays and
    /// other complex types keep their type as `_type`. A repeated child name
    /// becomes an array; a single occurrence stays a plain value, so readers
    /// should go through [`as_list`].
    pub fn to_json(&self) -> Value {
        if let Some(obj) = self.to_object_ref() {
            return serde_json::to_value(obj).unwrap_or(Value::Null);
        }
        let xsi = self.xsi_type();
        if xsi.is_some_and(|t| t.starts_with("ArrayOf")) {
            return Value::Array(self.children.iter().map(XmlNode::to_json).collect());
        }
        if self.children.is_empty() {
            return scalar(&self.text, xsi);
        }

        let mut map = Map::new();
        if let Some(t) = xsi {
            map.insert("_type".into(), Value::String(t.to_string()));
        }
        for c in &self.children {
            let v = c.to_json();
            match map.get_mut(&c.name) {
                Some(Value::Array(items)) => items.push(v),
                Some(existing) => {
                    let first = existing.take();
                    *existing = Value::Array(vec![first, v]);
                }
                None => {
                    map.insert(c.name.clone(), v);
                }
            }
        }
        Value::Object(map)
    }
}

fn scalar(text: &str, xsi: Option<&str>) -> Value {
    match xsi {
        Some("int" | "long" | "short" | "byte") => text
            .parse::<i64>()
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(text.to_string())),
        Some("float" | "double") => text
            .parse::<f64>()
            .ok()
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or_else(|| Value::String(text.to_string())),
        Some("boolean") => Value::Bool(text == "true"),
        _ => Value::String(text.to_string()),
    }
}

/// View a JSON value produced by [`XmlNode::to_json`] as a list, whether the
/// remote sent zero, one or many elements.
pub fn as_list(v: Option<&Value>) -> Vec<&Value> {
    match v {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.iter().collect(),
        Some(other) => vec![other],
    }
}

/// Parse a document. The returned node is a synthetic root whose children are
/// the top-level elements.
pub fn parse_xml(xml: &str) -> VsphereResult<XmlNode> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<XmlNode> = vec![XmlNode::default()];

    loop {
        match reader.read_event()? {
            Event::Start(ref e) => stack.push(start_node(e)?),
            Event::Empty(ref e) => {
                let node = start_node(e)?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(node);
                }
            }
            Event::End(_) => {
                let node = stack
                    .pop()
                    .ok_or_else(|| VsphereError::parse("Unbalanced XML end tag"))?;
                let parent = stack
                    .last_mut()
                    .ok_or_else(|| VsphereError::parse("Unbalanced XML end tag"))?;
                parent.children.push(node);
            }
            Event::Text(ref t) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&t.unescape()?);
                }
            }
            Event::CData(t) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&t.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if stack.len() != 1 {
        return Err(VsphereError::parse("Truncated XML document"));
    }
    stack
        .pop()
        .ok_or_else(|| VsphereError::parse("Empty XML document"))
}

fn start_node(e: &BytesStart<'_>) -> VsphereResult<XmlNode> {
    let mut node = XmlNode {
        name: local_name(&String::from_utf8_lossy(e.name().as_ref())).to_string(),
        ..XmlNode::default()
    };
    for attr in e.attributes() {
        let attr = attr.map_err(|err| VsphereError::parse(format!("Bad XML attribute: {err}")))?;
        let key = String::from_utf8_lossy(attr.key.as_ref()).to_string();
        let value = attr.unescape_value()?.to_string();
        node.attrs.push((key, value));
    }
    Ok(node)
}

fn local_name(raw: &str) -> &str {
    match raw.rfind(':') {
        Some(pos) => &raw[pos + 1..],
        None => raw,
    }
}

// ── Request builders ────────────────────────────────────────────────

pub fn esc(s: &str) -> String {
    quick_xml::escape::escape(s).into_owned()
}

/// `<tag>text</tag>`
pub fn el(tag: &str, text: &str) -> String {
    format!("<{tag}>{}</{tag}>", esc(text))
}

/// `<tag type="Kind">value</tag>`
pub fn moref(tag: &str, obj: &ObjectRef) -> String {
    format!(r#"<{tag} type="{}">{}</{tag}>"#, esc(&obj.kind), esc(&obj.value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_nested_elements_and_attributes() {
        let doc = parse_xml(
            r#"<?xml version="1.0"?><a xmlns:xsi="x"><b type="VirtualMachine">vm-1</b><c>x &amp; y</c><d/></a>"#,
        )
        .unwrap();
        let a = doc.child("a").unwrap();
        assert_eq!(a.child("b").unwrap().to_object_ref(), Some(ObjectRef::new("VirtualMachine", "vm-1")));
        assert_eq!(a.text_of("c"), Some("x & y"));
        assert!(a.child("d").is_some());
    }

    #[test]
    fn strips_namespace_prefixes_from_element_names() {
        let doc = parse_xml(r#"<soapenv:Envelope xmlns:soapenv="s"><soapenv:Body><R/></soapenv:Body></soapenv:Envelope>"#).unwrap();
        assert!(doc.find("Body").and_then(|b| b.child("R")).is_some());
    }

    #[test]
    fn truncated_document_is_an_error() {
        assert!(parse_xml("<a><b>").is_err());
    }

    #[test]
    fn json_conversion_follows_xsi_types() {
        let doc = parse_xml(
            r#"<val xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance" xsi:type="VirtualMachineQuickStats">
                 <overallCpuUsage xsi:type="xsd:int">120</overallCpuUsage>
                 <guestHeartbeatStatus>green</guestHeartbeatStatus>
                 <flag xsi:type="xsd:boolean">true</flag>
               </val>"#,
        )
        .unwrap();
        let v = doc.child("val").unwrap().to_json();
        assert_eq!(v["_type"], "VirtualMachineQuickStats");
        assert_eq!(v["overallCpuUsage"], 120);
        assert_eq!(v["guestHeartbeatStatus"], "green");
        assert_eq!(v["flag"], true);
    }

    #[test]
    fn repeated_children_become_arrays() {
        let doc = parse_xml(r#"<x><item>1</item><item>2</item><item>3</item><one>a</one></x>"#).unwrap();
        let v = doc.child("x").unwrap().to_json();
        assert_eq!(v["item"], json!(["1", "2", "3"]));
        assert_eq!(as_list(v.get("one")).len(), 1);
        assert!(as_list(v.get("missing")).is_empty());
    }

    #[test]
    fn array_wrappers_are_always_arrays() {
        let doc = parse_xml(
            r#"<val xmlns:xsi="i" xsi:type="ArrayOfManagedObjectReference"><ManagedObjectReference type="Datastore">datastore-1</ManagedObjectReference></val>"#,
        )
        .unwrap();
        let v = doc.child("val").unwrap().to_json();
        assert_eq!(v, json!([{"type": "Datastore", "value": "datastore-1"}]));
    }

    #[test]
    fn builders_escape_content() {
        assert_eq!(el("name", "a<b"), "<name>a&lt;b</name>");
        let obj = ObjectRef::new("VirtualMachine", "vm-9");
        assert_eq!(moref("_this", &obj), r#"<_this type="VirtualMachine">vm-9</_this>"#);
    }
}
