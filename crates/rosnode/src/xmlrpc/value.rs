// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! XML-RPC values and the XML document codec.
//!
//! Writing is done by hand; reading goes through `roxmltree`. A `<value>`
//! without a type element is a string.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use base64::Engine as _;
use roxmltree::{Document, Node};

use super::XmlRpcError;

/// One XML-RPC value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i32),
    Bool(bool),
    String(String),
    Double(f64),
    DateTime(String),
    Base64(Vec<u8>),
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(v) => Some(*v),
            Value::Int(v) => Some(f64::from(*v)),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Struct(members) => Some(members),
            _ => None,
        }
    }

    /// Array of strings (`None` if any element is not a string).
    pub fn as_string_list(&self) -> Option<Vec<String>> {
        self.as_array()?
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect()
    }

    /// The `[code, message, payload]` triple every ROS API returns.
    pub fn response(code: i32, message: impl Into<String>, payload: Value) -> Value {
        Value::Array(vec![
            Value::Int(code),
            Value::String(message.into()),
            payload,
        ])
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

// ============================================================================
// Encoding
// ============================================================================

fn escape_into(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
}

fn encode_value(out: &mut String, value: &Value) {
    out.push_str("<value>");
    match value {
        Value::Int(v) => {
            let _ = write!(out, "<i4>{}</i4>", v);
        }
        Value::Bool(v) => {
            let _ = write!(out, "<boolean>{}</boolean>", u8::from(*v));
        }
        Value::String(s) => {
            out.push_str("<string>");
            escape_into(out, s);
            out.push_str("</string>");
        }
        Value::Double(v) => {
            let _ = write!(out, "<double>{}</double>", v);
        }
        Value::DateTime(s) => {
            out.push_str("<dateTime.iso8601>");
            escape_into(out, s);
            out.push_str("</dateTime.iso8601>");
        }
        Value::Base64(bytes) => {
            out.push_str("<base64>");
            out.push_str(&base64::engine::general_purpose::STANDARD.encode(bytes));
            out.push_str("</base64>");
        }
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                encode_value(out, item);
            }
            out.push_str("</data></array>");
        }
        Value::Struct(members) => {
            out.push_str("<struct>");
            for (name, member) in members {
                out.push_str("<member><name>");
                escape_into(out, name);
                out.push_str("</name>");
                encode_value(out, member);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
    }
    out.push_str("</value>");
}

fn encode_params(out: &mut String, params: &[Value]) {
    out.push_str("<params>");
    for param in params {
        out.push_str("<param>");
        encode_value(out, param);
        out.push_str("</param>");
    }
    out.push_str("</params>");
}

/// Encode a `<methodCall>` document.
pub fn encode_call(method: &str, params: &[Value]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?>\n<methodCall><methodName>");
    escape_into(&mut out, method);
    out.push_str("</methodName>");
    encode_params(&mut out, params);
    out.push_str("</methodCall>\n");
    out
}

/// Encode a successful `<methodResponse>`.
pub fn encode_response(value: &Value) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?>\n<methodResponse>");
    encode_params(&mut out, std::slice::from_ref(value));
    out.push_str("</methodResponse>\n");
    out
}

/// Encode a fault `<methodResponse>`.
pub fn encode_fault(code: i32, message: &str) -> String {
    let mut members = BTreeMap::new();
    members.insert("faultCode".to_string(), Value::Int(code));
    members.insert("faultString".to_string(), Value::String(message.to_string()));
    let mut out = String::from("<?xml version=\"1.0\"?>\n<methodResponse><fault>");
    encode_value(&mut out, &Value::Struct(members));
    out.push_str("</fault></methodResponse>\n");
    out
}

// ============================================================================
// Decoding
// ============================================================================

fn parse_err(msg: impl Into<String>) -> XmlRpcError {
    XmlRpcError::Parse(msg.into())
}

fn child_elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(|n| n.is_element())
}

fn find_child<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    child_elements(node).find(|n| n.tag_name().name() == name)
}

fn node_text(node: Node<'_, '_>) -> String {
    node.children()
        .filter(|n| n.is_text())
        .filter_map(|n| n.text())
        .collect()
}

fn decode_value(node: Node<'_, '_>) -> Result<Value, XmlRpcError> {
    let typed = match child_elements(node).next() {
        Some(t) => t,
        None => return Ok(Value::String(node_text(node))),
    };
    let text = node_text(typed);
    match typed.tag_name().name() {
        "i4" | "int" => text
            .trim()
            .parse()
            .map(Value::Int)
            .map_err(|_| parse_err(format!("bad int: {:?}", text))),
        "i8" => text
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|v| i32::try_from(v).ok())
            .map(Value::Int)
            .ok_or_else(|| parse_err(format!("i8 out of range: {:?}", text))),
        "boolean" => match text.trim() {
            "1" | "true" => Ok(Value::Bool(true)),
            "0" | "false" => Ok(Value::Bool(false)),
            other => Err(parse_err(format!("bad boolean: {:?}", other))),
        },
        "string" => Ok(Value::String(text)),
        "double" => text
            .trim()
            .parse()
            .map(Value::Double)
            .map_err(|_| parse_err(format!("bad double: {:?}", text))),
        "dateTime.iso8601" => Ok(Value::DateTime(text.trim().to_string())),
        "base64" => {
            let cleaned: String = text.chars().filter(|c| !c.is_whitespace()).collect();
            base64::engine::general_purpose::STANDARD
                .decode(cleaned)
                .map(Value::Base64)
                .map_err(|e| parse_err(format!("bad base64: {}", e)))
        }
        "array" => {
            let data = find_child(typed, "data").ok_or_else(|| parse_err("array without <data>"))?;
            child_elements(data)
                .filter(|n| n.tag_name().name() == "value")
                .map(decode_value)
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array)
        }
        "struct" => {
            let mut members = BTreeMap::new();
            for member in child_elements(typed).filter(|n| n.tag_name().name() == "member") {
                let name = find_child(member, "name")
                    .map(node_text)
                    .ok_or_else(|| parse_err("member without <name>"))?;
                let value = find_child(member, "value")
                    .ok_or_else(|| parse_err("member without <value>"))?;
                members.insert(name, decode_value(value)?);
            }
            Ok(Value::Struct(members))
        }
        "nil" => Ok(Value::String(String::new())),
        other => Err(parse_err(format!("unknown value type <{}>", other))),
    }
}

fn decode_params(params: Node<'_, '_>) -> Result<Vec<Value>, XmlRpcError> {
    child_elements(params)
        .filter(|n| n.tag_name().name() == "param")
        .map(|p| {
            find_child(p, "value")
                .ok_or_else(|| parse_err("param without <value>"))
                .and_then(decode_value)
        })
        .collect()
}

/// Decode a `<methodCall>` into method name and parameters.
pub fn decode_call(xml: &str) -> Result<(String, Vec<Value>), XmlRpcError> {
    let doc = Document::parse(xml).map_err(|e| parse_err(format!("invalid XML: {}", e)))?;
    let root = doc.root_element();
    if root.tag_name().name() != "methodCall" {
        return Err(parse_err(format!(
            "expected <methodCall>, got <{}>",
            root.tag_name().name()
        )));
    }
    let method = find_child(root, "methodName")
        .map(node_text)
        .ok_or_else(|| parse_err("missing <methodName>"))?;
    let params = match find_child(root, "params") {
        Some(p) => decode_params(p)?,
        None => Vec::new(),
    };
    Ok((method.trim().to_string(), params))
}

/// Decode a `<methodResponse>`; faults become [`XmlRpcError::Fault`].
pub fn decode_response(xml: &str) -> Result<Value, XmlRpcError> {
    let doc = Document::parse(xml).map_err(|e| parse_err(format!("invalid XML: {}", e)))?;
    let root = doc.root_element();
    if root.tag_name().name() != "methodResponse" {
        return Err(parse_err(format!(
            "expected <methodResponse>, got <{}>",
            root.tag_name().name()
        )));
    }

    if let Some(fault) = find_child(root, "fault") {
        let value = find_child(fault, "value")
            .ok_or_else(|| parse_err("fault without <value>"))
            .and_then(decode_value)?;
        let members = value
            .as_struct()
            .ok_or_else(|| parse_err("fault value is not a struct"))?;
        return Err(XmlRpcError::Fault {
            code: members.get("faultCode").and_then(Value::as_i32).unwrap_or(-1),
            message: members
                .get("faultString")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        });
    }

    let params = find_child(root, "params").ok_or_else(|| parse_err("missing <params>"))?;
    decode_params(params)?
        .into_iter()
        .next()
        .ok_or_else(|| parse_err("response without a value"))
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_roundtrip() {
        let params = vec![
            Value::from("/talker"),
            Value::from("/chatter"),
            Value::from("std_msgs/String"),
            Value::from("http://127.0.0.1:1234/"),
        ];
        let xml = encode_call("registerPublisher", &params);
        let (method, decoded) = decode_call(&xml).unwrap();
        assert_eq!(method, "registerPublisher");
        assert_eq!(decoded, params);
    }

    #[test]
    fn test_nested_response_roundtrip() {
        let mut members = BTreeMap::new();
        members.insert("gain".to_string(), Value::Double(0.5));
        members.insert("name".to_string(), Value::from("a<b&c"));
        members.insert("blob".to_string(), Value::Base64(vec![0, 1, 2, 255]));
        let value = Value::response(
            1,
            "",
            Value::Array(vec![Value::Struct(members), Value::Bool(true)]),
        );
        let decoded = decode_response(&encode_response(&value)).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_untyped_value_is_string() {
        let xml = "<?xml version=\"1.0\"?><methodResponse><params><param>\
                   <value>plain</value></param></params></methodResponse>";
        assert_eq!(decode_response(xml).unwrap(), Value::from("plain"));
    }

    #[test]
    fn test_int_alias_and_whitespace() {
        let xml = "<methodResponse>\n  <params>\n    <param>\n      <value><int> 42 </int></value>\n\
                   </param>\n  </params>\n</methodResponse>";
        assert_eq!(decode_response(xml).unwrap(), Value::Int(42));
    }

    #[test]
    fn test_fault_decoding() {
        let xml = encode_fault(-32601, "method not found");
        match decode_response(&xml) {
            Err(XmlRpcError::Fault { code, message }) => {
                assert_eq!(code, -32601);
                assert_eq!(message, "method not found");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_xml() {
        assert!(matches!(
            decode_response("<methodResponse><params>"),
            Err(XmlRpcError::Parse(_))
        ));
        assert!(decode_call("<methodResponse/>").is_err());
    }

    #[test]
    fn test_string_list() {
        let v = Value::Array(vec![Value::from("a"), Value::from("b")]);
        assert_eq!(v.as_string_list().unwrap(), vec!["a", "b"]);
        assert!(Value::Array(vec![Value::Int(1)]).as_string_list().is_none());
    }
}
