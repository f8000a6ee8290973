//! XML-RPC documents for the registry and slave APIs.
//!
//! Every registry/slave method answers with a single array value
//! `[code, statusMessage, payload]`; see [`split_status`] and
//! [`status_response`].

use std::collections::BTreeMap;
use std::fmt::Write as _;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use roxmltree::{Document, Node};

use rn_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Values
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Bool(bool),
    String(String),
    Double(f64),
    Base64(Vec<u8>),
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Int(i) => Some(*i != 0),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// An array of strings, e.g. a publisher URI list.
    pub fn as_string_list(&self) -> Option<Vec<String>> {
        self.as_array()?
            .iter()
            .map(|v| v.as_str().map(str::to_owned))
            .collect()
    }

    /// Convert a JSON parameter value into its XML-RPC form.
    ///
    /// Integers outside `i32` become doubles; `null` becomes an empty string
    /// because XML-RPC has no nil in this dialect.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::String(String::new()),
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) if i32::try_from(i).is_ok() => Value::Int(i as i32),
                _ => Value::Double(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => Value::Struct(
                map.iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Convert into a JSON value.  Binary data is base64 encoded.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Bool(b) => serde_json::Value::from(*b),
            Value::String(s) => serde_json::Value::from(s.as_str()),
            Value::Double(d) => serde_json::Value::from(*d),
            Value::Base64(bytes) => serde_json::Value::from(BASE64.encode(bytes)),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Struct(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    fn write_xml(&self, out: &mut String) {
        out.push_str("<value>");
        match self {
            Value::Int(i) => {
                let _ = write!(out, "<i4>{i}</i4>");
            }
            Value::Bool(b) => {
                let _ = write!(out, "<boolean>{}</boolean>", u8::from(*b));
            }
            Value::String(s) => {
                out.push_str("<string>");
                escape_into(s, out);
                out.push_str("</string>");
            }
            Value::Double(d) => {
                let _ = write!(out, "<double>{d}</double>");
            }
            Value::Base64(bytes) => {
                let _ = write!(out, "<base64>{}</base64>", BASE64.encode(bytes));
            }
            Value::Array(items) => {
                out.push_str("<array><data>");
                for item in items {
                    item.write_xml(out);
                }
                out.push_str("</data></array>");
            }
            Value::Struct(map) => {
                out.push_str("<struct>");
                for (name, value) in map {
                    out.push_str("<member><name>");
                    escape_into(name, out);
                    out.push_str("</name>");
                    value.write_xml(out);
                    out.push_str("</member>");
                }
                out.push_str("</struct>");
            }
        }
        out.push_str("</value>");
    }

    fn parse(node: Node<'_, '_>) -> Result<Value> {
        let Some(typed) = first_element(node) else {
            // Untyped values are strings.
            return Ok(Value::String(node.text().unwrap_or_default().to_owned()));
        };
        let text = typed.text().unwrap_or_default();
        match typed.tag_name().name() {
            "i4" | "int" => text
                .trim()
                .parse()
                .map(Value::Int)
                .map_err(|_| rpc_err(format!("bad int {text:?}"))),
            "boolean" => match text.trim() {
                "1" | "true" => Ok(Value::Bool(true)),
                "0" | "false" => Ok(Value::Bool(false)),
                other => Err(rpc_err(format!("bad boolean {other:?}"))),
            },
            "string" => Ok(Value::String(text.to_owned())),
            "double" => text
                .trim()
                .parse()
                .map(Value::Double)
                .map_err(|_| rpc_err(format!("bad double {text:?}"))),
            "base64" => BASE64
                .decode(text.split_whitespace().collect::<String>())
                .map(Value::Base64)
                .map_err(|e| rpc_err(format!("bad base64: {e}"))),
            "array" => {
                let data = child(typed, "data")?;
                elements(data)
                    .filter(|n| n.has_tag_name("value"))
                    .map(Value::parse)
                    .collect::<Result<Vec<_>>>()
                    .map(Value::Array)
            }
            "struct" => {
                let mut map = BTreeMap::new();
                for member in elements(typed).filter(|n| n.has_tag_name("member")) {
                    let name = child(member, "name")?.text().unwrap_or_default().to_owned();
                    let value = Value::parse(child(member, "value")?)?;
                    map.insert(name, value);
                }
                Ok(Value::Struct(map))
            }
            other => Err(rpc_err(format!("unsupported value type <{other}>"))),
        }
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
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Calls and responses
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq)]
pub struct MethodCall {
    pub method: String,
    pub params: Vec<Value>,
}

impl MethodCall {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\"?><methodCall><methodName>");
        escape_into(&self.method, &mut out);
        out.push_str("</methodName><params>");
        for param in &self.params {
            out.push_str("<param>");
            param.write_xml(&mut out);
            out.push_str("</param>");
        }
        out.push_str("</params></methodCall>");
        out
    }

    pub fn parse(xml: &str) -> Result<Self> {
        let doc = Document::parse(xml).map_err(|e| rpc_err(format!("malformed XML: {e}")))?;
        let root = doc.root_element();
        if !root.has_tag_name("methodCall") {
            return Err(rpc_err(format!(
                "expected <methodCall>, got <{}>",
                root.tag_name().name()
            )));
        }
        let method = child(root, "methodName")?
            .text()
            .unwrap_or_default()
            .trim()
            .to_owned();
        if method.is_empty() {
            return Err(rpc_err("empty methodName"));
        }
        let params = match elements(root).find(|n| n.has_tag_name("params")) {
            Some(params) => parse_params(params)?,
            None => Vec::new(),
        };
        Ok(Self { method, params })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MethodResponse {
    Success(Value),
    Fault { code: i32, message: String },
}

impl MethodResponse {
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\"?><methodResponse>");
        match self {
            MethodResponse::Success(value) => {
                out.push_str("<params><param>");
                value.write_xml(&mut out);
                out.push_str("</param></params>");
            }
            MethodResponse::Fault { code, message } => {
                let mut fault = BTreeMap::new();
                fault.insert("faultCode".to_owned(), Value::Int(*code));
                fault.insert("faultString".to_owned(), Value::String(message.clone()));
                out.push_str("<fault>");
                Value::Struct(fault).write_xml(&mut out);
                out.push_str("</fault>");
            }
        }
        out.push_str("</methodResponse>");
        out
    }

    pub fn parse(xml: &str) -> Result<Self> {
        let doc = Document::parse(xml).map_err(|e| rpc_err(format!("malformed XML: {e}")))?;
        let root = doc.root_element();
        if !root.has_tag_name("methodResponse") {
            return Err(rpc_err(format!(
                "expected <methodResponse>, got <{}>",
                root.tag_name().name()
            )));
        }
        if let Some(fault) = elements(root).find(|n| n.has_tag_name("fault")) {
            let value = Value::parse(child(fault, "value")?)?;
            let Value::Struct(map) = value else {
                return Err(rpc_err("fault is not a struct"));
            };
            return Ok(MethodResponse::Fault {
                code: map.get("faultCode").and_then(Value::as_i32).unwrap_or(-1),
                message: map
                    .get("faultString")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned(),
            });
        }
        let mut params = parse_params(child(root, "params")?)?;
        if params.len() != 1 {
            return Err(rpc_err(format!(
                "expected exactly one response param, got {}",
                params.len()
            )));
        }
        Ok(MethodResponse::Success(params.remove(0)))
    }

    /// Success value, or the fault as an [`Error::Rpc`].
    pub fn into_result(self) -> Result<Value> {
        match self {
            MethodResponse::Success(v) => Ok(v),
            MethodResponse::Fault { code, message } => {
                Err(rpc_err(format!("fault {code}: {message}")))
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status triples
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const STATUS_SUCCESS: i32 = 1;
pub const STATUS_FAILURE: i32 = 0;
pub const STATUS_ERROR: i32 = -1;

/// Build the `[code, statusMessage, payload]` response value.
pub fn status_response(code: i32, message: impl Into<String>, payload: Value) -> Value {
    Value::Array(vec![
        Value::Int(code),
        Value::String(message.into()),
        payload,
    ])
}

/// Split a `[code, statusMessage, payload]` value.
pub fn split_status(value: Value) -> Result<(i32, String, Value)> {
    let mut items = value
        .into_array()
        .ok_or_else(|| rpc_err("status response is not an array"))?;
    if items.len() != 3 {
        return Err(rpc_err(format!(
            "status response has {} elements, expected 3",
            items.len()
        )));
    }
    let payload = items.pop().unwrap_or(Value::Int(0));
    let message = items
        .pop()
        .and_then(|v| v.as_str().map(str::to_owned))
        .unwrap_or_default();
    let code = items
        .pop()
        .and_then(|v| v.as_i32())
        .ok_or_else(|| rpc_err("status code is not an int"))?;
    Ok((code, message, payload))
}

// ── helpers ─────────────────────────────────────────────────────────

fn rpc_err(msg: impl Into<String>) -> Error {
    Error::Rpc(msg.into())
}

fn elements<'a, 'input>(node: Node<'a, 'input>) -> impl Iterator<Item = Node<'a, 'input>> {
    node.children().filter(Node::is_element)
}

fn first_element<'a, 'input>(node: Node<'a, 'input>) -> Option<Node<'a, 'input>> {
    elements(node).next()
}

fn child<'a, 'input>(node: Node<'a, 'input>, tag: &str) -> Result<Node<'a, 'input>> {
    elements(node)
        .find(|n| n.has_tag_name(tag))
        .ok_or_else(|| rpc_err(format!("<{}> missing <{tag}>", node.tag_name().name())))
}

fn parse_params(params: Node<'_, '_>) -> Result<Vec<Value>> {
    elements(params)
        .filter(|n| n.has_tag_name("param"))
        .map(|param| Value::parse(child(param, "value")?))
        .collect()
}

fn escape_into(text: &str, out: &mut String) {
    for c in text.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn call_roundtrip_with_nested_values() {
        let mut map = BTreeMap::new();
        map.insert("gain".to_owned(), Value::Double(0.5));
        map.insert("name".to_owned(), Value::from("a < b & c"));
        let call = MethodCall::new(
            "setParam",
            vec![
                Value::from("/node"),
                Value::from("/pid"),
                Value::Struct(map),
                Value::from(vec![1, 2, 3]),
                Value::Bool(true),
                Value::Base64(vec![0, 255, 7]),
            ],
        );
        let parsed = MethodCall::parse(&call.to_xml()).unwrap();
        assert_eq!(parsed, call);
    }

    #[test]
    fn parses_untyped_and_int_tags() {
        let xml = r#"<?xml version="1.0"?>
<methodCall>
  <methodName>publisherUpdate</methodName>
  <params>
    <param><value>/master</value></param>
    <param><value><int> 7 </int></value></param>
    <param><value><array><data>
      <value><string>http://a:1/</string></value>
      <value>http://b:2/</value>
    </data></array></value></param>
  </params>
</methodCall>"#;
        let call = MethodCall::parse(xml).unwrap();
        assert_eq!(call.method, "publisherUpdate");
        assert_eq!(call.params[0], Value::from("/master"));
        assert_eq!(call.params[1], Value::Int(7));
        assert_eq!(
            call.params[2].as_string_list().unwrap(),
            vec!["http://a:1/", "http://b:2/"]
        );
    }

    #[test]
    fn empty_string_value() {
        let xml = "<methodResponse><params><param><value><string></string></value></param></params></methodResponse>";
        assert_eq!(
            MethodResponse::parse(xml).unwrap(),
            MethodResponse::Success(Value::from(""))
        );
    }

    #[test]
    fn fault_roundtrip() {
        let fault = MethodResponse::Fault {
            code: -32601,
            message: "unknown method".into(),
        };
        let parsed = MethodResponse::parse(&fault.to_xml()).unwrap();
        assert_eq!(parsed, fault);
        assert!(parsed.into_result().is_err());
    }

    #[test]
    fn malformed_documents_are_rpc_errors() {
        assert!(matches!(MethodCall::parse("<nope"), Err(Error::Rpc(_))));
        assert!(matches!(
            MethodCall::parse("<methodResponse/>"),
            Err(Error::Rpc(_))
        ));
        assert!(matches!(
            MethodCall::parse("<methodCall><methodName>x</methodName><params><param><value><int>abc</int></value></param></params></methodCall>"),
            Err(Error::Rpc(_))
        ));
    }

    #[test]
    fn status_triple_split() {
        let v = status_response(1, "ok", Value::from(vec!["a", "b"]));
        let (code, msg, payload) = split_status(v).unwrap();
        assert_eq!(code, 1);
        assert_eq!(msg, "ok");
        assert_eq!(payload.as_string_list().unwrap(), vec!["a", "b"]);
        assert!(split_status(Value::Int(1)).is_err());
    }

    #[test]
    fn json_conversion() {
        let json = serde_json::json!({"a": 1, "b": [true, 2.5, "x"], "big": 10_000_000_000i64});
        let value = Value::from_json(&json);
        let Value::Struct(map) = &value else { panic!("expected struct") };
        assert_eq!(map["a"], Value::Int(1));
        assert_eq!(map["big"], Value::Double(10_000_000_000.0));
        let back = value.to_json();
        assert_eq!(back["b"], serde_json::json!([true, 2.5, "x"]));
    }
}
