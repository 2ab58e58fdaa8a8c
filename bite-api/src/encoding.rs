use std::fmt::Write as _;

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::http::RawResponse;

/// Wire encoding for request bodies and responses.
pub trait Encoder: Send + Sync {
    fn content_type(&self) -> &'static str;

    fn encode(&self, value: &Value) -> Result<String>;

    fn decode(&self, response: &RawResponse) -> Result<Value>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn encode(&self, value: &Value) -> Result<String> {
        Ok(serde_json::to_string(value)?)
    }

    fn decode(&self, response: &RawResponse) -> Result<Value> {
        if let Some(content_type) = response.header("content-type") {
            if !content_type.contains("json") {
                return Err(Error::Request {
                    msg: "non-JSON response from server".to_string(),
                    code: Some(response.status),
                    text: Some(response.body.clone()),
                });
            }
        }

        if response.body.trim().is_empty() {
            return Err(Error::parsing("no response content returned"));
        }

        serde_json::from_str(&response.body).map_err(|e| Error::Parsing {
            msg: format!("failed parsing JSON: {}", e),
            text: Some(response.body.clone()),
        })
    }
}

/// XML-RPC documents mapped onto JSON values.
///
/// Requests are encoded from `{"methodName", "params"}` objects. Responses
/// decode to `{"params": [...]}` or `{"fault": {...}}`; `dateTime.iso8601`
/// and `base64` values stay strings.
#[derive(Debug, Default, Clone, Copy)]
pub struct XmlEncoder;

impl Encoder for XmlEncoder {
    fn content_type(&self) -> &'static str {
        "text/xml"
    }

    fn encode(&self, value: &Value) -> Result<String> {
        let method = value
            .get("methodName")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Unexpected("XML-RPC call without a methodName".to_string()))?;
        let params = value
            .get("params")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        Ok(method_call(method, params))
    }

    fn decode(&self, response: &RawResponse) -> Result<Value> {
        if let Some(content_type) = response.header("content-type") {
            if !content_type.contains("xml") {
                return Err(Error::Request {
                    msg: "non-XML response, service interface likely disabled on server".to_string(),
                    code: Some(response.status),
                    text: Some(response.body.clone()),
                });
            }
        }

        if response.body.trim().is_empty() {
            return Err(Error::parsing("no response content returned"));
        }

        parse_tree(&response.body)
            .and_then(|root| method_response(&root))
            .map_err(|msg| Error::Parsing {
                msg: format!("failed parsing XML: {}", msg),
                text: Some(response.body.clone()),
            })
    }
}

fn method_call(method: &str, params: &[Value]) -> String {
    let mut out = String::from(r#"<?xml version="1.0" encoding="UTF-8"?><methodCall><methodName>"#);
    out.push_str(&escape(method));
    out.push_str("</methodName><params>");
    for param in params {
        out.push_str("<param>");
        write_value(&mut out, param);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

fn write_value(out: &mut String, value: &Value) {
    out.push_str("<value>");
    match value {
        Value::Null => out.push_str("<nil/>"),
        Value::Bool(b) => {
            let _ = write!(out, "<boolean>{}</boolean>", u8::from(*b));
        }
        Value::Number(n) => match n.as_i64() {
            Some(i) if i32::try_from(i).is_ok() => {
                let _ = write!(out, "<int>{}</int>", i);
            }
            Some(i) => {
                let _ = write!(out, "<i8>{}</i8>", i);
            }
            None => {
                let _ = write!(out, "<double>{}</double>", n.as_f64().unwrap_or_default());
            }
        },
        Value::String(s) => {
            let _ = write!(out, "<string>{}</string>", escape(s.as_str()));
        }
        Value::Array(items) => {
            out.push_str("<array><data>");
            for item in items {
                write_value(out, item);
            }
            out.push_str("</data></array>");
        }
        Value::Object(members) => {
            out.push_str("<struct>");
            for (name, member) in members {
                let _ = write!(out, "<member><name>{}</name>", escape(name.as_str()));
                write_value(out, member);
                out.push_str("</member>");
            }
            out.push_str("</struct>");
        }
    }
    out.push_str("</value>");
}

/// One XML element with its text content concatenated.
#[derive(Debug, Default)]
struct Element {
    name: String,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn new(name: &[u8]) -> Self {
        Self {
            name: String::from_utf8_lossy(name).into_owned(),
            ..Default::default()
        }
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }
}

fn parse_tree(text: &str) -> std::result::Result<Element, String> {
    let mut reader = Reader::from_str(text);
    // the bottom entry collects the document's root element
    let mut stack = vec![Element::default()];

    loop {
        match reader.read_event().map_err(|e| e.to_string())? {
            Event::Start(e) => stack.push(Element::new(e.name().as_ref())),
            Event::Empty(e) => {
                let element = Element::new(e.name().as_ref());
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(element);
                }
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .filter(|_| !stack.is_empty())
                    .ok_or("unbalanced closing tag")?;
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(element);
                }
            }
            Event::Text(e) => {
                let text = e.unescape().map_err(|e| e.to_string())?;
                if let Some(element) = stack.last_mut() {
                    element.text.push_str(&text);
                }
            }
            Event::CData(e) => {
                if let Some(element) = stack.last_mut() {
                    element.text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let document = stack
        .pop()
        .filter(|_| stack.is_empty())
        .ok_or("unclosed element")?;
    document
        .children
        .into_iter()
        .next()
        .ok_or_else(|| "empty document".to_string())
}

fn method_response(root: &Element) -> std::result::Result<Value, String> {
    if root.name != "methodResponse" {
        return Err(format!("expected methodResponse, got {}", root.name));
    }
    if let Some(fault) = root.child("fault") {
        let fault = fault.child("value").ok_or("fault without a value")?;
        return Ok(json!({ "fault": xml_value(fault)? }));
    }
    let params = match root.child("params") {
        Some(params) => params
            .children("param")
            .filter_map(|param| param.child("value"))
            .map(xml_value)
            .collect::<std::result::Result<Vec<Value>, String>>()?,
        None => Vec::new(),
    };
    Ok(json!({ "params": params }))
}

fn xml_value(element: &Element) -> std::result::Result<Value, String> {
    // untyped values are strings
    let Some(typed) = element.children.first() else {
        return Ok(Value::String(element.text.clone()));
    };
    let text = typed.text.trim();
    match typed.name.as_str() {
        "string" => Ok(Value::String(typed.text.clone())),
        "int" | "i4" | "i8" => text
            .parse::<i64>()
            .map(Value::from)
            .map_err(|e| format!("bad integer '{}': {}", text, e)),
        "double" => text
            .parse::<f64>()
            .map(Value::from)
            .map_err(|e| format!("bad double '{}': {}", text, e)),
        "boolean" => match text {
            "1" | "true" => Ok(Value::Bool(true)),
            "0" | "false" => Ok(Value::Bool(false)),
            other => Err(format!("bad boolean '{}'", other)),
        },
        "dateTime.iso8601" | "base64" => Ok(Value::String(text.to_string())),
        "nil" => Ok(Value::Null),
        "array" => {
            let items = match typed.child("data") {
                Some(data) => data
                    .children("value")
                    .map(xml_value)
                    .collect::<std::result::Result<Vec<Value>, String>>()?,
                None => Vec::new(),
            };
            Ok(Value::Array(items))
        }
        "struct" => {
            let mut members = Map::new();
            for member in typed.children("member") {
                let name = member.child("name").ok_or("struct member without a name")?;
                let value = member.child("value").ok_or("struct member without a value")?;
                members.insert(name.text.clone(), xml_value(value)?);
            }
            Ok(Value::Object(members))
        }
        other => Err(format!("unknown XML-RPC type: {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderValue};

    fn response(content_type: Option<&'static str>, body: &str) -> RawResponse {
        let mut headers = HeaderMap::new();
        if let Some(ct) = content_type {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static(ct));
        }
        RawResponse {
            status: 200,
            reason: "OK".to_string(),
            url: "https://example.org".to_string(),
            headers,
            body: body.to_string(),
        }
    }

    #[test]
    fn test_decode_json() {
        let value = JsonEncoder
            .decode(&response(Some("application/json; charset=utf-8"), r#"{"a": 1}"#))
            .unwrap();
        assert_eq!(value["a"], 1);
    }

    #[test]
    fn test_decode_rejects_html() {
        let result = JsonEncoder.decode(&response(Some("text/html"), "<html></html>"));
        match result {
            Err(Error::Request { msg, .. }) => assert_eq!(msg, "non-JSON response from server"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_decode_empty_and_malformed() {
        let result = JsonEncoder.decode(&response(None, "  "));
        assert!(matches!(result, Err(Error::Parsing { .. })));

        let result = JsonEncoder.decode(&response(None, "{oops"));
        match result {
            Err(Error::Parsing { msg, text }) => {
                assert!(msg.starts_with("failed parsing JSON"));
                assert_eq!(text.as_deref(), Some("{oops"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_encode_method_call() {
        let body = XmlEncoder
            .encode(&json!({
                "methodName": "Bug.get",
                "params": [{"ids": [1, 2], "summary": "a < b", "include_fields": null}]
            }))
            .unwrap();

        assert!(body.starts_with(r#"<?xml version="1.0" encoding="UTF-8"?><methodCall><methodName>Bug.get</methodName>"#));
        assert!(body.contains(
            "<member><name>ids</name><value><array><data><value><int>1</int></value><value><int>2</int></value></data></array></value></member>"
        ));
        assert!(body.contains("<string>a &lt; b</string>"));
        assert!(body.contains("<value><nil/></value>"));
        assert!(body.ends_with("</params></methodCall>"));
    }

    #[test]
    fn test_decode_method_response() {
        // Given: 構造体・配列・各種スカラーを含む応答
        let body = r#"<?xml version="1.0"?>
            <methodResponse><params><param><value><struct>
              <member><name>id</name><value><int>42</int></value></member>
              <member><name>open</name><value><boolean>1</boolean></value></member>
              <member><name>summary</name><value><string>fish &amp; chips</string></value></member>
              <member><name>owner</name><value>bob</value></member>
              <member><name>when</name><value><dateTime.iso8601>20240102T03:04:05</dateTime.iso8601></value></member>
              <member><name>cc</name><value><array><data><value><string>carol</string></value></data></array></value></member>
              <member><name>none</name><value><nil/></value></member>
            </struct></value></param></params></methodResponse>"#;

        // When
        let value = XmlEncoder.decode(&response(Some("text/xml"), body)).unwrap();

        // Then
        assert_eq!(
            value,
            json!({"params": [{
                "id": 42,
                "open": true,
                "summary": "fish & chips",
                "owner": "bob",
                "when": "20240102T03:04:05",
                "cc": ["carol"],
                "none": null
            }]})
        );
    }

    #[test]
    fn test_decode_fault() {
        let body = "<methodResponse><fault><value><struct>\
            <member><name>faultCode</name><value><int>101</int></value></member>\
            <member><name>faultString</name><value><string>Bug #9 does not exist.</string></value></member>\
            </struct></value></fault></methodResponse>";

        let value = XmlEncoder.decode(&response(Some("text/xml"), body)).unwrap();

        assert_eq!(
            value,
            json!({"fault": {"faultCode": 101, "faultString": "Bug #9 does not exist."}})
        );
    }

    #[test]
    fn test_decode_rejects_non_xml_and_broken_xml() {
        let result = XmlEncoder.decode(&response(Some("application/json"), "{}"));
        assert!(matches!(result, Err(Error::Request { .. })));

        let result = XmlEncoder.decode(&response(Some("text/xml"), "<methodResponse><params>"));
        match result {
            Err(Error::Parsing { msg, .. }) => assert!(msg.starts_with("failed parsing XML")),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
