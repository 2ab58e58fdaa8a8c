use serde_json::{Value, json};

use crate::error::{Error, Result};
use crate::service::Tracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    Rest,
    JsonRpc,
    XmlRpc,
}

/// Call framing layered over an [`Encoder`](crate::encoding::Encoder).
pub trait Protocol: Send + Sync {
    fn kind(&self) -> ProtocolKind;

    /// Wraps one remote call for the wire.
    fn envelope(&self, method: &str, params: Vec<Value>) -> Result<Value>;

    /// Strips the framing from a decoded response, raising embedded faults.
    fn unwrap(&self, data: Value, tracker: &dyn Tracker) -> Result<Value>;

    /// One `{method, params}` entry of a `system.multicall` call.
    fn multicall_entry(&self, method: &str, params: Vec<Value>) -> Result<Value>;

    /// Arguments of the `system.multicall` call itself.
    fn multicall_params(&self, entries: Vec<Value>) -> Vec<Value> {
        entries
    }

    /// Splits an unwrapped multicall result into per-call results.
    ///
    /// Faults stay in their own slot so the remaining results stay usable.
    fn split_multicall(&self, data: Value, tracker: &dyn Tracker) -> Result<Vec<Result<Value>>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Rest;

impl Protocol for Rest {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Rest
    }

    fn envelope(&self, method: &str, _params: Vec<Value>) -> Result<Value> {
        Err(Error::Unsupported(format!("RPC call over REST: {}", method)))
    }

    fn unwrap(&self, data: Value, tracker: &dyn Tracker) -> Result<Value> {
        tracker.check_response(data)
    }

    fn multicall_entry(&self, _method: &str, _params: Vec<Value>) -> Result<Value> {
        Err(Error::Unsupported("multicall over REST".to_string()))
    }

    fn split_multicall(&self, _data: Value, _tracker: &dyn Tracker) -> Result<Vec<Result<Value>>> {
        Err(Error::Unsupported("multicall over REST".to_string()))
    }
}

/// JSON-RPC 1.0.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonRpc;

impl JsonRpc {
    fn fault(error: &Value, tracker: &dyn Tracker) -> Error {
        let code = error.get("code").and_then(Value::as_i64);
        let msg = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        tracker.service_error(code, msg)
    }
}

impl Protocol for JsonRpc {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::JsonRpc
    }

    fn envelope(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        Ok(json!({
            "method": method,
            "params": params,
            "id": 0,
        }))
    }

    fn unwrap(&self, mut data: Value, tracker: &dyn Tracker) -> Result<Value> {
        match data.get("error") {
            Some(error) if !error.is_null() => Err(Self::fault(error, tracker)),
            _ => match data.get_mut("result") {
                Some(result) => Ok(result.take()),
                None => Err(Error::Parsing {
                    msg: "missing JSON-RPC result".to_string(),
                    text: Some(data.to_string()),
                }),
            },
        }
    }

    fn multicall_entry(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        Ok(json!({
            "method": method,
            "params": params,
        }))
    }

    fn split_multicall(&self, data: Value, tracker: &dyn Tracker) -> Result<Vec<Result<Value>>> {
        let Value::Array(items) = data else {
            return Err(Error::parsing("multicall result is not a list"));
        };

        Ok(items
            .into_iter()
            .enumerate()
            .map(|(index, mut item)| match item.get("error") {
                Some(error) if !error.is_null() => Err(Error::MulticallFault {
                    index,
                    source: Box::new(Self::fault(error, tracker)),
                }),
                _ => Ok(item.get_mut("result").map(Value::take).unwrap_or(Value::Null)),
            })
            .collect())
    }
}

/// XML-RPC, carried by [`XmlEncoder`](crate::encoding::XmlEncoder) documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct XmlRpc;

impl XmlRpc {
    fn fault(fault: &Value, tracker: &dyn Tracker) -> Error {
        let code = fault
            .get("faultCode")
            .and_then(|code| code.as_i64().or_else(|| code.as_str()?.trim().parse().ok()));
        let msg = fault
            .get("faultString")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| fault.to_string());
        tracker.service_error(code, msg)
    }
}

impl Protocol for XmlRpc {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::XmlRpc
    }

    fn envelope(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        Ok(json!({
            "methodName": method,
            "params": params,
        }))
    }

    fn unwrap(&self, mut data: Value, tracker: &dyn Tracker) -> Result<Value> {
        if let Some(fault) = data.get("fault") {
            return Err(Self::fault(fault, tracker));
        }
        let result = match data.get_mut("params").and_then(Value::as_array_mut) {
            Some(params) if !params.is_empty() => params.swap_remove(0),
            _ => Value::Null,
        };
        // permissive servers list faults next to the partial result
        if let Some(fault) = result.get("faults").and_then(Value::as_array).and_then(|f| f.first()) {
            return Err(Self::fault(fault, tracker));
        }
        Ok(result)
    }

    fn multicall_entry(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        Ok(json!({
            "methodName": method,
            "params": params,
        }))
    }

    /// The calls travel as a single array argument.
    fn multicall_params(&self, entries: Vec<Value>) -> Vec<Value> {
        vec![Value::Array(entries)]
    }

    /// Results come back wrapped in one-element arrays; faults are bare
    /// `{faultCode, faultString}` structs.
    fn split_multicall(&self, data: Value, tracker: &dyn Tracker) -> Result<Vec<Result<Value>>> {
        let Value::Array(items) = data else {
            return Err(Error::parsing("multicall result is not a list"));
        };

        Ok(items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                Value::Array(mut values) if !values.is_empty() => Ok(values.swap_remove(0)),
                Value::Object(_) if item.get("faultCode").is_some() => Err(Error::MulticallFault {
                    index,
                    source: Box::new(Self::fault(&item, tracker)),
                }),
                other => Err(Error::MulticallFault {
                    index,
                    source: Box::new(Error::Parsing {
                        msg: "unexpected multicall item".to_string(),
                        text: Some(other.to_string()),
                    }),
                }),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServiceConfig;
    use crate::service::ServiceKind;
    use crate::service::trackers::Trac;

    fn trac() -> Trac {
        Trac::new(&ServiceConfig::new("https://trac.example.org/proj", ServiceKind::TracJsonrpc).unwrap())
    }

    #[test]
    fn test_jsonrpc_envelope() {
        let envelope = JsonRpc.envelope("ticket.get", vec![json!(1)]).unwrap();
        assert_eq!(envelope, json!({"method": "ticket.get", "params": [1], "id": 0}));
    }

    #[test]
    fn test_jsonrpc_unwrap_result_and_error() {
        let tracker = trac();

        let result = JsonRpc
            .unwrap(json!({"result": [1, 2], "error": null, "id": 0}), &tracker)
            .unwrap();
        assert_eq!(result, json!([1, 2]));

        let err = JsonRpc
            .unwrap(
                json!({"result": null, "error": {"code": 1, "message": "no such ticket"}, "id": 0}),
                &tracker,
            )
            .unwrap_err();
        assert_eq!(err.to_string(), "trac error: no such ticket");
    }

    #[test]
    fn test_split_multicall_keeps_faults_in_their_slot() {
        let tracker = trac();
        let data = json!([
            {"result": "a", "error": null},
            {"result": null, "error": {"code": 404, "message": "gone"}},
            {"result": "c", "error": null},
        ]);

        let items = JsonRpc.split_multicall(data, &tracker).unwrap();

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap(), &json!("a"));
        match &items[1] {
            Err(Error::MulticallFault { index, .. }) => assert_eq!(*index, 1),
            other => panic!("unexpected item: {other:?}"),
        }
        assert_eq!(items[2].as_ref().unwrap(), &json!("c"));
    }

    #[test]
    fn test_rest_has_no_multicall() {
        let tracker = trac();
        assert!(matches!(
            Rest.split_multicall(json!([]), &tracker),
            Err(Error::Unsupported(_))
        ));
    }

    #[test]
    fn test_xmlrpc_fault_goes_through_the_tracker() {
        let tracker = trac();

        let err = XmlRpc
            .unwrap(
                json!({"fault": {"faultCode": 404, "faultString": "Ticket 9 does not exist."}}),
                &tracker,
            )
            .unwrap_err();

        assert!(matches!(err, Error::Service { code: Some(404), .. }));
        assert_eq!(err.to_string(), "trac error: Ticket 9 does not exist.");
        assert_eq!(XmlRpc.unwrap(json!({"params": ["1.2"]}), &tracker).unwrap(), json!("1.2"));
    }

    #[test]
    fn test_xmlrpc_multicall_framing() {
        let tracker = trac();
        let entry = XmlRpc.multicall_entry("ticket.get", vec![json!(1)]).unwrap();
        assert_eq!(entry, json!({"methodName": "ticket.get", "params": [1]}));
        assert_eq!(XmlRpc.multicall_params(vec![entry.clone()]), vec![json!([entry])]);

        // Given: 1件目は結果、2件目はフォルト
        let data = json!([[{"id": 1}], {"faultCode": 404, "faultString": "gone"}]);

        // When
        let items = XmlRpc.split_multicall(data, &tracker).unwrap();

        // Then: 結果は配列から取り出され、フォルトはその位置だけに残る
        assert_eq!(items[0].as_ref().unwrap(), &json!({"id": 1}));
        match &items[1] {
            Err(Error::MulticallFault { index, source }) => {
                assert_eq!(*index, 1);
                assert!(matches!(**source, Error::Service { code: Some(404), .. }));
            }
            other => panic!("unexpected item: {other:?}"),
        }
    }
}
