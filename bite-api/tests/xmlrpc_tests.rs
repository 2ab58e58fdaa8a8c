/// XML-RPC経由のBugzilla・Tracに関する統合テスト
///
/// methodCallの組み立て、フォルトの変換、system.multicallの分割を検証します。
use bite_api::{Error, GetOptions, Output, Record, Service, ServiceConfig, ServiceKind};
use futures::StreamExt;
use serde_json::Value;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn service(base: String, kind: ServiceKind) -> Service {
    Service::new(ServiceConfig::new(base, kind).unwrap()).unwrap()
}

fn xml(body: String) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_raw(
        format!(r#"<?xml version="1.0"?><methodResponse>{}</methodResponse>"#, body),
        "text/xml",
    )
}

fn fault(code: i64, msg: &str) -> String {
    format!(
        "<value><struct>\
         <member><name>faultCode</name><value><int>{}</int></value></member>\
         <member><name>faultString</name><value><string>{}</string></value></member>\
         </struct></value>",
        code, msg
    )
}

fn ticket(id: u64, summary: &str) -> String {
    format!(
        "<value><array><data>\
         <value><int>{}</int></value>\
         <value><dateTime.iso8601>20240102T03:04:05</dateTime.iso8601></value>\
         <value><dateTime.iso8601>20240103T03:04:05</dateTime.iso8601></value>\
         <value><struct>\
         <member><name>summary</name><value><string>{}</string></value></member>\
         <member><name>reporter</name><value><string>alice</string></value></member>\
         <member><name>status</name><value><string>new</string></value></member>\
         </struct></value>\
         </data></array></value>",
        id, summary
    )
}

#[tokio::test]
async fn test_bugzilla_version_over_xmlrpc() {
    // Given: xmlrpc.cgiでBugzilla.versionに応答するサーバー
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/xmlrpc.cgi"))
        .and(header("content-type", "text/xml"))
        .and(body_string_contains("<methodName>Bugzilla.version</methodName>"))
        .respond_with(xml(
            "<params><param><value><struct>\
             <member><name>version</name><value><string>5.0.4</string></value></member>\
             </struct></value></param></params>"
                .to_string(),
        ))
        .expect(1)
        .mount(&mock_server)
        .await;
    let service = service(mock_server.uri(), ServiceKind::Bugzilla50Xmlrpc);

    // When
    let output = service.version().await.unwrap();

    // Then
    match output {
        Output::Value(Record::Value(Value::String(version))) => assert_eq!(version, "5.0.4"),
        other => panic!("Expected version string, got {:?}", other),
    }
}

#[tokio::test]
async fn test_bugzilla_xmlrpc_fault_becomes_nonexistent_item() {
    // Given: 存在しないバグにフォルトコード101を返すBugzilla
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/xmlrpc.cgi"))
        .and(body_string_contains("<methodName>Bug.get</methodName>"))
        .respond_with(xml(format!("<fault>{}</fault>", fault(101, "Bug #42 does not exist."))))
        .mount(&mock_server)
        .await;
    let service = service(mock_server.uri(), ServiceKind::BugzillaXmlrpc);

    // When
    let result = async { service.get(&[42], GetOptions::new()).await?.collect().await }.await;

    // Then
    let err = result.unwrap_err();
    assert_eq!(err.to_string(), "nonexistent item ID(s): 42");
}

#[tokio::test]
async fn test_trac_multicall_over_xmlrpc_keeps_good_tickets() {
    // Given: 2件目のticket.getだけがフォルトになるTrac
    let mock_server = MockServer::start().await;
    let items = format!(
        "<value><array><data>{}</data></array></value>{}",
        ticket(1, "one"),
        fault(404, "Ticket 99 does not exist.")
    );
    Mock::given(method("POST"))
        .and(path("/proj/rpc"))
        .and(body_string_contains("<methodName>system.multicall</methodName>"))
        .and(body_string_contains(
            "<member><name>methodName</name><value><string>ticket.get</string></value></member>",
        ))
        .respond_with(xml(format!(
            "<params><param><value><array><data>{}</data></array></value></param></params>",
            items
        )))
        .expect(1)
        .mount(&mock_server)
        .await;
    let service = service(format!("{}/proj", mock_server.uri()), ServiceKind::TracXmlrpc);

    // When
    let output = service.get(&[1, 99], GetOptions::new()).await.unwrap();
    let results: Vec<Result<Record, Error>> = output.into_stream().collect().await;

    // Then: 1件目は日時付きで取得でき、2件目だけが存在しないIDになる
    assert_eq!(results.len(), 2);
    match &results[0] {
        Ok(Record::Item(item)) => {
            assert_eq!(item.id, 1);
            assert_eq!(item.title.as_deref(), Some("one"));
            assert_eq!(
                item.created.map(|t| t.to_rfc3339()).as_deref(),
                Some("2024-01-02T03:04:05+00:00")
            );
        }
        other => panic!("Expected ticket 1, got {:?}", other),
    }
    match &results[1] {
        Err(Error::NonexistentItem { ids }) => assert_eq!(ids, &vec![99]),
        other => panic!("Expected NonexistentItem, got {:?}", other),
    }
}
