/// エラー分類の統合テスト
///
/// HTTPエラー、JSONでない応答、使い方の誤り、未対応の操作を検証します。
use bite_api::{Error, GetOptions, SearchQuery, Service, ServiceConfig, ServiceKind};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn service(base: String, kind: ServiceKind) -> Service {
    Service::new(ServiceConfig::new(base, kind).unwrap()).unwrap()
}

#[tokio::test]
async fn test_server_error_is_a_request_error() {
    // Given: 503を返すサーバー
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/rest/api/2/serverInfo"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .mount(&mock_server)
        .await;
    let service = service(mock_server.uri(), ServiceKind::Jira);

    // When
    let result = service.version().await;

    // Then
    match result {
        Err(Error::Request { msg, code, text }) => {
            assert!(msg.starts_with("HTTP Error 503"), "unexpected message: {}", msg);
            assert_eq!(code, Some(503));
            assert_eq!(text.as_deref(), Some("maintenance"));
        }
        other => panic!("Expected Request error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_non_json_response_is_rejected() {
    // Given: HTMLのログインページを返すプロキシ
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v4/version"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/html")
                .set_body_string("<html>sign in</html>"),
        )
        .mount(&mock_server)
        .await;
    let service = service(format!("{}/group/project", mock_server.uri()), ServiceKind::Gitlab);

    // When
    let result = service.version().await;

    // Then
    let err = result.unwrap_err();
    assert!(matches!(err, Error::Request { .. }));
    assert!(err.message(true).contains("<html>sign in</html>"));
    assert!(!err.message(false).contains("<html>"));
}

#[tokio::test]
async fn test_jira_error_messages_are_collected() {
    // Given: errorMessagesを返すJira検索
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rest/api/2/search"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "errorMessages": ["Field 'foo' does not exist."],
            "errors": {}
        })))
        .mount(&mock_server)
        .await;
    let service = service(mock_server.uri(), ServiceKind::Jira);
    let query = SearchQuery::new().terms(vec!["foo".to_string()]);

    // When
    let result = async { service.search(&query).await?.collect().await }.await;

    // Then
    let err = result.unwrap_err();
    assert!(matches!(err, Error::Service { .. }));
    assert!(err.to_string().contains("Field 'foo' does not exist."));
}

#[tokio::test]
async fn test_usage_errors_need_no_network() {
    // Given: 到達できないサーバー
    let service = service("http://127.0.0.1:9/o/r".to_string(), ServiceKind::Github);

    // When / Then: IDも検索条件も無ければ送信前に失敗する
    assert!(matches!(service.get(&[], GetOptions::new()).await, Err(Error::Usage(_))));
    assert!(matches!(service.comments(&[]).await, Err(Error::Usage(_))));
    assert!(matches!(service.search(&SearchQuery::new()).await, Err(Error::Usage(_))));
}

#[tokio::test]
async fn test_unsupported_operation() {
    let service = service("http://127.0.0.1:9/o/r".to_string(), ServiceKind::Github);

    let err = service.version().await.unwrap_err();

    assert!(matches!(err, Error::Unsupported(_)));
    assert_eq!(err.to_string(), "unsupported operation: version for github");
}

#[tokio::test]
async fn test_modify_requires_changes() {
    let service = service("http://127.0.0.1:9".to_string(), ServiceKind::BugzillaRest);

    let result = service.modify(&[1], &serde_json::Map::new()).await;

    assert!(matches!(result, Err(Error::Usage(msg)) if msg == "no changes specified"));
}
