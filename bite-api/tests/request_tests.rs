/// リクエストの組み立て（finalize / describe）に関するテスト
///
/// ネットワークには接続しません。
use bite_api::service::trackers::Trac;
use bite_api::{
    GetOptions, LeafRequest, PagedRequest, Paging, Request, SearchQuery, Service, ServiceConfig, ServiceKind,
    Tracker,
};

fn bugzilla() -> Service {
    let config = ServiceConfig::new("https://bugs.example.org", ServiceKind::BugzillaRest)
        .unwrap()
        .auth_token("1-secret");
    Service::new(config).unwrap()
}

#[test]
fn test_describe_is_stable_across_calls() {
    // Given: 検索リクエスト
    let service = bugzilla();
    let query = SearchQuery::new().terms(vec!["crash".to_string()]).limit(5);
    let mut request = service.tracker().search(&service, &query).unwrap();

    // When: 2回描画する
    let first = request.describe(&service).unwrap();
    let second = request.describe(&service).unwrap();

    // Then: 同じ内容で、オプションとURLが含まれる
    assert_eq!(first, second);
    assert!(first.contains(" * Limit: 5"));
    assert!(first.contains("GET https://bugs.example.org/rest/bug?"));
    assert!(first.contains("summary=crash"));
}

#[test]
fn test_auth_is_added_to_the_wire_request_only() {
    // Given
    let service = bugzilla();
    let mut request: Request = LeafRequest::get("/version").into();

    // When
    let prepared = request.prepare(&service).unwrap();

    // Then: 送信用URLにはトークンが付くが、リクエスト自身のパラメータは変わらない
    assert!(prepared[0].url.contains("Bugzilla_token=1-secret"));
    match &request {
        Request::Leaf(leaf) => assert!(leaf.params().is_empty()),
        _ => unreachable!(),
    }
}

#[test]
fn test_first_offset_page_has_no_offset() {
    // Given
    let service = bugzilla();
    let leaf = LeafRequest::get("/bug").param("summary", "leak").many();
    let mut request: Request = PagedRequest::new(leaf, Paging::offset("offset", "limit")).into();

    // When
    let prepared = request.prepare(&service).unwrap();

    // Then: ページサイズはサービスの既定値、オフセットは無し
    assert!(prepared[0].url.contains("limit=10000"));
    assert!(!prepared[0].url.contains("offset="));
}

#[test]
fn test_page_paging_without_total_is_rejected() {
    let result = Paging::page("page", "per_page", 1, None);
    assert!(result.is_err());
}

#[test]
fn test_rpc_with_empty_args_sends_empty_list() {
    // Given: 引数無しのRPC呼び出し
    let config = ServiceConfig::new("https://trac.example.org/proj", ServiceKind::Trac).unwrap();
    let trac = Trac::new(&config);
    let service = Service::new(config).unwrap();
    let mut request = trac.version(&service).unwrap();

    // When
    let prepared = request.prepare(&service).unwrap();

    // Then
    assert_eq!(prepared[0].url, "https://trac.example.org/proj/rpc");
    let body: serde_json::Value = serde_json::from_str(prepared[0].body.as_deref().unwrap()).unwrap();
    assert_eq!(body["method"], "system.getAPIVersion");
    assert_eq!(body["params"], serde_json::json!([]));
}

#[test]
fn test_describe_lists_every_physical_request() {
    // Given: 課題とコメントを個別に取得するGitHubのget
    let config = ServiceConfig::new("https://github.com/o/r", ServiceKind::Github).unwrap();
    let service = Service::new(config).unwrap();
    let mut request = service.get_request(&[1, 2], GetOptions::new().comments(true)).unwrap();

    // When
    let text = request.describe(&service).unwrap();

    // Then
    for path in ["issues/1", "issues/2", "issues/1/comments", "issues/2/comments"] {
        assert!(
            text.contains(&format!("GET https://api.github.com/repos/o/r/{}", path)),
            "missing {} in:\n{}",
            path,
            text
        );
    }
}
