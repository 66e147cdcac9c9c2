use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Document gateway answering `GET url_path` with `body`
pub async fn mock_document_gateway(url_path: &str, body: &[u8], content_type: &str) -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path(url_path))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_bytes(body.to_vec())
                .insert_header("content-type", content_type),
        )
        .mount(&server)
        .await;

    server
}

/// Gateway that answers every request with `status_code`, optionally with a Retry-After header
pub async fn mock_status_server(status_code: u16, retry_after_secs: Option<u64>) -> MockServer {
    let server = MockServer::start().await;

    let mut response = ResponseTemplate::new(status_code);
    if let Some(secs) = retry_after_secs {
        response = response.insert_header("retry-after", secs.to_string().as_str());
    }

    Mock::given(method("GET")).respond_with(response).mount(&server).await;

    server
}

/// Gateway serving an HTML block page with status 200
pub async fn mock_block_page() -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<html><body><h1>Zu viele Anfragen</h1><p>Bitte versuchen Sie es später.</p></body></html>")
                .insert_header("content-type", "text/html; charset=utf-8"),
        )
        .mount(&server)
        .await;

    server
}
