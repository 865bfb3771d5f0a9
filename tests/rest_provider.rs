use groundwork::providers::rest::RestProvider;
use groundwork::providers::{Provider, ProviderError, ResourceRequest};
use groundwork::resource::{Attributes, ResourceId};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn attributes() -> Attributes {
    Attributes::from([("cidr".to_string(), serde_json::json!("10.0.0.0/16"))])
}

#[tokio::test]
async fn test_create_posts_to_type_collection() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/resources/network"))
        .and(header("authorization", "Bearer test_token"))
        .and(body_partial_json(serde_json::json!({
            "name": "main",
            "attributes": { "cidr": "10.0.0.0/16" }
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "success": true,
            "errors": [],
            "result": {
                "id": "vpc-0a1b2c",
                "outputs": { "arn": "arn:aws:ec2:vpc/vpc-0a1b2c" }
            }
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let provider = RestProvider::new(mock_server.uri(), Some("test_token".to_string())).unwrap();
    let id = ResourceId::new("network", "main");
    let attrs = attributes();
    let response = provider
        .create(ResourceRequest {
            id: &id,
            attributes: &attrs,
        })
        .await
        .unwrap();

    assert_eq!(response.provider_id, "vpc-0a1b2c");
    assert_eq!(response.outputs["arn"], "arn:aws:ec2:vpc/vpc-0a1b2c");
}

#[tokio::test]
async fn test_create_sends_instance_key() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/resources/subnet"))
        .and(body_partial_json(serde_json::json!({ "name": "public", "key": 2 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "result": { "id": "subnet-2" }
        })))
        .expect(1)
        .mount(&mock_server)
        .await;

    let provider = RestProvider::new(mock_server.uri(), None).unwrap();
    let id = ResourceId::indexed("subnet", "public", 2);
    let attrs = Attributes::new();
    let response = provider
        .create(ResourceRequest {
            id: &id,
            attributes: &attrs,
        })
        .await
        .unwrap();
    assert_eq!(response.provider_id, "subnet-2");
}

#[tokio::test]
async fn test_validation_error_is_rejection() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/resources/network"))
        .respond_with(ResponseTemplate::new(422).set_body_json(serde_json::json!({
            "success": false,
            "errors": [{ "code": 1003, "message": "cidr overlaps an existing network" }],
            "result": null
        })))
        .mount(&mock_server)
        .await;

    let provider = RestProvider::new(mock_server.uri(), None).unwrap();
    let id = ResourceId::new("network", "main");
    let attrs = attributes();
    let err = provider
        .create(ResourceRequest {
            id: &id,
            attributes: &attrs,
        })
        .await
        .unwrap_err();

    match err {
        ProviderError::Rejected { message } => assert!(message.contains("cidr overlaps")),
        other => panic!("expected Rejected, got {:?}", other),
    }
}

#[tokio::test]
async fn test_server_error_is_transient() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/resources/network/vpc-1"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let provider = RestProvider::new(mock_server.uri(), None).unwrap();
    let id = ResourceId::new("network", "main");
    let attrs = attributes();
    let err = provider
        .update(
            "vpc-1",
            ResourceRequest {
                id: &id,
                attributes: &attrs,
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_rate_limit_is_transient() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/resources/network/vpc-1"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .mount(&mock_server)
        .await;

    let provider = RestProvider::new(mock_server.uri(), None).unwrap();
    let err = provider
        .read(&ResourceId::new("network", "main"), "vpc-1")
        .await
        .unwrap_err();

    assert!(err.is_retryable());
    assert_eq!(err.retry_after(), Some(std::time::Duration::from_secs(7)));
    assert!(err.to_string().contains("retry after 7s"));
}

#[tokio::test]
async fn test_auth_error_does_not_contain_token() {
    let mock_server = MockServer::start().await;
    let secret_token = "super_secret_token_that_should_not_leak_12345";

    Mock::given(method("DELETE"))
        .and(path("/resources/network/vpc-1"))
        .respond_with(ResponseTemplate::new(401).set_body_json(serde_json::json!({
            "success": false,
            "errors": [{ "code": 10000, "message": "Authentication error" }],
            "result": null
        })))
        .mount(&mock_server)
        .await;

    let provider = RestProvider::new(mock_server.uri(), Some(secret_token.to_string())).unwrap();
    let err = provider
        .delete(&ResourceId::new("network", "main"), "vpc-1")
        .await
        .unwrap_err();

    assert!(matches!(err, ProviderError::Rejected { .. }));
    assert!(!err.to_string().contains(secret_token));
    assert!(!format!("{:?}", err).contains(secret_token));
    assert!(!format!("{:?}", provider).contains(secret_token));
}

#[tokio::test]
async fn test_read_missing_object_is_none() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/resources/network/vpc-gone"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let provider = RestProvider::new(mock_server.uri(), None).unwrap();
    let found = provider
        .read(&ResourceId::new("network", "main"), "vpc-gone")
        .await
        .unwrap();
    assert!(found.is_none());
}

#[tokio::test]
async fn test_read_returns_outputs() {
    let mock_server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/resources/kubernetes_cluster/eks-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": true,
            "errors": [],
            "result": {
                "id": "eks-1",
                "outputs": { "endpoint": "https://eks-1.example.test" }
            }
        })))
        .mount(&mock_server)
        .await;

    let provider = RestProvider::new(mock_server.uri(), None).unwrap();
    let found = provider
        .read(&ResourceId::new("kubernetes_cluster", "main"), "eks-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.outputs["endpoint"], "https://eks-1.example.test");
}

#[tokio::test]
async fn test_delete_of_missing_object_succeeds() {
    let mock_server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/resources/subnet/subnet-9"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&mock_server)
        .await;

    let provider = RestProvider::new(mock_server.uri(), None).unwrap();
    provider
        .delete(&ResourceId::indexed("subnet", "public", 0), "subnet-9")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_update_of_missing_object_is_not_found() {
    let mock_server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/resources/network/vpc-1"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&mock_server)
        .await;

    let provider = RestProvider::new(mock_server.uri(), None).unwrap();
    let id = ResourceId::new("network", "main");
    let attrs = attributes();
    let err = provider
        .update(
            "vpc-1",
            ResourceRequest {
                id: &id,
                attributes: &attrs,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ProviderError::NotFound { .. }));
}

#[tokio::test]
async fn test_unsuccessful_envelope_is_error() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/resources/network"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "success": false,
            "errors": [{ "code": 7, "message": "quota exceeded" }],
            "result": null
        })))
        .mount(&mock_server)
        .await;

    let provider = RestProvider::new(mock_server.uri(), None).unwrap();
    let id = ResourceId::new("network", "main");
    let attrs = attributes();
    let err = provider
        .create(ResourceRequest {
            id: &id,
            attributes: &attrs,
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("quota exceeded"));
}
