//! Integration tests for license activation.

mod common;

use axum::http::StatusCode;
use common::{body_json, post_json};

// ---------------------------------------------------------------------------
// Test: The master key is matched loosely and mints an unlimited token
// ---------------------------------------------------------------------------

#[tokio::test]
async fn master_key_activates_pro() {
    let app = common::build_test_app().await;

    let response = post_json(
        app.app(),
        "/api/license/activate",
        serde_json::json!({ "key": "  master-KEY-1 \n" }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["plan"], "pro");
    assert!(json["data"].get("limit").is_none());
    assert!(!json["data"]["token"].as_str().unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Test: The limited key mints a metered token
// ---------------------------------------------------------------------------

#[tokio::test]
async fn limited_key_activates_metered_pro() {
    let app = common::build_test_app().await;

    let response = post_json(
        app.app(),
        "/api/license/activate",
        serde_json::json!({ "key": common::LIMITED_KEY }),
    )
    .await;

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["plan"], "pro");
    assert_eq!(json["data"]["limit"], common::LIMITED_LIMIT);

    let token = json["data"]["token"].as_str().unwrap();
    assert_eq!(app.state.meter.remaining(token), Some(common::LIMITED_LIMIT));
}

// ---------------------------------------------------------------------------
// Test: Unknown and empty keys are refused
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_key_is_unauthorized() {
    let app = common::build_test_app().await;

    for key in ["not-a-key", ""] {
        let response = post_json(
            app.app(),
            "/api/license/activate",
            serde_json::json!({ "key": key }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let json = body_json(response).await;
        assert_eq!(json["code"], "UNAUTHORIZED");
        assert_eq!(json["error"], "Invalid license key");
    }
}
