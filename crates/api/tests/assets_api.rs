//! Integration tests for asset listing, upload, import and progress.

mod common;

use axum::http::StatusCode;
use common::{body_json, get, multipart_request, post_json, send};

const SID: &str = "sid_assets1";

async fn pro_token(app: &common::TestApp) -> String {
    let response = post_json(
        app.app(),
        "/api/license/activate",
        serde_json::json!({ "key": common::MASTER_KEY }),
    )
    .await;
    body_json(response).await["data"]["token"]
        .as_str()
        .unwrap()
        .to_string()
}

// ---------------------------------------------------------------------------
// Test: Listing merges shared and session assets, hiding session links
// ---------------------------------------------------------------------------

#[tokio::test]
async fn listing_shows_shared_assets_and_hides_links() {
    let app = common::build_test_app().await;
    let shared = &app.state.config.loras_root;
    std::fs::write(shared.join("style.safetensors"), b"weights").unwrap();
    std::fs::write(shared.join("sess_sid_other1.private.safetensors"), b"weights").unwrap();
    std::fs::write(shared.join("notes.txt"), b"not an asset").unwrap();

    let json = body_json(get(app.app(), "/api/assets").await).await;
    assert_eq!(json["data"], serde_json::json!(["style.safetensors"]));

    let response = get(app.app(), "/api/assets?session_id=bad").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Test: Upload is a pro feature
// ---------------------------------------------------------------------------

#[tokio::test]
async fn free_upload_requires_pro() {
    let app = common::build_test_app().await;

    let response = send(
        app.app(),
        multipart_request("/api/assets/upload", Some(SID), "mine.safetensors", b"w", None),
    )
    .await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(body_json(response).await["code"], "PRO_REQUIRED");
}

#[tokio::test]
async fn pro_upload_lands_in_the_session_folder() {
    let app = common::build_test_app().await;
    let token = pro_token(&app).await;

    let response = send(
        app.app(),
        multipart_request(
            "/api/assets/upload",
            Some(SID),
            "my style.safetensors",
            &[7u8; 4096],
            Some(&token),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await["data"]["filename"],
        "my_style.safetensors"
    );

    let json = body_json(get(app.app(), &format!("/api/assets?session_id={SID}")).await).await;
    assert_eq!(json["data"], serde_json::json!(["my_style.safetensors"]));

    let json = body_json(
        get(app.app(), &format!("/api/assets/import/progress?session_id={SID}")).await,
    )
    .await;
    assert_eq!(json["data"]["status"], "done");
    assert_eq!(json["data"]["bytes"], 4096);

    // Another session does not see it.
    let json = body_json(get(app.app(), "/api/assets?session_id=sid_assets2").await).await;
    assert_eq!(json["data"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn upload_with_wrong_extension_is_rejected() {
    let app = common::build_test_app().await;
    let token = pro_token(&app).await;

    let response = send(
        app.app(),
        multipart_request(
            "/api/assets/upload",
            Some(SID),
            "payload.exe",
            &[0u8; 64],
            Some(&token),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "VALIDATION_ERROR");

    let json = body_json(
        get(app.app(), &format!("/api/assets/import/progress?session_id={SID}")).await,
    )
    .await;
    assert_eq!(json["data"]["status"], "error");
}

// ---------------------------------------------------------------------------
// Test: Progress for a session with no transfer
// ---------------------------------------------------------------------------

#[tokio::test]
async fn progress_is_idle_without_a_transfer() {
    let app = common::build_test_app().await;

    let json = body_json(get(app.app(), "/api/assets/import/progress?session_id=sid_quiet1").await)
        .await;
    assert_eq!(json["data"]["status"], "idle");
    assert_eq!(json["data"]["bytes"], 0);

    let response = get(app.app(), "/api/assets/import/progress").await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Test: Imports refuse internal hosts and odd schemes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn import_refuses_internal_hosts() {
    let app = common::build_test_app().await;

    for url in [
        "http://127.0.0.1/model.safetensors",
        "http://192.168.1.20/model.safetensors",
        "ftp://example.com/model.safetensors",
    ] {
        let response = post_json(
            app.app(),
            "/api/assets/import",
            serde_json::json!({ "session_id": SID, "url": url }),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN, "{url}");
    }

    let json = body_json(
        get(app.app(), &format!("/api/assets/import/progress?session_id={SID}")).await,
    )
    .await;
    assert_eq!(json["data"]["status"], "error");
}

#[tokio::test]
async fn import_requires_a_session() {
    let app = common::build_test_app().await;

    let response = post_json(
        app.app(),
        "/api/assets/import",
        serde_json::json!({ "url": "https://example.com/model.safetensors" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
