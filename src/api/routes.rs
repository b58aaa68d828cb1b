// API route configuration

use actix_web::web;

use crate::api::handlers;
use crate::store::Datastore;

pub fn configure_routes<S: Datastore>(cfg: &mut web::ServiceConfig) {
    cfg
        // Health check (no auth required)
        .route("/health", web::get().to(handlers::health_check))
        .route("/", web::get().to(handlers::health_check))
        // Processor webhooks authenticate through the token in the path
        .route(
            "/webhooks/stripe/{token}",
            web::post().to(handlers::processor_webhook::<S>),
        )
        // API v1 routes (all require authentication)
        .service(
            web::scope("/api/v1")
                .route("/backers", web::post().to(handlers::start_backing::<S>))
                .route("/backers/{id}", web::delete().to(handlers::cancel_backing::<S>))
                .route("/backers/{id}/tier", web::put().to(handlers::change_tier::<S>))
                .route(
                    "/backers/{id}/profile",
                    web::put().to(handlers::update_profile::<S>),
                )
                .route("/backers/{id}/card", web::put().to(handlers::update_card::<S>))
                .route("/backers/{id}/sync", web::post().to(handlers::force_sync::<S>))
                // Display data
                .route("/totals", web::get().to(handlers::totals::<S>))
                .route("/sponsors", web::get().to(handlers::sponsors::<S>))
                // Cron
                .route("/cron/sync", web::post().to(handlers::cron_sync::<S>)),
        );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::auth::Auth;
    use crate::model::Tier;
    use crate::store::MemoryStore;
    use crate::testing::TestRig;
    use actix_web::{http::StatusCode, test, App};
    use serde_json::{json, Value};

    const SECRET: &str = "s3cret";

    macro_rules! app {
        ($rig:expr) => {
            test::init_service(
                App::new()
                    .app_data(web::Data::from($rig.platform.clone()))
                    .wrap(Auth::new(SECRET.to_string()))
                    .configure(configure_routes::<MemoryStore>),
            )
            .await
        };
    }

    fn authed(req: test::TestRequest) -> test::TestRequest {
        req.insert_header(("Authorization", format!("Bearer {SECRET}")))
    }

    fn backing(email: &str, tier: &str) -> Value {
        json!({
            "email": email,
            "name": "Ada",
            "tier": tier,
            "territory": "US",
            "card_token": "tok_visa"
        })
    }

    #[actix_web::test]
    async fn health_needs_no_token() {
        let rig = TestRig::new();
        let app = app!(rig);
        let resp = test::call_service(&app, test::TestRequest::get().uri("/health").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[actix_web::test]
    async fn api_routes_need_the_bearer_token() {
        let rig = TestRig::new();
        let app = app!(rig);
        let resp = test::call_service(&app, test::TestRequest::get().uri("/api/v1/totals").to_request()).await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let req = test::TestRequest::get()
            .uri("/api/v1/totals")
            .insert_header(("Authorization", "Bearer wrong"))
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn backing_lifecycle_over_http() {
        let rig = TestRig::new();
        let app = app!(rig);

        let req = authed(test::TestRequest::post().uri("/api/v1/backers"))
            .set_json(backing("ada@example.com", "gold"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["success"], true);
        let id = body["data"]["backer_id"].as_i64().unwrap();

        let req = authed(test::TestRequest::get().uri("/api/v1/totals")).to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["sponsors"], 1);

        let req = authed(test::TestRequest::put().uri(&format!("/api/v1/backers/{id}/tier")))
            .set_json(json!({"tier": "platinum", "territory": "US"}))
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["tier"], "platinum");

        let req = authed(test::TestRequest::delete().uri(&format!("/api/v1/backers/{id}"))).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
        assert_eq!(rig.store.ledger_totals().await.unwrap().get(Tier::Platinum), 0);
    }

    #[actix_web::test]
    async fn rejections_map_to_status_codes() {
        let rig = TestRig::new();
        let app = app!(rig);

        let req = authed(test::TestRequest::post().uri("/api/v1/backers"))
            .set_json(backing("nope", "gold"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "Please provide a valid email address.");

        let req = authed(test::TestRequest::post().uri("/api/v1/backers/77/sync")).to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn sync_failures_after_sign_up_map_by_cause() {
        let rig = TestRig::new();
        let app = app!(rig);

        rig.processor
            .fail_next_create(crate::billing::ProcessorError::Api("500: boom".into()));
        let req = authed(test::TestRequest::post().uri("/api/v1/backers"))
            .set_json(backing("ada@example.com", "gold"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body: Value = test::read_body_json(resp).await;
        assert!(body["error"].as_str().unwrap().contains("payment processor"));

        rig.processor.fail_next_create(crate::billing::ProcessorError::Card {
            code: Some("card_declined".into()),
            message: "Your card was declined.".into(),
        });
        let req = authed(test::TestRequest::post().uri("/api/v1/backers"))
            .set_json(backing("bob@example.com", "gold"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = test::read_body_json(resp).await;
        assert_eq!(body["error"], "Your card was declined.");
    }

    #[actix_web::test]
    async fn webhooks_use_the_path_token() {
        let rig = TestRig::new();
        let app = app!(rig);
        let event = json!({"id": "evt_9", "type": "invoice.paid", "data": {"object": {}}});

        let req = test::TestRequest::post()
            .uri("/webhooks/stripe/whtok")
            .set_json(&event)
            .to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["recorded"], true);

        let req = test::TestRequest::post()
            .uri("/webhooks/stripe/guess")
            .set_json(&event)
            .to_request();
        assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);
    }

    #[actix_web::test]
    async fn cron_runs_a_sweep() {
        let rig = TestRig::new();
        let app = app!(rig);
        let req = authed(test::TestRequest::post().uri("/api/v1/cron/sync")).to_request();
        let body: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["data"]["visited"], 0);
        assert_eq!(body["data"]["truncated"], false);
    }
}
