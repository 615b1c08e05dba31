use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::handlers::{health, orders, promo, wallet};
use crate::middlewares::auth::auth_middleware;
use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let order_routes = Router::new()
        .route("/", post(orders::create_order).get(orders::list_orders))
        .route("/paypal/capture", post(orders::capture_paypal))
        .route("/{id}/deliver", post(orders::mark_delivered))
        .route("/{id}/complete", post(orders::complete_order))
        .route("/{id}/dispute", post(orders::open_dispute))
        .route("/{id}/dispute/respond", post(orders::respond_dispute))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let promo_routes = Router::new()
        .route("/validate", post(promo::validate_promo))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    let admin_routes = Router::new()
        .route(
            "/wallet/approve/{id}",
            post(wallet::approve_manual_transfer),
        )
        .route("/wallet/reject/{id}", post(wallet::reject_manual_transfer))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    // Provider callbacks authenticate by signature, not API key.
    let wallet_routes = Router::new().route("/stripe-webhook", post(wallet::stripe_webhook));

    Router::new()
        .route("/", get(health::health_check))
        .nest("/orders", order_routes)
        .nest("/promo-codes", promo_routes)
        .nest("/admin", admin_routes)
        .nest("/wallet", wallet_routes)
        .layer(CorsLayer::permissive())
        .with_state(state)
}
