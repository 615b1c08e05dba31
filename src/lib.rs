pub mod config;
pub mod errors;
pub mod handlers;
pub mod middlewares;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;

pub use config::Settings;
pub use routes::create_router;
pub use state::AppState;
