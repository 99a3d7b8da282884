//! HTTP surface for the engine: lifecycle operations and the query path.

mod routes;

pub use routes::{app_router, AppState};
