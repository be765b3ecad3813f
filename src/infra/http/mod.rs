mod routes;
mod middleware;

pub use routes::{HttpState, X_CACHE, build_router};
pub use middleware::REQUEST_ID_HEADER;
