mod admin_server;
mod gateway_server;

pub use admin_server::{AdminServer, AdminState};
pub use gateway_server::{GatewayServer, GatewayState};

// Routers without a listener, for tests and embedding
#[allow(unused_imports)]
pub use admin_server::router as admin_router;
#[allow(unused_imports)]
pub use gateway_server::router as gateway_router;
