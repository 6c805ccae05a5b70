pub mod engine;
pub mod rewrite;
pub mod websocket;

pub use engine::{build_client, proxy_handler, AppState};
pub use websocket::ws_handler;
