pub mod accounts;
pub mod health;
pub mod records;
pub mod websocket;

// Re-export all handlers for easy route registration
pub use accounts::{login_handler, signup_handler};
pub use health::{health_handler, health_ready_handler, metrics_handler};
pub use records::{create_record_handler, list_records_handler, update_status_handler};
pub use websocket::websocket_handler;
