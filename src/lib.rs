pub mod admin_http;
pub mod relay;
