pub mod endpoint_handler;
pub mod request_response;
pub mod virtual_server;
