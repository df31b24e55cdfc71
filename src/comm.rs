pub mod cookie_jar;
pub mod credentials;
pub mod destination;
pub mod pool;
pub mod web_service_client;
