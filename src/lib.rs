pub mod comm;
pub mod error;
pub mod logging;
pub mod server;
pub mod tls;

pub use crate::comm::destination::Destination;
pub use crate::comm::pool::PoolConfig;
pub use crate::comm::web_service_client::WebServiceClient;
pub use crate::error::testwire_error::TestwireError;
pub use crate::server::endpoint_handler::{EndpointHandler, ResponseRules, ResponseUpdater, SimulatedEndpoint};
pub use crate::server::request_response::{SimRequest, SimResponse};
pub use crate::server::virtual_server::VirtualServer;
