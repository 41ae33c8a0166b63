//! REST API access for the chipin backend.
//!
//! All authenticated traffic goes through the `Gateway`, which attaches the
//! bearer token and recovers from expired tokens. `EventsApi` layers typed
//! event endpoints on top of it.

pub mod error;
pub mod events;
pub mod gateway;
pub mod transport;

pub use error::ApiError;
pub use events::EventsApi;
pub use gateway::Gateway;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
