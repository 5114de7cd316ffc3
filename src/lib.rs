pub mod auth;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod search;
pub mod security;
pub mod session;
pub mod tls;

pub use auth::{gssapi_bind, sasl_bind, simple_bind, SecurityLayerRequest};
pub use codec::{Control, LdapMessage, LdapResult, ProtocolOp, SearchFilter, SearchRequest};
pub use config::Config;
pub use connection::Connection;
pub use error::{LdapError, Result};
pub use search::{PageItem, PagedSearch};
pub use security::SecurityContext;
pub use session::SessionState;
