//! Object storage client: signed wire operations and part transfers.
//!
//! The layers, bottom up:
//!
//! 1. **Transport**: [`HttpTransport`] moves one request; [`ReqwestTransport`]
//!    is the production implementation.
//! 2. **Wire operations**: [`ObjectClient`] builds, signs and sends each
//!    provider call and turns error documents into [`ClientError`]s.
//! 3. **Parts**: [`PartExecutor`] transfers one planned part with bounded,
//!    cancellable retry of transport failures.

pub mod endpoint;
pub mod error;
pub mod executor;
pub mod object;
pub mod retry;
pub mod transport;
pub mod xml;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use endpoint::Endpoint;
pub use error::ClientError;
pub use executor::PartExecutor;
pub use object::{DeleteFailure, ObjectClient, ObjectMetadata};
pub use retry::RetryPolicy;
pub use transport::{HttpRequest, HttpResponse, HttpTransport, ReqwestTransport, TransportError};
