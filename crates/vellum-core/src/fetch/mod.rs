//! Resource fetch gateway.
//!
//! The driver never touches the network. It sends typed requests over a
//! channel and awaits the matching response, which the host delivers through
//! a [`FetchResponder`]. Each request waits at most its kind's timeout.

mod gateway;
mod protocol;

pub use gateway::{FetchGateway, FetchResponder, FetchTimeouts, FetchedBundle, HostEndpoint};
pub use protocol::{FetchKind, FetchRequest, FetchResponse, RequestBody, RequestId, ResponseBody};
