//! HTTP transport
//!
//! Requests are stateless XML documents:
//!
//! - `GET /{name}` resolves a published object
//! - `POST /{id}` with a `<Call>` body invokes a method on a leased object
//! - `GET /Callback/{id}` long-polls the invocations queued for a callback
//!   the client passed to the server
//!
//! Callback ids are allocated by each client, so requests carry the client's
//! id in the [`SESSION_HEADER`] header. Requests that cannot be dispatched at
//! all answer `400 Bad Request` with the error text; failures of the called
//! method answer `200 OK` with an `<Exception>` document.

mod client;
mod server;

pub use client::HttpClient;
pub use server::HttpServer;

/// Header carrying the client's session id
pub const SESSION_HEADER: &str = "X-Remoting-Session";

/// Content type of every XML document
pub const XML_CONTENT_TYPE: &str = "application/xml; charset=utf-8";
