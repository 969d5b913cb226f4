#![forbid(unsafe_code)]
//! Session layer for asynchronous 9P2000 file servers.
//!
//! This crate turns a stream of 9P2000 messages into an ordered sequence of
//! requests an application answers one at a time, while it takes care of the
//! protocol's handle bookkeeping: fid tables, multi-element walks and clones,
//! reference-counted session lifetime, reads and writes on open files, and
//! default answers for anything the application leaves alone.
//!
//! # Overview
//!
//! Every `Tattach` starts a [`session::Session`]. The fids derived from the
//! attached fid by walking belong to the same session, which ends when the
//! last of them is clunked. For each session the [`srv::Handler`] is called
//! once and loops over [`session::Session::next`]:
//!
//! - `Twalk`, `Topen`, `Tcreate`, `Tremove` and `Tstat` need a decision and
//!   are delivered as [`request::Request`] values;
//! - `Tread`, `Twrite` and `Tclunk` are serviced directly on the
//!   [`file::FileIo`] the application supplied when it accepted the open.
//!
//! Requests for one session arrive in the order the client sent them. A walk
//! of several names is delivered as one request per name, in order, each
//! with the cumulative path it resolves.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use ninep_session::{
//!     QIdType, Result, errstr,
//!     request::Request,
//!     session::Session,
//!     srv::{Config, Handler, dispatch},
//! };
//!
//! struct Hello;
//!
//! #[async_trait]
//! impl Handler for Hello {
//!     async fn serve9p(&self, session: &mut Session) {
//!         while session.next().await {
//!             match session.request() {
//!                 Some(Request::Walk(w)) if w.path() == "/hello" => w.rwalk(QIdType::FILE),
//!                 Some(r) => r.rerror(errstr::ENOENT),
//!                 None => {}
//!             }
//!         }
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     dispatch(Arc::new(Hello), Config::default(), tokio::io::stdin(), tokio::io::stdout()).await
//! }
//! ```
//!
//! # Error Handling
//!
//! 9P2000 reports errors as text in `Rerror`. Protocol misuse (unknown fid,
//! reopening an open fid, walking from an open fid, reusing a fid) is answered
//! by the session without involving the application. The application fails a
//! request with any displayable value; [`errstr`] holds the strings Linux
//! clients map back to errno values.
//!
//! # Cancellation
//!
//! Every request carries a cancellation token, fired by `Tflush` or by the
//! connection going away. Reads and writes in progress are abandoned when it
//! fires.
pub mod conn;
pub mod error;
pub mod fcall;
pub mod file;
pub mod request;
pub mod serialize;
pub mod session;
pub mod srv;
#[macro_use]
pub mod utils;
pub mod walk;

pub use crate::error::Error;
pub use crate::error::errno;
pub use crate::error::string as errstr;
pub use crate::fcall::*;
pub use crate::utils::Result;
