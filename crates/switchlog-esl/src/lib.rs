//! # switchlog-esl
//!
//! FreeSWITCH event socket (ESL) client for switchlog.
//!
//! - [`EslCodec`] - frames header blocks and `Content-Length` bodies
//! - [`EslClient`] - authenticates, subscribes and turns frames into
//!   [`switchlog_core::Event`]s through the [`switchlog_core::EventSource`] trait

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod codec;

pub use client::{DEFAULT_CONNECT_TIMEOUT, EslClient, parse_plain_event};
pub use codec::{EslCodec, EslError, EslFrame};
