#![forbid(unsafe_code)]
//! Asynchronous 9P2000 protocol server core for Rust.
//!
//! This crate implements the connection, session, and wire-codec layers
//! of the classic 9P2000 file protocol (Plan 9's `intro(5)`), the way the
//! Linux kernel's `v9fs` client and Plan 9 itself speak it, leaving the
//! actual file tree to user code. It deliberately stops short of being a
//! filesystem: no network listeners, no on-disk backing store, no
//! directory tree. Those are the caller's job — see the `dirfs` crate in
//! this workspace for a complete server built on top of this core.
//!
//! # Overview
//!
//! A [`conn::Connection`] owns one accepted transport (anything
//! `AsyncRead + AsyncWrite`). It decodes messages with a [`decoder::Decoder`],
//! negotiates `msize`/version, authenticates `Tauth`/`Tattach` against an
//! optional [`handler::AuthPolicy`], and for each successful attach spawns
//! a fresh [`session::Session`] plus the caller's [`handler::Handler`]
//! chain (produced by a [`handler::HandlerFactory`]) to answer requests
//! for that fid tree.
//!
//! User code only ever talks to the [`handler::Handler`] façade: pull one
//! [`session::Request`] at a time off a [`handler::Source`], inspect its
//! [`session::SessionRequest`], and answer it by calling `reply` with a
//! [`session::SessionReply`]. [`handler::Stack`] and [`handler::Mux`] let
//! several handlers compose and route by path prefix.
//!
//! # Getting Started
//!
//! 1. Implement [`handler::Handler`] (or build one from [`handler::Stack`]
//!    plus [`handler::Middleware`] stages, routed with [`handler::Mux`]).
//! 2. Wrap your handler constructor with [`handler::drive_to_completion`]
//!    to get a [`handler::HandlerFactory`], or implement
//!    `HandlerFactory::run` directly for full control over the drive loop.
//! 3. Build a [`conn::Config`] naming that factory and, if desired, an
//!    [`handler::AuthPolicy`].
//! 4. Accept a transport connection of your own (TCP, Unix socket, or
//!    anything else) and hand the halves to [`conn::Connection::new`],
//!    then `.serve().await` it.
//!
//! # Error Handling
//!
//! Fallible operations return [`error::Error`]; see its variants for which
//! kinds keep the connection open (replied as `Rerror`) versus which are
//! fatal. [`error::string`] holds the canonical 9P2000 error text table.
//!
//! # Safety
//!
//! This crate forbids unsafe code (`#![forbid(unsafe_code)]`).
pub mod conn;
pub mod decoder;
pub mod dirio;
pub mod encoder;
pub mod error;
pub mod fcall;
pub mod file;
pub mod handler;
pub mod idpool;
pub mod qidpool;
pub mod serialize;
pub mod session;
#[macro_use]
pub mod utils;
pub mod walk;
pub mod wstat;

pub use crate::error::string as errstr;
pub use crate::error::Error;
pub use crate::fcall::*;
pub use crate::utils::Result;
