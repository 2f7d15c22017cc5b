//! Process side of the bouncer: command line, IRC upstream client and the
//! WebSocket session transport. The relay engine lives in `bnc-core`.

pub mod cli;
pub mod irc;
pub mod tls;
pub mod upstream;
pub mod web;
