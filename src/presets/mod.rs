//! Closed preset tables (spec §9 redesign flag). See [`board`] and
//! [`distro`]; `--board help`/`--distro help` enumerate [`board::tags`]/
//! [`distro::tags`], and `help=<tag>` describes one entry.

pub mod board;
pub mod distro;
