//! Library half of the `concerto` binary, so commands can be driven from tests.

pub mod commands;
