//! Byte-level helpers shared by the IL codec and the signature parser.

pub mod io;
pub mod parser;
