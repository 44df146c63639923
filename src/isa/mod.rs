//! Architecture descriptor: register classes, registers and their aliases.
//!
//! Everything in this module is supplied by the (out-of-scope) instruction
//! selector once per target architecture and treated as read-only by the
//! allocator core afterwards; see [`registers::RegInfo`].

pub mod registers;
