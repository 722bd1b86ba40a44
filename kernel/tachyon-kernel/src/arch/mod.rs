//! Architecture support. x86_64 only; the module split keeps the door
//! open without pretending portability exists today.

pub mod x86_64;
