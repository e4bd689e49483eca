//! A real-mode 80x86 CPU core (8086 through early 80386), decoupled from
//! any particular memory, I/O, or interrupt-controller implementation.
//!
//! The core never owns memory or ports itself; an embedder supplies both by
//! implementing the traits in [`cpu::memory`] over whatever backing store
//! it likes, then drives execution by calling [`cpu::instructions8::dispatch_one`]
//! in a loop.

pub mod cpu;
