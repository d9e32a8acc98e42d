//! In-kernel device glue. Only the pieces the syscall layer depends on
//! live here; real device bring-up (PS/2 controller, framebuffer) is
//! platform code that calls into these interfaces.

pub mod keyboard;
