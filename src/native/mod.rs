/// Native module contains implementations of core traits
/// that drive child processes through syscalls directly.
pub mod runner;
