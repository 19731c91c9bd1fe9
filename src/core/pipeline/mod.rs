/// Episode execution and the sweep over every compatible pairing.
pub mod bench;
pub mod sweep;
