pub mod semfifo;

pub use semfifo::SemFifo;
