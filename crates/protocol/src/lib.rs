pub mod consumer;
pub mod frame;
pub mod protoo;

pub use consumer::*;
pub use frame::*;
pub use protoo::*;
