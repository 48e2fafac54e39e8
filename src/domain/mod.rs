pub mod event;
pub mod payment;
pub mod reservation;
pub mod schemas;

pub use event::*;
pub use payment::*;
pub use reservation::*;
pub use schemas::*;
