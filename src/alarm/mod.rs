pub mod ack;
pub mod clock;
pub mod model;
pub mod scheduler;
pub mod tracker;
