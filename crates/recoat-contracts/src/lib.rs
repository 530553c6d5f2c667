pub mod colors;
pub mod events;
pub mod session;
