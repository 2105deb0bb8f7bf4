pub mod ai;
pub mod availability;
pub mod booking;
pub mod conversation;
pub mod generator;
pub mod notify;
pub mod sessions;
