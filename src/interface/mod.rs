pub mod observer;
pub mod record;
