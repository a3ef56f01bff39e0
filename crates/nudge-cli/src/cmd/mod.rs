pub mod inbox;
pub mod settings;
pub mod sim;
