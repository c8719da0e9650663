pub mod dns;
pub mod status;
