pub mod node;
pub mod user;
