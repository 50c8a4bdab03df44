pub mod node;
pub mod node_usage;
pub mod node_user_usage;
pub mod user;
