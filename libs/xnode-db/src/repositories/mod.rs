pub mod node_repo;
pub mod user_repo;

pub use node_repo::NodeRepository;
pub use user_repo::UserRepository;
