pub mod balance_repo;
pub mod schema;
pub mod session_repo;
pub mod token_repo;
pub mod usage_repo;

pub use balance_repo::BalanceRepository;
pub use session_repo::SessionRepository;
pub use token_repo::TokenRepository;
pub use usage_repo::UsageRepository;
