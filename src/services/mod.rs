pub mod accounting_service;
pub mod dispatcher;
pub mod encryption_service;
pub mod provider_registry;
pub mod scheduler_service;
pub mod session_pool;
pub mod streaming;
pub mod token_authorizer;
pub mod translator;
pub mod upstream;

pub use accounting_service::AccountingEngine;
pub use dispatcher::RequestDispatcher;
pub use encryption_service::EncryptionService;
pub use provider_registry::ProviderRegistry;
pub use scheduler_service::SchedulerService;
pub use session_pool::SessionPool;
pub use token_authorizer::TokenAuthorizer;
