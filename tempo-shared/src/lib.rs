pub mod models;
pub mod pii;

pub use models::events::DomainEvent;
pub use pii::Masked;
