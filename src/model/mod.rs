pub mod listener;
pub mod message;
pub mod order;
pub mod patient;
pub mod result;

pub use listener::{ListenerSpec, Protocol};
pub use message::{Message, OrderGroup};
pub use order::Order;
pub use patient::Patient;
pub use result::{SyncStatus, TestResult};
