pub mod access;
pub mod dispatch;
pub mod errors;
pub mod ipc;
pub mod mount_security;
pub mod scheduler;
pub mod store;
pub mod supervisor;
pub mod token;

pub use errors::{DispatchError, IpcError, MountError, StoreError, SupervisorError, TokenError};
pub use store::{Store, StoreHandle};
