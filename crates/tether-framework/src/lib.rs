//! # Tether Framework
//!
//! The scoped-instance cache and the observer registry.
//!
//! - [`ScopedInstanceManager`]: routes every event of a conversation to one
//!   handler instance, promotes autocomplete instances, evicts idle ones.
//! - [`ObserverRegistry`]: pending button, select-menu and modal callbacks
//!   whose timers follow their owning instance.
//!
//! Both run their timers on a tokio runtime.  Locks are never held while
//! user code (factories, destroy hooks, timeout callbacks) runs.

mod hook;
mod instance;
pub mod manager;
pub mod observer;
mod store;
mod timer;

pub use instance::ScopedInstance;
pub use manager::ScopedInstanceManager;
pub use observer::{
    ObserverKey, ObserverKind, ObserverOptions, ObserverRegistry, ObserverTrigger, SelectMenu,
    TimeoutCallback,
};
pub use store::{InstanceInfo, ScopeStats};
