//! # Data Model
//!
//! Declarative configuration and persisted state documents.

pub mod config;
pub mod state;
pub mod version;

pub use config::{
    ApprovePolicy, BaseConfig, Config, MessageType, Module, NotificationConfig,
    NotificationTarget, Schedule, Source, Step, StepType, VpcConfig,
};
pub use state::{BaseConfigState, State, StateModule, StateStep};
pub use version::VersionSpec;
