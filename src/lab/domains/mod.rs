//! Built-in [`DomainModule`](crate::lab::domain::DomainModule) implementations.

pub mod field_format;
