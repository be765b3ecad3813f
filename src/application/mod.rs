//! Application services: fetching, read-through pages, warmup and
//! revalidation.

pub mod content;
pub mod error;
pub mod fetch;
pub mod page;
pub mod revalidate;
pub mod warmup;
