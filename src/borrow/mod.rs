//! Borrow Module
//!
//! The lending desk: borrow requests and the lifecycle that moves a book between
//! available and checked out.
//!
//! ```text
//! requested --approve--> approved --return--> returned
//!     \
//!      --reject--> rejected
//! ```
//!
//! A book's `availability` flag is only ever written here, and only together
//! with the borrow request transition that justifies it.
//!
//! # Usage
//!
//! ```rust,ignore
//! use borrowd::borrow::BorrowEngine;
//!
//! let engine = BorrowEngine::new(&db, &policy);
//! let request = engine.create_borrow_request(actor, book_id).await?;
//! let approved = engine.approve_borrow_request(librarian, request.id).await?;
//! ```

mod engine;
mod handler;
mod ledger;
mod routes;

pub use engine::*;
pub use ledger::*;

pub use routes::routes;

pub fn migrations() -> &'static [(&'static str, &'static str)] {
    &[("borrow_001_schema.sql", include_str!("migrations/001_schema.sql"))]
}
