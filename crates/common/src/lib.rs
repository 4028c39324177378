//! Common utilities and shared types for tern.
//!
//! This crate provides foundational components used across all tern crates:
//!
//! - **Configuration**: Application settings via [`Config`]
//! - **Error handling**: Unified error types via [`AppError`] and [`AppResult`]
//! - **Cryptography**: RSA key loading for `ActivityPub` signatures
//! - **HTTP Signatures**: Signing of outbound and verification of inbound requests
//! - **ID Generation**: Monotonic ULID identifiers via [`IdGenerator`]
//!
//! # Example
//!
//! ```no_run
//! use tern_common::{Config, IdGenerator, AppResult};
//!
//! fn example() -> AppResult<()> {
//!     let config = Config::load()?;
//!     let id_gen = IdGenerator::new();
//!     let id = id_gen.generate();
//!     println!("{} workers, first job {}", config.queue.worker_count(), id);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod http_signature;
pub mod id;

pub use config::Config;
pub use crypto::{PrivateKeySource, RsaKeypair, generate_rsa_keypair};
pub use error::{AppError, AppResult};
pub use http_signature::{
    HttpSignature, SignedHeaders, build_signature_string, calculate_digest, sign_request,
    verify_signature,
};
pub use id::IdGenerator;
