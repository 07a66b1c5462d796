//! Core library for `stash`.
//!
//! Contains the AES-GCM primitives and key material, and the encryption
//! decorator that layers authenticated encryption over any buffered
//! backend from `stash-storage`. This crate knows nothing about specific
//! storage media.

pub mod crypto;
pub mod encryption;
pub mod error;

pub use encryption::{EncryptedBackend, is_codec_error};
pub use error::CryptoError;
