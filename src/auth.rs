//! Bearer secrets, unverified JWT claims, and the persisted session credentials.

pub mod claims;
pub mod credentials;
pub mod secret;

pub use claims::*;
pub use credentials::*;
pub use secret::*;
