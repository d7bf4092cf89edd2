pub mod basic;
pub mod forward;
pub mod iq;
pub mod router;
pub mod traits;
