pub mod binary;
pub mod buffer_json;
pub mod jid;
pub mod noise;
pub mod signal;
