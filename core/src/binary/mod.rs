pub mod builder;
pub mod error;
pub mod marshal;
pub mod node;
mod xml;

pub use builder::NodeBuilder;
pub use error::{BinaryError, Result};
pub use marshal::{marshal, unmarshal, unpack};
pub use node::{Attrs, Node, NodeContent};
