use crate::binary::node::{Node, NodeContent};
use std::fmt;

const MAX_INLINE_CONTENT: usize = 512;

// XML-like rendering used by trace logging.
fn fmt_node(node: &Node, f: &mut fmt::Formatter<'_>, indent: usize) -> fmt::Result {
    let indentation = "  ".repeat(indent);
    if indent > 0 {
        writeln!(f)?;
    }
    write!(f, "{}<{}", indentation, node.tag)?;

    for (k, v) in &node.attrs {
        write!(f, " {k}=\"{v}\"")?;
    }

    match &node.content {
        Some(NodeContent::Nodes(nodes)) => {
            write!(f, ">")?;
            for child in nodes {
                fmt_node(child, f, indent + 1)?;
            }
            write!(f, "\n{}</{}>", indentation, node.tag)
        }
        Some(NodeContent::Bytes(bytes)) => {
            write!(f, ">")?;
            if bytes.len() > MAX_INLINE_CONTENT {
                write!(f, "[{} bytes]", bytes.len())?;
            } else if let Ok(s) = std::str::from_utf8(bytes) {
                write!(f, "{s}")?;
            } else {
                write!(f, "{}", hex::encode(bytes))?;
            }
            write!(f, "</{}>", node.tag)
        }
        Some(NodeContent::String(s)) => {
            if s.len() > MAX_INLINE_CONTENT {
                write!(f, ">[{} chars]</{}>", s.len(), node.tag)
            } else {
                write!(f, ">{}</{}>", s, node.tag)
            }
        }
        None => write!(f, "/>"),
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_node(self, f, 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::binary::NodeBuilder;

    #[test]
    fn renders_nested_nodes() {
        let node = NodeBuilder::new("iq")
            .attr("id", "a")
            .children([
                NodeBuilder::new("ping").build(),
                NodeBuilder::new("raw").bytes(vec![0xff, 0x00]).build(),
            ])
            .build();
        assert_eq!(
            node.to_string(),
            "<iq id=\"a\">\n  <ping/>\n  <raw>ff00</raw>\n</iq>"
        );
    }
}
