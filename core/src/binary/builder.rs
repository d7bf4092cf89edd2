use crate::binary::node::{Attrs, Node, NodeContent};

/// Chained construction of a [`Node`]. Setting content replaces whatever
/// content was set before, except [`child`](Self::child) which appends.
#[derive(Debug, Default)]
pub struct NodeBuilder {
    tag: String,
    attrs: Attrs,
    content: Option<NodeContent>,
}

impl NodeBuilder {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Default::default()
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    /// Sets `key` only when `value` is present.
    pub fn opt_attr(self, key: impl Into<String>, value: Option<impl Into<String>>) -> Self {
        match value {
            Some(value) => self.attr(key, value),
            None => self,
        }
    }

    pub fn children(mut self, children: impl IntoIterator<Item = Node>) -> Self {
        self.content = Some(NodeContent::Nodes(children.into_iter().collect()));
        self
    }

    pub fn child(mut self, child: Node) -> Self {
        match &mut self.content {
            Some(NodeContent::Nodes(nodes)) => nodes.push(child),
            _ => self.content = Some(NodeContent::Nodes(vec![child])),
        }
        self
    }

    pub fn bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.content = Some(NodeContent::Bytes(bytes.into()));
        self
    }

    pub fn text(mut self, s: impl Into<String>) -> Self {
        self.content = Some(NodeContent::String(s.into()));
        self
    }

    pub fn build(self) -> Node {
        Node {
            tag: self.tag,
            attrs: self.attrs,
            content: self.content,
        }
    }
}
