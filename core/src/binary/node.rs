use indexmap::IndexMap;

pub type Attrs = IndexMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeContent {
    Bytes(Vec<u8>),
    String(String),
    Nodes(Vec<Node>),
}

/// A protocol element: tag, ordered attributes and optional content.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Node {
    pub tag: String,
    pub attrs: Attrs,
    pub content: Option<NodeContent>,
}

impl Node {
    pub fn new(tag: impl Into<String>, attrs: Attrs, content: Option<NodeContent>) -> Self {
        Self {
            tag: tag.into(),
            attrs,
            content,
        }
    }

    /// The correlation identity of this element, if any.
    pub fn id(&self) -> Option<&str> {
        self.attrs.get("id").map(String::as_str)
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn children(&self) -> Option<&[Node]> {
        match &self.content {
            Some(NodeContent::Nodes(nodes)) => Some(nodes),
            _ => None,
        }
    }

    pub fn content_bytes(&self) -> Option<&[u8]> {
        match &self.content {
            Some(NodeContent::Bytes(b)) => Some(b),
            Some(NodeContent::String(s)) => Some(s.as_bytes()),
            _ => None,
        }
    }

    pub fn get_optional_child_by_tag<'a>(&'a self, tags: &[&str]) -> Option<&'a Node> {
        let mut current_node = self;
        for &tag in tags {
            current_node = current_node.get_optional_child(tag)?;
        }
        Some(current_node)
    }

    /// Returns the direct children that have the specified tag.
    pub fn get_children_by_tag(&self, tag: &str) -> Vec<&Node> {
        self.children()
            .map(|children| children.iter().filter(|c| c.tag == tag).collect())
            .unwrap_or_default()
    }

    /// Finds the first direct child with the given tag.
    pub fn get_optional_child(&self, tag: &str) -> Option<&Node> {
        self.children()
            .and_then(|nodes| nodes.iter().find(|node| node.tag == tag))
    }

    /// Extracts `(code, text)` from an `<error>` child, the server's way of
    /// failing an iq.
    pub fn error_details(&self) -> Option<(u16, String)> {
        let error_node = self.get_optional_child("error")?;
        let code = error_node
            .attr("code")
            .and_then(|c| c.parse::<u16>().ok())
            .unwrap_or(0);
        let text = error_node
            .attr("text")
            .unwrap_or("Unknown error")
            .to_string();
        Some((code, text))
    }
}
