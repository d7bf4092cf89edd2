use crate::binary::error::{BinaryError, Result};
use crate::binary::node::{Attrs, Node, NodeContent};
use bytes::{Buf, BufMut};
use flate2::read::ZlibDecoder;
use std::borrow::Cow;
use std::io::Read;

const CONTENT_NONE: u8 = 0;
const CONTENT_BYTES: u8 = 1;
const CONTENT_STRING: u8 = 2;
const CONTENT_NODES: u8 = 3;

/// Frame flag marking a zlib-compressed body.
pub const FLAG_COMPRESSED: u8 = 2;

const MAX_DEPTH: usize = 64;

/// Encodes a node into a frame body, prefixed by an (uncompressed) flags byte.
pub fn marshal(node: &Node) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    out.put_u8(0);
    write_node(&mut out, node);
    out
}

/// Decodes a frame body that has already been unpacked.
pub fn unmarshal(data: &[u8]) -> Result<Node> {
    let mut buf = data;
    let node = read_node(&mut buf, 0)?;
    if buf.has_remaining() {
        return Err(BinaryError::LeftoverData(buf.remaining()));
    }
    Ok(node)
}

/// Strips the flags byte, inflating the body when it is marked compressed.
pub fn unpack(data: &[u8]) -> Result<Cow<'_, [u8]>> {
    let (&flags, body) = data.split_first().ok_or(BinaryError::EmptyData)?;

    if flags & FLAG_COMPRESSED != 0 {
        let mut decoder = ZlibDecoder::new(body);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| BinaryError::Zlib(e.to_string()))?;
        Ok(Cow::Owned(decompressed))
    } else {
        Ok(Cow::Borrowed(body))
    }
}

fn write_bytes(out: &mut Vec<u8>, data: &[u8]) {
    out.put_u32(data.len() as u32);
    out.put_slice(data);
}

fn write_node(out: &mut Vec<u8>, node: &Node) {
    write_bytes(out, node.tag.as_bytes());
    out.put_u16(node.attrs.len() as u16);
    for (key, value) in &node.attrs {
        write_bytes(out, key.as_bytes());
        write_bytes(out, value.as_bytes());
    }
    match &node.content {
        None => out.put_u8(CONTENT_NONE),
        Some(NodeContent::Bytes(b)) => {
            out.put_u8(CONTENT_BYTES);
            write_bytes(out, b);
        }
        Some(NodeContent::String(s)) => {
            out.put_u8(CONTENT_STRING);
            write_bytes(out, s.as_bytes());
        }
        Some(NodeContent::Nodes(children)) => {
            out.put_u8(CONTENT_NODES);
            out.put_u32(children.len() as u32);
            for child in children {
                write_node(out, child);
            }
        }
    }
}

fn read_bytes(buf: &mut &[u8]) -> Result<Vec<u8>> {
    if buf.remaining() < 4 {
        return Err(BinaryError::UnexpectedEof);
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(BinaryError::UnexpectedEof);
    }
    let data = buf[..len].to_vec();
    buf.advance(len);
    Ok(data)
}

fn read_string(buf: &mut &[u8]) -> Result<String> {
    Ok(String::from_utf8(read_bytes(buf)?)?)
}

fn read_node(buf: &mut &[u8], depth: usize) -> Result<Node> {
    if depth > MAX_DEPTH {
        return Err(BinaryError::TooDeep(MAX_DEPTH));
    }
    let tag = read_string(buf)?;

    if buf.remaining() < 2 {
        return Err(BinaryError::UnexpectedEof);
    }
    let attr_count = buf.get_u16() as usize;
    let mut attrs = Attrs::with_capacity(attr_count);
    for _ in 0..attr_count {
        let key = read_string(buf)?;
        let value = read_string(buf)?;
        attrs.insert(key, value);
    }

    if !buf.has_remaining() {
        return Err(BinaryError::UnexpectedEof);
    }
    let content = match buf.get_u8() {
        CONTENT_NONE => None,
        CONTENT_BYTES => Some(NodeContent::Bytes(read_bytes(buf)?)),
        CONTENT_STRING => Some(NodeContent::String(read_string(buf)?)),
        CONTENT_NODES => {
            if buf.remaining() < 4 {
                return Err(BinaryError::UnexpectedEof);
            }
            let count = buf.get_u32() as usize;
            let mut children = Vec::with_capacity(count.min(256));
            for _ in 0..count {
                children.push(read_node(buf, depth + 1)?);
            }
            Some(NodeContent::Nodes(children))
        }
        other => return Err(BinaryError::InvalidContentMarker(other)),
    };

    Ok(Node { tag, attrs, content })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::NodeBuilder;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use std::io::Write;

    fn sample() -> Node {
        NodeBuilder::new("iq")
            .attr("id", "1.2-3")
            .attr("type", "get")
            .attr("xmlns", "w:p")
            .children([
                NodeBuilder::new("ping").build(),
                NodeBuilder::new("blob").bytes(vec![0, 159, 255]).build(),
                NodeBuilder::new("text").text("héllo").build(),
            ])
            .build()
    }

    #[test]
    fn marshal_then_unmarshal_preserves_attribute_order() {
        let node = sample();
        let data = marshal(&node);
        let body = unpack(&data).unwrap();
        let decoded = unmarshal(&body).unwrap();
        assert_eq!(decoded, node);
        let keys: Vec<_> = decoded.attrs.keys().cloned().collect();
        assert_eq!(keys, vec!["id", "type", "xmlns"]);
    }

    #[test]
    fn unpack_inflates_compressed_frames() {
        let node = sample();
        let plain = marshal(&node);

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&plain[1..]).unwrap();
        let mut compressed = vec![FLAG_COMPRESSED];
        compressed.extend(encoder.finish().unwrap());

        let body = unpack(&compressed).unwrap();
        assert_eq!(unmarshal(&body).unwrap(), node);
    }

    #[test]
    fn truncated_input_is_rejected() {
        let data = marshal(&sample());
        let body = unpack(&data).unwrap();
        let err = unmarshal(&body[..body.len() - 2]).unwrap_err();
        assert!(matches!(err, BinaryError::UnexpectedEof));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut data = marshal(&sample());
        data.push(7);
        let body = unpack(&data).unwrap();
        assert!(matches!(
            unmarshal(&body),
            Err(BinaryError::LeftoverData(1))
        ));
    }

    #[test]
    fn empty_frame_cannot_be_unpacked() {
        assert!(matches!(unpack(&[]), Err(BinaryError::EmptyData)));
    }
}
