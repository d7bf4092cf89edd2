use crate::binary::{unmarshal, unpack};
use crate::noise::framing::{FrameDecoder, encode_frame};
use crate::noise::proto::{ClientFinish, ClientHello, HandshakeMessage};
use crate::noise::state::{NoiseState, TransportCipher};
use crate::noise::{
    DecodedFrame, NOISE_START_PATTERN, NoiseError, NoiseHandler, Result, WA_CONN_HEADER,
    build_edge_routing_preintro,
};
use crate::signal::KeyPair;
use log::{debug, trace};
use prost::Message as _;

enum Phase {
    Initial,
    AwaitingServerHello(NoiseState),
    AwaitingFinish(NoiseState),
    Transport(TransportCipher),
}

/// Initiator side of `Noise_XX_25519_AESGCM_SHA256`.
pub struct XxNoiseHandler {
    static_key: KeyPair,
    ephemeral: KeyPair,
    client_payload: Vec<u8>,
    intro: Vec<u8>,
    sent_intro: bool,
    phase: Phase,
    decoder: FrameDecoder,
}

impl XxNoiseHandler {
    /// `client_payload` is sent, encrypted, in the client finish message.
    /// When `routing_info` is present it is announced ahead of the
    /// connection header.
    pub fn new(static_key: KeyPair, client_payload: Vec<u8>, routing_info: Option<&[u8]>) -> Self {
        let mut intro = routing_info
            .map(build_edge_routing_preintro)
            .unwrap_or_default();
        intro.extend_from_slice(&WA_CONN_HEADER);
        Self {
            static_key,
            ephemeral: KeyPair::generate(),
            client_payload,
            intro,
            sent_intro: false,
            phase: Phase::Initial,
            decoder: FrameDecoder::new(),
        }
    }

    pub fn is_transport_ready(&self) -> bool {
        matches!(self.phase, Phase::Transport(_))
    }
}

fn to_key(bytes: &[u8], what: &str) -> Result<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| NoiseError::Handshake(format!("{what} must be 32 bytes, got {}", bytes.len())))
}

impl NoiseHandler for XxNoiseHandler {
    fn client_hello(&mut self) -> Result<Option<Vec<u8>>> {
        if !matches!(self.phase, Phase::Initial) {
            return Err(NoiseError::InvalidPhase("client hello already sent"));
        }
        let mut state = NoiseState::new(NOISE_START_PATTERN, &WA_CONN_HEADER)?;
        state.authenticate(&self.ephemeral.public_key);

        let hello = HandshakeMessage {
            client_hello: Some(ClientHello {
                ephemeral: Some(self.ephemeral.public_key.to_vec()),
            }),
            ..Default::default()
        };
        self.phase = Phase::AwaitingServerHello(state);
        Ok(Some(hello.encode_to_vec()))
    }

    fn process_server_hello(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        let Phase::AwaitingServerHello(mut state) = std::mem::replace(&mut self.phase, Phase::Initial)
        else {
            return Err(NoiseError::InvalidPhase("not waiting for a server hello"));
        };

        let message = HandshakeMessage::decode(frame)?;
        let server_hello = message
            .server_hello
            .ok_or_else(|| NoiseError::Handshake("missing server hello".into()))?;
        let server_ephemeral = to_key(
            &server_hello.ephemeral.unwrap_or_default(),
            "server ephemeral key",
        )?;
        let server_static_ciphertext = server_hello
            .r#static
            .ok_or_else(|| NoiseError::Handshake("missing server static key".into()))?;
        let certificate_ciphertext = server_hello
            .payload
            .ok_or_else(|| NoiseError::Handshake("missing server payload".into()))?;

        state.authenticate(&server_ephemeral);
        state.mix_shared_secret(&self.ephemeral.private_key, &server_ephemeral)?;

        let server_static = to_key(
            &state.decrypt(&server_static_ciphertext)?,
            "server static key",
        )?;
        state.mix_shared_secret(&self.ephemeral.private_key, &server_static)?;

        let certificate = state.decrypt(&certificate_ciphertext)?;
        debug!(target: "Noise/Handshake", "Server certificate payload: {} bytes", certificate.len());

        let encrypted_static = state.encrypt(&self.static_key.public_key)?;
        state.mix_shared_secret(&self.static_key.private_key, &server_ephemeral)?;
        let encrypted_payload = state.encrypt(&self.client_payload)?;

        let finish = HandshakeMessage {
            client_finish: Some(ClientFinish {
                r#static: Some(encrypted_static),
                payload: Some(encrypted_payload),
            }),
            ..Default::default()
        };
        self.phase = Phase::AwaitingFinish(state);
        Ok(finish.encode_to_vec())
    }

    fn finish_handshake(&mut self) -> Result<()> {
        let Phase::AwaitingFinish(state) = std::mem::replace(&mut self.phase, Phase::Initial) else {
            return Err(NoiseError::InvalidPhase("handshake not ready to finish"));
        };
        self.phase = Phase::Transport(state.finish()?);
        debug!(target: "Noise/Handshake", "Handshake complete, transport keys derived");
        Ok(())
    }

    fn encode_frame(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let payload = match &mut self.phase {
            Phase::Transport(cipher) => cipher.encrypt(data)?,
            _ => data.to_vec(),
        };
        let header = if self.sent_intro {
            None
        } else {
            self.sent_intro = true;
            Some(self.intro.as_slice())
        };
        encode_frame(&payload, header)
    }

    fn decode_frame(&mut self, data: &[u8]) -> Result<Vec<DecodedFrame>> {
        self.decoder.feed(data);
        let mut frames = Vec::new();
        while let Some(frame) = self.decoder.decode_frame() {
            match &mut self.phase {
                Phase::Transport(cipher) => {
                    let plaintext = cipher.decrypt(&frame)?;
                    let body = unpack(&plaintext)?;
                    let node = unmarshal(&body)?;
                    trace!(target: "Noise/Recv", "{node}");
                    frames.push(DecodedFrame::Node(node));
                }
                _ => frames.push(DecodedFrame::Handshake(frame)),
            }
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::{NodeBuilder, marshal};
    use crate::noise::proto::ServerHello;

    /// Minimal server side of the handshake.
    struct Responder {
        static_key: KeyPair,
        ephemeral: KeyPair,
        state: NoiseState,
    }

    impl Responder {
        fn new() -> Self {
            Self {
                static_key: KeyPair::generate(),
                ephemeral: KeyPair::generate(),
                state: NoiseState::new(NOISE_START_PATTERN, &WA_CONN_HEADER).unwrap(),
            }
        }

        fn server_hello(&mut self, client_hello: &[u8]) -> Vec<u8> {
            let msg = HandshakeMessage::decode(client_hello).unwrap();
            let client_ephemeral =
                to_key(&msg.client_hello.unwrap().ephemeral.unwrap(), "eph").unwrap();
            self.state.authenticate(&client_ephemeral);
            self.state.authenticate(&self.ephemeral.public_key);
            self.state
                .mix_shared_secret(&self.ephemeral.private_key, &client_ephemeral)
                .unwrap();
            let encrypted_static = self.state.encrypt(&self.static_key.public_key).unwrap();
            self.state
                .mix_shared_secret(&self.static_key.private_key, &client_ephemeral)
                .unwrap();
            let encrypted_cert = self.state.encrypt(b"certificate").unwrap();
            HandshakeMessage {
                server_hello: Some(ServerHello {
                    ephemeral: Some(self.ephemeral.public_key.to_vec()),
                    r#static: Some(encrypted_static),
                    payload: Some(encrypted_cert),
                }),
                ..Default::default()
            }
            .encode_to_vec()
        }

        fn client_finish(mut self, finish: &[u8]) -> (TransportCipher, Vec<u8>) {
            let msg = HandshakeMessage::decode(finish).unwrap().client_finish.unwrap();
            let client_static =
                to_key(&self.state.decrypt(&msg.r#static.unwrap()).unwrap(), "static").unwrap();
            self.state
                .mix_shared_secret(&self.ephemeral.private_key, &client_static)
                .unwrap();
            let payload = self.state.decrypt(&msg.payload.unwrap()).unwrap();
            (self.state.finish_responder().unwrap(), payload)
        }
    }

    fn strip_frame(data: &[u8], intro_len: usize) -> Vec<u8> {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&data[intro_len..]);
        decoder.decode_frame().unwrap().to_vec()
    }

    #[test]
    fn handshake_then_encrypted_nodes_both_ways() {
        let client_static = KeyPair::generate();
        let mut client = XxNoiseHandler::new(client_static.clone(), b"login".to_vec(), None);
        let mut server = Responder::new();

        let hello = client.client_hello().unwrap().unwrap();
        let hello_frame = client.encode_frame(&hello).unwrap();
        assert_eq!(&hello_frame[..4], &WA_CONN_HEADER);
        let server_hello = server.server_hello(&strip_frame(&hello_frame, 4));

        let mut inbound = encode_frame(&server_hello, None).unwrap();
        let frames = client.decode_frame(&inbound).unwrap();
        let [DecodedFrame::Handshake(sh)] = frames.as_slice() else {
            panic!("expected one handshake frame");
        };
        let finish = client.process_server_hello(sh).unwrap();
        let finish_frame = client.encode_frame(&finish).unwrap();
        client.finish_handshake().unwrap();
        assert!(client.is_transport_ready());

        let (mut server_cipher, payload) = server.client_finish(&strip_frame(&finish_frame, 0));
        assert_eq!(payload, b"login");

        // server -> client, split across two reads
        let node = NodeBuilder::new("success").attr("t", "1").build();
        let encrypted = server_cipher.encrypt(&marshal(&node)).unwrap();
        inbound = encode_frame(&encrypted, None).unwrap();
        let (first, rest) = inbound.split_at(5);
        assert!(client.decode_frame(first).unwrap().is_empty());
        assert_eq!(
            client.decode_frame(rest).unwrap(),
            vec![DecodedFrame::Node(node)]
        );

        // client -> server
        let ping = NodeBuilder::new("iq").attr("id", "1").build();
        let outbound = client.encode_frame(&marshal(&ping)).unwrap();
        let plaintext = server_cipher.decrypt(&strip_frame(&outbound, 0)).unwrap();
        assert_eq!(unmarshal(&unpack(&plaintext).unwrap()).unwrap(), ping);
    }

    #[test]
    fn routing_info_is_sent_before_header() {
        let mut client = XxNoiseHandler::new(KeyPair::generate(), Vec::new(), Some(&[9, 9]));
        let hello = client.client_hello().unwrap().unwrap();
        let frame = client.encode_frame(&hello).unwrap();
        assert_eq!(&frame[..9], &[b'E', b'D', 0, 1, 0, 0, 2, 9, 9]);
        assert_eq!(&frame[9..13], &WA_CONN_HEADER);

        let second = client.encode_frame(&[1]).unwrap();
        assert_eq!(second, vec![0, 0, 1, 1]);
    }

    #[test]
    fn server_hello_before_client_hello_is_rejected() {
        let mut client = XxNoiseHandler::new(KeyPair::generate(), Vec::new(), None);
        assert!(matches!(
            client.process_server_hello(&[]),
            Err(NoiseError::InvalidPhase(_))
        ));
    }

    #[test]
    fn corrupted_server_hello_fails() {
        let mut client = XxNoiseHandler::new(KeyPair::generate(), Vec::new(), None);
        let hello = client.client_hello().unwrap().unwrap();
        let mut server = Responder::new();
        let mut server_hello = server.server_hello(&hello);
        let last = server_hello.len() - 1;
        server_hello[last] ^= 0xFF;
        assert!(client.process_server_hello(&server_hello).is_err());
    }
}
