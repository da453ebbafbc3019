use std::io;
use std::ops::Deref;

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const MAX_PACKET_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct Packet {
    pub body: Vec<u8>,
}

impl Packet {
    pub fn new(body: Vec<u8>) -> Self {
        Self { body }
    }
}

impl Deref for Packet {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.body
    }
}

/// Frames packets with a big endian `u32` length prefix.
#[derive(Debug, Default)]
pub struct PacketCodec;

impl Encoder<Packet> for PacketCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_PACKET_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, format!("packet of {} bytes too large", item.len())));
        }
        dst.reserve(4 + item.len());
        dst.put_u32(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let body_len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if body_len > MAX_PACKET_LEN {
            return Err(io::Error::new(io::ErrorKind::InvalidData, format!("packet of {} bytes too large", body_len)));
        }
        if src.len() - 4 < body_len {
            src.reserve(4 + body_len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let body = src.split_to(body_len);
        Ok(Some(Packet::new(body.to_vec())))
    }
}
