use bytes::{Buf, BufMut};

use crate::Error;

/// Wire commands, one per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cmd {
    Connect = 0,
    Data = 1,
    Close = 2,
    Switch = 3,
}

impl TryFrom<u8> for Cmd {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Error> {
        match value {
            0 => Ok(Cmd::Connect),
            1 => Ok(Cmd::Data),
            2 => Ok(Cmd::Close),
            3 => Ok(Cmd::Switch),
            other => Err(Error::UnknownCmd(other)),
        }
    }
}

/// A single multiplexer command as carried inside one envelope.
///
/// `tid` identifies a logical tunnel (it survives rotation), `sid` one user
/// stream within it. `network` / `address` ride along on every DATA frame so
/// the server can re-dial a stream it no longer knows about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub cmd: Cmd,
    pub tid: String,
    pub sid: String,
    pub ok: bool,
    pub msg: String,
    pub network: String,
    pub address: String,
    pub data: Vec<u8>,
}

impl Message {
    pub fn connect(tid: &str, sid: &str, network: &str, address: &str) -> Self {
        Self {
            cmd: Cmd::Connect,
            tid: tid.to_owned(),
            sid: sid.to_owned(),
            ok: true,
            msg: String::new(),
            network: network.to_owned(),
            address: address.to_owned(),
            data: Vec::new(),
        }
    }

    pub fn connect_ok(tid: &str, sid: &str) -> Self {
        Self {
            cmd: Cmd::Connect,
            ok: true,
            ..Self::connect(tid, sid, "", "")
        }
    }

    pub fn connect_err(tid: &str, sid: &str, msg: impl Into<String>) -> Self {
        Self {
            cmd: Cmd::Connect,
            ok: false,
            msg: msg.into(),
            ..Self::connect(tid, sid, "", "")
        }
    }

    pub fn data(tid: &str, sid: &str, network: &str, address: &str, data: Vec<u8>) -> Self {
        Self {
            cmd: Cmd::Data,
            data,
            ..Self::connect(tid, sid, network, address)
        }
    }

    pub fn close(tid: &str, sid: &str) -> Self {
        Self {
            cmd: Cmd::Close,
            ..Self::connect(tid, sid, "", "")
        }
    }

    pub fn switch(tid: &str) -> Self {
        Self {
            cmd: Cmd::Switch,
            ..Self::connect(tid, "", "", "")
        }
    }

    /// Serializes to the stable TLV schema: `cmd`, `ok`, then each field as a
    /// big-endian u16 length followed by its bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32 + self.data.len());

        buf.put_u8(self.cmd as u8);
        buf.put_u8(self.ok as u8);
        put_field(&mut buf, self.tid.as_bytes());
        put_field(&mut buf, self.sid.as_bytes());
        put_field(&mut buf, self.msg.as_bytes());
        put_field(&mut buf, self.network.as_bytes());
        put_field(&mut buf, self.address.as_bytes());
        put_field(&mut buf, &self.data);

        buf
    }

    pub fn decode(mut input: &[u8]) -> Result<Self, Error> {
        if input.remaining() < 2 {
            return Err(Error::Schema);
        }

        let cmd = Cmd::try_from(input.get_u8())?;
        let ok = input.get_u8() != 0;

        let tid = get_string(&mut input)?;
        let sid = get_string(&mut input)?;
        let msg = get_string(&mut input)?;
        let network = get_string(&mut input)?;
        let address = get_string(&mut input)?;
        let data = get_field(&mut input)?;

        Ok(Self {
            cmd,
            tid,
            sid,
            ok,
            msg,
            network,
            address,
            data,
        })
    }
}

fn put_field(buf: &mut Vec<u8>, field: &[u8]) {
    buf.put_u16(field.len() as u16);
    buf.put_slice(field);
}

fn get_field(input: &mut &[u8]) -> Result<Vec<u8>, Error> {
    if input.remaining() < 2 {
        return Err(Error::Schema);
    }

    let len = input.get_u16() as usize;

    if input.remaining() < len {
        return Err(Error::Schema);
    }

    let mut field = vec![0; len];
    input.copy_to_slice(&mut field);

    Ok(field)
}

fn get_string(input: &mut &[u8]) -> Result<String, Error> {
    String::from_utf8(get_field(input)?).map_err(|_| Error::Schema)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_field() {
        let msg = Message {
            cmd: Cmd::Data,
            tid: "wid".to_owned(),
            sid: "cid1234".to_owned(),
            ok: false,
            msg: "connection refused".to_owned(),
            network: "tcp".to_owned(),
            address: "example.test:443".to_owned(),
            data: vec![0, 1, 2, 255],
        };

        assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn round_trips_empty_fields() {
        let msg = Message::switch("w1");

        let decoded = Message::decode(&msg.encode()).unwrap();

        assert_eq!(decoded, msg);
        assert!(decoded.sid.is_empty());
        assert!(decoded.data.is_empty());
    }

    #[test]
    fn rejects_unknown_command() {
        let mut encoded = Message::close("w", "c").encode();
        encoded[0] = 42;

        assert!(matches!(
            Message::decode(&encoded),
            Err(Error::UnknownCmd(42))
        ));
    }

    #[test]
    fn rejects_truncated_body() {
        let encoded = Message::connect("w", "c", "tcp", "a:80").encode();

        assert!(matches!(
            Message::decode(&encoded[..encoded.len() - 3]),
            Err(Error::Schema)
        ));
    }
}
