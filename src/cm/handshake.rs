use anyhow::bail;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// The private data exchanged with connect, accept and reject.
///
/// ```ascii
/// 0: protocol version (u8)
/// 1: reserved (u8), sent as 0 and ignored
/// 2: listening port of the sender (u16 BE)
/// 4: process id of the sender (u32 BE)
/// ```
///
/// The active side proposes its version. The version returned by an accept is <= the proposed
///  one, which allows the active side to fall back to an older protocol version.
///
/// The port is needed because the address a connection request arrives from carries the
///  peer's ephemeral port rather than the port it listens on. The process id disambiguates
///  simultaneous connection attempts and detects restarted peers - it is *not* a credential.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct Handshake {
    pub version: u8,
    pub port: u16,
    pub pid: u32,
}

impl Handshake {
    pub const SERIALIZED_LEN: usize = 8;

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_u8(self.version);
        buf.put_u8(0);
        buf.put_u16(self.port);
        buf.put_u32(self.pid);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::SERIALIZED_LEN);
        self.ser(&mut buf);
        buf.freeze()
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<Handshake> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("handshake requires {} bytes, got {}", Self::SERIALIZED_LEN, buf.remaining());
        }

        let version = buf.get_u8();
        let _reserved = buf.get_u8();
        let port = buf.get_u16();
        let pid = buf.get_u32();
        Ok(Handshake {
            version,
            port,
            pid,
        })
    }

    /// The handshake the passive side sends back when accepting this one: the same port, the
    ///  accepting process' id, and a version no higher than either side supports.
    pub fn accept_reply(&self, local_version: u8, local_pid: u32) -> Handshake {
        Handshake {
            version: self.version.min(local_version),
            port: self.port,
            pid: local_pid,
        }
    }
}

#[cfg(test)]
mod test {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::simple(Handshake { version: 1, port: 0x1234, pid: 0x01020304 }, vec![1, 0, 0x12, 0x34, 1, 2, 3, 4])]
    #[case::max(Handshake { version: 255, port: 65535, pid: u32::MAX }, vec![255, 0, 255, 255, 255, 255, 255, 255])]
    fn test_ser(#[case] handshake: Handshake, #[case] expected: Vec<u8>) {
        let mut buf = BytesMut::new();
        handshake.ser(&mut buf);
        assert_eq!(buf.to_vec(), expected);
        assert_eq!(handshake.to_bytes().to_vec(), expected);
    }

    #[rstest]
    #[case::exact(vec![2, 0, 0, 80, 0, 0, 1, 0], b"", Some(Handshake { version: 2, port: 80, pid: 256 }))]
    #[case::reserved_ignored(vec![1, 99, 0, 81, 0, 0, 0, 7], b"", Some(Handshake { version: 1, port: 81, pid: 7 }))]
    #[case::remainder(vec![1, 0, 0, 80, 0, 0, 0, 1, 9, 9], b"\x09\x09", Some(Handshake { version: 1, port: 80, pid: 1 }))]
    #[case::too_short(vec![1, 0, 0, 80, 0, 0, 0], b"", None)]
    #[case::empty(vec![], b"", None)]
    fn test_deser(#[case] raw: Vec<u8>, #[case] buf_after: &[u8], #[case] expected: Option<Handshake>) {
        let mut buf = raw.as_slice();
        match Handshake::deser(&mut buf) {
            Ok(actual) => {
                assert_eq!(Some(actual), expected);
                assert_eq!(buf, buf_after);
            }
            Err(_) => assert!(expected.is_none()),
        }
    }

    #[rstest]
    #[case::same_version(3, 3, 3)]
    #[case::downgrade(3, 2, 2)]
    #[case::never_upgrade(1, 4, 1)]
    fn test_accept_reply(#[case] proposed: u8, #[case] local: u8, #[case] expected: u8) {
        let request = Handshake { version: proposed, port: 4711, pid: 11 };
        let reply = request.accept_reply(local, 22);
        assert_eq!(reply, Handshake { version: expected, port: 4711, pid: 22 });
    }
}
