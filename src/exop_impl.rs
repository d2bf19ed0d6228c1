use std::str;

use lber::common::TagClass;
use lber::structures::{OctetString, Tag};

/// OID of the StartTLS extended operation ([RFC 4513](https://tools.ietf.org/html/rfc4513)).
pub const STARTTLS_OID: &str = "1.3.6.1.4.1.1466.20037";

pub const WHOAMI_OID: &str = "1.3.6.1.4.1.4203.1.11.3";

/// Generic extended operation.
///
/// Since the same struct can be used both for requests and responses,
/// both fields must be declared as optional; when sending an extended
/// request, `name` must be set.
#[derive(Clone, Debug)]
pub struct Exop {
    /// OID of the operation. It may be absent in the response.
    pub name: Option<String>,
    /// Request or response value. It may be absent in both cases.
    pub val: Option<Vec<u8>>,
}

/// Conversion trait for extended response values.
pub trait ExopParser {
    /// Convert the raw BER value into an exop-specific struct.
    fn parse(val: &[u8]) -> Self;
}

impl Exop {
    /// Parse the generic exop into an operation-specific struct.
    ///
    /// The parser will panic if the value is `None`.
    pub fn parse<T: ExopParser>(&self) -> T {
        T::parse(self.val.as_ref().expect("value"))
    }
}

/// Encode an exop as the body of an Extended request:
/// `[0] requestName`, optionally followed by `[1] requestValue`.
pub(crate) fn construct_exop(exop: Exop) -> Vec<Tag> {
    let mut seq = Vec::new();
    if let Some(name) = exop.name {
        seq.push(Tag::OctetString(OctetString {
            id: 0,
            class: TagClass::Context,
            inner: name.into_bytes(),
        }));
    }
    if let Some(val) = exop.val {
        seq.push(Tag::OctetString(OctetString {
            id: 1,
            class: TagClass::Context,
            inner: val,
        }));
    }
    seq
}

/// StartTLS extended operation ([RFC 4513](https://tools.ietf.org/html/rfc4513)).
///
/// Instructs the server to upgrade the plaintext connection to TLS in
/// place. The operation has no data; transport rewiring happens in the
/// connection driver after a successful response.
#[derive(Clone, Debug)]
pub struct StartTLS;

impl From<StartTLS> for Exop {
    fn from(_: StartTLS) -> Exop {
        Exop {
            name: Some(STARTTLS_OID.to_owned()),
            val: None,
        }
    }
}

/// WhoAmI extended operation ([RFC 4532](https://tools.ietf.org/html/rfc4532)).
///
/// Returns the authorization identity the connection is bound as.
#[derive(Clone, Debug)]
pub struct WhoAmI;

/// WhoAmI response.
#[derive(Clone, Debug)]
pub struct WhoAmIResp {
    /// Authorization identity, empty for an anonymous connection.
    pub authzid: String,
}

impl From<WhoAmI> for Exop {
    fn from(_: WhoAmI) -> Exop {
        Exop {
            name: Some(WHOAMI_OID.to_owned()),
            val: None,
        }
    }
}

impl ExopParser for WhoAmIResp {
    fn parse(val: &[u8]) -> WhoAmIResp {
        WhoAmIResp {
            authzid: str::from_utf8(val).expect("authzid").to_owned(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::{construct_exop, Exop, StartTLS, STARTTLS_OID};
    use lber::structures::Tag;

    #[test]
    fn starttls_exop_shape() {
        let exop: Exop = StartTLS.into();
        assert_eq!(exop.name.as_deref(), Some(STARTTLS_OID));
        let tags = construct_exop(exop);
        assert_eq!(tags.len(), 1);
        match &tags[0] {
            Tag::OctetString(os) => {
                assert_eq!(os.id, 0);
                assert_eq!(os.inner, STARTTLS_OID.as_bytes());
            }
            _ => panic!("unexpected tag"),
        }
    }
}
